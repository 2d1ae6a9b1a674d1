//! A simulated Phoenix-style chip: flash array, flash controller registers and a little RAM,
//! with every access recorded.  Programming ANDs data into the array like real NOR flash.
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{ConfigError, Result};
use crate::flash::model::ROW;
use crate::flash::orchestrator::Registers;
use crate::flash::phoenix::{row, word};
use crate::flash::Operation;
use crate::target::{AlgorithmHost, TargetMemory, WorkingArea};

/// Status left behind by a flash write that nothing was armed for
pub(crate) const STRAY_WRITE: u32 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    /// Address and the value returned
    Read(u32, u32),
    Write(u32, u32),
    ReadBuffer { address: u32, len: usize },
    WriteBuffer { address: u32, len: usize },
}

pub(crate) struct SimFlash {
    pub regs: Registers,
    pub page_size: u32,
    pub model_chk: u32,
    /// Value the model register reads back
    pub model: u32,
    pub flash: Vec<u8>,
    pub page_buffer: Option<u32>,
    page_buf: Vec<u8>,
    /// Everything that is neither flash nor page buffer, byte by byte
    pub ram: BTreeMap<u32, u8>,
    pub log: Vec<Access>,

    sts: u32,
    opr: Vec<u32>,
    armed: Option<u32>,
    unlocked: bool,
    /// Status reads answered with 0 after each word program
    pub busy_reads: u32,
    busy_left: u32,
    /// Fail the given operation with a status value after that many successes
    pub fail: Option<(Operation, u32, usize)>,

    /// Offer `AlgorithmHost` through `algorithm_host`
    pub host: bool,
    pub work: WorkingArea,
    pub allocs: Vec<WorkingArea>,
    pub alloc_requests: Vec<u32>,
    pub runs: Vec<[u32; 3]>,
    pub halts: usize,
    /// Polls answered with "still running" before each run finishes
    pub algo_polls: u32,
    pub algo_return: u32,
    pub hang: bool,
    pub clobber_stack: bool,
    polls_left: Option<u32>,
}

impl SimFlash {
    fn new(regs: Registers, page_size: u32, flash_size: u32, model_chk: u32, model: u32) -> Self {
        Self {
            regs,
            page_size,
            model_chk,
            model,
            flash: vec![0xff; flash_size as usize],
            page_buffer: None,
            page_buf: vec![0xff; 512],
            ram: BTreeMap::new(),
            log: Vec::new(),
            sts: 0,
            opr: Vec::new(),
            armed: None,
            unlocked: false,
            busy_reads: 0,
            busy_left: 0,
            fail: None,
            host: false,
            work: WorkingArea { address: 0x2000_0000, size: 0x4000 },
            allocs: Vec::new(),
            alloc_requests: Vec::new(),
            runs: Vec::new(),
            halts: 0,
            algo_polls: 0,
            algo_return: 1,
            hang: false,
            clobber_stack: false,
            polls_left: None,
        }
    }

    /// The 128KB row-programming part
    pub fn row() -> Self {
        let mut sim = Self::new(row::registers(), 512, 128 * 1024, row::MODEL_CHK, 0x05);
        sim.page_buffer = Some(row::PAGE_BUFFER);
        sim
    }

    /// The 16KB word-programming part
    pub fn word() -> Self {
        Self::new(word::registers(), 128, 16 * 1024, word::MODEL_CHK, 0xf05)
    }

    fn flash_offset(&self, address: u32) -> Option<usize> {
        let off = address.checked_sub(self.regs.flash_base)? as usize;
        (off < self.flash.len()).then_some(off)
    }

    fn page_buffer_offset(&self, address: u32) -> Option<usize> {
        let off = address.checked_sub(self.page_buffer?)? as usize;
        (off < self.page_buf.len()).then_some(off)
    }

    fn outcome(&mut self, op: Operation) -> u32 {
        match &mut self.fail {
            Some((o, status, 0)) if *o == op => *status,
            Some((o, _, skip)) if *o == op => {
                *skip -= 1;
                1
            }
            _ => 1,
        }
    }

    fn erase_page(&mut self, off: usize) {
        let page = self.page_size as usize;
        let start = off - off % page;
        self.flash[start..start + page].fill(0xff);
    }

    fn program(&mut self, off: usize, data: &[u8]) {
        for (dst, src) in self.flash[off..off + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
    }

    fn opr_write(&mut self, value: u32) {
        if value == 0xff {
            self.unlocked = false;
            self.armed = None;
            self.opr.clear();
            return;
        }
        self.opr.push(value);
        if self.opr.len() == 4 {
            let op = self.opr[0];
            if self.opr[..] == [op, 0x70 + op, 0x90 + op, 0xc0 + op] {
                if op == 0 {
                    self.unlocked = true;
                } else {
                    self.armed = Some(op);
                }
            }
            self.opr.clear();
        }
    }

    fn flash_write(&mut self, off: usize, value: u32) {
        self.sts = match self.armed.take() {
            Some(2) => {
                let status = self.outcome(Operation::Erase);
                if status == 1 {
                    self.erase_page(off);
                }
                status
            }
            Some(1) => {
                let status = self.outcome(Operation::Program);
                if status == 1 {
                    let row = ROW as usize;
                    let start = off - off % row;
                    let half = off % 512 / row * row;
                    let data = self.page_buf[half..half + row].to_vec();
                    self.program(start, &data);
                }
                status
            }
            _ if self.unlocked => {
                let status = self.outcome(Operation::Program);
                if status == 1 {
                    self.program(off & !3, &value.to_le_bytes());
                }
                self.busy_left = self.busy_reads;
                status
            }
            _ => STRAY_WRITE,
        };
    }

    fn peek(&self, address: u32) -> u8 {
        if let Some(off) = self.flash_offset(address) {
            self.flash[off]
        } else if let Some(off) = self.page_buffer_offset(address) {
            self.page_buf[off]
        } else {
            *self.ram.get(&address).unwrap_or(&0)
        }
    }

    /// Plain store; the flash array only changes through the controller
    fn poke(&mut self, address: u32, value: u8) {
        if self.flash_offset(address).is_some() {
            self.sts = STRAY_WRITE;
        } else if let Some(off) = self.page_buffer_offset(address) {
            self.page_buf[off] = value;
        } else {
            self.ram.insert(address, value);
        }
    }

    fn load(&mut self, address: u32) -> u32 {
        if address == self.regs.sts {
            if self.busy_left > 0 {
                self.busy_left -= 1;
                return 0;
            }
            return self.sts;
        }
        if address == self.model_chk {
            return self.model;
        }
        u32::from_le_bytes([0, 1, 2, 3].map(|i| self.peek(address + i)))
    }

    fn store(&mut self, address: u32, value: u32) {
        if address == self.regs.sts {
            self.sts = value;
        } else if address == self.regs.opr {
            self.opr_write(value);
        } else if address == self.model_chk {
            // probing write, reads keep returning the model
        } else if let Some(off) = self.flash_offset(address) {
            self.flash_write(off, value);
        } else {
            for (i, b) in value.to_le_bytes().into_iter().enumerate() {
                self.poke(address + i as u32, b);
            }
        }
    }

    /// What the uploaded programming algorithm does to the chip
    fn run_algorithm(&mut self, [offset, buffer, len]: [u32; 3], stack_top: u32) {
        let page = self.page_size;
        let mut at = offset - offset % page;
        while at < offset + len {
            self.erase_page(at as usize);
            at += page;
        }
        let data: Vec<u8> = (0..len).map(|i| self.peek(buffer + i)).collect();
        self.program(offset as usize, &data);
        if self.clobber_stack {
            let bottom = stack_top - crate::flash::loader::STACK_WORDS * 4;
            self.ram.insert(bottom, 0);
        }
    }
}

impl TargetMemory for SimFlash {
    fn read_u32(&mut self, address: u32) -> Result<u32> {
        let value = self.load(address);
        self.log.push(Access::Read(address, value));
        Ok(value)
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        self.log.push(Access::Write(address, value));
        self.store(address, value);
        Ok(())
    }

    fn read_buffer(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.log.push(Access::ReadBuffer { address, len: buf.len() });
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.peek(address + i as u32);
        }
        Ok(())
    }

    fn write_buffer(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.log.push(Access::WriteBuffer { address, len: data.len() });
        for (i, b) in data.iter().enumerate() {
            self.poke(address + i as u32, *b);
        }
        Ok(())
    }

    fn algorithm_host(&mut self) -> Option<&mut dyn AlgorithmHost> {
        if self.host {
            Some(self)
        } else {
            None
        }
    }
}

impl AlgorithmHost for SimFlash {
    fn alloc_working_area(&mut self, size: u32) -> Result<WorkingArea> {
        self.alloc_requests.push(size);
        let address = self.allocs.iter().map(WorkingArea::end).max().unwrap_or(self.work.address);
        if address + size > self.work.end() {
            return Err(ConfigError::NoWorkingArea(size).into());
        }
        let area = WorkingArea { address, size };
        self.allocs.push(area);
        Ok(area)
    }

    fn free_working_area(&mut self, area: WorkingArea) {
        self.allocs.retain(|a| *a != area);
    }

    fn start_algorithm(&mut self, _entry: u32, args: [u32; 3], stack_top: u32) -> Result<()> {
        self.runs.push(args);
        if !self.hang {
            self.run_algorithm(args, stack_top);
        }
        self.polls_left = Some(self.algo_polls);
        Ok(())
    }

    fn poll_algorithm(&mut self) -> Result<Option<u32>> {
        match self.polls_left {
            _ if self.hang => Ok(None),
            Some(0) => {
                self.polls_left = None;
                Ok(Some(self.algo_return))
            }
            Some(n) => {
                self.polls_left = Some(n - 1);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn halt_algorithm(&mut self) -> Result<()> {
        self.halts += 1;
        self.polls_left = None;
        Ok(())
    }
}
