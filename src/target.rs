//! What the flash code needs from a target: word and block memory access, and for the
//! algorithm path, working areas and a way to run code on the target CPU.
//!
//! `ScanTarget` provides memory access over a JTAG chain through a bus-access TAP with an
//! address register and an auto-incrementing data register.  CPU control is architecture
//! specific and lives outside this crate; it comes in through `AlgorithmHost`.
use alloc::vec;
use alloc::vec::Vec;
use core::ops::DerefMut;

use log::{debug, trace};

use crate::cable::Backend;
use crate::error::{Error, Result};
use crate::queue::CaptureId;
use crate::taps::Taps;

pub trait TargetMemory {
    fn read_u32(&mut self, address: u32) -> Result<u32>;

    fn write_u32(&mut self, address: u32, value: u32) -> Result<()>;

    fn read_buffer(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        read_words(self, address, buf)
    }

    fn write_buffer(&mut self, address: u32, data: &[u8]) -> Result<()> {
        write_words(self, address, data)
    }

    /// Targets that can run code return themselves here
    fn algorithm_host(&mut self) -> Option<&mut dyn AlgorithmHost> {
        None
    }
}

/// A block of target RAM handed out for algorithm code, data or stack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkingArea {
    pub address: u32,
    pub size: u32,
}

impl WorkingArea {
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

pub trait AlgorithmHost: TargetMemory {
    /// Fails with `ConfigError::NoWorkingArea` when `size` bytes are not available
    fn alloc_working_area(&mut self, size: u32) -> Result<WorkingArea>;

    fn free_working_area(&mut self, area: WorkingArea);

    /// Start the CPU at `entry` with `args` in the first three argument registers and the stack
    /// pointer at `stack_top`.  Returns once the CPU is running.
    fn start_algorithm(&mut self, entry: u32, args: [u32; 3], stack_top: u32) -> Result<()>;

    /// `Some(return value)` once the algorithm has reached its exit point and halted
    fn poll_algorithm(&mut self) -> Result<Option<u32>>;

    fn halt_algorithm(&mut self) -> Result<()>;
}

/// Byte-wise read built from word reads
pub fn read_words<M: TargetMemory + ?Sized>(mem: &mut M, address: u32, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let addr = address + done as u32;
        let word = mem.read_u32(addr & !3)?.to_le_bytes();
        let skip = (addr & 3) as usize;
        let n = (4 - skip).min(buf.len() - done);
        buf[done..done + n].copy_from_slice(&word[skip..skip + n]);
        done += n;
    }
    Ok(())
}

/// Byte-wise write built from word writes.  Partial words are read, merged and written back.
pub fn write_words<M: TargetMemory + ?Sized>(mem: &mut M, address: u32, data: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        let addr = address + done as u32;
        let skip = (addr & 3) as usize;
        let n = (4 - skip).min(data.len() - done);
        let word = if n == 4 {
            let mut w = [0; 4];
            w.copy_from_slice(&data[done..done + 4]);
            w
        } else {
            let mut w = mem.read_u32(addr & !3)?.to_le_bytes();
            w[skip..skip + n].copy_from_slice(&data[done..done + n]);
            w
        };
        mem.write_u32(addr & !3, u32::from_le_bytes(word))?;
        done += n;
    }
    Ok(())
}

/// The TAP and instructions that give access to the target bus
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusTap {
    pub tap: usize,
    /// Selects the 32-bit address register
    pub address_ir: Vec<u8>,
    /// Selects the 33-bit data register: 32 data bits, then a write-enable bit.  Every access
    /// steps the address by 4.
    pub data_ir: Vec<u8>,
}

const DATA_BITS: usize = 33;
const WRITE_ENABLE: u64 = 1 << 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Selected {
    Address,
    Data,
}

/// `TargetMemory` over a scan chain.  Writes are only queued; reads flush.
pub struct ScanTarget<T>
    where T: DerefMut,
          T::Target: Backend
{
    pub taps: Taps<T>,
    bus: BusTap,
    ir: Option<Selected>,
}

impl<T, U> ScanTarget<T>
    where T: DerefMut<Target=U>,
          U: Backend + ?Sized
{
    pub fn new(taps: Taps<T>, bus: BusTap) -> Self {
        Self { taps, bus, ir: None }
    }

    fn select(&mut self, which: Selected) -> Result<()> {
        if self.ir == Some(which) {
            return Ok(());
        }
        let ir = match which {
            Selected::Address => &self.bus.address_ir,
            Selected::Data => &self.bus.data_ir,
        };
        if self.ir.is_none() {
            // First access, or the chain was lost: start from TLR
            self.taps.select_tap(self.bus.tap, ir)?;
        } else {
            self.taps.write_ir(ir)?;
        }
        self.ir = Some(which);
        Ok(())
    }

    fn set_address(&mut self, address: u32) -> Result<()> {
        self.select(Selected::Address)?;
        self.taps.write_dr(&address.to_le_bytes(), 32)
    }

    fn queue_write(&mut self, value: u32) -> Result<()> {
        self.select(Selected::Data)?;
        let dr = (u64::from(value) | WRITE_ENABLE).to_le_bytes();
        self.taps.write_dr(&dr[..5], DATA_BITS)
    }

    fn queue_read(&mut self) -> Result<CaptureId> {
        self.select(Selected::Data)?;
        self.taps.queue_read_write_dr(&[0; 5], DATA_BITS)
    }

    fn collect(&mut self, ids: &[CaptureId], buf: &mut [u8]) -> Result<()> {
        self.taps.session.flush()?;
        for (id, chunk) in ids.iter().zip(buf.chunks_mut(4)) {
            let dr = self.taps.session.take_capture(*id)?;
            chunk.copy_from_slice(&dr[..chunk.len()]);
        }
        Ok(())
    }

    /// Forget the selected instruction after a failure so the next access starts with a reset
    fn checked<R>(&mut self, r: Result<R>) -> Result<R> {
        if r.is_err() {
            debug!("bus access failed, resynchronizing on next access");
            self.ir = None;
        }
        r
    }

    fn read_block(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.set_address(address)?;
        let mut ids = Vec::with_capacity(buf.len() / 4);
        for _ in 0..buf.len() / 4 {
            ids.push(self.queue_read()?);
        }
        self.collect(&ids, buf)
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.set_address(address)?;
        for word in data.chunks_exact(4) {
            self.queue_write(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))?;
        }
        Ok(())
    }
}

impl<T, U> TargetMemory for ScanTarget<T>
    where T: DerefMut<Target=U>,
          U: Backend + ?Sized
{
    fn read_u32(&mut self, address: u32) -> Result<u32> {
        let mut buf = [0; 4];
        let r = self.read_block(address, &mut buf);
        self.checked(r)?;
        trace!("read {:#010x} = {:#010x}", address, u32::from_le_bytes(buf));
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        trace!("write {:#010x} = {:#010x}", address, value);
        let r = self.write_block(address, &value.to_le_bytes());
        self.checked(r)
    }

    fn read_buffer(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        if address % 4 != 0 || buf.len() % 4 != 0 {
            return read_words(self, address, buf);
        }
        let r = self.read_block(address, buf);
        self.checked(r)
    }

    fn write_buffer(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if address % 4 != 0 || data.len() % 4 != 0 {
            return write_words(self, address, data);
        }
        let r = self.write_block(address, data);
        self.checked(r)
    }
}

/// Bytes read from `address` compared with `expected`.  The first difference is reported.
pub fn compare<M: TargetMemory + ?Sized>(mem: &mut M, address: u32, expected: &[u8]) -> Result<()> {
    let mut found = vec![0; expected.len()];
    mem.read_buffer(address, &mut found)?;
    match found.iter().zip(expected).position(|(f, e)| f != e) {
        Some(i) => Err(Error::VerifyMismatch {
            address: address + i as u32,
            expected: expected[i],
            found: found[i],
        }),
        None => Ok(()),
    }
}
