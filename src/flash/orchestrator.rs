//! Host-driven erase and program.  Every controller access is a target memory access, so this
//! works on any `TargetMemory`, at the cost of one round trip per status read.
use log::{debug, error, trace};

use crate::error::{Error, ProtocolError, Result};
use crate::flash::loader::AlgorithmJob;
use crate::flash::model::{FlashModel, ROW, WORD};
use crate::flash::{Operation, Phase};
use crate::target::{self, TargetMemory, WorkingArea};

/// Status reads allowed per programmed word before giving up
pub const POLL_LIMIT: u32 = 10_000;
/// Status register value of a completed operation
pub const STATUS_DONE: u32 = 0x01;
const STATUS_CLEAR: u32 = 0xff;

const OP_UNLOCK: u32 = 0x00;
const OP_PROGRAM: u32 = 0x01;
const OP_ERASE: u32 = 0x02;
const OP_LOCK: u32 = 0xff;
/// Each operation is armed by writing it to OPR four times, tagged with these keys
const ARM_KEYS: [u32; 4] = [0x00, 0x70, 0x90, 0xc0];

/// Where the flash controller of a device lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registers {
    pub flash_base: u32,
    pub opr: u32,
    pub sts: u32,
}

pub struct Orchestrator<'a> {
    target: &'a mut dyn TargetMemory,
    regs: Registers,
    phase: Phase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(target: &'a mut dyn TargetMemory, regs: Registers) -> Self {
        Self { target, regs, phase: Phase::Idle }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn status(&mut self) -> Result<u32> {
        self.target.read_u32(self.regs.sts)
    }

    fn arm(&mut self, op: u32) -> Result<()> {
        for key in ARM_KEYS {
            self.target.write_u32(self.regs.opr, key + op)?;
        }
        Ok(())
    }

    /// Arm `op` and start it with a dummy write inside the flash
    fn trigger(&mut self, op: u32, offset: u32) -> Result<()> {
        trace!("efc op {} at {:#x}", op, offset);
        self.target.write_u32(self.regs.sts, STATUS_CLEAR)?;
        self.arm(op)?;
        self.target.write_u32(self.regs.flash_base + offset, 1)
    }

    fn fail(&mut self, op: Operation, value: u32, offset: u32) -> Error {
        self.phase = Phase::Failed;
        error!("flash {} failed at offset {:#x}, status {:#x}", op, offset, value);
        ProtocolError::Status { op, value, offset }.into()
    }

    fn erase_page(&mut self, offset: u32) -> Result<()> {
        self.phase = Phase::Erasing;
        self.trigger(OP_ERASE, offset)?;
        let status = self.status()?;
        if status != STATUS_DONE {
            return Err(self.fail(Operation::Erase, status, offset));
        }
        Ok(())
    }

    /// Erase the sector at `offset`.  A failure leaves the sector in an unknown state; it is not
    /// retried.
    pub fn erase_sector(&mut self, offset: u32) -> Result<()> {
        debug!("erasing sector at {:#x}", offset);
        self.erase_page(offset)?;
        self.phase = Phase::Done;
        Ok(())
    }

    /// Program `job.source_data` at `job.offset`, one page at a time, erasing each page first.
    /// Returns the final status register value.
    ///
    /// On failure the error carries the offset of the page that failed; the pages before it
    /// are programmed and stay that way.
    pub fn program(&mut self, model: FlashModel, job: &AlgorithmJob<'_>) -> Result<u32> {
        let page = match model.page_size() {
            Ok(page) => page,
            Err(e) => {
                self.phase = Phase::Failed;
                error!("refusing to program {}", model);
                return Err(e);
            }
        };
        if job.offset % page != 0 {
            return Err(Error::Syntax("offset not aligned to the page size"));
        }
        if job.source_data.len() % WORD as usize != 0 {
            return Err(Error::Syntax("length is not a whole number of words"));
        }

        let mut offset = job.offset;
        let mut status = STATUS_DONE;
        for chunk in job.source_data.chunks(page as usize) {
            debug!("programming {} bytes at {:#x}", chunk.len(), offset);
            self.erase_page(offset)?;
            status = match model {
                FlashModel::RowProgram(_) => self.program_rows(chunk, offset, job.work_buffer)?,
                _ => self.program_words(chunk, offset)?,
            };
            offset += chunk.len() as u32;
        }

        self.phase = Phase::VerifyingStatus;
        if status != STATUS_DONE {
            return Err(self.fail(Operation::Program, status, offset));
        }
        self.phase = Phase::Done;
        Ok(status)
    }

    /// Read `expected.len()` bytes back from flash offset `offset` and compare.  A difference is
    /// a `VerifyMismatch`, never a status failure.
    pub fn verify(&mut self, offset: u32, expected: &[u8]) -> Result<()> {
        self.phase = Phase::VerifyingStatus;
        let r = target::compare(&mut *self.target, self.regs.flash_base + offset, expected);
        self.phase = if r.is_ok() { Phase::Done } else { Phase::Failed };
        r
    }

    /// Stage each half page in the page buffer and program it as one row.  The status read
    /// after each row is final.
    fn program_rows(&mut self, chunk: &[u8], offset: u32, page_buffer: WorkingArea) -> Result<u32> {
        self.phase = Phase::Programming;
        let mut status = STATUS_DONE;
        for (i, half) in chunk.chunks(ROW as usize).enumerate() {
            let at = i as u32 * ROW;
            let mut row = [0xff; ROW as usize];
            row[..half.len()].copy_from_slice(half);
            self.target.write_buffer(page_buffer.address + at, &row)?;
            self.trigger(OP_PROGRAM, offset + at)?;
            status = self.status()?;
            if status != STATUS_DONE {
                return Err(self.fail(Operation::Program, status, offset));
            }
        }
        Ok(status)
    }

    /// Lift write protection, program word by word, and protect again even if a word failed
    fn program_words(&mut self, chunk: &[u8], offset: u32) -> Result<u32> {
        self.phase = Phase::Protecting;
        self.arm(OP_UNLOCK)?;
        self.phase = Phase::Programming;
        let r = self.write_words(chunk, offset);
        self.phase = Phase::Protecting;
        self.target.write_u32(self.regs.opr, OP_LOCK)?;
        r?;
        self.status()
    }

    fn write_words(&mut self, chunk: &[u8], offset: u32) -> Result<()> {
        for (i, word) in chunk.chunks_exact(WORD as usize).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.target.write_u32(self.regs.sts, STATUS_CLEAR)?;
            self.target.write_u32(self.regs.flash_base + offset + i as u32 * WORD, value)?;
            let status = self.poll()?;
            if status != STATUS_DONE {
                return Err(self.fail(Operation::Program, status, offset));
            }
        }
        Ok(())
    }

    /// Read the status register until it reports completion, at most `POLL_LIMIT` times
    fn poll(&mut self) -> Result<u32> {
        let mut status = 0;
        for _ in 0..POLL_LIMIT {
            status = self.status()?;
            if status == STATUS_DONE {
                break;
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::flash::model::Geometry;
    use crate::flash::phoenix::{row, word};
    use crate::flash::sim::{Access, SimFlash};
    use crate::queue::tests::init_logger;
    use alloc::vec;
    use alloc::vec::Vec;

    const G: Geometry = Geometry { flash_size: 16 * 1024, ram_size: 2048 };

    fn job(data: &[u8], offset: u32, work: WorkingArea) -> AlgorithmJob<'_> {
        AlgorithmJob { target_code: &[], work_buffer: work, source_data: data, offset }
    }

    fn page_buffer() -> WorkingArea {
        WorkingArea { address: row::PAGE_BUFFER, size: 512 }
    }

    #[test]
    fn unknown_model_writes_nothing() {
        init_logger();
        let mut sim = SimFlash::word();
        let data = [0xaa; 128];
        let mut orch = Orchestrator::new(&mut sim, word::registers());
        let r = orch.program(FlashModel::Unrecognized(0x1234), &job(&data, 0, page_buffer()));
        assert!(matches!(r, Err(Error::Config(ConfigError::UnknownModel(0x1234)))));
        assert_eq!(orch.phase(), Phase::Failed);
        assert!(sim.log.is_empty());
    }

    #[test]
    fn erase_then_program_a_word_page() {
        init_logger();
        let mut sim = SimFlash::word();
        sim.busy_reads = 3;
        let regs = word::registers();
        let data = [0xaa; 128];
        {
            let mut orch = Orchestrator::new(&mut sim, regs);
            orch.erase_sector(0).unwrap();
            assert_eq!(orch.phase(), Phase::Done);
        }
        assert_eq!(sim.log.last(), Some(&Access::Read(regs.sts, STATUS_DONE)));
        sim.log.clear();

        let status = Orchestrator::new(&mut sim, regs)
            .program(FlashModel::WordProgram(G), &job(&data, 0, page_buffer()))
            .unwrap();
        assert_eq!(status, STATUS_DONE);
        assert!(sim.flash[..128].iter().all(|&b| b == 0xaa));

        let opr: Vec<u32> = sim.log.iter().filter_map(|a| match a {
            Access::Write(addr, v) if *addr == regs.opr => Some(*v),
            _ => None,
        }).collect();
        // erase arm, unlock, lock
        assert_eq!(opr, vec![0x02, 0x72, 0x92, 0xc2, 0x00, 0x70, 0x90, 0xc0, 0xff]);

        let unlock = sim.log.iter().position(|a| *a == Access::Write(regs.opr, 0xc0)).unwrap();
        let lock = sim.log.iter().position(|a| *a == Access::Write(regs.opr, 0xff)).unwrap();
        let word_writes: Vec<usize> = sim.log.iter().enumerate().filter_map(|(i, a)| match a {
            Access::Write(addr, v) if *addr >= regs.flash_base && *addr < regs.flash_base + 128 && *v == 0xaaaa_aaaa => Some(i),
            _ => None,
        }).collect();
        assert_eq!(word_writes.len(), 32);
        assert!(word_writes.iter().all(|&i| i > unlock && i < lock));
        // every word is followed by a poll that sees three busy reads, then done
        for &i in &word_writes {
            assert_eq!(sim.log[i + 1], Access::Read(regs.sts, 0));
            assert_eq!(sim.log[i + 4], Access::Read(regs.sts, STATUS_DONE));
        }
    }

    #[test]
    fn row_page_goes_out_in_halves() {
        init_logger();
        let mut sim = SimFlash::row();
        let regs = row::registers();
        let data = [0xaa; 128];
        let status = Orchestrator::new(&mut sim, regs)
            .program(FlashModel::RowProgram(G), &job(&data, 0, page_buffer()))
            .unwrap();
        assert_eq!(status, STATUS_DONE);
        assert!(sim.flash[..128].iter().all(|&b| b == 0xaa));
        assert!(sim.flash[128..512].iter().all(|&b| b == 0xff));

        let staged: Vec<&Access> = sim.log.iter().filter(|a| matches!(a, Access::WriteBuffer { .. })).collect();
        assert_eq!(staged, vec![&Access::WriteBuffer { address: row::PAGE_BUFFER, len: 256 }]);
        // one read after the erase, one after the only row
        let status_reads = sim.log.iter().filter(|a| matches!(a, Access::Read(r, _) if *r == regs.sts)).count();
        assert_eq!(status_reads, 2);
    }

    #[test]
    fn six_hundred_bytes_make_two_chunks() {
        let mut sim = SimFlash::row();
        let regs = row::registers();
        let data: Vec<u8> = (0..600).map(|i| i as u8).collect();
        Orchestrator::new(&mut sim, regs)
            .program(FlashModel::RowProgram(G), &job(&data, 0x400, page_buffer()))
            .unwrap();
        assert_eq!(&sim.flash[0x400..0x400 + 600], &data[..]);

        let erases: Vec<u32> = sim.log.windows(2).filter_map(|w| match (w[0], w[1]) {
            (Access::Write(opr, 0xc2), Access::Write(addr, 1)) if opr == regs.opr => Some(addr - regs.flash_base),
            _ => None,
        }).collect();
        assert_eq!(erases, vec![0x400, 0x600]);
        let staged = sim.log.iter().filter(|a| matches!(a, Access::WriteBuffer { .. })).count();
        // 512 = two rows, 88 = one row
        assert_eq!(staged, 3);
    }

    #[test]
    fn failure_reports_the_page_to_resume_from() {
        init_logger();
        let mut sim = SimFlash::row();
        sim.fail = Some((Operation::Program, 0x10, 2));
        let data = [0x55; 1024];
        let mut orch = Orchestrator::new(&mut sim, row::registers());
        match orch.program(FlashModel::RowProgram(G), &job(&data, 0, page_buffer())) {
            Err(Error::Protocol(ProtocolError::Status { op, value, offset })) => {
                assert_eq!((op, value, offset), (Operation::Program, 0x10, 0x200));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(orch.phase(), Phase::Failed);
        assert!(sim.flash[..512].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn word_timeout_still_relocks() {
        let mut sim = SimFlash::word();
        sim.busy_reads = POLL_LIMIT + 1;
        let regs = word::registers();
        let data = [0; 8];
        let r = Orchestrator::new(&mut sim, regs).program(FlashModel::WordProgram(G), &job(&data, 0, page_buffer()));
        assert!(matches!(r, Err(Error::Protocol(ProtocolError::Status { value: 0, offset: 0, .. }))));
        assert_eq!(sim.log.last(), Some(&Access::Write(regs.opr, 0xff)));
        let polls = sim.log.iter().filter(|a| **a == Access::Read(regs.sts, 0)).count();
        assert_eq!(polls as u32, POLL_LIMIT);
    }

    #[test]
    fn failed_erase_stops_before_programming() {
        let mut sim = SimFlash::word();
        sim.fail = Some((Operation::Erase, 0x08, 0));
        let regs = word::registers();
        let data = [0; 4];
        let mut orch = Orchestrator::new(&mut sim, regs);
        let r = orch.program(FlashModel::WordProgram(G), &job(&data, 0, page_buffer()));
        assert!(matches!(r, Err(Error::Protocol(ProtocolError::Status { op: Operation::Erase, value: 0x08, .. }))));
        assert!(!sim.log.contains(&Access::Write(regs.opr, 0xc0)));
    }

    #[test]
    fn misaligned_offsets_are_rejected() {
        let mut sim = SimFlash::word();
        let data = [0; 4];
        let r = Orchestrator::new(&mut sim, word::registers())
            .program(FlashModel::WordProgram(G), &job(&data, 4, page_buffer()));
        assert!(matches!(r, Err(Error::Syntax(_))));
    }

    #[test]
    fn verify_reports_a_mismatch_separately() {
        let mut sim = SimFlash::word();
        let data = [0x5a; 8];
        let mut orch = Orchestrator::new(&mut sim, word::registers());
        orch.program(FlashModel::WordProgram(G), &job(&data, 0x80, page_buffer())).unwrap();
        orch.verify(0x80, &data).unwrap();
        assert_eq!(orch.phase(), Phase::Done);

        let r = orch.verify(0x80, &[0x5a, 0x5a, 0x00]);
        assert!(matches!(r, Err(Error::VerifyMismatch { address: 0x2082, expected: 0, found: 0x5a })));
        assert_eq!(orch.phase(), Phase::Failed);
    }
}
