//! A convenience wrapper for JTAG scan chains with multiple TAPs present.  `Taps` allows the
//! client to interact with one selected TAP as if it were the only TAP in the chain, so that the
//! client doesn't have to deal with putting the other TAPs into bypass and shifting data through
//! the bypass registers.
//!
//! TAP 0 is the one nearest TDI.  Bits shifted first travel furthest, so every scan is laid out
//! as: padding for the TAPs after the selected one, the selected TAP's bits, then padding for the
//! TAPs before it.
use alloc::vec;
use alloc::vec::Vec;
use core::ops::DerefMut;

use log::{info, warn};

use crate::cable::Backend;
use crate::codec::get_bits;
use crate::error::{Error, Result};
use crate::queue::{AdapterSession, CaptureId, Command, ScanField};
use crate::statemachine::{Register, TapState};

/// Longest instruction register chain `detect` looks through
pub const MAX_IR_CHAIN: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tap {
    pub irlen: usize,
    /// `None` for TAPs that come up in BYPASS
    pub idcode: Option<u32>,
}

pub struct Taps<T>
    where T: DerefMut,
          T::Target: Backend
{
    pub session: AdapterSession<T>,
    taps: Vec<Tap>,
    active: usize,
}

/// Pad fields are only added when they have bits in them
fn push_ones(fields: &mut Vec<ScanField<'_>>, bits: usize) {
    if bits > 0 {
        fields.push(ScanField::ones(bits));
    }
}

impl<T, U> Taps<T>
    where T: DerefMut<Target=U>,
          U: Backend + ?Sized
{
    /// Create an object using an existing session
    pub fn new(session: AdapterSession<T>) -> Self {
        Self {
            session,
            taps: Vec::new(),
            active: 0,
        }
    }

    /// Add a TAP to the scan chain with the given instruction register length
    pub fn add_tap(&mut self, irlen: usize) {
        self.taps.push(Tap { irlen, idcode: None });
    }

    pub fn taps(&self) -> &[Tap] {
        &self.taps
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Attempt to autodetect the number of TAPs on the scan chain and the instruction register
    /// length for each.  Relies on every TAP capturing `...01` into its IR, and on IDCODE (which
    /// always has bit 0 set) or BYPASS being selected after reset.
    pub fn detect(&mut self) -> Result<()> {
        self.taps.clear();
        self.active = 0;

        self.session.reset()?;
        let ones = vec![0xff; MAX_IR_CHAIN / 8];
        let ir = self.session.read_write_reg(Register::Instruction, &ones, MAX_IR_CHAIN)?;

        let mut count: i32 = -1;
        let mut irlen = vec![];
        for i in 0..MAX_IR_CHAIN {
            if get_bits(&ir, i, 1) != 0 {
                if count > 0 {
                    irlen.push(count as usize + 1);
                }
                if count == 0 {
                    break;
                }
                count = 0;
            } else {
                count += 1;
            }
        }
        if irlen.is_empty() {
            warn!("no TAPs found on the scan chain");
            return Ok(());
        }

        // Shifting ones into every IR selected BYPASS; start over for the IDCODEs
        self.session.reset()?;
        let bits = irlen.len() * 32;
        let ones = vec![0xff; bits / 8];
        let dr = self.session.read_write_reg(Register::Data, &ones, bits)?;

        let mut ids = vec![];
        let mut pos = 0;
        for _ in 0..irlen.len() {
            if get_bits(&dr, pos, 1) == 0 {
                ids.push(None);
                pos += 1;
            } else {
                ids.push(Some(get_bits(&dr, pos, 32) as u32));
                pos += 32;
            }
        }

        // The first bits out belong to the TAP nearest TDO
        irlen.reverse();
        ids.reverse();

        for (i, (irlen, idcode)) in irlen.into_iter().zip(ids).enumerate() {
            match idcode {
                Some(id) => info!("tap {}: IR length {}, idcode {:#010x}", i, irlen, id),
                None => info!("tap {}: IR length {}, no idcode", i, irlen),
            }
            self.taps.push(Tap { irlen, idcode });
        }
        Ok(())
    }

    fn check_active(&self) -> Result<&Tap> {
        self.taps
            .get(self.active)
            .ok_or(Error::Syntax("no such TAP on the chain"))
    }

    /// IR bits of the TAPs nearer TDO and nearer TDI than the selected one
    fn ir_padding(&self) -> (usize, usize) {
        let after = self.taps[self.active + 1..].iter().map(|t| t.irlen).sum();
        let before = self.taps[..self.active].iter().map(|t| t.irlen).sum();
        (after, before)
    }

    /// One BYPASS bit per other TAP
    fn dr_padding(&self) -> (usize, usize) {
        (self.taps.len() - self.active - 1, self.active)
    }

    /// Select which TAP in the scan chain to operate upon.  `ir` will be shifted into its
    /// instruction register, and the other TAPs put into bypass.
    pub fn select_tap(&mut self, tap: usize, ir: &[u8]) -> Result<()> {
        if tap >= self.taps.len() {
            return Err(Error::Syntax("no such TAP on the chain"));
        }
        self.session.reset()?;
        self.active = tap;
        self.write_ir(ir)
    }

    /// Shift `ir` into the instruction register of the TAP selected by `select_tap`.  Queued;
    /// goes out with the next flush.
    pub fn write_ir(&mut self, ir: &[u8]) -> Result<()> {
        let irlen = self.check_active()?.irlen;
        if ir.len() != (irlen + 7) / 8 {
            return Err(Error::Syntax("IR value does not match the IR length"));
        }
        let (after, before) = self.ir_padding();

        let mut fields = vec![];
        push_ones(&mut fields, after);
        fields.push(ScanField::write(irlen, ir));
        push_ones(&mut fields, before);
        self.session.enqueue(Command::Scan {
            register: Register::Instruction,
            fields,
            end_state: TapState::Idle,
        })?;
        Ok(())
    }

    /// Read the instruction register of the TAP selected by `select_tap`.  Every TAP is left in
    /// BYPASS afterwards.
    pub fn read_ir(&mut self) -> Result<Vec<u8>> {
        let irlen = self.check_active()?.irlen;
        let (after, before) = self.ir_padding();

        let mut fields = vec![];
        push_ones(&mut fields, after);
        fields.push(ScanField::read(irlen));
        push_ones(&mut fields, before);
        let ids = self.session.enqueue(Command::Scan {
            register: Register::Instruction,
            fields,
            end_state: TapState::Idle,
        })?;
        self.session.flush()?;
        self.session.take_capture(ids[0])
    }

    fn dr_scan(&mut self, field: ScanField<'_>) -> Result<Option<CaptureId>> {
        self.check_active()?;
        let (after, before) = self.dr_padding();

        let mut fields = vec![];
        push_ones(&mut fields, after);
        fields.push(field);
        push_ones(&mut fields, before);
        let ids = self.session.enqueue(Command::Scan {
            register: Register::Data,
            fields,
            end_state: TapState::Idle,
        })?;
        Ok(ids.first().copied())
    }

    /// Shift `bits` bits of `dr` into the data register of the selected TAP.  Queued.
    pub fn write_dr(&mut self, dr: &[u8], bits: usize) -> Result<()> {
        self.dr_scan(ScanField::write(bits, dr)).map(|_| ())
    }

    /// Queue a data register scan whose output is wanted later
    pub fn queue_read_write_dr(&mut self, dr: &[u8], bits: usize) -> Result<CaptureId> {
        self.dr_scan(ScanField::read_write(bits, dr))?
            .ok_or(Error::Syntax("scan produced no capture"))
    }

    /// Read the data register of the TAP selected by `select_tap`.  `bits` indicates the length of
    /// the data register for the current instruction.
    pub fn read_dr(&mut self, bits: usize) -> Result<Vec<u8>> {
        let id = self
            .dr_scan(ScanField::read(bits))?
            .ok_or(Error::Syntax("scan produced no capture"))?;
        self.session.flush()?;
        self.session.take_capture(id)
    }

    pub fn read_write_dr(&mut self, dr: &[u8], bits: usize) -> Result<Vec<u8>> {
        let id = self.queue_read_write_dr(dr, bits)?;
        self.session.flush()?;
        self.session.take_capture(id)
    }
}
