//! Flash banks and the machinery that erases and programs them.
//!
//! `FlashBank` is what callers use.  It validates sector ranges, realigns writes to the
//! driver's granularity and delegates to a `FlashDriver`.  The Phoenix driver in `phoenix`
//! identifies the silicon through its model register and either drives the flash controller
//! from the host with an `Orchestrator`, or uploads a programming algorithm through an
//! `AlgorithmLoader` when the target can run code.
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::config::BankConfig;
use crate::error::Result;
use crate::target::TargetMemory;

pub mod bank;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod phoenix;
#[cfg(test)]
pub(crate) mod sim;

pub use bank::{FlashBank, Sector};
pub use loader::{AlgorithmJob, AlgorithmLoader};
pub use model::{FlashModel, Geometry};
pub use orchestrator::{Orchestrator, Registers};
pub use phoenix::{Family, PhoenixFlash};

/// What a flash failure was doing at the time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Erase,
    Program,
    Protect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Erase => "erase",
            Operation::Program => "program",
            Operation::Protect => "protect",
        };
        f.write_str(s)
    }
}

/// Progress of one erase or program call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Erasing,
    Protecting,
    Programming,
    VerifyingStatus,
    Done,
    Failed,
}

/// A concrete flash controller.  Offsets are relative to the bank base.
pub trait FlashDriver {
    fn name(&self) -> &'static str;

    /// Identify the device and return its sector table
    fn probe(&mut self, target: &mut dyn TargetMemory, bank: &BankConfig) -> Result<Vec<Sector>>;

    fn erase(&mut self, target: &mut dyn TargetMemory, offset: u32, size: u32) -> Result<()>;

    /// `offset` and `data.len()` are multiples of `granularity`
    fn write(&mut self, target: &mut dyn TargetMemory, data: &[u8], offset: u32) -> Result<()>;

    /// Smallest aligned unit `write` accepts
    fn granularity(&self) -> u32 {
        4
    }

    fn erased_value(&self) -> u8 {
        0xff
    }

    /// Whether `write` erases every granule it touches first, so bytes around the data
    /// must be handed back to it
    fn erases_on_write(&self) -> bool {
        false
    }

    /// Returns whether the sectors are now protected
    fn protect(&mut self, _target: &mut dyn TargetMemory, set: bool, _first: usize, _last: usize) -> Result<bool> {
        Ok(set)
    }

    fn info(&self) -> String;
}
