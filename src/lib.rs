//! This crate drives a JTAG adapter and uses it to program the flash of a target chip.  It
//! is layered the same way you would think about the hardware.
//!
//! At the lowest level is the `Backend` trait in `cable`.  A backend only moves bytes to and
//! from one physical adapter: a USB bulk device, a CMSIS-DAP HID probe, an FTDI chip in
//! synchronous bit-bang mode, or plain GPIO pins through embedded-hal.  A `Codec` from
//! `codec` knows how a given adapter wants TMS/TDI runs framed on the wire.
//!
//! The next level is the `AdapterSession` in `queue`.  It keeps track of the TAP state, turns
//! state moves and register scans into adapter frames and batches them until a flush.  You tell
//! it which state you want (e.g., Reset or Idle) and it gets there along the shortest path.
//! Captured bits come back in enqueue order once the queue is flushed.
//!
//! If there are multiple TAPs in the JTAG chain, you probably want to use the methods
//! associated with the `Taps` struct.  You tell Taps how many TAPs exist and what the IR length
//! is for each one, or let it detect them.  You can then read and write the instruction and
//! data registers for that one TAP, and it will take care of putting other TAPs in BYPASS.
//!
//! On top of that, `target` describes target memory access and on-target algorithm execution,
//! and `flash` implements flash banks: probing, sector erase, aligned writes through either a
//! host-driven register sequence or an uploaded programming algorithm, and read-back verify.
//!
//! # Example
//! ```no_run
//! use jtag_flash::config::{AdapterConfig, BackendKind, CodecKind, MatchCriteria};
//! use jtag_flash::queue;
//! use jtag_flash::taps::Taps;
//!
//! # fn main() -> jtag_flash::Result<()> {
//! let config = AdapterConfig::new(BackendKind::Usb, CodecKind::DapJtagSequence)
//!     .with_criteria(MatchCriteria::from_terminated(&[(0xc251, 0xf001), (0, 0)])?);
//! let session = queue::open(&config)?;
//! let mut taps = Taps::new(session);
//! taps.detect()?;
//!
//! taps.select_tap(0, &[0x08])?;
//! let buf = [0x11, 0x22, 0x33, 0x44];
//! taps.write_dr(&buf, 32)?;
//! taps.session.flush()?;
//! # Ok(())
//! # }
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod cable;
pub mod codec;
pub mod config;
pub mod error;
pub mod flash;
pub mod queue;
pub mod statemachine;
pub mod taps;
pub mod target;

pub use error::{Error, Result};
