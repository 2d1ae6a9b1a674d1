//! Adapter backends.  A backend only moves bytes between the host and one physical adapter; it
//! knows nothing about TAP states or scans.  The command queue in `crate::queue` owns all of that
//! and talks to backends through the `Backend` trait.
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::time::Duration;

use crate::codec::Sequence;
use crate::config::{AdapterConfig, BackendKind};
use crate::error::{AdapterError, Result};

pub mod gpio;
pub mod loopback;

#[cfg(feature = "ftdi")]
pub mod ftdi;
#[cfg(feature = "hid")]
pub mod hid;
#[cfg(feature = "std")]
pub mod usb;

/// Who we ended up talking to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vid: u16,
    pub pid: u16,
    pub serial: Option<String>,
}

pub trait Backend {
    fn name(&self) -> &'static str;

    /// Largest frame the adapter accepts in one write
    fn packet_size(&self) -> usize;

    fn allocate_packet_buffer(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| AdapterError::OutOfMemory)?;
        buf.resize(size, 0);
        Ok(buf)
    }

    /// Send `buf`.  Returns the number of bytes the adapter accepted.
    fn write(&mut self, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Receive into `buf`.  Returns the number of bytes received, which may be fewer than asked
    /// for.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Release the device.  Calling it again does nothing.
    fn close(&mut self);

    fn delay(&mut self, duration: Duration) {
        #[cfg(feature = "std")]
        std::thread::sleep(duration);
        #[cfg(not(feature = "std"))]
        let _ = duration;
    }

    fn identity(&self) -> Option<&DeviceIdentity> {
        None
    }

    /// Backends that can clock sequences themselves return the captured TDO words here instead
    /// of going through a codec.
    fn execute_native(&mut self, _seqs: &[Sequence]) -> Option<Result<Vec<u64>>> {
        None
    }
}

/// Open the backend named by `config`
pub fn open(config: &AdapterConfig) -> Result<Box<dyn Backend>> {
    log::debug!("opening {:?} backend", config.backend);
    match config.backend {
        BackendKind::Loopback => {
            let size = config.packet_size.unwrap_or(loopback::DEFAULT_PACKET_SIZE);
            Ok(Box::new(loopback::Loopback::new(size)))
        }
        #[cfg(feature = "std")]
        BackendKind::Usb => Ok(Box::new(usb::UsbBulk::open(&config.criteria)?)),
        #[cfg(feature = "hid")]
        BackendKind::Hid => Ok(Box::new(hid::HidBackend::open(&config.criteria)?)),
        #[cfg(feature = "ftdi")]
        BackendKind::Ftdi => Ok(Box::new(ftdi::FtdiBitbang::open(
            &config.criteria,
            config.speed_khz,
            crate::codec::PinMap::default(),
        )?)),
        #[allow(unreachable_patterns)]
        other => Err(crate::error::ConfigError::BackendUnavailable(backend_name(other)).into()),
    }
}

fn backend_name(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Usb => "usb",
        BackendKind::Hid => "hid",
        BackendKind::Ftdi => "ftdi",
        BackendKind::Loopback => "loopback",
    }
}
