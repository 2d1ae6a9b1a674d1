//! FT232R-style adapters driven in synchronous bit-bang mode.  Every byte written is put on the
//! pins for one baud tick and answered with one byte sampled from the pins at that time, so the
//! read side always returns as many bytes as were written.
use alloc::format;
use core::time::Duration;

use libftd2xx::{BitMode, FtStatus, Ftdi, FtdiCommon};
use log::debug;

use crate::cable::{Backend, DeviceIdentity};
use crate::codec::PinMap;
use crate::config::MatchCriteria;
use crate::error::{AdapterError, Error, Result};

/// The FT232R transmit buffer
const PACKET_SIZE: usize = 256;

impl From<FtStatus> for AdapterError {
    fn from(e: FtStatus) -> Self {
        match e {
            FtStatus::DEVICE_NOT_FOUND => AdapterError::NotFound,
            FtStatus::DEVICE_NOT_OPENED => AdapterError::Busy,
            FtStatus::INSUFFICIENT_RESOURCES => AdapterError::OutOfMemory,
            other => AdapterError::Io(format!("{:?}", other)),
        }
    }
}

impl From<FtStatus> for Error {
    fn from(e: FtStatus) -> Self {
        Error::Adapter(e.into())
    }
}

pub struct FtdiBitbang {
    ft: Option<Ftdi>,
    identity: DeviceIdentity,
    timeout: Duration,
}

impl FtdiBitbang {
    /// Open the first listed FTDI device matching `criteria` and switch it to synchronous
    /// bit-bang on the pins in `pins`.
    pub fn open(criteria: &MatchCriteria, speed_khz: u32, pins: PinMap) -> Result<Self> {
        if let Some(&(vid, pid)) = criteria.ids.first() {
            libftd2xx::set_vid_pid(vid, pid)?;
        }

        let info = libftd2xx::list_devices()?
            .into_iter()
            .find(|d| {
                criteria.matches_id(d.vendor_id, d.product_id)
                    && criteria.matches_serial(Some(d.serial_number.as_str()))
            })
            .ok_or(AdapterError::NotFound)?;

        let mut ft = Ftdi::with_serial_number(&info.serial_number)?;
        // Two bytes per TCK cycle
        ft.set_baud_rate(speed_khz.saturating_mul(500).max(300))?;
        ft.set_bit_mode(pins.output_mask(), BitMode::SyncBitbang)?;
        ft.purge_all()?;
        debug!(
            "opened {} ({:04x}:{:04x}) in sync bit-bang, outputs {:#04x}",
            info.description,
            info.vendor_id,
            info.product_id,
            pins.output_mask()
        );

        Ok(Self {
            ft: Some(ft),
            identity: DeviceIdentity {
                vid: info.vendor_id,
                pid: info.product_id,
                serial: Some(info.serial_number),
            },
            timeout: Duration::ZERO,
        })
    }

    fn ft(&mut self, timeout: Duration) -> Result<&mut Ftdi> {
        let ft = self.ft.as_mut().ok_or(AdapterError::Closed)?;
        if self.timeout != timeout {
            ft.set_timeouts(timeout, timeout)?;
            self.timeout = timeout;
        }
        Ok(ft)
    }
}

impl Backend for FtdiBitbang {
    fn name(&self) -> &'static str {
        "ftdi"
    }

    fn packet_size(&self) -> usize {
        PACKET_SIZE
    }

    fn write(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.ft(timeout)?.write(buf)?)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.ft(timeout)?.read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(AdapterError::Timeout.into());
        }
        Ok(n)
    }

    fn close(&mut self) {
        if let Some(mut ft) = self.ft.take() {
            let _ = ft.close();
        }
    }

    fn identity(&self) -> Option<&DeviceIdentity> {
        Some(&self.identity)
    }
}
