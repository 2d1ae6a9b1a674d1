//! CMSIS-DAP style adapters that talk through HID reports
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use hidapi::{DeviceInfo, HidApi, HidDevice, HidError};
use log::{debug, trace};

use crate::cable::{Backend, DeviceIdentity};
use crate::config::MatchCriteria;
use crate::error::{AdapterError, Error, Result};

const REPORT_ID: u8 = 0x00;
const DEFAULT_REPORT_SIZE: usize = 64;
const ATMEL_REPORT_SIZE: usize = 512;
const VID_ATMEL: u16 = 0x03eb;
const VID_NXP: u16 = 0x1fc9;
const PID_LPC_LINK2: u16 = 0x0090;

impl From<HidError> for Error {
    fn from(e: HidError) -> Self {
        Error::Adapter(AdapterError::Io(e.to_string()))
    }
}

pub struct HidBackend {
    // Enumeration state lives and dies with the session
    _api: HidApi,
    device: Option<HidDevice>,
    report_size: usize,
    identity: DeviceIdentity,
    report: Vec<u8>,
}

fn matches(criteria: &MatchCriteria, info: &DeviceInfo) -> bool {
    let (vid, pid) = (info.vendor_id(), info.product_id());
    let id_ok = if criteria.ids.is_empty() {
        info.product_string().map_or(false, |p| p.contains("CMSIS-DAP"))
    } else {
        criteria.matches_id(vid, pid)
    };
    if !id_ok || !criteria.matches_serial(info.serial_number()) {
        return false;
    }
    // LPC-Link2 exposes several HID interfaces; only the first one is the DAP
    !(vid == VID_NXP && pid == PID_LPC_LINK2 && info.interface_number() != 0)
}

fn report_size(vid: u16, pid: u16) -> usize {
    if vid == VID_ATMEL && pid != 0x2145 && pid != 0x2175 {
        ATMEL_REPORT_SIZE
    } else {
        DEFAULT_REPORT_SIZE
    }
}

impl HidBackend {
    pub fn open(criteria: &MatchCriteria) -> Result<Self> {
        let api = HidApi::new()?;
        let info = api
            .device_list()
            .find(|info| matches(criteria, info))
            .ok_or(AdapterError::NotFound)?;

        let identity = DeviceIdentity {
            vid: info.vendor_id(),
            pid: info.product_id(),
            serial: info.serial_number().map(|s| s.to_string()),
        };
        let device = info.open_device(&api)?;
        let report_size = report_size(identity.vid, identity.pid);
        debug!(
            "opened HID {:04x}:{:04x}, report size {}",
            identity.vid, identity.pid, report_size
        );

        Ok(Self {
            _api: api,
            device: Some(device),
            report_size,
            identity,
            report: vec![0; report_size + 1],
        })
    }
}

impl Backend for HidBackend {
    fn name(&self) -> &'static str {
        "hid"
    }

    fn packet_size(&self) -> usize {
        self.report_size
    }

    /// Reports always go out whole: report id first, then the data, zero padded
    fn write(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize> {
        let device = self.device.as_ref().ok_or(AdapterError::Closed)?;
        if buf.len() > self.report_size {
            return Err(AdapterError::ShortTransfer {
                done: self.report_size,
                expected: buf.len(),
            }
            .into());
        }
        self.report.fill(0);
        self.report[0] = REPORT_ID;
        self.report[1..=buf.len()].copy_from_slice(buf);
        let n = device.write(&self.report)?;
        trace!("HID <- {} bytes", n);
        Ok(buf.len().min(n.saturating_sub(1)))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let device = self.device.as_ref().ok_or(AdapterError::Closed)?;
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let n = device.read_timeout(buf, ms)?;
        if n == 0 {
            return Err(AdapterError::Timeout.into());
        }
        trace!("HID -> {} bytes", n);
        Ok(n)
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("closed HID {:04x}:{:04x}", self.identity.vid, self.identity.pid);
        }
    }

    fn identity(&self) -> Option<&DeviceIdentity> {
        Some(&self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atmel_report_sizes() {
        assert_eq!(report_size(0x03eb, 0x2111), 512);
        assert_eq!(report_size(0x03eb, 0x2145), 64);
        assert_eq!(report_size(0x03eb, 0x2175), 64);
        assert_eq!(report_size(0x0d28, 0x0204), 64);
    }
}
