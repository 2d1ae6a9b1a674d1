//! Vendor-class USB adapters reached over a pair of bulk endpoints
use alloc::string::String;
use core::time::Duration;

use log::{debug, trace, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use rusb::constants::LIBUSB_CLASS_VENDOR_SPEC;

use crate::cable::{Backend, DeviceIdentity};
use crate::config::MatchCriteria;
use crate::error::{AdapterError, Result};

const DEFAULT_PACKET_SIZE: usize = 512;

struct Endpoints {
    interface: u8,
    read: u8,
    write: u8,
    packet_size: usize,
}

pub struct UsbBulk {
    // Keeps libusb alive for as long as the session lasts
    _context: Context,
    handle: Option<DeviceHandle<Context>>,
    endpoints: Endpoints,
    identity: DeviceIdentity,
}

fn read_serial(device: &Device<Context>) -> Option<String> {
    let descriptor = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    handle.read_serial_number_string_ascii(&descriptor).ok()
}

/// First vendor-specific interface with a bulk endpoint in each direction
fn find_endpoints(device: &Device<Context>) -> Result<Endpoints> {
    let config = device.active_config_descriptor()?;
    for i in config.interfaces() {
        for d in i.descriptors() {
            if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC || d.num_endpoints() < 2 {
                continue;
            }

            let mut read = None;
            let mut write = None;
            for e in d.endpoint_descriptors() {
                if e.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match e.direction() {
                    Direction::In => read = read.or(Some(e.address())),
                    Direction::Out => {
                        if write.is_none() {
                            write = Some((e.address(), e.max_packet_size() as usize));
                        }
                    }
                }
            }

            if let (Some(read), Some((write, size))) = (read, write) {
                let packet_size = if size == 0 { DEFAULT_PACKET_SIZE } else { size };
                return Ok(Endpoints {
                    interface: d.interface_number(),
                    read,
                    write,
                    packet_size,
                });
            }
        }
    }
    Err(AdapterError::NotFound.into())
}

impl UsbBulk {
    /// Open the first enumerated device that satisfies `criteria`
    pub fn open(criteria: &MatchCriteria) -> Result<Self> {
        let context = Context::new()?;

        let device = context
            .devices()?
            .iter()
            .find(|device| {
                let Ok(descriptor) = device.device_descriptor() else {
                    return false;
                };
                if !criteria.matches_id(descriptor.vendor_id(), descriptor.product_id()) {
                    return false;
                }
                let ports = device.port_numbers().unwrap_or_default();
                if !criteria.matches_location(device.bus_number(), &ports) {
                    return false;
                }
                if criteria.serial.is_some() {
                    let serial = read_serial(device);
                    if !criteria.matches_serial(serial.as_deref()) {
                        warn!(
                            "skipping {:04x}:{:04x}, serial {:?} does not match",
                            descriptor.vendor_id(),
                            descriptor.product_id(),
                            serial
                        );
                        return false;
                    }
                }
                true
            })
            .ok_or(AdapterError::NotFound)?;

        let descriptor = device.device_descriptor()?;
        let endpoints = find_endpoints(&device)?;
        let handle = device.open()?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(endpoints.interface)?;

        let identity = DeviceIdentity {
            vid: descriptor.vendor_id(),
            pid: descriptor.product_id(),
            serial: handle.read_serial_number_string_ascii(&descriptor).ok(),
        };
        debug!(
            "claimed interface {} of {:04x}:{:04x}, endpoints {:#04x}/{:#04x}, packet size {}",
            endpoints.interface,
            identity.vid,
            identity.pid,
            endpoints.write,
            endpoints.read,
            endpoints.packet_size
        );

        // Drain anything left over from a previous session
        let mut junk = [0; 64];
        let _ = handle.read_bulk(endpoints.read, &mut junk, Duration::from_millis(10));

        Ok(Self {
            _context: context,
            handle: Some(handle),
            endpoints,
            identity,
        })
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        self.handle.as_ref().ok_or_else(|| AdapterError::Closed.into())
    }
}

impl Backend for UsbBulk {
    fn name(&self) -> &'static str {
        "usb"
    }

    fn packet_size(&self) -> usize {
        self.endpoints.packet_size
    }

    fn write(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let n = self.handle()?.write_bulk(self.endpoints.write, buf, timeout)?;
        trace!("usb <- {} bytes", n);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.handle()?.read_bulk(self.endpoints.read, buf, timeout)?;
        trace!("usb -> {} bytes", n);
        Ok(n)
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(self.endpoints.interface);
            debug!("released {:04x}:{:04x}", self.identity.vid, self.identity.pid);
        }
    }

    fn identity(&self) -> Option<&DeviceIdentity> {
        Some(&self.identity)
    }
}

impl Drop for UsbBulk {
    fn drop(&mut self) {
        self.close();
    }
}
