//! Plain configuration values handed in by whatever parses the user's configuration.
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::str::FromStr;
use core::time::Duration;

use crate::error::{ConfigError, Result};

/// Maximum depth of a USB port path
pub const MAX_USB_PORTS: usize = 7;

/// Physical USB position: bus number and the chain of hub ports leading to the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbLocation {
    pub bus: u8,
    pub ports: Vec<u8>,
}

impl FromStr for UsbLocation {
    type Err = ConfigError;

    /// Parses the `bus-port.port.port` form, e.g. `1-4.2`.
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let bad = || ConfigError::InvalidLocation(s.to_string());
        let (bus, rest) = s.split_once('-').ok_or_else(bad)?;
        let bus = bus.parse().map_err(|_| bad())?;
        let ports = rest
            .split('.')
            .map(|p| p.parse::<u8>().map_err(|_| bad()))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        if ports.is_empty() || ports.len() > MAX_USB_PORTS {
            return Err(bad());
        }
        Ok(UsbLocation { bus, ports })
    }
}

/// Which physical device to pick.  The first enumerated device whose (vid, pid) is in `ids`
/// wins; when `serial` is set it must equal the device serial string exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    pub ids: Vec<(u16, u16)>,
    pub serial: Option<String>,
    pub location: Option<UsbLocation>,
}

impl MatchCriteria {
    pub fn new(ids: &[(u16, u16)]) -> Self {
        Self {
            ids: ids.to_vec(),
            serial: None,
            location: None,
        }
    }

    /// Build from a list terminated by a `(0, 0)` entry.  Anything after the terminator is
    /// ignored.
    pub fn from_terminated(ids: &[(u16, u16)]) -> Result<Self> {
        let ids: Vec<_> = ids.iter().copied().take_while(|&(v, p)| v != 0 || p != 0).collect();
        if ids.is_empty() {
            return Err(ConfigError::EmptyMatchList.into());
        }
        Ok(Self::new(&ids))
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn with_location(mut self, location: UsbLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn matches_id(&self, vid: u16, pid: u16) -> bool {
        self.ids.iter().any(|&(v, p)| v == vid && p == pid)
    }

    /// Exact comparison, never a prefix match
    pub fn matches_serial(&self, serial: Option<&str>) -> bool {
        match &self.serial {
            None => true,
            Some(wanted) => serial == Some(wanted.as_str()),
        }
    }

    pub fn matches_location(&self, bus: u8, ports: &[u8]) -> bool {
        match &self.location {
            None => true,
            Some(loc) => loc.bus == bus && loc.ports == ports,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Usb,
    Hid,
    Ftdi,
    Loopback,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "usb" | "usb_bulk" => Ok(BackendKind::Usb),
            "hid" => Ok(BackendKind::Hid),
            "ftdi" | "ft232r" => Ok(BackendKind::Ftdi),
            "loopback" => Ok(BackendKind::Loopback),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Wire format spoken by the adapter on the other end of the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
    SyncBitbang,
    DapJtagSequence,
}

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub backend: BackendKind,
    pub codec: CodecKind,
    pub criteria: MatchCriteria,
    pub speed_khz: u32,
    pub timeout: Duration,
    /// Overrides the backend's packet size when set
    pub packet_size: Option<usize>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Usb,
            codec: CodecKind::DapJtagSequence,
            criteria: MatchCriteria::default(),
            speed_khz: 1000,
            timeout: Duration::from_millis(1000),
            packet_size: None,
        }
    }
}

impl AdapterConfig {
    pub fn new(backend: BackendKind, codec: CodecKind) -> Self {
        Self {
            backend,
            codec,
            ..Self::default()
        }
    }

    pub fn with_criteria(mut self, criteria: MatchCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_speed_khz(mut self, khz: u32) -> Self {
        self.speed_khz = khz;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = Some(size);
        self
    }
}

/// A flash bank as declared in the configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BankConfig {
    pub name: String,
    pub base: u32,
    pub size: u32,
    pub chip_width: u8,
    pub bus_width: u8,
}

impl BankConfig {
    pub fn new(name: &str, base: u32, size: u32) -> Self {
        Self {
            name: name.to_string(),
            base,
            size,
            chip_width: 4,
            bus_width: 4,
        }
    }
}
