use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info};

use crate::config::BankConfig;
use crate::error::{ConfigError, Error, Result};
use crate::flash::FlashDriver;
use crate::target::{self, TargetMemory};

/// One erase unit.  `None` means not known yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    pub offset: u32,
    pub size: u32,
    pub erased: Option<bool>,
    pub protected: Option<bool>,
}

impl Sector {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size, erased: None, protected: None }
    }
}

/// Sectors must start at 0 and follow each other without gaps
fn check_sectors(sectors: &[Sector]) -> Result<u32> {
    let mut end = 0u32;
    for s in sectors {
        if s.offset != end || s.size == 0 {
            return Err(ConfigError::SectorTable.into());
        }
        end = end.checked_add(s.size).ok_or(ConfigError::SectorTable)?;
    }
    if sectors.is_empty() {
        return Err(ConfigError::SectorTable.into());
    }
    Ok(end)
}

pub struct FlashBank<D> {
    pub config: BankConfig,
    driver: D,
    sectors: Vec<Sector>,
    probed: bool,
}

impl<D: FlashDriver> FlashBank<D> {
    pub fn new(config: BankConfig, driver: D) -> Self {
        Self { config, driver, sectors: Vec::new(), probed: false }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn is_probed(&self) -> bool {
        self.probed
    }

    /// Ask the driver what is there.  The probed size replaces the declared one.
    pub fn probe(&mut self, target: &mut dyn TargetMemory) -> Result<()> {
        self.probed = false;
        let sectors = self.driver.probe(target, &self.config)?;
        let size = check_sectors(&sectors)?;
        if self.config.size != size {
            debug!("{}: size {:#x} from probe, declared {:#x}", self.config.name, size, self.config.size);
            self.config.size = size;
        }
        self.sectors = sectors;
        self.probed = true;
        Ok(())
    }

    /// Probe unless that already happened
    pub fn auto_probe(&mut self, target: &mut dyn TargetMemory) -> Result<()> {
        if self.probed {
            return Ok(());
        }
        self.probe(target)
    }

    fn check_range(&self, first: usize, last: usize) -> Result<()> {
        if !self.probed {
            return Err(ConfigError::NotProbed.into());
        }
        if first > last || last >= self.sectors.len() {
            return Err(Error::Syntax("sector range out of bounds"));
        }
        Ok(())
    }

    fn check_span(&self, offset: u32, len: usize) -> Result<()> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.config.size => Ok(()),
            _ => Err(Error::Syntax("access past the end of the bank")),
        }
    }

    pub fn erase(&mut self, target: &mut dyn TargetMemory, first: usize, last: usize) -> Result<()> {
        self.check_range(first, last)?;
        for i in first..=last {
            let (offset, size) = (self.sectors[i].offset, self.sectors[i].size);
            if let Err(e) = self.driver.erase(target, offset, size) {
                self.sectors[i].erased = None;
                return Err(e);
            }
            self.sectors[i].erased = Some(true);
        }
        Ok(())
    }

    /// Write `data` at `offset`.  The driver only sees whole granules: leading bytes of the
    /// first one are read back from the target, the last one is padded with the erased value,
    /// or read back too when the driver erases before programming.
    pub fn write(&mut self, target: &mut dyn TargetMemory, data: &[u8], offset: u32) -> Result<()> {
        self.auto_probe(target)?;
        self.check_span(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let granule = self.driver.granularity();
        let lead = offset % granule;
        let start = offset - lead;
        let mut buf = vec![0; lead as usize];
        if lead > 0 {
            target.read_buffer(self.config.base + start, &mut buf)?;
            debug!("realigned write at {:#x} to {:#x}", offset, start);
        }
        buf.extend_from_slice(data);
        let filled = buf.len();
        let padded = (filled as u32 + granule - 1) / granule * granule;
        if self.driver.erases_on_write() && padded as usize > filled {
            buf.resize(padded as usize, 0);
            target.read_buffer(self.config.base + start + filled as u32, &mut buf[filled..])?;
        } else {
            buf.resize(padded as usize, self.driver.erased_value());
        }

        self.driver.write(target, &buf, start)?;
        let end = start + padded;
        for s in self.sectors.iter_mut().filter(|s| s.offset < end && s.offset + s.size > start) {
            s.erased = Some(false);
        }
        Ok(())
    }

    pub fn read(&mut self, target: &mut dyn TargetMemory, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len())?;
        target.read_buffer(self.config.base + offset, buf)
    }

    /// Read back `data` at `offset`.  A difference is a `VerifyMismatch`, never retried.
    pub fn verify(&mut self, target: &mut dyn TargetMemory, data: &[u8], offset: u32) -> Result<()> {
        self.check_span(offset, data.len())?;
        target::compare(target, self.config.base + offset, data)?;
        info!("verified {} bytes at {:#010x}", data.len(), self.config.base + offset);
        Ok(())
    }

    pub fn protect(&mut self, target: &mut dyn TargetMemory, set: bool, first: usize, last: usize) -> Result<()> {
        self.check_range(first, last)?;
        let protected = self.driver.protect(target, set, first, last)?;
        for s in &mut self.sectors[first..=last] {
            s.protected = Some(protected);
        }
        Ok(())
    }

    /// Which sectors read back as all erased value
    pub fn erase_check(&mut self, target: &mut dyn TargetMemory) -> Result<Vec<bool>> {
        if !self.probed {
            return Err(ConfigError::NotProbed.into());
        }
        let blank = self.driver.erased_value();
        let mut result = Vec::with_capacity(self.sectors.len());
        for s in self.sectors.iter_mut() {
            let mut buf = vec![0; s.size as usize];
            target.read_buffer(self.config.base + s.offset, &mut buf)?;
            let erased = buf.iter().all(|&b| b == blank);
            s.erased = Some(erased);
            result.push(erased);
        }
        Ok(result)
    }

    pub fn info(&self) -> String {
        if !self.probed {
            return format!("{} ({}): {:#010x}, not probed", self.config.name, self.driver.name(), self.config.base);
        }
        format!(
            "{} ({}): {:#010x}, size={:#x}, {} sectors, {}",
            self.config.name,
            self.driver.name(),
            self.config.base,
            self.config.size,
            self.sectors.len(),
            self.driver.info()
        )
    }
}
