//! Driver for the Phoenix family of small RISC-V microcontrollers.  Two silicon generations
//! share the flash controller design but not the memory map: the row family programs 256-byte
//! rows out of a page buffer, the word family programs one word at a time.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, error, info, warn};

use crate::config::BankConfig;
use crate::error::{ConfigError, Error, Result};
use crate::flash::bank::Sector;
use crate::flash::loader::AlgorithmLoader;
use crate::flash::model::{FlashModel, Geometry, ROW, ROW_PAGE, WORD_PAGE};
use crate::flash::orchestrator::{Orchestrator, Registers};
use crate::flash::{AlgorithmJob, FlashDriver};
use crate::target::{TargetMemory, WorkingArea};

const EFC_OPR: u32 = 0x1c;
const EFC_STS: u32 = 0x24;

pub mod row {
    use super::*;

    pub const FLASH_BASE: u32 = 0x1010_0000;
    pub const NVR_BASE: u32 = 0x1014_0000;
    pub const EEPROM_BASE: u32 = 0x1018_0000;
    pub const PAGE_BUFFER: u32 = 0x101c_0000;
    pub const EFC_BASE: u32 = 0x4000_0000;
    pub const MODEL_CHK: u32 = 0x4000_1020;
    pub const PMU_CR: u32 = 0x4001_2c00;
    pub const PMU_WPT: u32 = PMU_CR + 0x18;
    /// Written to the model register before reading it back
    pub const MODEL_PROBE: u32 = 0x05;

    pub fn registers() -> Registers {
        Registers { flash_base: FLASH_BASE, opr: EFC_BASE + EFC_OPR, sts: EFC_BASE + EFC_STS }
    }
}

pub mod word {
    use super::*;

    pub const FLASH_BASE: u32 = 0x2000;
    pub const NVR_BASE: u32 = 0x6000;
    pub const EEPROM_BASE: u32 = 0x7000;
    pub const EFC_BASE: u32 = 0xc000;
    pub const MODEL_CHK: u32 = 0xc3fc;
    pub const SYSC_CLKCTRCFG: u32 = 0xc400;
    pub const SYSC_WRPROCFG: u32 = SYSC_CLKCTRCFG + 0x04;

    pub fn registers() -> Registers {
        Registers { flash_base: FLASH_BASE, opr: EFC_BASE + EFC_OPR, sts: EFC_BASE + EFC_STS }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Row,
    Word,
}

impl Family {
    pub fn registers(&self) -> Registers {
        match self {
            Family::Row => row::registers(),
            Family::Word => word::registers(),
        }
    }

    /// Bases a bank may be declared at: main flash, NVR and EEPROM
    pub fn bank_bases(&self) -> [u32; 3] {
        match self {
            Family::Row => [row::FLASH_BASE, row::NVR_BASE, row::EEPROM_BASE],
            Family::Word => [word::FLASH_BASE, word::NVR_BASE, word::EEPROM_BASE],
        }
    }

    fn identify(&self, id: u32) -> FlashModel {
        match (self, id) {
            (Family::Row, 0x05) => FlashModel::RowProgram(Geometry { flash_size: 128 * 1024, ram_size: 10 * 1024 }),
            (Family::Row, 0x00) => FlashModel::RowProgram(Geometry { flash_size: 32 * 1024, ram_size: 4 * 1024 }),
            (Family::Word, 0xf05) => FlashModel::WordProgram(Geometry { flash_size: 16 * 1024, ram_size: 2 * 1024 }),
            (_, id) => FlashModel::Unrecognized(id),
        }
    }

    fn read_model(&self, target: &mut dyn TargetMemory) -> Result<u32> {
        match self {
            Family::Row => {
                target.write_u32(row::MODEL_CHK, row::MODEL_PROBE)?;
                target.read_u32(row::MODEL_CHK)
            }
            Family::Word => target.read_u32(word::MODEL_CHK),
        }
    }

    fn disable_watchdog(&self, target: &mut dyn TargetMemory) -> Result<()> {
        match self {
            Family::Row => {
                let cr = target.read_u32(row::PMU_CR)? & !(1 << 7);
                target.write_u32(row::PMU_WPT, 0xc3)?;
                target.write_u32(row::PMU_WPT, 0x3c)?;
                target.write_u32(row::PMU_CR, cr)
            }
            Family::Word => {
                let cfg = target.read_u32(word::SYSC_CLKCTRCFG)? & !(1 << 2);
                target.write_u32(word::SYSC_WRPROCFG, 0x5a)?;
                target.write_u32(word::SYSC_WRPROCFG, 0xa5)?;
                target.write_u32(word::SYSC_CLKCTRCFG, cfg)
            }
        }
    }

    /// Starting size of the algorithm's source buffer
    fn preferred_buffer(&self) -> u32 {
        match self {
            Family::Row => 8192,
            Family::Word => 1024,
        }
    }

    /// The source buffer is halved until it fits; at this size or below it is not worth it
    fn min_buffer(&self) -> u32 {
        match self {
            Family::Row => ROW,
            Family::Word => WORD_PAGE,
        }
    }

    fn page_size(&self) -> u32 {
        match self {
            Family::Row => ROW_PAGE,
            Family::Word => WORD_PAGE,
        }
    }
}

pub struct PhoenixFlash {
    family: Family,
    model: Option<FlashModel>,
    algorithm: Option<Vec<u8>>,
}

impl PhoenixFlash {
    /// Declare a bank.  Only the main flash, NVR and EEPROM bases are accepted.
    pub fn new(family: Family, bank: &BankConfig) -> Result<Self> {
        let bases = family.bank_bases();
        if !bases.contains(&bank.base) {
            error!(
                "address {:#010x} invalid bank address (try {:#010x}/{:#010x}/{:#010x})",
                bank.base, bases[0], bases[1], bases[2]
            );
            return Err(ConfigError::BankBase { base: bank.base, expected: bases[0] }.into());
        }
        Ok(Self { family, model: None, algorithm: None })
    }

    /// Program through this code blob whenever the target can run it
    pub fn with_algorithm(mut self, code: Vec<u8>) -> Self {
        self.algorithm = Some(code);
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn model(&self) -> Option<FlashModel> {
        self.model
    }

    fn probed_model(&self) -> Result<FlashModel> {
        self.model.ok_or_else(|| ConfigError::NotProbed.into())
    }

    /// Returns false when the target offers no usable working area
    fn write_with_algorithm(&self, target: &mut dyn TargetMemory, data: &[u8], offset: u32) -> Result<bool> {
        let (code, host) = match (&self.algorithm, target.algorithm_host()) {
            (Some(code), Some(host)) => (code, host),
            _ => return Ok(false),
        };
        let loader = AlgorithmLoader::new(self.family.preferred_buffer(), self.family.min_buffer());
        match loader.write(host, code, data, offset) {
            Ok(()) => Ok(true),
            Err(Error::Config(ConfigError::NoWorkingArea(_))) => {
                warn!("no working area for the flash algorithm, programming from the host");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl FlashDriver for PhoenixFlash {
    fn name(&self) -> &'static str {
        "phoenix"
    }

    /// Identify the model, then disable the watchdog so it cannot reset the chip while the
    /// flash is busy.  An unknown model is left alone.
    fn probe(&mut self, target: &mut dyn TargetMemory, bank: &BankConfig) -> Result<Vec<Sector>> {
        let expected = self.family.registers().flash_base;
        if bank.base != expected {
            error!("bank base shall be {:#010x}", expected);
            return Err(ConfigError::BankBase { base: bank.base, expected }.into());
        }

        let id = self.family.read_model(target)?;
        let model = self.family.identify(id);
        self.model = Some(model);
        let geometry = match model.geometry() {
            Some(g) => g,
            None => {
                error!("phoenix model probe failed, id {:#x}", id);
                return Err(ConfigError::UnknownModel(id).into());
            }
        };
        self.family.disable_watchdog(target)?;

        let page = model.page_size()?;
        let sectors = (0..geometry.flash_size / page)
            .map(|i| Sector::new(i * page, page))
            .collect();
        info!("flash: phoenix ({}KB, {}KB RAM)", geometry.flash_size / 1024, geometry.ram_size / 1024);
        Ok(sectors)
    }

    fn erase(&mut self, target: &mut dyn TargetMemory, offset: u32, size: u32) -> Result<()> {
        let page = self.probed_model()?.page_size()?;
        let mut orch = Orchestrator::new(target, self.family.registers());
        let mut at = offset;
        while at < offset + size {
            orch.erase_sector(at)?;
            at += page;
        }
        Ok(())
    }

    fn write(&mut self, target: &mut dyn TargetMemory, data: &[u8], offset: u32) -> Result<()> {
        let model = self.probed_model()?;
        let page = model.page_size()?;
        info!("phoenix write offset={:#x}, count={}", offset, data.len());
        if offset % page != 0 {
            error!("offset not aligned by sector size {}", page);
            return Err(Error::Syntax("offset not aligned to the sector size"));
        }

        if self.write_with_algorithm(target, data, offset)? {
            return Ok(());
        }

        let work_buffer = match self.family {
            Family::Row => WorkingArea { address: row::PAGE_BUFFER, size: ROW_PAGE },
            Family::Word => WorkingArea { address: 0, size: 0 },
        };
        let job = AlgorithmJob { target_code: &[], work_buffer, source_data: data, offset };
        let status = Orchestrator::new(target, self.family.registers()).program(model, &job)?;
        debug!("write finished with status {:#x}", status);
        Ok(())
    }

    /// Pages are erased before they are programmed, so writes go out a page at a time
    fn granularity(&self) -> u32 {
        self.family.page_size()
    }

    fn erases_on_write(&self) -> bool {
        true
    }

    fn protect(&mut self, _target: &mut dyn TargetMemory, set: bool, first: usize, last: usize) -> Result<bool> {
        info!("phoenix protect set={}, first={}, last={}: not supported, sectors stay writable", set, first, last);
        Ok(false)
    }

    fn info(&self) -> String {
        match self.model {
            Some(model) => format!("phoenix {:?} family, {}", self.family, model),
            None => format!("phoenix {:?} family, not probed", self.family),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::sim::{Access, SimFlash};
    use crate::queue::tests::init_logger;
    use alloc::vec;

    fn probed(sim: &mut SimFlash, family: Family, base: u32) -> PhoenixFlash {
        let bank = BankConfig::new("flash", base, 0);
        let mut drv = PhoenixFlash::new(family, &bank).unwrap();
        drv.probe(sim, &bank).unwrap();
        drv
    }

    #[test]
    fn declaration_checks_the_base() {
        assert!(PhoenixFlash::new(Family::Row, &BankConfig::new("nvr", row::NVR_BASE, 0)).is_ok());
        assert!(PhoenixFlash::new(Family::Word, &BankConfig::new("ee", word::EEPROM_BASE, 0)).is_ok());
        let r = PhoenixFlash::new(Family::Row, &BankConfig::new("x", 0x0800_0000, 0));
        assert!(matches!(r, Err(Error::Config(ConfigError::BankBase { base: 0x0800_0000, .. }))));
    }

    #[test]
    fn row_probe_identifies_then_disables_the_watchdog() {
        init_logger();
        let mut sim = SimFlash::row();
        sim.ram.insert(row::PMU_CR, 0x81);
        let bank = BankConfig::new("flash", row::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Row, &bank).unwrap();
        let sectors = drv.probe(&mut sim, &bank).unwrap();
        assert_eq!(sectors.len(), 256);
        assert_eq!(sectors[1], Sector::new(512, 512));
        assert_eq!(
            sim.log,
            vec![
                Access::Write(row::MODEL_CHK, 0x05),
                Access::Read(row::MODEL_CHK, 0x05),
                Access::Read(row::PMU_CR, 0x81),
                Access::Write(row::PMU_WPT, 0xc3),
                Access::Write(row::PMU_WPT, 0x3c),
                Access::Write(row::PMU_CR, 0x01),
            ]
        );
        assert!(drv.info().contains("128KB"));
    }

    #[test]
    fn small_row_part() {
        let mut sim = SimFlash::row();
        sim.model = 0x00;
        let drv = probed(&mut sim, Family::Row, row::FLASH_BASE);
        assert_eq!(drv.model().and_then(|m| m.geometry()).map(|g| g.flash_size), Some(32 * 1024));
    }

    #[test]
    fn word_probe_reads_the_model_only() {
        let mut sim = SimFlash::word();
        let drv = probed(&mut sim, Family::Word, word::FLASH_BASE);
        assert!(matches!(drv.model(), Some(FlashModel::WordProgram(_))));
        assert_eq!(sim.log[0], Access::Read(word::MODEL_CHK, 0xf05));
        assert_eq!(sim.log[2], Access::Write(word::SYSC_WRPROCFG, 0x5a));
        assert_eq!(sim.log[3], Access::Write(word::SYSC_WRPROCFG, 0xa5));
    }

    #[test]
    fn unknown_model_touches_nothing_else() {
        let mut sim = SimFlash::word();
        sim.model = 0x123;
        let bank = BankConfig::new("flash", word::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Word, &bank).unwrap();
        let r = drv.probe(&mut sim, &bank);
        assert!(matches!(r, Err(Error::Config(ConfigError::UnknownModel(0x123)))));
        assert_eq!(sim.log, vec![Access::Read(word::MODEL_CHK, 0x123)]);

        sim.log.clear();
        let r = drv.write(&mut sim, &[0; 4], 0);
        assert!(matches!(r, Err(Error::Config(ConfigError::UnknownModel(0x123)))));
        assert!(sim.log.is_empty());
    }

    #[test]
    fn probe_only_on_main_flash() {
        let mut sim = SimFlash::row();
        let bank = BankConfig::new("nvr", row::NVR_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Row, &bank).unwrap();
        let r = drv.probe(&mut sim, &bank);
        assert!(matches!(r, Err(Error::Config(ConfigError::BankBase { expected: row::FLASH_BASE, .. }))));
        assert!(sim.log.is_empty());
    }

    #[test]
    fn write_needs_a_probe_and_page_alignment() {
        let mut sim = SimFlash::word();
        let bank = BankConfig::new("flash", word::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Word, &bank).unwrap();
        assert!(matches!(drv.write(&mut sim, &[0; 4], 0), Err(Error::Config(ConfigError::NotProbed))));
        drv.probe(&mut sim, &bank).unwrap();
        assert!(matches!(drv.write(&mut sim, &[0; 4], 4), Err(Error::Syntax(_))));
    }

    #[test]
    fn host_driven_write_and_erase() {
        let mut sim = SimFlash::word();
        let mut drv = probed(&mut sim, Family::Word, word::FLASH_BASE);
        drv.write(&mut sim, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88], 0x80).unwrap();
        assert_eq!(&sim.flash[0x80..0x88], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        drv.erase(&mut sim, 0x80, 0x100).unwrap();
        assert!(sim.flash[0x80..0x180].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn algorithm_is_used_when_the_target_can_run_it() {
        let mut sim = SimFlash::row();
        sim.host = true;
        let bank = BankConfig::new("flash", row::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Row, &bank).unwrap().with_algorithm(vec![0x82, 0x80]);
        drv.probe(&mut sim, &bank).unwrap();
        let data = [0x5a; 700];
        drv.write(&mut sim, &data, 0x200).unwrap();
        assert_eq!(sim.runs.len(), 1);
        assert_eq!(sim.runs[0][0], 0x200);
        assert_eq!(sim.runs[0][2], 700);
        assert_eq!(&sim.flash[0x200..0x200 + 700], &data[..]);
    }

    #[test]
    fn falls_back_to_the_host_without_working_area() {
        init_logger();
        let mut sim = SimFlash::row();
        sim.host = true;
        sim.work.size = 64;
        let bank = BankConfig::new("flash", row::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Row, &bank).unwrap().with_algorithm(vec![0x82, 0x80]);
        drv.probe(&mut sim, &bank).unwrap();
        let data = [0x5a; 16];
        drv.write(&mut sim, &data, 0).unwrap();
        assert!(sim.runs.is_empty());
        assert_eq!(&sim.flash[..16], &data[..]);
    }

    #[test]
    fn row_buffer_may_shrink_to_one_page() {
        let mut sim = SimFlash::row();
        sim.host = true;
        // code, stack and a 512-byte buffer, nothing more
        sim.work.size = 4 + 128 + 600;
        let bank = BankConfig::new("flash", row::FLASH_BASE, 0);
        let mut drv = PhoenixFlash::new(Family::Row, &bank).unwrap().with_algorithm(vec![0x82, 0x80]);
        drv.probe(&mut sim, &bank).unwrap();
        let data = [0x3c; 600];
        drv.write(&mut sim, &data, 0).unwrap();
        assert_eq!(sim.alloc_requests, vec![4, 128, 8192, 4096, 2048, 1024, 512]);
        assert_eq!(sim.runs.len(), 2);
        assert_eq!(sim.runs[1][2], 88);
        assert_eq!(&sim.flash[..600], &data[..]);
    }
}
