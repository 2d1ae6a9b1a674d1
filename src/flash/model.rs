use core::fmt;

use crate::error::{ConfigError, Result};

/// Erase unit of the row-programming family
pub const ROW_PAGE: u32 = 512;
/// One row-program operation covers half a page
pub const ROW: u32 = 256;
/// Erase unit of the word-programming family
pub const WORD_PAGE: u32 = 128;
pub const WORD: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub flash_size: u32,
    pub ram_size: u32,
}

/// Which programming algorithm the silicon needs, as identified by its model register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashModel {
    /// 512-byte pages written as two 256-byte rows from a page buffer
    RowProgram(Geometry),
    /// 128-byte pages written one word at a time with write protection lifted
    WordProgram(Geometry),
    /// Anything else.  Nothing may be written to a device we cannot identify.
    Unrecognized(u32),
}

impl FlashModel {
    /// Erase unit and programming chunk size
    pub fn page_size(&self) -> Result<u32> {
        match self {
            FlashModel::RowProgram(_) => Ok(ROW_PAGE),
            FlashModel::WordProgram(_) => Ok(WORD_PAGE),
            FlashModel::Unrecognized(id) => Err(ConfigError::UnknownModel(*id).into()),
        }
    }

    /// Size of one program operation inside a page
    pub fn program_unit(&self) -> Result<u32> {
        match self {
            FlashModel::RowProgram(_) => Ok(ROW),
            FlashModel::WordProgram(_) => Ok(WORD),
            FlashModel::Unrecognized(id) => Err(ConfigError::UnknownModel(*id).into()),
        }
    }

    pub fn geometry(&self) -> Option<Geometry> {
        match self {
            FlashModel::RowProgram(g) | FlashModel::WordProgram(g) => Some(*g),
            FlashModel::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for FlashModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashModel::RowProgram(g) => write!(f, "row-program ({}KB, {}KB RAM)", g.flash_size / 1024, g.ram_size / 1024),
            FlashModel::WordProgram(g) => write!(f, "word-program ({}KB, {}KB RAM)", g.flash_size / 1024, g.ram_size / 1024),
            FlashModel::Unrecognized(id) => write!(f, "unrecognized ({:#x})", id),
        }
    }
}
