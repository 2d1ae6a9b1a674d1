//! Error taxonomy shared by the queue, the backends and the flash code.
//!
//! Four families matter to callers: configuration mistakes that must be fixed
//! before retrying, adapter failures that may go away after reopening the
//! session, protocol failures that need an explicit TAP reset, and verify
//! mismatches that must be reported and never retried.
use alloc::string::String;

use thiserror::Error;

use crate::flash::Operation;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller handed us something malformed.
    #[error("invalid request: {0}")]
    Syntax(&'static str),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Read-back after programming did not match the source data.
    #[error("verify mismatch at {address:#010x}: expected {expected:#04x}, found {found:#04x}")]
    VerifyMismatch {
        address: u32,
        expected: u8,
        found: u8,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no vendor/product id pairs given")]
    EmptyMatchList,
    #[error("unknown adapter backend `{0}`")]
    UnknownBackend(String),
    #[error("malformed USB location `{0}`")]
    InvalidLocation(String),
    #[error("backend `{0}` is not compiled in")]
    BackendUnavailable(&'static str),
    #[error("unrecognized flash model id {0:#x}")]
    UnknownModel(u32),
    #[error("bank base {base:#010x} invalid, expected {expected:#010x}")]
    BankBase { base: u32, expected: u32 },
    #[error("bank has not been probed")]
    NotProbed,
    #[error("sector table does not cover the bank contiguously")]
    SectorTable,
    #[error("no working area large enough for {0} bytes")]
    NoWorkingArea(u32),
    #[error("codec `{0}` cannot be used with backend `{1}`")]
    Codec(&'static str, &'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("no matching device found")]
    NotFound,
    #[error("device busy or access denied")]
    Busy,
    #[error("transfer timed out")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("out of memory for packet buffer")]
    OutOfMemory,
    #[error("session is closed")]
    Closed,
    #[error("short transfer: {done} of {expected} bytes")]
    ShortTransfer { done: usize, expected: usize },
    #[error("I/O failure: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A status register or status byte read back something other than the
    /// "operation complete" value. `offset` is the flash offset at which a
    /// resumed call should start.
    #[error("{op} status {value:#x} at offset {offset:#x}")]
    Status { op: Operation, value: u32, offset: u32 },
    /// The adapter reported a non-zero status for a command frame.
    #[error("adapter status {0:#04x}")]
    AdapterStatus(u8),
    #[error("malformed response frame")]
    Framing,
    /// The tracked TAP state is unknown; queue a reset first.
    #[error("TAP state unknown, reset required")]
    Desync,
    #[error("flash algorithm did not finish after {0} polls")]
    AlgorithmTimeout(u32),
    #[error("flash algorithm overran its stack")]
    StackOverrun,
}

/// Numeric result codes surfaced to the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    SyntaxError = -601,
    Fail = -4,
    TimeoutReached = -6,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Syntax(_) => ErrorCode::SyntaxError,
            Error::Adapter(AdapterError::Timeout) => ErrorCode::TimeoutReached,
            Error::Protocol(ProtocolError::AlgorithmTimeout(_)) => ErrorCode::TimeoutReached,
            _ => ErrorCode::Fail,
        }
    }

    /// Only adapter failures are worth retrying, and only after reopening.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Adapter(_))
    }

    /// Raw status register value, when the failure carries one.
    pub fn status_value(&self) -> Option<u32> {
        match self {
            Error::Protocol(ProtocolError::Status { value, .. }) => Some(*value),
            Error::Protocol(ProtocolError::AdapterStatus(s)) => Some(u32::from(*s)),
            _ => None,
        }
    }
}

impl From<&Result<()>> for ErrorCode {
    fn from(r: &Result<()>) -> Self {
        match r {
            Ok(()) => ErrorCode::Ok,
            Err(e) => e.code(),
        }
    }
}

#[cfg(feature = "std")]
impl From<rusb::Error> for AdapterError {
    fn from(e: rusb::Error) -> Self {
        use alloc::string::ToString;
        match e {
            rusb::Error::Timeout => AdapterError::Timeout,
            rusb::Error::NoDevice => AdapterError::Disconnected,
            rusb::Error::Busy | rusb::Error::Access => AdapterError::Busy,
            rusb::Error::NotFound => AdapterError::NotFound,
            rusb::Error::NoMem => AdapterError::OutOfMemory,
            other => AdapterError::Io(other.to_string()),
        }
    }
}

#[cfg(feature = "std")]
impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::Adapter(e.into())
    }
}
