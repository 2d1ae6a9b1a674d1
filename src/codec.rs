//! Adapter-native framing.  The queue lowers every command into `Sequence`s (runs of TCK cycles
//! with a constant TMS level) and a `Codec` turns batches of those into the bytes a particular
//! adapter understands, and pulls TDO back out of the adapter's answer.
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::CodecKind;
use crate::error::Result;

pub mod bitbang;
pub mod dap;

pub use bitbang::{PinMap, SyncBitbang};
pub use dap::DapJtagSequence;

/// Longest run a single `Sequence` may describe
pub const MAX_SEQUENCE_BITS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sequence {
    pub tms: bool,
    /// Number of TCK cycles, 1..=64
    pub bits: usize,
    /// TDI levels, bit 0 first
    pub tdi: u64,
    /// Whether TDO must be sampled during this run
    pub capture: bool,
}

impl Sequence {
    pub fn new(tms: bool, bits: usize, tdi: u64, capture: bool) -> Self {
        debug_assert!(bits > 0 && bits <= MAX_SEQUENCE_BITS);
        Self {
            tms,
            bits,
            tdi: tdi & mask(bits),
            capture,
        }
    }

    /// Split into the first `at` cycles and the rest
    pub fn split(self, at: usize) -> (Sequence, Sequence) {
        let first = Sequence::new(self.tms, at, self.tdi, self.capture);
        let rest = Sequence::new(self.tms, self.bits - at, self.tdi >> at, self.capture);
        (first, rest)
    }

    pub fn bytes(&self) -> usize {
        (self.bits + 7) / 8
    }
}

pub fn mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

pub trait Codec {
    fn name(&self) -> &'static str;

    /// Fixed request bytes per frame
    fn request_overhead(&self) -> usize {
        0
    }

    /// Fixed response bytes per frame
    fn response_overhead(&self) -> usize {
        0
    }

    fn request_len(&self, seq: &Sequence) -> usize;

    fn response_len(&self, seq: &Sequence) -> usize;

    /// Upper bound on sequences per frame
    fn max_sequences(&self) -> usize {
        usize::MAX
    }

    fn encode(&self, seqs: &[Sequence], out: &mut Vec<u8>);

    /// Append the TDO bits of every capturing sequence in `seqs`, in order, to `tdo`.
    fn decode(&self, seqs: &[Sequence], response: &[u8], tdo: &mut Vec<u64>) -> Result<()>;
}

pub fn new_codec(kind: CodecKind) -> Box<dyn Codec> {
    match kind {
        CodecKind::SyncBitbang => Box::new(SyncBitbang::new(PinMap::default())),
        CodecKind::DapJtagSequence => Box::new(DapJtagSequence),
    }
}

/// Run-length encode a TMS path, holding TDI at `tdi`
pub fn tms_sequences(tms: &[bool], tdi: bool, out: &mut Vec<Sequence>) {
    let mut i = 0;
    while i < tms.len() {
        let level = tms[i];
        let mut n = 1;
        while i + n < tms.len() && tms[i + n] == level && n < MAX_SEQUENCE_BITS {
            n += 1;
        }
        let tdi = if tdi { u64::MAX } else { 0 };
        out.push(Sequence::new(level, n, tdi, false));
        i += n;
    }
}

/// Read up to 64 bits starting at bit `start` of an LSB-first byte buffer
pub fn get_bits(data: &[u8], start: usize, bits: usize) -> u64 {
    let mut value = 0u64;
    for i in 0..bits {
        let bit = start + i;
        if data[bit / 8] & (1 << (bit % 8)) != 0 {
            value |= 1 << i;
        }
    }
    value
}

/// Store `bits` bits of `value` at bit `start` of an LSB-first byte buffer
pub fn set_bits(data: &mut [u8], start: usize, bits: usize, value: u64) {
    for i in 0..bits {
        let bit = start + i;
        if value & (1 << i) != 0 {
            data[bit / 8] |= 1 << (bit % 8);
        } else {
            data[bit / 8] &= !(1 << (bit % 8));
        }
    }
}
