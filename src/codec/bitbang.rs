//! Synchronous bit-bang framing, as spoken by FT232R-style adapters and USB-Blaster clones.  Each
//! TCK cycle costs two bytes on the wire: one with the clock low, one with the clock high.
use alloc::vec::Vec;

use crate::codec::{Codec, Sequence};
use crate::error::{ProtocolError, Result};

/// Bit positions of the JTAG signals within a bit-bang byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinMap {
    pub tck: u8,
    pub tms: u8,
    /// Output towards the target
    pub tdi: u8,
    /// Input from the target, position within the returned byte
    pub tdo: u8,
    /// Adapters that only answer when asked set this bit on bytes that should be sampled
    pub read_flag: Option<u8>,
}

impl Default for PinMap {
    /// The EasyFlash 3 FT232R wiring
    fn default() -> Self {
        Self {
            tck: 2,
            tms: 1,
            tdi: 0,
            tdo: 3,
            read_flag: None,
        }
    }
}

impl PinMap {
    pub fn usb_blaster() -> Self {
        Self {
            tck: 0,
            tms: 1,
            tdi: 4,
            tdo: 0,
            read_flag: Some(6),
        }
    }

    /// Output-enable mask for the adapter's bit mode
    pub fn output_mask(&self) -> u8 {
        1 << self.tck | 1 << self.tms | 1 << self.tdi
    }
}

pub struct SyncBitbang {
    pins: PinMap,
}

impl SyncBitbang {
    pub fn new(pins: PinMap) -> Self {
        Self { pins }
    }

    pub fn pins(&self) -> PinMap {
        self.pins
    }

    fn byte(&self, tms: bool, tdi: bool, tck: bool) -> u8 {
        (tms as u8) << self.pins.tms | (tdi as u8) << self.pins.tdi | (tck as u8) << self.pins.tck
    }
}

impl Codec for SyncBitbang {
    fn name(&self) -> &'static str {
        "sync-bitbang"
    }

    /// One trailing byte returns TCK low at the end of every frame
    fn request_overhead(&self) -> usize {
        1
    }

    fn response_overhead(&self) -> usize {
        match self.pins.read_flag {
            Some(_) => 0,
            None => 1,
        }
    }

    fn request_len(&self, seq: &Sequence) -> usize {
        seq.bits * 2
    }

    fn response_len(&self, seq: &Sequence) -> usize {
        match self.pins.read_flag {
            Some(_) if seq.capture => seq.bits,
            Some(_) => 0,
            None => seq.bits * 2,
        }
    }

    fn encode(&self, seqs: &[Sequence], out: &mut Vec<u8>) {
        let mut last = 0;
        for seq in seqs {
            for i in 0..seq.bits {
                let tdi = seq.tdi & (1 << i) != 0;
                out.push(self.byte(seq.tms, tdi, false));
                let mut high = self.byte(seq.tms, tdi, true);
                if let (Some(flag), true) = (self.pins.read_flag, seq.capture) {
                    high |= 1 << flag;
                }
                out.push(high);
                last = self.byte(seq.tms, tdi, false);
            }
        }
        out.push(last);
    }

    fn decode(&self, seqs: &[Sequence], response: &[u8], tdo: &mut Vec<u64>) -> Result<()> {
        let expected: usize = seqs.iter().map(|s| self.response_len(s)).sum();
        if response.len() < expected {
            return Err(ProtocolError::Framing.into());
        }

        let mut pos = 0;
        for seq in seqs {
            let step = match self.pins.read_flag {
                Some(_) if !seq.capture => continue,
                Some(_) => 1,
                None => 2,
            };
            let mut value = 0u64;
            for i in 0..seq.bits {
                // Without a read flag the sample sits in the clock-high byte
                let sample = response[pos + step - 1];
                if sample & (1 << self.pins.tdo) != 0 {
                    value |= 1 << i;
                }
                pos += step;
            }
            if seq.capture {
                tdo.push(value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn two_bytes_per_clock() {
        let codec = SyncBitbang::new(PinMap::default());
        let seqs = [Sequence::new(true, 2, 0b01, false)];
        let mut out = Vec::new();
        codec.encode(&seqs, &mut out);
        // tms = bit 1, tdi = bit 0, tck = bit 2
        assert_eq!(out, vec![0b011, 0b111, 0b010, 0b110, 0b010]);
        assert_eq!(out.len(), codec.request_overhead() + codec.request_len(&seqs[0]));
    }

    #[test]
    fn samples_taken_with_clock_high() {
        let codec = SyncBitbang::new(PinMap::default());
        let seqs = [Sequence::new(false, 3, 0, true)];
        // tdo on bit 3; low bytes carry garbage that must be ignored
        let response = [0x08, 0x08, 0x08, 0x00, 0x00, 0x08, 0x00];
        let mut tdo = Vec::new();
        codec.decode(&seqs, &response, &mut tdo).unwrap();
        assert_eq!(tdo, vec![0b101]);
    }

    #[test]
    fn read_flag_only_on_captured_clocks() {
        let codec = SyncBitbang::new(PinMap::usb_blaster());
        let seqs = [
            Sequence::new(true, 1, 0, false),
            Sequence::new(false, 2, 0b11, true),
        ];
        let mut out = Vec::new();
        codec.encode(&seqs, &mut out);
        let flagged = out.iter().filter(|b| *b & 0x40 != 0).count();
        assert_eq!(flagged, 2);
        assert_eq!(codec.response_len(&seqs[0]), 0);

        let mut tdo = Vec::new();
        codec.decode(&seqs, &[0x01, 0x00], &mut tdo).unwrap();
        assert_eq!(tdo, vec![0b01]);
    }

    #[test]
    fn short_response_is_a_framing_error() {
        let codec = SyncBitbang::new(PinMap::default());
        let seqs = [Sequence::new(false, 4, 0, true)];
        let mut tdo = Vec::new();
        assert!(codec.decode(&seqs, &[0; 3], &mut tdo).is_err());
    }
}
