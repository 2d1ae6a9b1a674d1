//! CMSIS-DAP `DAP_JTAG_Sequence` framing
use alloc::vec::Vec;

use log::trace;

use crate::codec::{mask, Codec, Sequence};
use crate::error::{ProtocolError, Result};

pub const DAP_JTAG_SEQUENCE: u8 = 0x14;
const DAP_OK: u8 = 0x00;

const INFO_TMS: u8 = 1 << 6;
const INFO_TDO_CAPTURE: u8 = 1 << 7;

pub struct DapJtagSequence;

impl DapJtagSequence {
    /// Sequence info byte: cycle count in the low six bits (0 meaning 64), then TMS and capture
    fn info(seq: &Sequence) -> u8 {
        let mut info = (seq.bits % 64) as u8;
        if seq.tms {
            info |= INFO_TMS;
        }
        if seq.capture {
            info |= INFO_TDO_CAPTURE;
        }
        info
    }
}

impl Codec for DapJtagSequence {
    fn name(&self) -> &'static str {
        "dap-jtag-sequence"
    }

    fn request_overhead(&self) -> usize {
        2
    }

    fn response_overhead(&self) -> usize {
        2
    }

    fn request_len(&self, seq: &Sequence) -> usize {
        1 + seq.bytes()
    }

    fn response_len(&self, seq: &Sequence) -> usize {
        if seq.capture {
            seq.bytes()
        } else {
            0
        }
    }

    fn max_sequences(&self) -> usize {
        255
    }

    fn encode(&self, seqs: &[Sequence], out: &mut Vec<u8>) {
        out.push(DAP_JTAG_SEQUENCE);
        out.push(seqs.len() as u8);
        for seq in seqs {
            out.push(Self::info(seq));
            out.extend_from_slice(&seq.tdi.to_le_bytes()[..seq.bytes()]);
        }
    }

    fn decode(&self, seqs: &[Sequence], response: &[u8], tdo: &mut Vec<u64>) -> Result<()> {
        if response.len() < 2 || response[0] != DAP_JTAG_SEQUENCE {
            return Err(ProtocolError::Framing.into());
        }
        if response[1] != DAP_OK {
            trace!("DAP_JTAG_Sequence status {:#04x}", response[1]);
            return Err(ProtocolError::AdapterStatus(response[1]).into());
        }

        let mut data = &response[2..];
        for seq in seqs.iter().filter(|s| s.capture) {
            let n = seq.bytes();
            if data.len() < n {
                return Err(ProtocolError::Framing.into());
            }
            let mut bytes = [0u8; 8];
            bytes[..n].copy_from_slice(&data[..n]);
            tdo.push(u64::from_le_bytes(bytes) & mask(seq.bits));
            data = &data[n..];
        }
        Ok(())
    }
}
