use alloc::collections::VecDeque;
use alloc::format;
use alloc::vec::Vec;
use core::time::Duration;

use embedded_hal::{delay::DelayNs, digital::{InputPin, OutputPin, PinState}};

use crate::cable::Backend;
use crate::codec::{PinMap, Sequence};
use crate::error::{AdapterError, Error, Result};

const PACKET_SIZE: usize = 4096;

fn pin_error<E: embedded_hal::digital::Error>(e: E) -> Error {
    AdapterError::Io(format!("gpio: {:?}", e.kind())).into()
}

/// Bit-bangs JTAG on plain GPIO pins.  Bytes written through `Backend::write` are interpreted
/// in the synchronous bit-bang layout described by `pins`; each one is applied to the pins and
/// answered with one sample, exactly as an FT232R would.  Queues that know about the pins skip
/// the bytes entirely and call `execute_native`.
pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
    pins: PinMap,
    rx: VecDeque<u8>,
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    pub fn new(freq_khz: u32, clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Gpio<Clk, Tdi, Tdo, Tms, Delay> {
        let period_ns = 1_000_000 / freq_khz.max(1);
        let half_period = period_ns / 2;
        Gpio { half_period, clock, tdi, tdo, tms, delay, pins: PinMap::default(), rx: VecDeque::new() }
    }

    /// Layout used to interpret written bytes
    pub fn with_pin_map(mut self, pins: PinMap) -> Self {
        self.pins = pins;
        self
    }

    /// One full TCK cycle.  TDO is sampled while the clock is high.
    fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        self.tms.set_state(PinState::from(tms)).map_err(pin_error)?;
        self.tdi.set_state(PinState::from(tdi)).map_err(pin_error)?;
        self.clock.set_high().map_err(pin_error)?;
        let tdo = self.tdo.is_high().map_err(pin_error)?;
        self.delay.delay_ns(self.half_period);
        self.clock.set_low().map_err(pin_error)?;
        self.delay.delay_ns(self.half_period);
        Ok(tdo)
    }

    fn apply(&mut self, byte: u8) -> Result<u8> {
        let bit = |n: u8| PinState::from(byte & (1 << n) != 0);
        self.tms.set_state(bit(self.pins.tms)).map_err(pin_error)?;
        self.tdi.set_state(bit(self.pins.tdi)).map_err(pin_error)?;
        self.clock.set_state(bit(self.pins.tck)).map_err(pin_error)?;
        let sample = (self.tdo.is_high().map_err(pin_error)? as u8) << self.pins.tdo;
        self.delay.delay_ns(self.half_period);
        Ok(sample)
    }

    fn run(&mut self, seqs: &[Sequence]) -> Result<Vec<u64>> {
        let mut captured = Vec::new();
        for seq in seqs {
            let mut value = 0u64;
            for i in 0..seq.bits {
                if self.clock(seq.tms, seq.tdi & (1 << i) != 0)? {
                    value |= 1 << i;
                }
            }
            if seq.capture {
                captured.push(value);
            }
        }
        Ok(captured)
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Backend for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn name(&self) -> &'static str {
        "gpio"
    }

    fn packet_size(&self) -> usize {
        PACKET_SIZE
    }

    fn write(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize> {
        for &byte in buf {
            let sample = self.apply(byte)?;
            self.rx.push_back(sample);
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.rx.is_empty() && !buf.is_empty() {
            return Err(AdapterError::Timeout.into());
        }
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.rx.clear();
    }

    fn delay(&mut self, duration: Duration) {
        self.delay.delay_us(duration.as_micros().min(u32::MAX as u128) as u32);
    }

    fn execute_native(&mut self, seqs: &[Sequence]) -> Option<Result<Vec<u64>>> {
        Some(self.run(seqs))
    }
}
