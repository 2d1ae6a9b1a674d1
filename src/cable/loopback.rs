//! A backend with no hardware behind it.  Every written frame comes straight back on the next
//! reads, unless a canned response has been queued for it.  Writes are logged so tests can check
//! exactly what would have gone over the wire.
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::time::Duration;

use log::trace;

use crate::cable::Backend;
use crate::error::{AdapterError, Result};

pub const DEFAULT_PACKET_SIZE: usize = 512;

#[derive(Default)]
pub struct Loopback {
    packet_size: usize,
    rx: VecDeque<u8>,
    canned: VecDeque<Vec<u8>>,
    fail_on_write: Option<usize>,
    /// Every frame written, in order
    pub writes: Vec<Vec<u8>>,
    pub delays: Vec<Duration>,
    pub closes: usize,
    closed: bool,
}

impl Loopback {
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size,
            ..Self::default()
        }
    }

    /// Answer the next write with `response` instead of an echo
    pub fn push_response(&mut self, response: Vec<u8>) {
        self.canned.push_back(response);
    }

    /// Make write number `n` (counting from zero) fail as if the device went away
    pub fn fail_on_write(&mut self, n: usize) {
        self.fail_on_write = Some(n);
    }
}

impl Backend for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn write(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(AdapterError::Closed.into());
        }
        if self.fail_on_write == Some(self.writes.len()) {
            self.fail_on_write = None;
            return Err(AdapterError::Disconnected.into());
        }
        trace!("loopback <- {:02x?}", buf);
        self.writes.push(buf.to_vec());
        match self.canned.pop_front() {
            Some(response) => self.rx.extend(response),
            None => self.rx.extend(buf.iter().copied()),
        }
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(AdapterError::Closed.into());
        }
        if self.rx.is_empty() {
            return Err(AdapterError::Timeout.into());
        }
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes += 1;
            self.rx.clear();
        }
    }

    fn delay(&mut self, duration: Duration) {
        self.delays.push(duration);
    }
}
