//! The command queue.  Callers describe what should happen on the scan chain (state moves, scans,
//! idle clocks, delays, raw adapter commands); the session lowers each command into runs of TCK
//! cycles, batches them into frames no larger than the adapter's packet size and only talks to
//! the hardware when it has to: on `flush`, when the next command would not fit, or when a move
//! through an update state has to wait for earlier captures.
//!
//! Captured data is handed back through `CaptureId` tickets once the flush that produced it has
//! completed successfully.
use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::DerefMut;
use core::time::Duration;

use log::{debug, trace, warn};

use crate::cable::{self, Backend, DeviceIdentity};
use crate::codec::{self, get_bits, set_bits, Codec, Sequence, MAX_SEQUENCE_BITS};
use crate::config::{AdapterConfig, BackendKind, CodecKind};
use crate::error::{AdapterError, ConfigError, Error, ProtocolError, Result};
use crate::statemachine::{self, Register, TapState};

/// One shift register segment of a scan
#[derive(Clone, Debug)]
pub struct ScanField<'a> {
    pub bits: usize,
    /// Bits to shift in, LSB first.  All ones when absent.
    pub out: Option<Cow<'a, [u8]>>,
    pub capture: bool,
}

impl<'a> ScanField<'a> {
    pub fn write(bits: usize, data: &'a [u8]) -> Self {
        Self {
            bits,
            out: Some(Cow::Borrowed(data)),
            capture: false,
        }
    }

    pub fn read(bits: usize) -> Self {
        Self {
            bits,
            out: None,
            capture: true,
        }
    }

    pub fn read_write(bits: usize, data: &'a [u8]) -> Self {
        Self {
            bits,
            out: Some(Cow::Borrowed(data)),
            capture: true,
        }
    }

    /// Shift ones without looking at what comes out
    pub fn ones(bits: usize) -> Self {
        Self {
            bits,
            out: None,
            capture: false,
        }
    }

    fn bit(&self, offset: usize, n: usize) -> u64 {
        match &self.out {
            Some(data) => get_bits(data, offset, n),
            None => u64::MAX,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Command<'a> {
    StateMove(TapState),
    /// Raw TMS bits, applied in order
    Tms(Vec<bool>),
    /// Test-Logic-Reset by holding TMS high; works from any state, known or not
    Reset,
    Scan {
        register: Register,
        fields: Vec<ScanField<'a>>,
        end_state: TapState,
    },
    /// Clock in Run-Test/Idle, then move to `end_state`
    RunTest { cycles: usize, end_state: TapState },
    /// Clock while holding the current (stable) state
    StableClocks(usize),
    Sleep(Duration),
    /// Adapter-specific bytes sent as-is, answered by `response_len` bytes
    Custom { request: Vec<u8>, response_len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureId(usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub flushes: usize,
    pub frames: usize,
    pub bytes_out: usize,
    pub bytes_in: usize,
}

/// A sequence plus where its TDO bits go: (capture slot, bit offset)
#[derive(Clone, Copy, Debug)]
struct Tagged {
    seq: Sequence,
    slot: Option<(usize, usize)>,
}

impl Tagged {
    fn split(self, at: usize) -> (Tagged, Tagged) {
        let (a, b) = self.seq.split(at);
        (
            Tagged { seq: a, slot: self.slot },
            Tagged {
                seq: b,
                slot: self.slot.map(|(s, off)| (s, off + at)),
            },
        )
    }
}

#[derive(Debug)]
enum Step {
    Clocks(Tagged),
    Sleep(Duration),
    Custom {
        request: Vec<u8>,
        response_len: usize,
        slot: Option<usize>,
    },
}

/// Result of lowering one command against a known starting state
struct Lowered {
    steps: Vec<Step>,
    captures: Vec<usize>,
    end: Option<TapState>,
    through_update: bool,
    bytes: usize,
    response: usize,
}

/// An open adapter together with everything queued for it.  Dropping it closes the backend.
pub struct AdapterSession<T>
    where T: DerefMut,
          T::Target: Backend
{
    pub backend: T,
    codec: Box<dyn Codec>,
    packet_size: usize,
    timeout: Duration,
    buffer: Vec<u8>,
    pending: Vec<Step>,
    pending_bytes: usize,
    pending_response: usize,
    /// Capture buffers of the pending commands
    captures: Vec<(CaptureId, Vec<u8>)>,
    ready: BTreeMap<CaptureId, Vec<u8>>,
    next_capture: usize,
    state: Option<TapState>,
    stats: Stats,
    closed: bool,
}

/// Open the adapter described by `config` and wrap it in a session
pub fn open(config: &AdapterConfig) -> Result<AdapterSession<Box<dyn Backend>>> {
    if config.codec == CodecKind::DapJtagSequence && config.backend == BackendKind::Ftdi {
        return Err(ConfigError::Codec("dap-jtag-sequence", "ftdi").into());
    }
    let backend = cable::open(config)?;
    let mut session = AdapterSession::new(backend, codec::new_codec(config.codec), config.timeout)?;
    if let Some(size) = config.packet_size {
        session.set_packet_size(size)?;
    }
    Ok(session)
}

impl<T, U> AdapterSession<T>
    where T: DerefMut<Target=U>,
          U: Backend + ?Sized
{
    /// Wrap an open backend.  The TAP state is unknown until the first command, so a
    /// Test-Logic-Reset is queued straight away; nothing reaches the hardware before a flush.
    pub fn new(mut backend: T, codec: Box<dyn Codec>, timeout: Duration) -> Result<Self> {
        let packet_size = backend.packet_size();
        let buffer = backend.allocate_packet_buffer(packet_size)?;
        debug!(
            "session on {} with {} codec, packet size {}",
            backend.name(),
            codec.name(),
            packet_size
        );

        let mut session = Self {
            backend,
            codec,
            packet_size,
            timeout,
            buffer,
            pending: Vec::new(),
            pending_bytes: 0,
            pending_response: 0,
            captures: Vec::new(),
            ready: BTreeMap::new(),
            next_capture: 0,
            state: None,
            stats: Stats::default(),
            closed: false,
        };
        session.enqueue(Command::Reset)?;
        Ok(session)
    }

    /// Shrink the frame size below what the backend reports.  Applies from the next frame on.
    pub fn set_packet_size(&mut self, size: usize) -> Result<()> {
        let size = size.min(self.backend.packet_size());
        self.buffer = self.backend.allocate_packet_buffer(size)?;
        self.packet_size = size;
        Ok(())
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Tracked TAP state after everything queued so far; `None` after a failure until reset
    pub fn state(&self) -> Option<TapState> {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn identity<'a>(&'a self) -> Option<&'a DeviceIdentity>
        where U: 'a
    {
        self.backend.identity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of lowered steps waiting for a flush
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(AdapterError::Closed.into())
        } else {
            Ok(())
        }
    }

    fn known_state(&self) -> Result<TapState> {
        self.state.ok_or_else(|| ProtocolError::Desync.into())
    }

    /// Append a command.  Returns one ticket per captured field (or one for a custom command
    /// with a response).  May flush earlier commands first; their errors come back from here.
    pub fn enqueue(&mut self, cmd: Command<'_>) -> Result<Vec<CaptureId>> {
        self.check_open()?;
        let is_move = matches!(cmd, Command::StateMove(_) | Command::Tms(_));
        let lowered = self.lower(cmd)?;

        let needs_update_flush = is_move && lowered.through_update && !self.captures.is_empty();
        let overflow = !self.pending.is_empty()
            && (self.codec.request_overhead() + self.pending_bytes + lowered.bytes > self.packet_size
                || self.codec.response_overhead() + self.pending_response + lowered.response
                    > self.packet_size);
        if needs_update_flush || overflow {
            trace!("implicit flush (update: {}, overflow: {})", needs_update_flush, overflow);
            self.flush()?;
        }

        let base = self.captures.len();
        let mut ids = Vec::with_capacity(lowered.captures.len());
        for bits in lowered.captures {
            let id = CaptureId(self.next_capture);
            self.next_capture += 1;
            self.captures.push((id, vec![0; (bits + 7) / 8]));
            ids.push(id);
        }
        for mut step in lowered.steps {
            match &mut step {
                Step::Clocks(Tagged { slot: Some((s, _)), .. }) => *s += base,
                Step::Custom { slot: Some(s), .. } => *s += base,
                _ => {}
            }
            self.pending.push(step);
        }
        self.pending_bytes += lowered.bytes;
        self.pending_response += lowered.response;
        self.state = lowered.end;
        Ok(ids)
    }

    fn lower(&self, cmd: Command<'_>) -> Result<Lowered> {
        let mut seqs = Vec::new();
        let mut captures = Vec::new();
        let mut through_update = false;

        let mut tagged: Vec<Tagged> = Vec::new();
        let end = match cmd {
            Command::Reset => {
                codec::tms_sequences(&statemachine::RESET_SEQUENCE, true, &mut seqs);
                TapState::Reset
            }
            Command::StateMove(to) => {
                let from = match self.state {
                    None if to == TapState::Reset => {
                        codec::tms_sequences(&statemachine::RESET_SEQUENCE, true, &mut seqs);
                        TapState::Reset
                    }
                    other => other.ok_or(ProtocolError::Desync)?,
                };
                through_update |= moves(from, to, &mut seqs);
                to
            }
            Command::Tms(bits) => {
                let from = self.known_state()?;
                through_update = statemachine::passes_through(from, &bits, TapState::is_update);
                codec::tms_sequences(&bits, true, &mut seqs);
                statemachine::walk(from, &bits)
            }
            Command::Scan { register, fields, end_state } => {
                let from = self.known_state()?;
                if fields.is_empty() || fields.iter().any(|f| f.bits == 0) {
                    return Err(Error::Syntax("scan fields must not be empty"));
                }
                if fields.iter().any(|f| f.out.as_ref().map_or(false, |d| d.len() * 8 < f.bits)) {
                    return Err(Error::Syntax("scan data shorter than field"));
                }
                through_update |= moves(from, register.shift_state(), &mut seqs);
                tagged.extend(seqs.drain(..).map(|seq| Tagged { seq, slot: None }));

                let last_field = fields.len() - 1;
                for (i, field) in fields.iter().enumerate() {
                    let slot = if field.capture {
                        captures.push(field.bits);
                        Some(captures.len() - 1)
                    } else {
                        None
                    };
                    // The final bit of the scan leaves the shift state
                    let body = if i == last_field { field.bits - 1 } else { field.bits };
                    let mut offset = 0;
                    while offset < body {
                        let n = (body - offset).min(MAX_SEQUENCE_BITS);
                        tagged.push(Tagged {
                            seq: Sequence::new(false, n, field.bit(offset, n), field.capture),
                            slot: slot.map(|s| (s, offset)),
                        });
                        offset += n;
                    }
                    if i == last_field {
                        tagged.push(Tagged {
                            seq: Sequence::new(true, 1, field.bit(body, 1), field.capture),
                            slot: slot.map(|s| (s, body)),
                        });
                    }
                }

                let exit1 = statemachine::walk(register.shift_state(), &[true]);
                through_update |= moves(exit1, end_state, &mut seqs);
                end_state
            }
            Command::RunTest { cycles, end_state } => {
                let from = self.known_state()?;
                through_update |= moves(from, TapState::Idle, &mut seqs);
                let mut left = cycles;
                while left > 0 {
                    let n = left.min(MAX_SEQUENCE_BITS);
                    seqs.push(Sequence::new(false, n, 0, false));
                    left -= n;
                }
                through_update |= moves(TapState::Idle, end_state, &mut seqs);
                end_state
            }
            Command::StableClocks(cycles) => {
                let from = self.known_state()?;
                if !from.is_stable() {
                    return Err(Error::Syntax("stable clocks outside a stable state"));
                }
                let tms = from == TapState::Reset;
                let mut left = cycles;
                while left > 0 {
                    let n = left.min(MAX_SEQUENCE_BITS);
                    seqs.push(Sequence::new(tms, n, 0, false));
                    left -= n;
                }
                from
            }
            Command::Sleep(d) => {
                return Ok(Lowered {
                    steps: vec![Step::Sleep(d)],
                    captures,
                    end: self.state,
                    through_update,
                    bytes: 0,
                    response: 0,
                });
            }
            Command::Custom { request, response_len } => {
                let slot = if response_len > 0 {
                    captures.push(response_len * 8);
                    Some(0)
                } else {
                    None
                };
                let bytes = request.len();
                return Ok(Lowered {
                    steps: vec![Step::Custom { request, response_len, slot }],
                    captures,
                    end: self.state,
                    through_update,
                    bytes,
                    response: response_len,
                });
            }
        };

        tagged.extend(seqs.into_iter().map(|seq| Tagged { seq, slot: None }));
        let bytes = tagged.iter().map(|t| self.codec.request_len(&t.seq)).sum();
        let response = tagged.iter().map(|t| self.codec.response_len(&t.seq)).sum();
        Ok(Lowered {
            steps: tagged.into_iter().map(Step::Clocks).collect(),
            captures,
            end: Some(end),
            through_update,
            bytes,
            response,
        })
    }

    /// Send everything queued.  The queue is empty afterwards whatever happens; on failure the
    /// captures of this flush are dropped and the TAP state becomes unknown.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        let steps = core::mem::take(&mut self.pending);
        let mut captures = core::mem::take(&mut self.captures);
        self.pending_bytes = 0;
        self.pending_response = 0;
        if steps.is_empty() {
            return Ok(());
        }

        debug!("flushing {} steps, {} captures", steps.len(), captures.len());
        self.stats.flushes += 1;
        match self.execute(&steps, &mut captures) {
            Ok(()) => {
                self.ready.extend(captures);
                Ok(())
            }
            Err(e) => {
                warn!("flush failed: {}; TAP state now unknown", e);
                self.state = None;
                Err(e)
            }
        }
    }

    fn execute(&mut self, steps: &[Step], captures: &mut [(CaptureId, Vec<u8>)]) -> Result<()> {
        let mut batch = Vec::new();
        for step in steps {
            match step {
                Step::Clocks(t) => batch.push(*t),
                Step::Sleep(d) => {
                    self.transmit(&batch, captures)?;
                    batch.clear();
                    self.backend.delay(*d);
                }
                Step::Custom { request, response_len, slot } => {
                    self.transmit(&batch, captures)?;
                    batch.clear();
                    self.send(request)?;
                    let response = self.receive(*response_len)?;
                    if let Some(s) = slot {
                        captures[*s].1.copy_from_slice(&response[..*response_len]);
                    }
                }
            }
        }
        self.transmit(&batch, captures)
    }

    fn transmit(&mut self, batch: &[Tagged], captures: &mut [(CaptureId, Vec<u8>)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let seqs: Vec<Sequence> = batch.iter().map(|t| t.seq).collect();
        if let Some(result) = self.backend.execute_native(&seqs) {
            let tdo = result?;
            scatter(batch, &tdo, captures);
            return Ok(());
        }

        let limit = self.packet_size;
        let max = self.codec.max_sequences();
        let mut frame: Vec<Tagged> = Vec::new();
        let mut req = self.codec.request_overhead();
        let mut resp = self.codec.response_overhead();

        for t in batch {
            let mut t = *t;
            loop {
                let r = self.codec.request_len(&t.seq);
                let s = self.codec.response_len(&t.seq);
                if frame.len() < max && req + r <= limit && resp + s <= limit {
                    frame.push(t);
                    req += r;
                    resp += s;
                    break;
                }

                if frame.is_empty() {
                    // Too long for any frame: send as much of it as fits
                    let fits = (1..t.seq.bits).rev().find(|&n| {
                        let (a, _) = t.seq.split(n);
                        req + self.codec.request_len(&a) <= limit
                            && resp + self.codec.response_len(&a) <= limit
                    });
                    let Some(n) = fits else {
                        return Err(ConfigError::Codec(self.codec.name(), self.backend.name()).into());
                    };
                    let (a, b) = t.split(n);
                    frame.push(a);
                    t = b;
                }

                self.frame(&frame, captures)?;
                frame.clear();
                req = self.codec.request_overhead();
                resp = self.codec.response_overhead();
            }
        }

        if !frame.is_empty() {
            self.frame(&frame, captures)?;
        }
        Ok(())
    }

    fn frame(&mut self, frame: &[Tagged], captures: &mut [(CaptureId, Vec<u8>)]) -> Result<()> {
        let seqs: Vec<Sequence> = frame.iter().map(|t| t.seq).collect();
        let mut request = core::mem::take(&mut self.buffer);
        request.clear();
        self.codec.encode(&seqs, &mut request);
        let sent = self.send(&request);
        self.buffer = request;
        sent?;

        let expected = self.codec.response_overhead()
            + seqs.iter().map(|s| self.codec.response_len(s)).sum::<usize>();
        let response = self.receive(expected)?;

        let mut tdo = Vec::new();
        self.codec.decode(&seqs, &response, &mut tdo)?;
        scatter(frame, &tdo, captures);
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        trace!("{} <- {:02x?}", self.backend.name(), buf);
        let n = self.backend.write(buf, self.timeout)?;
        self.stats.frames += 1;
        self.stats.bytes_out += n;
        if n != buf.len() {
            return Err(AdapterError::ShortTransfer { done: n, expected: buf.len() }.into());
        }
        Ok(())
    }

    fn receive(&mut self, expected: usize) -> Result<Vec<u8>> {
        if expected == 0 {
            return Ok(Vec::new());
        }
        let mut response = vec![0; expected.max(self.packet_size)];
        let mut got = 0;
        while got < expected {
            let n = self.backend.read(&mut response[got..], self.timeout)?;
            if n == 0 {
                return Err(AdapterError::ShortTransfer { done: got, expected }.into());
            }
            got += n;
        }
        response.truncate(got);
        self.stats.bytes_in += got;
        trace!("{} -> {:02x?}", self.backend.name(), response);
        Ok(response)
    }

    /// Captured bits of a completed flush.  Each ticket can be redeemed once.
    pub fn take_capture(&mut self, id: CaptureId) -> Result<Vec<u8>> {
        self.ready
            .remove(&id)
            .ok_or(Error::Syntax("capture not available; flush first"))
    }

    /// Queue a move to `state` along the shortest path
    pub fn move_to(&mut self, state: TapState) -> Result<()> {
        self.enqueue(Command::StateMove(state)).map(|_| ())
    }

    /// Test-Logic-Reset followed by a move to Run-Test/Idle.  The only way back after a failure.
    pub fn reset(&mut self) -> Result<()> {
        self.enqueue(Command::Reset)?;
        self.move_to(TapState::Idle)
    }

    pub fn run_test(&mut self, cycles: usize) -> Result<()> {
        self.enqueue(Command::RunTest { cycles, end_state: TapState::Idle }).map(|_| ())
    }

    pub fn sleep(&mut self, duration: Duration) -> Result<()> {
        self.enqueue(Command::Sleep(duration)).map(|_| ())
    }

    /// Queue raw adapter bytes; the ticket yields the response after a flush
    pub fn custom(&mut self, request: Vec<u8>, response_len: usize) -> Result<Option<CaptureId>> {
        let ids = self.enqueue(Command::Custom { request, response_len })?;
        Ok(ids.first().copied())
    }

    /// Queue a single-field scan ending in Run-Test/Idle
    pub fn queue_scan(&mut self, register: Register, field: ScanField<'_>) -> Result<Option<CaptureId>> {
        let ids = self.enqueue(Command::Scan {
            register,
            fields: vec![field],
            end_state: TapState::Idle,
        })?;
        Ok(ids.first().copied())
    }

    /// Shift `data` into `register` and return what came out, flushing immediately
    pub fn read_write_reg(&mut self, register: Register, data: &[u8], bits: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; (bits + 7) / 8];
        self.scan_into(register, ScanField::read_write(bits, data), &mut buf)?;
        Ok(buf)
    }

    pub fn read_reg(&mut self, register: Register, bits: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; (bits + 7) / 8];
        self.scan_into(register, ScanField::read(bits), &mut buf)?;
        Ok(buf)
    }

    /// Queue a write; nothing is sent until the queue fills or is flushed
    pub fn write_reg(&mut self, register: Register, data: &[u8], bits: usize) -> Result<()> {
        self.queue_scan(register, ScanField::write(bits, data)).map(|_| ())
    }

    /// Blocking scan.  `buf` must be exactly as long as the field needs.
    pub fn scan_into(&mut self, register: Register, mut field: ScanField<'_>, buf: &mut [u8]) -> Result<()> {
        if buf.len() != (field.bits + 7) / 8 {
            return Err(Error::Syntax("capture buffer does not match field length"));
        }
        field.capture = true;
        let id = self.queue_scan(register, field)?;
        self.flush()?;
        let data = match id {
            Some(id) => self.take_capture(id)?,
            None => return Err(Error::Syntax("scan produced no capture")),
        };
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Flush what is left and release the adapter.  Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.flush();
        self.backend.close();
        self.closed = true;
        self.pending.clear();
        self.captures.clear();
        debug!("session closed");
        result
    }
}

impl<T> Drop for AdapterSession<T>
    where T: DerefMut,
          T::Target: Backend
{
    fn drop(&mut self) {
        if !self.closed {
            self.backend.close();
            self.closed = true;
        }
    }
}

/// Lower the shortest move between two states, TDI held high.  Reports whether it passes
/// through an update state.
fn moves(from: TapState, to: TapState, seqs: &mut Vec<Sequence>) -> bool {
    let tms = statemachine::path(from, to);
    codec::tms_sequences(&tms, true, seqs);
    statemachine::passes_through(from, &tms, TapState::is_update)
}

/// Copy TDO words into the capture buffers they belong to
fn scatter(batch: &[Tagged], tdo: &[u64], captures: &mut [(CaptureId, Vec<u8>)]) {
    let captured = batch.iter().filter(|t| t.seq.capture);
    for (t, &value) in captured.zip(tdo) {
        if let Some((slot, offset)) = t.slot {
            set_bits(&mut captures[slot].1, offset, t.seq.bits, value);
        }
    }
}
