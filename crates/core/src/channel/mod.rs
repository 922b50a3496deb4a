//! Prompt-aware byte channel
//!
//! A [`Channel`] wraps a [`ChannelIo`] backend and adds the framing every
//! machine relies on: `expect`, prompt detection, stream sinks that see all
//! delivered bytes, and death-strings that abort any operation when a pattern
//! appears in the input.
//!
//! Bytes flow through a pending buffer. Every byte read from the backend is
//! scanned for death-strings on arrival, but only handed to the stream sinks
//! once it is consumed (or once it can no longer be part of a pending match).
//! A watermark remembers how much of the pending buffer the sinks have
//! already seen, so nothing is logged twice when bytes are put back.
//!
//! Channel references are single-threaded. Cloning a `Channel` clones the
//! reference; [`Channel::borrow`] and [`Channel::take`] hand out new
//! references and retire the old one.

use crate::error::{DeathStringFn, Result, TbotError};
use crate::interrupt;
use bytes::BytesMut;
use std::cell::{Cell, RefCell, RefMut};
use std::io::Write;
use std::ops::Range;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

mod interactive;
pub mod io;
pub mod pattern;
pub mod testing;

pub use io::{ChannelIo, NullChannelIo};
pub use pattern::Pattern;

/// Default number of bytes requested from the backend per read
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// How long `read_back` waits for the echo of sent data
pub const READ_BACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity at which blocking reads check the interrupt flag
const POLL_SLICE: Duration = Duration::from_millis(100);

/// How long `readline` waits to see whether a `\r` is followed by `\n`
const LINE_ENDING_GRACE: Duration = Duration::from_millis(50);

/// Bytes of history kept for regex death-strings
const REGEX_DEATH_WINDOW: usize = 4096;

/// A log sink that receives every delivered byte
pub type Sink = Rc<RefCell<dyn Write>>;

/// Ownership state of one channel reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Usable
    Open,
    /// Lent to another reference until the borrow guard is dropped
    Borrowed,
    /// Permanently handed over to another reference
    Taken,
}

/// Result of a successful [`Channel::expect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the pattern that matched
    pub index: usize,
    /// Bytes received before the match
    pub before: Vec<u8>,
    /// The matched bytes
    pub matched: Vec<u8>,
}

impl ExpectMatch {
    /// Text before the match, with line endings normalized
    pub fn before_text(&self) -> String {
        normalize_newlines(&String::from_utf8_lossy(&self.before))
    }
}

struct StreamEntry {
    id: u64,
    sink: Sink,
    show_prompt: bool,
}

struct DeathEntry {
    id: u64,
    pattern: Pattern,
    raise: DeathStringFn,
}

/// Absolute deadline plus the timeout it came from, for error reporting
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Option<Instant>,
    total: Option<Duration>,
}

impl Deadline {
    fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|t| Instant::now() + t),
            total: timeout,
        }
    }

    /// Time left, or `Timeout` once the deadline passed
    fn remaining(&self) -> Result<Option<Duration>> {
        match (self.at, self.total) {
            (Some(at), Some(total)) => {
                let now = Instant::now();
                if now >= at {
                    Err(TbotError::Timeout { after: total })
                } else {
                    Ok(Some(at - now))
                }
            }
            _ => Ok(None),
        }
    }

    fn earliest(self, other: Self) -> Self {
        match (self.at, other.at) {
            (Some(a), Some(b)) if b < a => other,
            (None, Some(_)) => other,
            _ => self,
        }
    }
}

struct ChannelCore {
    io: Box<dyn ChannelIo>,
    name: String,
    pending: BytesMut,
    /// Prefix of `pending` the stream sinks have already seen
    delivered: usize,
    prompts: Vec<(u64, Pattern)>,
    streams: Vec<StreamEntry>,
    deaths: Vec<DeathEntry>,
    death_window: Vec<u8>,
    /// Trailing bytes of `pending` not yet checked for death-strings
    unscanned: usize,
    read_chunk: usize,
    terminal: (u16, u16),
    next_id: u64,
    closed: bool,
}

impl ChannelCore {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Read one chunk from the backend into the pending buffer
    fn fill(&mut self, deadline: &Deadline) -> Result<usize> {
        if self.closed {
            return Err(TbotError::ChannelClosed);
        }
        loop {
            interrupt::check()?;
            let slice = match deadline.remaining()? {
                Some(left) => left.min(POLL_SLICE),
                None => POLL_SLICE,
            };
            match self.io.read(self.read_chunk, Some(slice)) {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => {
                    trace!(channel = %self.name, bytes = chunk.len(), "received");
                    self.pending.extend_from_slice(&chunk);
                    self.unscanned += chunk.len();
                    self.scan_death_strings()?;
                    return Ok(chunk.len());
                }
                Err(TbotError::Timeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn death_keep(&self) -> usize {
        self.deaths
            .iter()
            .map(|d| match d.pattern.max_len() {
                Some(len) => len.saturating_sub(1),
                None => REGEX_DEATH_WINDOW,
            })
            .max()
            .unwrap_or(0)
    }

    /// Check the unscanned pending bytes (plus carried-over suffix) for death-strings
    fn scan_death_strings(&mut self) -> Result<()> {
        let new = self.unscanned.min(self.pending.len());
        self.unscanned = 0;
        if self.deaths.is_empty() || new == 0 {
            return Ok(());
        }
        let start = self.pending.len() - new;
        let old = self.death_window.len();
        self.death_window.extend_from_slice(&self.pending[start..]);

        let hit = self
            .deaths
            .iter()
            .rev()
            .filter_map(|d| {
                d.pattern
                    .find(&self.death_window, old)
                    .map(|r| (r.end, d.raise, self.death_window[r].to_vec()))
            })
            .min_by_key(|(end, _, _)| *end);

        if let Some((_, raise, matched)) = hit {
            self.death_window.clear();
            // Sinks see everything up to here before the error surfaces; the
            // bytes themselves stay pending for whoever reads next.
            let all = self.pending.len();
            self.deliver(all, false);
            debug!(channel = %self.name, matched = %String::from_utf8_lossy(&matched), "death-string hit");
            return Err(raise(&matched));
        }

        let keep = self.death_keep();
        if self.death_window.len() > keep {
            let cut = self.death_window.len() - keep;
            self.death_window.drain(..cut);
        }
        Ok(())
    }

    /// Hand `pending[delivered..upto]` to the sinks.
    ///
    /// With `prompt` set only sinks that asked for prompts get the bytes.
    fn deliver(&mut self, upto: usize, prompt: bool) {
        let upto = upto.min(self.pending.len());
        if upto <= self.delivered {
            return;
        }
        let data = &self.pending[self.delivered..upto];
        for stream in &self.streams {
            if prompt && !stream.show_prompt {
                continue;
            }
            match stream.sink.try_borrow_mut() {
                Ok(mut sink) => {
                    if let Err(e) = sink.write_all(data) {
                        warn!(channel = %self.name, "stream sink write failed: {}", e);
                    }
                }
                Err(_) => warn!(channel = %self.name, "stream sink is busy, dropping output"),
            }
        }
        self.delivered = upto;
    }

    /// Deliver the part of the buffer that can no longer start a match
    fn deliver_safe(&mut self, patterns: &[Pattern]) {
        let bound = patterns
            .iter()
            .map(Pattern::max_len)
            .try_fold(0usize, |acc, len| len.map(|l| acc.max(l)));
        if let Some(max_len) = bound {
            let safe = self.pending.len().saturating_sub(max_len.saturating_sub(1));
            self.deliver(safe, false);
        }
    }

    /// Remove the first `n` pending bytes, delivering them first
    fn consume(&mut self, n: usize) -> Vec<u8> {
        self.deliver(n, false);
        let out = self.pending.split_to(n.min(self.pending.len()));
        self.delivered = self.delivered.saturating_sub(out.len());
        out.to_vec()
    }

    /// Consume up to the end of a prompt match, returning the bytes before it
    fn consume_prompt(&mut self, range: Range<usize>) -> Vec<u8> {
        self.deliver(range.start, false);
        self.deliver(range.end, true);
        let mut out = self.pending.split_to(range.end);
        self.delivered = self.delivered.saturating_sub(range.end);
        out.truncate(range.start);
        out.to_vec()
    }

    fn read_exact(&mut self, n: usize, deadline: &Deadline) -> Result<Vec<u8>> {
        self.scan_death_strings()?;
        while self.pending.len() < n {
            self.fill(deadline)?;
        }
        Ok(self.consume(n))
    }

    fn read_some(&mut self, max: usize, deadline: &Deadline) -> Result<Vec<u8>> {
        self.scan_death_strings()?;
        if self.pending.is_empty() {
            self.fill(deadline)?;
        }
        let n = max.min(self.pending.len());
        Ok(self.consume(n))
    }

    fn expect(&mut self, patterns: &[Pattern], deadline: &Deadline) -> Result<ExpectMatch> {
        self.scan_death_strings()?;
        let mut searched = 0;
        loop {
            if !self.pending.is_empty() {
                if let Some((index, range)) =
                    pattern::first_completed(patterns, &self.pending, searched)
                {
                    let before = self.consume(range.start);
                    let matched = self.consume(range.end - range.start);
                    return Ok(ExpectMatch {
                        index,
                        before,
                        matched,
                    });
                }
                searched = self.pending.len();
                self.deliver_safe(patterns);
            }
            self.fill(deadline)?;
        }
    }

    fn await_prompt(&mut self, prompt: &Pattern, deadline: &Deadline) -> Result<Vec<u8>> {
        self.scan_death_strings()?;
        let mut searched = 0;
        loop {
            let hit = match prompt {
                Pattern::Literal(_) if !self.pending.is_empty() => prompt.find(&self.pending, searched),
                Pattern::Literal(_) => None,
                Pattern::Regex { .. } => prompt.find_prompt(&self.pending),
            };
            if let Some(range) = hit {
                return Ok(self.consume_prompt(range));
            }
            searched = self.pending.len();
            self.deliver_safe(std::slice::from_ref(prompt));
            self.fill(deadline)?;
        }
    }

    fn readline(&mut self, deadline: &Deadline) -> Result<String> {
        self.scan_death_strings()?;
        loop {
            let len = self.pending.len();
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n' || b == b'\r') {
                if self.pending[pos] == b'\n' {
                    let mut line = self.consume(pos + 1);
                    line.truncate(pos);
                    return Ok(line_with_newline(&line));
                }
                let mut end = pos;
                while end < len && self.pending[end] == b'\r' {
                    end += 1;
                }
                if end < len {
                    if self.pending[end] == b'\n' {
                        end += 1;
                    }
                    let mut line = self.consume(end);
                    line.truncate(pos);
                    return Ok(line_with_newline(&line));
                }
                // A trailing '\r' might be the first half of "\r\n".
                let grace = Deadline::after(Some(LINE_ENDING_GRACE)).earliest(*deadline);
                match self.fill(&grace) {
                    Ok(_) => continue,
                    Err(TbotError::Timeout { .. }) if deadline.remaining().is_ok() => {
                        let mut line = self.consume(end);
                        line.truncate(pos);
                        return Ok(line_with_newline(&line));
                    }
                    Err(e) => return Err(e),
                }
            }
            self.fill(deadline)?;
        }
    }

    /// Consume everything up to and including the next `\n`
    fn skip_line_ending(&mut self, deadline: &Deadline) -> Result<()> {
        self.scan_death_strings()?;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                self.consume(pos + 1);
                return Ok(());
            }
            self.fill(deadline)?;
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let all = self.pending.len();
        self.deliver(all, false);
        debug!(channel = %self.name, "closing channel");
        self.io.close()
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(channel = %self.name, "error while closing channel: {}", e);
        }
    }
}

fn line_with_newline(line: &[u8]) -> String {
    let mut text = normalize_newlines(&String::from_utf8_lossy(line));
    text.push('\n');
    text
}

/// Convert `\r\n`, `\r\r\n` and lone `\r` into `\n`
pub fn normalize_newlines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            while chars.peek() == Some(&'\r') {
                chars.next();
            }
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

/// A reference to a prompt-aware byte channel
#[derive(Clone)]
pub struct Channel {
    core: Rc<RefCell<ChannelCore>>,
    handle: Rc<Cell<ChannelState>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .core
            .try_borrow()
            .map(|c| c.name.clone())
            .unwrap_or_else(|_| "<busy>".to_string());
        f.debug_struct("Channel")
            .field("name", &name)
            .field("state", &self.handle.get())
            .finish()
    }
}

impl Channel {
    /// Create a channel on top of a backend
    pub fn new(io: impl ChannelIo + 'static) -> Self {
        Self::from_boxed(Box::new(io))
    }

    /// Create a channel on top of a boxed backend
    pub fn from_boxed(io: Box<dyn ChannelIo>) -> Self {
        let name = io.describe();
        Self {
            core: Rc::new(RefCell::new(ChannelCore {
                io,
                name,
                pending: BytesMut::with_capacity(DEFAULT_READ_CHUNK),
                delivered: 0,
                prompts: Vec::new(),
                streams: Vec::new(),
                deaths: Vec::new(),
                death_window: Vec::new(),
                unscanned: 0,
                read_chunk: DEFAULT_READ_CHUNK,
                terminal: (80, 25),
                next_id: 0,
                closed: false,
            })),
            handle: Rc::new(Cell::new(ChannelState::Open)),
        }
    }

    /// Borrow the shared state after checking this reference may use it
    fn core(&self) -> Result<RefMut<'_, ChannelCore>> {
        match self.handle.get() {
            ChannelState::Open => {}
            ChannelState::Borrowed => return Err(TbotError::ChannelBorrowed),
            ChannelState::Taken => return Err(TbotError::ChannelTaken),
        }
        let core = self
            .core
            .try_borrow_mut()
            .map_err(|_| TbotError::internal("channel is already in use"))?;
        if core.closed {
            return Err(TbotError::ChannelClosed);
        }
        Ok(core)
    }

    /// State of this reference
    pub fn state(&self) -> ChannelState {
        self.handle.get()
    }

    /// Whether the channel was closed locally
    pub fn is_closed(&self) -> bool {
        self.core.try_borrow().map(|c| c.closed).unwrap_or(false)
    }

    /// Whether this reference is the current, usable owner
    pub fn is_usable(&self) -> bool {
        self.handle.get() == ChannelState::Open && !self.is_closed()
    }

    /// Name used in logs
    pub fn name(&self) -> String {
        self.core
            .try_borrow()
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.name = name.into();
        }
    }

    /// Number of bytes requested from the backend per read
    pub fn set_read_chunk(&self, size: usize) -> Result<()> {
        self.core()?.read_chunk = size.max(1);
        Ok(())
    }

    /// Write bytes. With `read_back`, consume exactly the echoed bytes.
    pub fn send(&self, data: impl AsRef<[u8]>, read_back: bool) -> Result<()> {
        let data = data.as_ref();
        let mut core = self.core()?;
        core.io.write(data)?;
        if read_back {
            core.read_exact(data.len(), &Deadline::after(Some(READ_BACK_TIMEOUT)))?;
        }
        Ok(())
    }

    /// Send a line terminated by `\r`.
    ///
    /// With `read_back`, the echoed line and the echoed line ending are
    /// consumed.
    pub fn sendline(&self, line: impl AsRef<str>, read_back: bool) -> Result<()> {
        let line = line.as_ref();
        let mut core = self.core()?;
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\r');
        core.io.write(&data)?;
        if read_back {
            let deadline = Deadline::after(Some(READ_BACK_TIMEOUT));
            core.read_exact(line.len(), &deadline)?;
            core.skip_line_ending(&deadline)?;
        }
        Ok(())
    }

    /// Send a control character, e.g. `'C'` for `^C`
    pub fn sendcontrol(&self, c: char) -> Result<()> {
        let upper = c.to_ascii_uppercase();
        if !('@'..='_').contains(&upper) {
            return Err(TbotError::internal(format!(
                "{c:?} is not a control character"
            )));
        }
        self.send([upper as u8 - b'@'], false)
    }

    /// Send `^C`
    pub fn sendintr(&self) -> Result<()> {
        self.sendcontrol('C')
    }

    /// Send `^D`
    pub fn sendeof(&self) -> Result<()> {
        self.sendcontrol('D')
    }

    /// Read exactly `n` bytes or fail with a timeout
    pub fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.core()?.read_exact(n, &Deadline::after(timeout))
    }

    /// Wait for at least one byte and return up to `max` bytes
    pub fn read_some(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.core()?.read_some(max, &Deadline::after(timeout))
    }

    /// Collect everything that arrives until `timeout` elapses
    pub fn read_until_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut core = self.core()?;
        core.scan_death_strings()?;
        let deadline = Deadline::after(Some(timeout));
        loop {
            match core.fill(&deadline) {
                Ok(_) => continue,
                Err(TbotError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        let all = core.pending.len();
        Ok(core.consume(all))
    }

    /// Collect everything until the far end closes the channel
    pub fn read_until_close(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut core = self.core()?;
        core.scan_death_strings()?;
        let deadline = Deadline::after(timeout);
        loop {
            match core.fill(&deadline) {
                Ok(_) => continue,
                Err(TbotError::ChannelClosed) => break,
                Err(e) => return Err(e),
            }
        }
        let all = core.pending.len();
        Ok(core.consume(all))
    }

    /// Read one line, normalizing its line ending to `\n`
    pub fn readline(&self, timeout: Option<Duration>) -> Result<String> {
        self.core()?.readline(&Deadline::after(timeout))
    }

    /// Wait until one of `patterns` shows up
    pub fn expect(&self, patterns: &[Pattern], timeout: Option<Duration>) -> Result<ExpectMatch> {
        if patterns.is_empty() {
            return Err(TbotError::internal("expect needs at least one pattern"));
        }
        self.core()?.expect(patterns, &Deadline::after(timeout))
    }

    /// Wait for the active prompt and return the output before it
    pub fn read_until_prompt(&self, timeout: Option<Duration>) -> Result<String> {
        let mut core = self.core()?;
        let prompt = core
            .prompts
            .last()
            .map(|(_, p)| p.clone())
            .ok_or_else(|| TbotError::internal("no prompt configured on channel"))?;
        let out = core.await_prompt(&prompt, &Deadline::after(timeout))?;
        Ok(normalize_newlines(&String::from_utf8_lossy(&out)))
    }

    /// Wait for `prompt` and return the output before it
    pub fn read_until_prompt_with(
        &self,
        prompt: &Pattern,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let out = self.core()?.await_prompt(prompt, &Deadline::after(timeout))?;
        Ok(normalize_newlines(&String::from_utf8_lossy(&out)))
    }

    /// The active prompt
    pub fn prompt(&self) -> Option<Pattern> {
        self.core
            .try_borrow()
            .ok()
            .and_then(|c| c.prompts.last().map(|(_, p)| p.clone()))
    }

    /// Replace the innermost prompt
    pub fn set_prompt(&self, prompt: impl Into<Pattern>) -> Result<()> {
        let prompt = prompt.into();
        let mut core = self.core()?;
        match core.prompts.last_mut() {
            Some((_, p)) => *p = prompt,
            None => {
                let id = core.next_id();
                core.prompts.push((id, prompt));
            }
        }
        Ok(())
    }

    /// Use `prompt` until the guard is dropped
    pub fn with_prompt(&self, prompt: impl Into<Pattern>) -> Result<PromptGuard> {
        let mut core = self.core()?;
        let id = core.next_id();
        core.prompts.push((id, prompt.into()));
        Ok(PromptGuard {
            core: Rc::clone(&self.core),
            id,
        })
    }

    /// Copy every delivered byte into `sink` until the guard is dropped
    pub fn with_stream(&self, sink: Sink, show_prompt: bool) -> Result<StreamGuard> {
        let mut core = self.core()?;
        let id = core.next_id();
        core.streams.push(StreamEntry {
            id,
            sink,
            show_prompt,
        });
        Ok(StreamGuard {
            core: Rc::clone(&self.core),
            id,
        })
    }

    /// Raise `raise(matched)` whenever `pattern` appears, until the guard is dropped
    pub fn with_death_string(
        &self,
        pattern: impl Into<Pattern>,
        raise: DeathStringFn,
    ) -> Result<DeathStringGuard> {
        let mut core = self.core()?;
        let id = core.next_id();
        core.deaths.push(DeathEntry {
            id,
            pattern: pattern.into(),
            raise,
        });
        // bytes already buffered count as arriving now
        core.death_window.clear();
        core.unscanned = core.pending.len();
        Ok(DeathStringGuard {
            core: Rc::clone(&self.core),
            id,
        })
    }

    /// Lend the channel to a new reference until the guard is dropped
    pub fn borrow(&self) -> Result<ChannelBorrow> {
        drop(self.core()?);
        self.handle.set(ChannelState::Borrowed);
        Ok(ChannelBorrow {
            outer: Rc::clone(&self.handle),
            inner: Channel {
                core: Rc::clone(&self.core),
                handle: Rc::new(Cell::new(ChannelState::Open)),
            },
        })
    }

    /// Permanently move the channel to a new reference
    pub fn take(&self) -> Result<Channel> {
        drop(self.core()?);
        self.handle.set(ChannelState::Taken);
        Ok(Channel {
            core: Rc::clone(&self.core),
            handle: Rc::new(Cell::new(ChannelState::Open)),
        })
    }

    /// Close the channel and its backend.
    ///
    /// Closing through a reference that gave the channel away is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.handle.get() {
            ChannelState::Open => {}
            ChannelState::Borrowed => return Err(TbotError::ChannelBorrowed),
            ChannelState::Taken => return Ok(()),
        }
        let mut core = self
            .core
            .try_borrow_mut()
            .map_err(|_| TbotError::internal("channel is already in use"))?;
        core.close()
    }

    /// Resize the remote terminal
    pub fn update_pty(&self, columns: u16, lines: u16) -> Result<()> {
        let mut core = self.core()?;
        core.terminal = (columns, lines);
        core.io.update_pty(columns, lines)
    }

    /// Last terminal size set with [`Channel::update_pty`]
    pub fn terminal_size(&self) -> (u16, u16) {
        self.core.try_borrow().map(|c| c.terminal).unwrap_or((80, 25))
    }
}

/// Pops a prompt pushed with [`Channel::with_prompt`]
pub struct PromptGuard {
    core: Rc<RefCell<ChannelCore>>,
    id: u64,
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.prompts.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Removes a sink pushed with [`Channel::with_stream`]
pub struct StreamGuard {
    core: Rc<RefCell<ChannelCore>>,
    id: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.streams.retain(|s| s.id != self.id);
        }
    }
}

/// Removes a death-string pushed with [`Channel::with_death_string`]
pub struct DeathStringGuard {
    core: Rc<RefCell<ChannelCore>>,
    id: u64,
}

impl Drop for DeathStringGuard {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.deaths.retain(|d| d.id != self.id);
            core.death_window.clear();
        }
    }
}

/// A channel lent out by [`Channel::borrow`].
///
/// Dereferences to the new reference. Dropping the guard retires it and
/// hands the channel back, unless it was taken further in the meantime.
pub struct ChannelBorrow {
    outer: Rc<Cell<ChannelState>>,
    inner: Channel,
}

impl std::ops::Deref for ChannelBorrow {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.inner
    }
}

impl Drop for ChannelBorrow {
    fn drop(&mut self) {
        if self.inner.handle.get() == ChannelState::Taken {
            self.outer.set(ChannelState::Taken);
        } else {
            self.inner.handle.set(ChannelState::Taken);
            self.outer.set(ChannelState::Open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedIo;
    use super::*;

    fn collecting_sink() -> (Sink, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        (buf.clone() as Sink, buf)
    }

    #[test]
    fn test_normalize_newlines() {
        assert_eq!(normalize_newlines("a\r\nb\rc\r\r\nd\n"), "a\nb\nc\nd\n");
        assert_eq!(normalize_newlines("plain"), "plain");
    }

    #[test]
    fn test_prompt_split_across_reads() {
        let io = ScriptedIo::new().chunks(["hello\r\nTBOT-", "VEJP$ "]);
        let ch = Channel::new(io);
        ch.set_prompt("TBOT-VEJP$ ").unwrap();
        let out = ch.read_until_prompt(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_prompt_hidden_from_streams_unless_requested() {
        let io = ScriptedIo::new().chunks(["out\n$ ", "more\n$ "]);
        let ch = Channel::new(io);
        ch.set_prompt("$ ").unwrap();
        let (plain, plain_buf) = collecting_sink();
        let (full, full_buf) = collecting_sink();
        let _g1 = ch.with_stream(plain, false).unwrap();
        let _g2 = ch.with_stream(full, true).unwrap();
        ch.read_until_prompt(Some(Duration::from_secs(1))).unwrap();
        ch.read_until_prompt(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(plain_buf.borrow().as_slice(), b"out\nmore\n");
        assert_eq!(full_buf.borrow().as_slice(), b"out\n$ more\n$ ");
    }

    #[test]
    fn test_expect_returns_leftover_to_stream() {
        let io = ScriptedIo::new().chunks(["Autoboot: 3 tail"]);
        let ch = Channel::new(io);
        let m = ch
            .expect(
                &[Pattern::from("login:"), Pattern::regex(r"Autoboot:\s+\d").unwrap()],
                Some(Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(m.index, 1);
        assert_eq!(m.matched, b"Autoboot: 3");
        assert_eq!(ch.read(5, Some(Duration::from_secs(1))).unwrap(), b" tail");
    }

    #[test]
    fn test_read_exact_times_out_on_short_input() {
        let io = ScriptedIo::new().chunks(["abc"]);
        let ch = Channel::new(io);
        let err = ch.read(4, Some(Duration::from_millis(50))).unwrap_err();
        assert!(err.is_timeout());
        // the partial bytes are not lost
        assert_eq!(ch.read(3, Some(Duration::from_millis(50))).unwrap(), b"abc");
    }

    #[test]
    fn test_readline_normalizes_endings() {
        let io = ScriptedIo::new().chunks(["one\r", "\ntwo\rthree\n"]);
        let ch = Channel::new(io);
        let t = Some(Duration::from_secs(1));
        assert_eq!(ch.readline(t).unwrap(), "one\n");
        assert_eq!(ch.readline(t).unwrap(), "two\n");
        assert_eq!(ch.readline(t).unwrap(), "three\n");
    }

    #[test]
    fn test_death_string_across_chunk_boundary() {
        let io = ScriptedIo::new().chunks(["booting... Kernel pa", "nic - not syncing\n"]);
        let ch = Channel::new(io);
        let (sink, buf) = collecting_sink();
        let _s = ch.with_stream(sink, true).unwrap();
        let _d = ch
            .with_death_string("Kernel panic", TbotError::death_string)
            .unwrap();
        let err = ch
            .expect(&[Pattern::from("login: ")], Some(Duration::from_secs(1)))
            .unwrap_err();
        assert!(err.is_death_string());
        // the log saw everything, and the bytes are still there to be read
        assert_eq!(
            buf.borrow().as_slice(),
            b"booting... Kernel panic - not syncing\n"
        );
        drop(_d);
        let line = ch.readline(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(line, "booting... Kernel panic - not syncing\n");
        // nothing was delivered twice
        assert_eq!(
            buf.borrow().as_slice(),
            b"booting... Kernel panic - not syncing\n"
        );
    }

    #[test]
    fn test_death_string_sees_already_buffered_bytes() {
        let io = ScriptedIo::new().chunks(["ok\nKernel panic\n"]);
        let ch = Channel::new(io);
        let t = Some(Duration::from_secs(1));
        assert_eq!(ch.readline(t).unwrap(), "ok\n");
        let d = ch
            .with_death_string("Kernel panic", TbotError::death_string)
            .unwrap();
        assert!(ch.read_some(64, t).unwrap_err().is_death_string());
        drop(d);
        assert_eq!(ch.readline(t).unwrap(), "Kernel panic\n");
    }

    #[test]
    fn test_borrow_blocks_outer_reference() {
        let (io, written) = ScriptedIo::new().with_written();
        let ch = Channel::new(io);
        {
            let inner = ch.borrow().unwrap();
            inner.send("x", false).unwrap();
            assert!(matches!(ch.send("y", false), Err(TbotError::ChannelBorrowed)));
        }
        ch.send("z", false).unwrap();
        assert_eq!(written.borrow().as_slice(), b"xz");
    }

    #[test]
    fn test_take_is_permanent() {
        let io = ScriptedIo::new();
        let ch = Channel::new(io);
        let taken = ch.take().unwrap();
        assert!(matches!(ch.send("a", false), Err(TbotError::ChannelTaken)));
        assert!(matches!(ch.take(), Err(TbotError::ChannelTaken)));
        taken.send("b", false).unwrap();
        // closing through the old reference does nothing
        ch.close().unwrap();
        assert!(!taken.is_closed());
    }

    #[test]
    fn test_borrow_then_take_moves_ownership() {
        let ch = Channel::new(ScriptedIo::new());
        let moved = {
            let inner = ch.borrow().unwrap();
            inner.take().unwrap()
        };
        assert_eq!(ch.state(), ChannelState::Taken);
        assert_eq!(moved.state(), ChannelState::Open);
    }

    #[test]
    fn test_closed_channel_stays_closed() {
        let ch = Channel::new(ScriptedIo::new());
        ch.close().unwrap();
        assert!(matches!(ch.send("a", false), Err(TbotError::ChannelClosed)));
        assert!(ch.is_closed());
    }

    #[test]
    fn test_sendline_read_back_consumes_echo() {
        let io = ScriptedIo::new().echo(true);
        let ch = Channel::new(io);
        ch.sendline("echo hi", true).unwrap();
        let err = ch.read_some(16, Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_sendcontrol_encoding() {
        let (io, written) = ScriptedIo::new().with_written();
        let ch = Channel::new(io);
        ch.sendintr().unwrap();
        ch.sendeof().unwrap();
        ch.sendcontrol('d').unwrap();
        assert_eq!(written.borrow().as_slice(), &[0x03, 0x04, 0x04]);
        assert!(ch.sendcontrol('1').is_err());
    }
}
