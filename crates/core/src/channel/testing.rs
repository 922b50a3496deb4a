//! Scripted channel backend for tests

use super::io::ChannelIo;
use crate::error::{Result, TbotError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// A backend that plays back prepared chunks and records what was written.
///
/// Reads return the queued chunks one at a time. Once the queue is empty a
/// read times out, or reports the channel closed if [`ScriptedIo::eof`] was
/// set.
pub struct ScriptedIo {
    incoming: VecDeque<Vec<u8>>,
    written: Rc<RefCell<Vec<u8>>>,
    echo: bool,
    joined: bool,
    responder: Option<Responder>,
    eof: bool,
    closed: bool,
}

impl Default for ScriptedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedIo {
    pub fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            written: Rc::new(RefCell::new(Vec::new())),
            echo: false,
            joined: false,
            responder: None,
            eof: false,
            closed: false,
        }
    }

    /// Queue chunks to be read in order
    pub fn chunks<I, T>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.incoming
            .extend(chunks.into_iter().map(|c| c.as_ref().to_vec()));
        self
    }

    /// Echo written bytes back like a terminal would (`\r` comes back as `\r\n`)
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Deliver the echo and the responder's answer as a single chunk,
    /// the way a fast remote often does
    pub fn joined(mut self, joined: bool) -> Self {
        self.joined = joined;
        self
    }

    /// Report the channel closed once all chunks are consumed
    pub fn eof(mut self) -> Self {
        self.eof = true;
        self
    }

    /// Answer each write with the bytes returned by `f`
    pub fn respond(mut self, f: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        self.responder = Some(Box::new(f));
        self
    }

    /// Keep a handle on everything written to the backend
    pub fn with_written(self) -> (Self, Rc<RefCell<Vec<u8>>>) {
        let written = Rc::clone(&self.written);
        (self, written)
    }
}

impl ChannelIo for ScriptedIo {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TbotError::ChannelClosed);
        }
        self.written.borrow_mut().extend_from_slice(buf);
        let mut echoed = Vec::new();
        if self.echo {
            for &b in buf {
                echoed.push(b);
                if b == b'\r' {
                    echoed.push(b'\n');
                }
            }
        }
        let answer = match self.responder.as_mut() {
            Some(responder) => responder(buf),
            None => Vec::new(),
        };
        if self.joined {
            echoed.extend(answer);
            if !echoed.is_empty() {
                self.incoming.push_back(echoed);
            }
        } else {
            for chunk in [echoed, answer] {
                if !chunk.is_empty() {
                    self.incoming.push_back(chunk);
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.closed {
            return Err(TbotError::ChannelClosed);
        }
        match self.incoming.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max {
                    let rest = chunk.split_off(max);
                    self.incoming.push_front(rest);
                }
                Ok(chunk)
            }
            None if self.eof => Err(TbotError::ChannelClosed),
            None => {
                let wait = timeout.unwrap_or(Duration::from_millis(5));
                std::thread::sleep(wait.min(Duration::from_millis(5)));
                Err(TbotError::Timeout {
                    after: timeout.unwrap_or_default(),
                })
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
