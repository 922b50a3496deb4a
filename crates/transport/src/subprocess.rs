//! Local processes attached to a pseudo-terminal

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;
use tbot_core::{ChannelIo, Result, TbotError};
use tracing::{debug, trace, warn};

/// First wait while the process group shuts down; doubled up to seven times
const SHUTDOWN_BACKOFF: Duration = Duration::from_millis(10);
const SHUTDOWN_ROUNDS: u32 = 7;

/// What to run on the PTY
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub columns: u16,
    pub lines: u16,
}

impl Default for SubprocessOptions {
    /// A local bash without any user configuration
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            args: vec!["--norc".to_string(), "--noprofile".to_string()],
            env: vec![("TERM".to_string(), "dumb".to_string())],
            cwd: None,
            columns: 80,
            lines: 25,
        }
    }
}

impl SubprocessOptions {
    pub fn command(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A local process on a fresh PTY.
///
/// A reader thread moves PTY output into a queue; `read` waits on that
/// queue with the requested timeout.
pub struct SubprocessChannelIo {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    output: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    pgid: Option<Pid>,
    description: String,
    eof: bool,
    closed: bool,
}

fn pty_error(what: &str, e: impl std::fmt::Display) -> TbotError {
    TbotError::internal(format!("{what}: {e}"))
}

impl SubprocessChannelIo {
    /// Spawn a local `bash --norc --noprofile`
    pub fn bash() -> Result<Self> {
        Self::spawn(SubprocessOptions::default())
    }

    pub fn spawn(options: SubprocessOptions) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.lines,
                cols: options.columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("failed to open pty", e))?;

        let mut command = CommandBuilder::new(&options.program);
        command.args(&options.args);
        for (key, value) in &options.env {
            command.env(key, value);
        }
        if let Some(cwd) = &options.cwd {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| pty_error(&format!("failed to spawn {}", options.program), e))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let pgid = child.process_id().map(|pid| Pid::from_raw(pid as i32));
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("failed to clone pty reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("failed to take pty writer", e))?;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("tbot-pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        // EIO once the slave side is gone
                        Err(_) => break,
                    }
                }
            })?;

        let description = format!(
            "subprocess {} (pid {})",
            options.program,
            pgid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );
        debug!("spawned {}", description);

        Ok(Self {
            child,
            master: pair.master,
            writer,
            output: rx,
            leftover: Vec::new(),
            pgid,
            description,
            eof: false,
            closed: false,
        })
    }

    /// Append whatever is queued without blocking, up to `max` bytes
    fn drain_into(&mut self, out: &mut Vec<u8>, max: usize) {
        while out.len() < max {
            match self.output.try_recv() {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
            }
        }
        if out.len() > max {
            self.leftover = out.split_off(max);
        }
    }

    fn group_alive(&mut self) -> bool {
        // reap the leader so a zombie does not keep the group "alive"
        let _ = self.child.try_wait();
        match self.pgid {
            Some(pgid) => !matches!(killpg(pgid, None), Err(Errno::ESRCH)),
            None => false,
        }
    }

    fn terminate(&mut self) {
        if let Some(pgid) = self.pgid {
            for signal in [Signal::SIGHUP, Signal::SIGTERM] {
                if let Err(e) = killpg(pgid, signal) {
                    if e != Errno::ESRCH {
                        warn!("failed to signal process group {}: {}", pgid, e);
                    }
                }
            }
        }

        let mut wait = SHUTDOWN_BACKOFF;
        for _ in 0..SHUTDOWN_ROUNDS {
            if !self.group_alive() {
                return;
            }
            std::thread::sleep(wait);
            wait *= 2;
        }
        if self.group_alive() {
            warn!("{}: processes still running after close", self.description);
        }
    }
}

impl ChannelIo for SubprocessChannelIo {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed || self.eof {
            return Err(TbotError::ChannelClosed);
        }
        trace!(bytes = buf.len(), "pty write");
        self.writer.write_all(buf).map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe => TbotError::ChannelClosed,
            _ => TbotError::Io(e),
        })?;
        self.writer.flush()?;
        Ok(())
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.closed {
            return Err(TbotError::ChannelClosed);
        }
        let mut out = std::mem::take(&mut self.leftover);
        if out.is_empty() {
            if self.eof {
                return Err(TbotError::ChannelClosed);
            }
            let first = match timeout {
                Some(timeout) => self.output.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => TbotError::Timeout { after: timeout },
                    RecvTimeoutError::Disconnected => TbotError::ChannelClosed,
                }),
                None => self.output.recv().map_err(|_| TbotError::ChannelClosed),
            };
            match first {
                Ok(chunk) => out = chunk,
                Err(e) => {
                    if matches!(e, TbotError::ChannelClosed) {
                        self.eof = true;
                    }
                    return Err(e);
                }
            }
        }
        self.drain_into(&mut out, max);
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.terminate();
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed || (self.eof && self.leftover.is_empty())
    }

    fn update_pty(&mut self, columns: u16, lines: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows: lines,
                cols: columns,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("failed to resize pty", e))
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

impl Drop for SubprocessChannelIo {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.terminate();
        }
    }
}
