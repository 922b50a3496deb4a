//! Serial console devices

use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, SetArg};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tbot_core::{ChannelIo, Result, TbotError};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SerialOptions {
    pub port: PathBuf,
    pub baudrate: u32,
}

impl SerialOptions {
    pub fn new(port: impl Into<PathBuf>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
        }
    }
}

fn baud_rate(rate: u32) -> Result<BaudRate> {
    Ok(match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        1500000 => BaudRate::B1500000,
        3000000 => BaudRate::B3000000,
        other => return Err(TbotError::serial(format!("unsupported baudrate {other}"))),
    })
}

/// A serial port opened in raw mode and locked exclusively.
///
/// The first byte of a read waits up to the timeout; whatever follows is
/// drained without blocking.
pub struct SerialChannelIo {
    device: Option<Flock<File>>,
    description: String,
}

impl SerialChannelIo {
    pub fn open(options: &SerialOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(&options.port)
            .map_err(|e| {
                TbotError::serial(format!("failed to open {}: {}", options.port.display(), e))
            })?;

        let device = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            TbotError::serial(format!(
                "{} is in use by another process: {}",
                options.port.display(),
                errno
            ))
        })?;

        let mut attrs = termios::tcgetattr(device.as_fd())
            .map_err(|e| TbotError::serial(format!("tcgetattr failed: {e}")))?;
        termios::cfmakeraw(&mut attrs);
        termios::cfsetspeed(&mut attrs, baud_rate(options.baudrate)?)
            .map_err(|e| TbotError::serial(format!("failed to set baudrate: {e}")))?;
        termios::tcsetattr(device.as_fd(), SetArg::TCSANOW, &attrs)
            .map_err(|e| TbotError::serial(format!("tcsetattr failed: {e}")))?;

        let description = format!("serial {} @ {}", options.port.display(), options.baudrate);
        debug!("opened {}", description);
        Ok(Self {
            device: Some(device),
            description,
        })
    }

    fn device(&self) -> Result<&File> {
        self.device
            .as_ref()
            .map(|d| &**d)
            .ok_or(TbotError::ChannelClosed)
    }
}

impl ChannelIo for SerialChannelIo {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut device = self.device()?;
        let mut written = 0;
        while written < buf.len() {
            match device.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let mut fds = [PollFd::new(device.as_fd(), PollFlags::POLLOUT)];
                    poll(&mut fds, PollTimeout::from(100u16)).map_err(std::io::Error::from)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut device = self.device()?;
        let wait = match timeout {
            Some(t) => PollTimeout::from(t.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        };
        let mut fds = [PollFd::new(device.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, wait).map_err(std::io::Error::from)?;
        if ready == 0 {
            return Err(TbotError::Timeout {
                after: timeout.unwrap_or_default(),
            });
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
            && !revents.contains(PollFlags::POLLIN)
        {
            return Err(TbotError::ChannelClosed);
        }

        let mut out = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            match device.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    fn close(&mut self) -> Result<()> {
        // dropping the Flock unlocks, dropping the File closes
        self.device.take();
        Ok(())
    }

    fn closed(&self) -> bool {
        self.device.is_none()
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}
