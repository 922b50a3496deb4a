//! Connect the user's terminal to a channel

use super::pattern::find_subslice;
use super::{Channel, Deadline};
use crate::error::{Result, TbotError};
use crossterm::terminal;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::time::Duration;
use tracing::{debug, warn};

const CHANNEL_POLL: Duration = Duration::from_millis(20);

/// CTRL+] detaches without forwarding anything further
const DETACH_KEY: u8 = 0x1d;

/// Puts the local terminal into raw mode until dropped
struct RawMode;

impl RawMode {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}

impl Channel {
    /// Relay the local terminal to this channel.
    ///
    /// Returns when stdin reaches end-of-file, the user presses CTRL+], the
    /// channel closes, or `end_magic` shows up in the channel output.
    pub fn attach_interactive(&self, end_magic: Option<&str>) -> Result<()> {
        let mut core = self.core()?;
        let stdin = std::io::stdin();
        // Unbuffered view of fd 0 so poll() and read() agree on what is pending.
        // SAFETY: the File is never dropped, so fd 0 is not closed.
        let mut input = ManuallyDrop::new(unsafe { File::from_raw_fd(stdin.as_raw_fd()) });
        let mut stdout = std::io::stdout();

        if let Ok((columns, lines)) = terminal::size() {
            core.terminal = (columns, lines);
            core.io.update_pty(columns, lines)?;
        }

        let magic = end_magic.map(|m| m.as_bytes().to_vec());
        let mut tail: Vec<u8> = Vec::new();
        let _raw = RawMode::enable()?;
        debug!(channel = %core.name, "attached interactive session");

        loop {
            if !core.pending.is_empty() {
                let all = core.pending.len();
                let data = core.consume(all);
                stdout.write_all(&data)?;
                stdout.flush()?;
                if let Some(magic) = &magic {
                    tail.extend_from_slice(&data);
                    if find_subslice(&tail, magic).is_some() {
                        break;
                    }
                    let keep = magic.len().saturating_sub(1);
                    if tail.len() > keep {
                        tail.drain(..tail.len() - keep);
                    }
                }
            }

            match core.fill(&Deadline::after(Some(CHANNEL_POLL))) {
                Ok(_) | Err(TbotError::Timeout { .. }) => {}
                Err(TbotError::ChannelClosed) => break,
                Err(e) => return Err(e),
            }

            let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, PollTimeout::from(10u8)).map_err(std::io::Error::from)?;
            if ready > 0 {
                let mut buf = [0u8; 1024];
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                if let Some(pos) = buf[..n].iter().position(|&b| b == DETACH_KEY) {
                    core.io.write(&buf[..pos])?;
                    break;
                }
                core.io.write(&buf[..n])?;
            }
        }

        debug!(channel = %core.name, "detached interactive session");
        Ok(())
    }
}
