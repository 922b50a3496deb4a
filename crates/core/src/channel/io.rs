//! The byte-pipe contract every channel backend implements

use crate::error::{Result, TbotError};
use std::time::Duration;
use tracing::warn;

/// Ownership of the OS resource behind a [`Channel`](super::Channel).
///
/// Exactly one `ChannelIo` backs a channel and closing the channel closes it.
pub trait ChannelIo {
    /// Write all of `buf` or fail.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Read up to `max` bytes.
    ///
    /// Blocks until at least one byte is available. Fails with
    /// [`TbotError::Timeout`] when nothing arrives within `timeout` and with
    /// [`TbotError::ChannelClosed`] once the far end is gone.
    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Release the underlying resource. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Whether the backend has been closed or the far end disappeared
    fn closed(&self) -> bool;

    /// Resize the remote terminal, if the backend has one
    fn update_pty(&mut self, columns: u16, lines: u16) -> Result<()> {
        warn!(
            backend = self.describe(),
            columns, lines, "backend cannot resize its terminal"
        );
        Ok(())
    }

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// Backend for machines without a console. Every operation fails.
#[derive(Debug, Default)]
pub struct NullChannelIo;

impl ChannelIo for NullChannelIo {
    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(TbotError::ChannelClosed)
    }

    fn read(&mut self, _max: usize, _timeout: Option<Duration>) -> Result<Vec<u8>> {
        Err(TbotError::ChannelClosed)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn closed(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}
