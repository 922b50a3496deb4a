//! Channel backends for tbot
//!
//! Each backend implements [`tbot_core::ChannelIo`] on top of one OS
//! resource:
//!
//! - [`SubprocessChannelIo`]: a local process on a fresh PTY
//! - [`SshChannelIo`]: an interactive shell in an SSH session
//! - [`SerialChannelIo`]: a serial console device
//!
//! [`SshConfig`] resolves host aliases from `~/.ssh/config` for the SSH
//! backend and for machines that shell out to `ssh`.

pub mod serial;
pub mod ssh;
pub mod ssh_config;
pub mod subprocess;

pub use serial::{SerialChannelIo, SerialOptions};
pub use ssh::{SshAuth, SshChannelIo, SshOptions};
pub use ssh_config::{SshConfig, SshHostConfig};
pub use subprocess::{SubprocessChannelIo, SubprocessOptions};
