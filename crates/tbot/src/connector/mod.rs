//! Connectors: where a machine's channel comes from

mod board;
pub(crate) mod lab;

pub use board::{BoardConnector, UBootBootConnector};
pub use lab::{ConsoleConnector, LabSshConnector};

use tbot_core::{Channel, NullChannelIo, Result};
use tbot_transport::{
    SerialChannelIo, SerialOptions, SshAuth, SshChannelIo, SshOptions, SubprocessChannelIo,
    SubprocessOptions,
};

use crate::machine::{Connection, Connector, InitContext, SshTarget};

/// Close `channel` when the machine goes down
pub(crate) fn close_on_teardown(cx: &mut InitContext<'_>, channel: &Channel) {
    let channel = channel.clone();
    cx.stack.push(move || channel.close());
}

/// A local process, by default `bash --norc --noprofile`
#[derive(Debug, Clone, Default)]
pub struct SubprocessConnector {
    options: SubprocessOptions,
}

impl SubprocessConnector {
    pub fn new(options: SubprocessOptions) -> Self {
        Self { options }
    }

    pub fn bash() -> Self {
        Self::default()
    }
}

impl Connector for SubprocessConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        let channel = Channel::new(SubprocessChannelIo::spawn(self.options.clone())?);
        close_on_teardown(cx, &channel);
        Ok(channel)
    }

    fn clone_connector(&self) -> Option<Box<dyn Connector>> {
        Some(Box::new(self.clone()))
    }

    fn connection(&self) -> Connection {
        Connection::Local
    }
}

/// SSH straight from this process
#[derive(Debug, Clone)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// Settings for `alias` from `~/.ssh/config`
    pub fn from_ssh_config(alias: &str) -> Self {
        Self::new(SshOptions::from_ssh_config(alias))
    }
}

impl Connector for SshConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        let channel = Channel::new(SshChannelIo::connect(&self.options)?);
        close_on_teardown(cx, &channel);
        Ok(channel)
    }

    fn clone_connector(&self) -> Option<Box<dyn Connector>> {
        Some(Box::new(self.clone()))
    }

    fn connection(&self) -> Connection {
        let mut target = SshTarget::new(&self.options.host, &self.options.username);
        target.port = self.options.port;
        target.strict_host_key_checking = self.options.strict_host_key_checking;
        match &self.options.auth {
            SshAuth::Password(password) => target.password = Some(password.clone()),
            SshAuth::Key { path, .. } => target.key = Some(path.display().to_string()),
        }
        Connection::Ssh { target, via: None }
    }
}

/// A serial port on this computer
#[derive(Debug, Clone)]
pub struct SerialConnector {
    options: SerialOptions,
}

impl SerialConnector {
    pub fn new(options: SerialOptions) -> Self {
        Self { options }
    }
}

impl Connector for SerialConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        let channel = Channel::new(SerialChannelIo::open(&self.options)?);
        close_on_teardown(cx, &channel);
        Ok(channel)
    }
}

/// A channel that never produces anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConnector;

impl Connector for NullConnector {
    fn connect(&self, _cx: &mut InitContext<'_>) -> Result<Channel> {
        Ok(Channel::new(NullChannelIo))
    }

    fn clone_connector(&self) -> Option<Box<dyn Connector>> {
        Some(Box::new(*self))
    }
}
