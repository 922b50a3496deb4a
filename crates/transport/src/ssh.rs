//! Interactive shells over SSH
//!
//! russh is async; the channel engine is not. Each connection owns a
//! current-thread tokio runtime and every operation blocks on it.

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tbot_core::{ChannelIo, Result, TbotError};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::ssh_config::SshConfig;

/// How to authenticate
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub connect_timeout: Duration,
    /// Verify the server key against `~/.ssh/known_hosts`
    pub strict_host_key_checking: bool,
}

impl SshOptions {
    /// Fill the options for `alias` from `~/.ssh/config`.
    ///
    /// Falls back to the alias itself as hostname, port 22, `$USER`, and the
    /// first configured identity file (or `~/.ssh/id_ed25519`).
    pub fn from_ssh_config(alias: &str) -> Self {
        let entry = SshConfig::load_default().lookup(alias);
        let key = entry.identity_files.first().cloned().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("id_ed25519")
        });
        Self {
            host: entry.hostname.unwrap_or_else(|| alias.to_string()),
            port: entry.port.unwrap_or(22),
            username: entry
                .user
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string()),
            auth: SshAuth::Key {
                path: key,
                passphrase: None,
            },
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: entry.strict_host_key_checking.unwrap_or(false),
        }
    }
}

struct ServerKeyCheck {
    host: String,
    port: u16,
    strict: bool,
}

impl client::Handler for ServerKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => Ok(known),
            Err(e) => {
                warn!("host key check for {} failed: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

fn ssh_error(what: &str, e: impl std::fmt::Display) -> TbotError {
    TbotError::ssh(format!("{what}: {e}"))
}

/// An interactive shell channel in an SSH session
pub struct SshChannelIo {
    runtime: Runtime,
    session: Handle<ServerKeyCheck>,
    channel: russh::Channel<Msg>,
    leftover: Vec<u8>,
    description: String,
    eof: bool,
    closed: bool,
}

impl SshChannelIo {
    /// Connect, authenticate, and start a shell on an 80x25 pty
    pub fn connect(options: &SshOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        info!(
            "Connecting to {}:{} as {}",
            options.host, options.port, options.username
        );
        let config = Arc::new(client::Config::default());
        let handler = ServerKeyCheck {
            host: options.host.clone(),
            port: options.port,
            strict: options.strict_host_key_checking,
        };

        let (session, channel) = runtime.block_on(async {
            let connect = client::connect(config, (options.host.as_str(), options.port), handler);
            let mut session = tokio::time::timeout(options.connect_timeout, connect)
                .await
                .map_err(|_| TbotError::ssh(format!("connecting to {} timed out", options.host)))?
                .map_err(|e| ssh_error("Failed to connect to SSH server", e))?;

            let auth = match &options.auth {
                SshAuth::Password(password) => session
                    .authenticate_password(&options.username, password)
                    .await
                    .map_err(|e| ssh_error("Failed to authenticate with password", e))?,
                SshAuth::Key { path, passphrase } => {
                    let key = russh::keys::load_secret_key(path, passphrase.as_deref())
                        .map_err(|e| ssh_error(&format!("Failed to load key {}", path.display()), e))?;
                    let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                    session
                        .authenticate_publickey(&options.username, key)
                        .await
                        .map_err(|e| ssh_error("Failed to authenticate with key", e))?
                }
            };
            if !matches!(auth, AuthResult::Success) {
                return Err(TbotError::ssh(format!(
                    "authentication as {} rejected",
                    options.username
                )));
            }

            let channel = session
                .channel_open_session()
                .await
                .map_err(|e| ssh_error("Failed to open SSH channel", e))?;
            channel
                .request_pty(false, "dumb", 80, 25, 0, 0, &[])
                .await
                .map_err(|e| ssh_error("Failed to request pty", e))?;
            channel
                .request_shell(false)
                .await
                .map_err(|e| ssh_error("Failed to start shell", e))?;
            Ok::<_, TbotError>((session, channel))
        })?;

        let description = format!("ssh {}@{}:{}", options.username, options.host, options.port);
        debug!("opened {}", description);
        Ok(Self {
            runtime,
            session,
            channel,
            leftover: Vec::new(),
            description,
            eof: false,
            closed: false,
        })
    }
}

impl ChannelIo for SshChannelIo {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed || self.eof {
            return Err(TbotError::ChannelClosed);
        }
        self.runtime
            .block_on(self.channel.data(buf))
            .map_err(|_| TbotError::ChannelClosed)
    }

    fn read(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.closed {
            return Err(TbotError::ChannelClosed);
        }
        if !self.leftover.is_empty() {
            let n = max.min(self.leftover.len());
            let rest = self.leftover.split_off(n);
            return Ok(std::mem::replace(&mut self.leftover, rest));
        }
        if self.eof {
            return Err(TbotError::ChannelClosed);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let msg = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match self
                        .runtime
                        .block_on(tokio::time::timeout(left, self.channel.wait()))
                    {
                        Ok(msg) => msg,
                        Err(_) => {
                            return Err(TbotError::Timeout {
                                after: timeout.unwrap_or_default(),
                            });
                        }
                    }
                }
                None => self.runtime.block_on(self.channel.wait()),
            };
            match msg {
                // stderr is merged, as on a terminal
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let mut out = data.to_vec();
                    if out.len() > max {
                        self.leftover = out.split_off(max);
                    }
                    return Ok(out);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{}: remote shell exited with {}", self.description, exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.eof = true;
                    return Err(TbotError::ChannelClosed);
                }
                Some(_) => {}
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let channel = &self.channel;
        let session = &self.session;
        let result = self.runtime.block_on(async move {
            let _ = channel.eof().await;
            let _ = channel.close().await;
            session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
        });
        if let Err(e) = result {
            debug!("{}: disconnect failed: {}", self.description, e);
        }
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed || (self.eof && self.leftover.is_empty())
    }

    fn update_pty(&mut self, columns: u16, lines: u16) -> Result<()> {
        self.runtime
            .block_on(self.channel.window_change(columns as u32, lines as u32, 0, 0))
            .map_err(|e| ssh_error("Failed to resize pty", e))
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}
