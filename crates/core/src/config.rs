//! Configuration management for tbot

use crate::error::{Result, TbotError};
use crate::event::Verbosity;
use crate::logging::{LogFormat, LogOutput, LoggingConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure for tbot
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TbotConfig {
    /// Named user flags switched on for this run
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub workdir: WorkdirConfig,
    #[serde(default)]
    pub ssh: SshSettings,
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Threshold for rendering events to stdout
    #[serde(default = "default_verbosity")]
    pub verbosity: Verbosity,
    /// JSON-lines log of every event
    pub log_file: Option<PathBuf>,
}

/// Channel defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Bytes requested from a backend per read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Seconds to wait for echoed input
    #[serde(default = "default_read_back_timeout")]
    pub read_back_timeout: u64,
    /// Seconds a board may take to show its first prompt
    pub boot_timeout: Option<u64>,
}

/// Where per-host scratch directories live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkdirBase {
    /// `$XDG_RUNTIME_DIR/<name>`
    XdgRuntime,
    /// `$HOME/<name>`
    Home,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkdirConfig {
    #[serde(default = "default_workdir_name")]
    pub name: String,
    #[serde(default = "default_workdir_base")]
    pub base: WorkdirBase,
}

/// Settings shared by the SSH connectors and `copy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Reuse connections through a ControlMaster socket
    #[serde(default = "default_true")]
    pub multiplexing: bool,
    /// Pass `-O` to scp for servers without SFTP
    #[serde(default)]
    pub legacy_scp: bool,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_verbosity() -> Verbosity {
    Verbosity::Info
}
fn default_read_chunk() -> usize {
    4096
}
fn default_read_back_timeout() -> u64 {
    10
}
fn default_workdir_name() -> String {
    "tbot-workdir".to_string()
}
fn default_workdir_base() -> WorkdirBase {
    WorkdirBase::XdgRuntime
}
fn default_ssh_port() -> u16 {
    22
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            log_file: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_chunk: default_read_chunk(),
            read_back_timeout: default_read_back_timeout(),
            boot_timeout: None,
        }
    }
}

impl Default for WorkdirConfig {
    fn default() -> Self {
        Self {
            name: default_workdir_name(),
            base: default_workdir_base(),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            multiplexing: default_true(),
            legacy_scp: false,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ChannelConfig {
    pub fn boot_timeout(&self) -> Option<Duration> {
        self.boot_timeout.map(Duration::from_secs)
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl TbotConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let contents = std::fs::read_to_string(path)
            .map_err(|e| TbotError::config(format!("Failed to read config file: {}", e)))?;
        let config: TbotConfig = toml::from_str(&contents)
            .map_err(|e| TbotError::config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TbotError::config(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// `~/.config/tbot/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tbot").join("config.toml"))
    }

    /// Load `tbot.toml` from the working directory or the user config,
    /// falling back to defaults
    pub fn load_with_fallback() -> Self {
        let mut paths = vec![PathBuf::from("tbot.toml")];
        paths.extend(Self::default_path());

        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to load config from {}: {}", path.display(), e),
            }
        }
        debug!("No configuration file found, using defaults");
        Self::default()
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.merge_with_env()?;
        Ok(config)
    }

    /// Apply `TBOT_*` and `NO_COLOR` overrides
    pub fn merge_with_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("TBOT_LOG_LEVEL") {
            self.logging.level = level.parse()?;
        }
        if let Ok(format) = std::env::var("TBOT_LOG_FORMAT") {
            self.logging.format = format.parse::<LogFormat>()?;
        }
        if let Ok(path) = std::env::var("TBOT_LOG_FILE") {
            self.logging.output = LogOutput::File {
                path: PathBuf::from(path),
            };
        }
        if let Ok(verbosity) = std::env::var("TBOT_VERBOSITY") {
            self.events.verbosity = verbosity.parse()?;
        }
        if std::env::var("TBOT_TRACE_CHANNELS").is_ok_and(|v| v != "0") {
            self.logging.trace_channels = true;
        }
        if std::env::var("NO_COLOR").is_ok() {
            self.logging.ansi = false;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.read_chunk == 0 {
            return Err(TbotError::config("Read chunk size must be greater than 0"));
        }
        if self.ssh.port == 0 {
            return Err(TbotError::config("SSH port cannot be 0"));
        }
        if self.workdir.name.is_empty() || self.workdir.name.contains('/') {
            return Err(TbotError::config(format!(
                "Invalid workdir name: {:?}",
                self.workdir.name
            )));
        }
        Ok(())
    }

    /// Switch on the configured user flags
    pub fn apply_flags(&self) {
        for flag in &self.flags {
            Flags::set(flag);
        }
    }
}

static FLAGS: Lazy<RwLock<BTreeSet<String>>> = Lazy::new(|| RwLock::new(BTreeSet::new()));

/// Process-wide set of named user flags
pub struct Flags;

impl Flags {
    pub fn set(name: &str) {
        if let Ok(mut flags) = FLAGS.write() {
            flags.insert(name.to_string());
        }
    }

    pub fn unset(name: &str) {
        if let Ok(mut flags) = FLAGS.write() {
            flags.remove(name);
        }
    }

    pub fn is_set(name: &str) -> bool {
        FLAGS.read().map(|f| f.contains(name)).unwrap_or(false)
    }

    pub fn all() -> Vec<String> {
        FLAGS
            .read()
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }
}
