//! Diagnostic logging for tbot
//!
//! Diagnostics go through `tracing`. This module installs the subscriber;
//! the user-facing event stream lives in [`crate::event`].

use crate::error::{Result, TbotError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Targets `level` applies to
const TBOT_TARGETS: [&str; 3] = ["tbot", "tbot_core", "tbot_transport"];

/// Target of the per-byte channel traces
pub const CHANNEL_TARGET: &str = "tbot_core::channel";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the tbot crates
    pub level: LogLevel,
    /// Extra `target = level` directives, e.g. for `russh`
    pub targets: HashMap<String, LogLevel>,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Show `file:line` of each record
    pub location: bool,
    pub ansi: bool,
    /// Trace every chunk read from or written to a channel
    pub trace_channels: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            targets: HashMap::new(),
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            location: false,
            ansi: true,
            trace_channels: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = TbotError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TbotError::config(format!("unknown log level {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per record
    Compact,
    /// Multi-line, for reading along while debugging a board
    Pretty,
    /// `tracing-subscriber`'s default
    Full,
    /// One JSON object per record
    Json,
}

impl FromStr for LogFormat {
    type Err = TbotError;

    fn from_str(s: &str) -> Result<Self> {
        let format = match s.to_ascii_lowercase().as_str() {
            "compact" => LogFormat::Compact,
            "pretty" => LogFormat::Pretty,
            "full" => LogFormat::Full,
            "json" => LogFormat::Json,
            _ => return Err(TbotError::config(format!("unknown log format {s:?}"))),
        };
        Ok(format)
    }
}

/// Where diagnostics are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Appended to
    File { path: PathBuf },
}

/// Assembles a [`LoggingConfig`] and installs it
#[derive(Default)]
pub struct LoggerBuilder {
    config: LoggingConfig,
}

impl LoggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn target(mut self, target: impl Into<String>, level: LogLevel) -> Self {
        self.config.targets.insert(target.into(), level);
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn location(mut self, location: bool) -> Self {
        self.config.location = location;
        self
    }

    pub fn ansi(mut self, ansi: bool) -> Self {
        self.config.ansi = ansi;
        self
    }

    pub fn trace_channels(mut self, trace: bool) -> Self {
        self.config.trace_channels = trace;
        self
    }

    pub fn init(self) -> Result<()> {
        init_logging(self.config)
    }
}

fn directives(config: &LoggingConfig) -> Vec<String> {
    let mut directives: Vec<String> = TBOT_TARGETS
        .iter()
        .map(|t| format!("{t}={}", config.level))
        .collect();
    let mut targets: Vec<_> = config.targets.iter().collect();
    targets.sort_by(|a, b| a.0.cmp(b.0));
    directives.extend(targets.into_iter().map(|(t, l)| format!("{t}={l}")));
    // most specific, so it goes last
    if config.trace_channels {
        directives.push(format!("{CHANNEL_TARGET}=trace"));
    }
    directives
}

fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(env) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(&env)
            .map_err(|e| TbotError::config(format!("RUST_LOG={env:?}: {e}")));
    }
    directives(config)
        .into_iter()
        .try_fold(EnvFilter::new(""), |filter, d| {
            let parsed = d
                .parse()
                .map_err(|e| TbotError::config(format!("log directive {d:?}: {e}")))?;
            Ok(filter.add_directive(parsed))
        })
}

fn writer(output: &LogOutput) -> Result<BoxMakeWriter> {
    let writer = match output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File { path } => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };
    Ok(writer)
}

/// Install the global subscriber; fails if one is already installed
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let ansi = config.ansi && !matches!(config.output, LogOutput::File { .. });
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer(&config.output)?)
        .with_file(config.location)
        .with_line_number(config.location);
    let registry = Registry::default().with(filter(&config)?);

    match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.with_ansi(ansi).compact()).try_init(),
        LogFormat::Pretty => registry.with(layer.with_ansi(ansi).pretty()).try_init(),
        LogFormat::Full => registry.with(layer.with_ansi(ansi)).try_init(),
    }
    .map_err(|e| TbotError::config(format!("cannot install logger: {e}")))?;

    tracing::debug!(?config, "logging initialized");
    Ok(())
}

/// Install logging as configured by `TBOT_LOG_*` and `NO_COLOR`
pub fn init_from_env() -> Result<()> {
    init_logging(crate::config::TbotConfig::from_env()?.logging)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_and_format() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_directives() {
        let builder = LoggerBuilder::new()
            .level(LogLevel::Info)
            .target("russh", LogLevel::Error)
            .target("mio", LogLevel::Warn)
            .trace_channels(true);
        assert_eq!(
            directives(&builder.config),
            [
                "tbot=info",
                "tbot_core=info",
                "tbot_transport=info",
                "mio=warn",
                "russh=error",
                "tbot_core::channel=trace",
            ]
        );
    }

    #[test]
    fn test_output_in_config_files() {
        let output = LogOutput::File {
            path: PathBuf::from("/tmp/tbot.log"),
        };
        let json = serde_json::to_string(&output).unwrap();
        assert_eq!(json, r#"{"type":"file","path":"/tmp/tbot.log"}"#);
        let back: LogOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, output);
    }
}
