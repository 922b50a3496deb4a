//! Error types shared by every tbot crate

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tbot operations
pub type Result<T> = std::result::Result<T, TbotError>;

/// Constructor attached to a death-string; builds the error raised when the
/// pattern shows up in channel input.
pub type DeathStringFn = fn(&[u8]) -> TbotError;

/// Central error type for all tbot operations
#[derive(Error, Debug)]
pub enum TbotError {
    /// A capability method was called but the implementation does not provide it
    #[error("{capability} does not implement {method}")]
    AbstractMethod {
        capability: &'static str,
        method: &'static str,
    },

    /// The far end of the channel went away
    #[error("Channel closed")]
    ChannelClosed,

    /// The channel was lent to another machine and is not usable through this reference
    #[error("Channel is borrowed by another machine")]
    ChannelBorrowed,

    /// The channel was permanently handed over to another machine
    #[error("Channel was taken by another machine")]
    ChannelTaken,

    /// A timed read did not complete
    #[error("Operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// A death-string showed up in the channel input
    #[error("Death string {name:?} appeared in channel output: {matched:?}")]
    DeathString { name: String, matched: String },

    /// A command started with `run` exited before it was terminated
    #[error("Command ended prematurely")]
    CommandEnded,

    /// `exec0` saw a non-zero exit code
    #[error("[{host}] command `{command}` failed with exit code {retcode}")]
    CommandFailure {
        host: String,
        command: String,
        retcode: i32,
        output: String,
    },

    /// The exit code query returned something that is not a number
    #[error("[{host}] invalid exit code {output:?}, shell is in an unknown state")]
    InvalidRetcode { host: String, output: String },

    /// Shell sanity check after initialization failed
    #[error("Shell is in an unclean state: {reason}")]
    UncleanShell { reason: String },

    /// A path was used with a machine it does not belong to
    #[error("Path {path} is associated with {actual}, not {expected}")]
    WrongHost {
        path: String,
        expected: String,
        actual: String,
    },

    /// Context availability or exclusivity rule violated
    #[error("Context error: {message}")]
    Context { message: String },

    /// Two strong registrations for the same role
    #[error("Role {role} already has {existing} registered, refusing {name}")]
    RoleConflict {
        role: &'static str,
        existing: String,
        name: String,
    },

    /// Operation that is not supported for the given combination
    #[error("Not implemented: {what}")]
    NotImplemented { what: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// SSH connection errors
    #[error("SSH error: {message}")]
    Ssh { message: String },

    /// Serial port errors
    #[error("Serial port error: {message}")]
    Serial { message: String },

    /// SIGINT arrived while blocked on a channel
    #[error("Interrupted")]
    Interrupted,

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TbotError {
    /// Create a new context error
    pub fn context<S: Into<String>>(message: S) -> Self {
        Self::Context {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new SSH error
    pub fn ssh<S: Into<String>>(message: S) -> Self {
        Self::Ssh {
            message: message.into(),
        }
    }

    /// Create a new serial port error
    pub fn serial<S: Into<String>>(message: S) -> Self {
        Self::Serial {
            message: message.into(),
        }
    }

    /// Create a new not-implemented error
    pub fn not_implemented<S: Into<String>>(what: S) -> Self {
        Self::NotImplemented { what: what.into() }
    }

    /// Create a new unclean shell error
    pub fn unclean_shell<S: Into<String>>(reason: S) -> Self {
        Self::UncleanShell {
            reason: reason.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Default death-string constructor
    pub fn death_string(matched: &[u8]) -> Self {
        Self::DeathString {
            name: "death-string".to_string(),
            matched: String::from_utf8_lossy(matched).into_owned(),
        }
    }

    /// Death-string constructor used by `run` proxies
    pub fn command_ended(_matched: &[u8]) -> Self {
        Self::CommandEnded
    }

    /// Whether this error was raised by a death-string
    pub fn is_death_string(&self) -> bool {
        matches!(self, Self::DeathString { .. } | Self::CommandEnded)
    }

    /// Whether this error is a read timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Get the error category for logging and events
    pub fn category(&self) -> &'static str {
        match self {
            Self::AbstractMethod { .. } => "abstract-method",
            Self::ChannelClosed | Self::ChannelBorrowed | Self::ChannelTaken => "channel",
            Self::Timeout { .. } => "timeout",
            Self::DeathString { .. } | Self::CommandEnded => "death-string",
            Self::CommandFailure { .. } | Self::InvalidRetcode { .. } => "command",
            Self::UncleanShell { .. } => "shell",
            Self::WrongHost { .. } => "path",
            Self::Context { .. } | Self::RoleConflict { .. } => "context",
            Self::NotImplemented { .. } => "not-implemented",
            Self::Config { .. } => "config",
            Self::Ssh { .. } => "ssh",
            Self::Serial { .. } => "serial",
            Self::Interrupted => "interrupted",
            Self::Io(_) => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_death_string_constructors() {
        let err = TbotError::death_string(b"Kernel panic");
        assert!(err.is_death_string());
        assert_eq!(err.category(), "death-string");
        assert!(err.to_string().contains("Kernel panic"));

        let ended: DeathStringFn = TbotError::command_ended;
        assert!(matches!(ended(b"$ "), TbotError::CommandEnded));
    }

    #[test]
    fn test_command_failure_display() {
        let err = TbotError::CommandFailure {
            host: "lab".to_string(),
            command: "false".to_string(),
            retcode: 1,
            output: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "[lab] command `false` failed with exit code 1"
        );
        assert_eq!(err.category(), "command");
    }

    #[test]
    fn test_timeout_classification() {
        let err = TbotError::Timeout {
            after: Duration::from_secs(2),
        };
        assert!(err.is_timeout());
        assert!(!err.is_death_string());
    }
}
