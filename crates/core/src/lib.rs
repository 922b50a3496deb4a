//! # tbot core
//!
//! Shared plumbing for the tbot board-automation framework: the
//! prompt-aware [`Channel`] and its backend contract, the error type,
//! configuration, diagnostic logging and the user-facing event stream.
//!
//! Machines, shells and the context live in the `tbot` crate; concrete
//! channel backends live in `tbot-transport`.

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod logging;
pub mod testcase;

pub use channel::{Channel, ChannelIo, ChannelState, ExpectMatch, NullChannelIo, Pattern, Sink};
pub use config::{Flags, TbotConfig};
pub use error::{DeathStringFn, Result, TbotError};
pub use event::{EVENTS, Event, Verbosity};
pub use logging::{
    LogFormat, LogLevel, LogOutput, LoggerBuilder, LoggingConfig, init_from_env, init_logging,
};
pub use testcase::testcase;
