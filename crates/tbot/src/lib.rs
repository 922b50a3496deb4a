//! # tbot
//!
//! Test automation for embedded boards. A test run gets its machines
//! (lab host, board, U-Boot, Linux on the board, ...) from a
//! [`Context`](context::Context) and drives them through typed shells:
//!
//! * [`shell::LinuxHost`] for bash and POSIX `sh`, with [`path::Path`]s
//!   bound to the host they live on
//! * [`shell::UBootHost`] and [`shell::ZephyrHost`] for bootloader and RTOS
//!   shells
//! * [`board::Board`] for the console and power of the hardware itself
//!
//! Everything is synchronous and single threaded. Channels, events and the
//! error type come from [`tbot_core`], channel backends from
//! `tbot-transport`.

pub mod board;
pub mod builder;
pub mod connector;
pub mod context;
pub mod lab;
pub mod machine;
pub mod path;
pub mod runner;
pub mod shell;
pub mod testpy;

pub use tbot_core::{Channel, Pattern, Result, TbotConfig, TbotError, event, testcase};

pub use context::{Context, ContextOptions, MachineRequest, RequestOptions};
pub use machine::{Machine, MachineBuilder, MachineHandle};
pub use path::Path;
pub use shell::{Arg, LinuxHost, Special, UBootHost, ZephyrHost};

/// Error for a capability a machine was not given
pub(crate) fn abstract_method(capability: &'static str, method: &'static str) -> TbotError {
    TbotError::AbstractMethod { capability, method }
}
