//! Top level of a test run

use std::process::ExitCode;
use tbot_core::{EVENTS, Result, TbotConfig, TbotError, event, interrupt};
use tracing::{debug, error, warn};

use crate::context::{Context, register_default_machines};

/// Exit code of a successful run
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code when a testcase or the setup failed
pub const EXIT_FAILURE: u8 = 1;
/// Exit code after SIGINT
pub const EXIT_INTERRUPTED: u8 = 130;

fn exit_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(TbotError::Interrupted) => EXIT_INTERRUPTED,
        Err(_) if interrupt::is_set() => EXIT_INTERRUPTED,
        Err(_) => EXIT_FAILURE,
    }
}

/// Apply `config` to the process: logging, event output and user flags.
///
/// Logging is left alone if a subscriber is already installed.
pub fn setup(config: &TbotConfig) -> Result<()> {
    config.validate()?;
    if let Err(e) = tbot_core::init_logging(config.logging.clone()) {
        debug!("keeping the existing logger: {}", e);
    }
    EVENTS.set_verbosity(config.events.verbosity);
    if let Some(path) = &config.events.log_file {
        EVENTS.open_file(path)?;
    }
    config.apply_flags();
    Ok(())
}

/// Entry point for a test binary.
///
/// Loads the configuration file and `TBOT_*` overrides, then runs `f` in a
/// fresh context with the local host registered as lab and build host.
pub fn main(f: impl FnOnce(&Context) -> Result<()>) -> ExitCode {
    let mut config = TbotConfig::load_with_fallback();
    let ctx = Context::new();
    let prepared = config
        .merge_with_env()
        .and_then(|()| setup(&config))
        .and_then(|()| register_default_machines(&ctx));
    if let Err(e) = prepared {
        error!("{}", e);
        eprintln!("tbot: {e}");
        return ExitCode::from(EXIT_FAILURE);
    }
    run(&ctx, f)
}

/// Run `f` inside the entered `ctx` and turn the outcome into an exit code.
///
/// Every machine left in the context is torn down before `tbot/end` is
/// emitted and the event log is closed.
pub fn run(ctx: &Context, f: impl FnOnce(&Context) -> Result<()>) -> ExitCode {
    ExitCode::from(run_code(ctx, f))
}

fn run_code(ctx: &Context, f: impl FnOnce(&Context) -> Result<()>) -> u8 {
    if let Err(e) = interrupt::install_handler() {
        warn!("SIGINT will not be handled gracefully: {}", e);
    }

    let scope = ctx.enter();
    let result = f(ctx);
    drop(scope);

    if let Err(e) = &result {
        error!("{}", e);
        event::exception(e.category(), &e.to_string());
    }
    let code = exit_code(&result);
    event::tbot_end(code == EXIT_SUCCESS);
    if let Err(e) = tbot_core::EVENTS.close_file() {
        warn!("failed to close the event log: {}", e);
    }
    code
}
