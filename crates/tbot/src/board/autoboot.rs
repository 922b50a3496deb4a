use std::time::Duration;
use tbot_core::{Pattern, Result};
use tracing::debug;

use crate::machine::{InitContext, InitPhase, Initializer};

/// Stops U-Boot's autoboot countdown
pub struct UBootAutobootIntercept {
    prompt: Pattern,
    keys: String,
    timeout: Option<Duration>,
}

impl UBootAutobootIntercept {
    /// Matches U-Boot's `Hit any key to stop autoboot:  3` and sends `\r`
    pub fn new() -> Result<Self> {
        Ok(Self {
            prompt: Pattern::regex(r"autoboot:\s{0,5}\d{0,3}\s{0,3}")?,
            keys: "\r".to_string(),
            timeout: None,
        })
    }

    pub fn prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Bytes sent once the countdown shows up
    pub fn keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = keys.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Initializer for UBootAutobootIntercept {
    fn phase(&self) -> InitPhase {
        InitPhase::AutobootIntercept
    }

    fn init(&self, cx: &mut InitContext<'_>) -> Result<()> {
        let ch = cx.channel()?;
        ch.expect(std::slice::from_ref(&self.prompt), self.timeout)?;
        debug!("{}: intercepting autoboot", cx.name());
        ch.send(&self.keys, false)
    }
}
