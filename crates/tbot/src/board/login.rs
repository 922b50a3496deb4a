use std::time::Duration;
use tbot_core::channel::READ_BACK_TIMEOUT;
use tbot_core::{Pattern, Result, event};

use crate::machine::{InitContext, InitPhase, Initializer};

/// Logs in on a serial console after Linux booted
pub struct LinuxBootLogin {
    login_prompt: Pattern,
    password_prompt: Pattern,
    username: String,
    password: Option<String>,
    login_delay: Duration,
    boot_timeout: Option<Duration>,
}

impl LinuxBootLogin {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            login_prompt: Pattern::from("login: "),
            password_prompt: Pattern::from("assword: "),
            username: username.into(),
            password: None,
            login_delay: Duration::ZERO,
            boot_timeout: None,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn login_prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.login_prompt = prompt.into();
        self
    }

    pub fn password_prompt(mut self, prompt: impl Into<Pattern>) -> Self {
        self.password_prompt = prompt.into();
        self
    }

    /// Let late kernel messages pass before logging in
    pub fn login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = Some(timeout);
        self
    }
}

impl Initializer for LinuxBootLogin {
    fn phase(&self) -> InitPhase {
        InitPhase::Login
    }

    fn init(&self, cx: &mut InitContext<'_>) -> Result<()> {
        event::board_linux(cx.name());
        let ch = cx.channel()?;
        let login = std::slice::from_ref(&self.login_prompt);
        ch.expect(login, self.boot_timeout)?;

        if !self.login_delay.is_zero() {
            ch.read_until_timeout(self.login_delay)?;
            ch.sendline("", false)?;
            ch.expect(login, Some(READ_BACK_TIMEOUT))?;
        }

        ch.sendline(&self.username, true)?;
        if let Some(password) = &self.password {
            ch.expect(std::slice::from_ref(&self.password_prompt), Some(READ_BACK_TIMEOUT))?;
            ch.sendline(password, false)?;
        }
        Ok(())
    }
}
