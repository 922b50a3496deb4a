//! Interacting with a running command

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tbot_core::channel::{DeathStringGuard, READ_BACK_TIMEOUT, StreamGuard};
use tbot_core::event::CommandLog;
use tbot_core::{Channel, ExpectMatch, Pattern, Result, TbotError};
use tracing::warn;

use super::{check_retcode, query_retcode};

/// A command started with [`LinuxHost::run`](super::LinuxHost::run).
///
/// While the proxy is alive the shell prompt acts as a death-string: once
/// the command exits, every operation fails with
/// [`TbotError::CommandEnded`]. Finish with [`RunCommandProxy::terminate`]
/// or [`RunCommandProxy::terminate0`].
pub struct RunCommandProxy {
    channel: Channel,
    host: String,
    command: String,
    death: Option<DeathStringGuard>,
    stream: Option<StreamGuard>,
    log: Rc<RefCell<CommandLog>>,
    ended: Cell<bool>,
    terminated: bool,
}

impl RunCommandProxy {
    pub(crate) fn start(channel: Channel, host: &str, command: String) -> Result<Self> {
        let prompt = channel
            .prompt()
            .ok_or_else(|| TbotError::internal("run needs a shell prompt"))?;
        channel.sendline(&command, true)?;
        let (log, sink) = CommandLog::sink(host, &command);
        let stream = channel.with_stream(sink, false)?;
        let death = channel.with_death_string(prompt, TbotError::command_ended)?;
        Ok(Self {
            channel,
            host: host.to_string(),
            command,
            death: Some(death),
            stream: Some(stream),
            log,
            ended: Cell::new(false),
            terminated: false,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the command was seen exiting
    pub fn ended(&self) -> bool {
        self.ended.get()
    }

    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(TbotError::CommandEnded) => {
                self.ended.set(true);
                Err(TbotError::CommandEnded)
            }
            Err(TbotError::Interrupted) => {
                if let Err(e) = self.channel.sendintr() {
                    warn!("{}: could not interrupt `{}`: {}", self.host, self.command, e);
                }
                Err(TbotError::Interrupted)
            }
            other => other,
        }
    }

    fn check(&self) -> Result<()> {
        if self.terminated {
            return Err(TbotError::internal(format!(
                "`{}` was already terminated",
                self.command
            )));
        }
        if self.ended.get() {
            return Err(TbotError::CommandEnded);
        }
        Ok(())
    }

    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.check()?;
        self.guard(self.channel.send(data, false))
    }

    pub fn sendline(&self, line: impl AsRef<str>) -> Result<()> {
        self.check()?;
        self.guard(self.channel.sendline(line, false))
    }

    pub fn sendcontrol(&self, c: char) -> Result<()> {
        self.check()?;
        self.guard(self.channel.sendcontrol(c))
    }

    pub fn sendintr(&self) -> Result<()> {
        self.check()?;
        self.guard(self.channel.sendintr())
    }

    pub fn sendeof(&self) -> Result<()> {
        self.check()?;
        self.guard(self.channel.sendeof())
    }

    pub fn read(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.check()?;
        self.guard(self.channel.read(n, timeout))
    }

    pub fn read_some(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.check()?;
        self.guard(self.channel.read_some(max, timeout))
    }

    pub fn read_until_timeout(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.check()?;
        self.guard(self.channel.read_until_timeout(timeout))
    }

    pub fn readline(&self, timeout: Option<Duration>) -> Result<String> {
        self.check()?;
        self.guard(self.channel.readline(timeout))
    }

    pub fn expect(&self, patterns: &[Pattern], timeout: Option<Duration>) -> Result<ExpectMatch> {
        self.check()?;
        self.guard(self.channel.expect(patterns, timeout))
    }

    /// Wait for the command to exit; returns its exit code and remaining output
    pub fn terminate(&mut self) -> Result<(i32, String)> {
        if self.terminated {
            return Err(TbotError::internal(format!(
                "`{}` was already terminated",
                self.command
            )));
        }
        self.terminated = true;
        self.death.take();
        let output = self.channel.read_until_prompt(None);
        self.stream.take();
        self.log.borrow_mut().finish();
        let output = output?;
        let retcode = query_retcode(&self.channel, &self.host)?;
        Ok((retcode, output))
    }

    /// [`RunCommandProxy::terminate`], failing on a non-zero exit code
    pub fn terminate0(&mut self) -> Result<String> {
        let result = self.terminate()?;
        check_retcode(&self.host, &self.command, result)
    }
}

impl Drop for RunCommandProxy {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        warn!(
            "{}: `{}` was not terminated, interrupting it",
            self.host, self.command
        );
        self.death.take();
        self.stream.take();
        if !self.ended.get() {
            let _ = self.channel.sendintr();
        }
        if let Err(e) = self.channel.read_until_prompt(Some(READ_BACK_TIMEOUT)) {
            warn!("{}: shell did not come back: {}", self.host, e);
        }
    }
}
