//! The U-Boot command line

use std::rc::Rc;
use std::time::Duration;
use tbot_core::{Channel, Result, TbotError, event};
use tracing::info;

use super::{Arg, Shell, Special, check_retcode, exec_framed, quote};
use crate::machine::{InitContext, Machine, MachineBuilder, MachineHandle};

/// Waits for the U-Boot prompt
#[derive(Debug, Clone)]
pub struct UBootShell {
    pub prompt: String,
    /// How long to wait for the first prompt; `None` waits forever
    pub boot_timeout: Option<Duration>,
}

impl Default for UBootShell {
    fn default() -> Self {
        Self {
            prompt: "=> ".to_string(),
            boot_timeout: None,
        }
    }
}

impl UBootShell {
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = Some(timeout);
        self
    }
}

impl Shell for UBootShell {
    fn init_shell(&self, cx: &mut InitContext<'_>) -> Result<()> {
        let ch = cx.channel()?;
        ch.set_prompt(self.prompt.as_str())?;
        ch.read_until_prompt(self.boot_timeout)?;
        event::board_uboot(cx.name());
        Ok(())
    }
}

/// A machine sitting at the U-Boot prompt
#[derive(Clone)]
pub struct UBootHost {
    machine: Machine,
}

impl MachineHandle for UBootHost {
    fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl UBootHost {
    pub fn new(builder: MachineBuilder, shell: UBootShell) -> Self {
        Self {
            machine: builder.build(Rc::new(shell)),
        }
    }

    pub fn channel(&self) -> Result<Channel> {
        self.machine.channel()
    }

    /// Join `args` for U-Boot's hush parser
    pub fn escape(&self, args: &[Arg]) -> Result<String> {
        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            words.push(match arg {
                Arg::Str(s) => quote(s),
                Arg::Special(Special::Raw(raw)) => raw.clone(),
                Arg::Special(Special::Then) => ";".to_string(),
                Arg::Special(Special::AndThen) => "&&".to_string(),
                Arg::Special(Special::OrElse) => "||".to_string(),
                Arg::Path(p) => {
                    return Err(TbotError::WrongHost {
                        path: p.as_str().to_string(),
                        expected: self.name().to_string(),
                        actual: p.host().name().to_string(),
                    });
                }
                Arg::Special(other) => {
                    return Err(TbotError::not_implemented(format!(
                        "{other:?} in a U-Boot command line"
                    )));
                }
            });
        }
        Ok(words.join(" "))
    }

    pub fn exec(&self, args: &[Arg]) -> Result<(i32, String)> {
        let cmd = self.escape(args)?;
        exec_framed(&self.channel()?, self.name(), &cmd)
    }

    pub fn exec0(&self, args: &[Arg]) -> Result<String> {
        let cmd = self.escape(args)?;
        let result = exec_framed(&self.channel()?, self.name(), &cmd)?;
        check_retcode(self.name(), &cmd, result)
    }

    pub fn test(&self, args: &[Arg]) -> Result<bool> {
        Ok(self.exec(args)?.0 == 0)
    }

    /// Value of an environment variable
    pub fn env(&self, var: &str) -> Result<String> {
        let out = self.exec0(&[Special::Raw(format!("echo \" ${{{var}}}\"")).into()])?;
        let out = out.strip_suffix('\n').unwrap_or(&out);
        Ok(out.strip_prefix(' ').unwrap_or(out).to_string())
    }

    pub fn env_set(&self, var: &str, value: &str) -> Result<()> {
        self.exec0(&crate::args!["setenv", var, value])?;
        Ok(())
    }

    /// Run a boot command and take the channel without waiting for a prompt
    pub fn boot(&self, args: &[Arg]) -> Result<Channel> {
        let ch = self.channel()?;
        let cmd = self.escape(args)?;
        ch.sendline(&cmd, true)?;
        ch.take()
    }

    /// Hand the console to the user's terminal; CTRL+] leaves
    pub fn interactive(&self) -> Result<()> {
        let ch = self.channel()?;
        info!("Entering interactive U-Boot shell on {} (CTRL+] to leave)", self.name());
        ch.sendline("", false)?;
        ch.attach_interactive(None)?;
        ch.sendline("", false)?;
        ch.read_until_prompt(Some(tbot_core::channel::READ_BACK_TIMEOUT))?;
        info!("Leaving interactive U-Boot shell on {}", self.name());
        Ok(())
    }
}
