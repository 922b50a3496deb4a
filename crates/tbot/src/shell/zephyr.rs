//! The Zephyr RTOS shell

use std::rc::Rc;
use std::time::Duration;
use tbot_core::channel::READ_BACK_TIMEOUT;
use tbot_core::event::CommandLog;
use tbot_core::{Channel, Result};
use tracing::info;

use super::{Arg, Shell, escape_posix};
use crate::machine::{InitContext, Machine, MachineBuilder, MachineHandle};

#[derive(Debug, Clone)]
pub struct ZephyrShell {
    pub prompt: String,
    pub boot_timeout: Option<Duration>,
}

impl Default for ZephyrShell {
    fn default() -> Self {
        Self {
            prompt: "uart:~$ ".to_string(),
            boot_timeout: None,
        }
    }
}

impl Shell for ZephyrShell {
    fn init_shell(&self, cx: &mut InitContext<'_>) -> Result<()> {
        let ch = cx.channel()?;
        ch.set_prompt(self.prompt.as_str())?;
        ch.read_until_prompt(self.boot_timeout)?;
        Ok(())
    }
}

/// A board running the Zephyr shell.
///
/// Zephyr has no exit codes, so there is only [`ZephyrHost::exec`].
#[derive(Clone)]
pub struct ZephyrHost {
    machine: Machine,
}

impl MachineHandle for ZephyrHost {
    fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl ZephyrHost {
    pub fn new(builder: MachineBuilder, shell: ZephyrShell) -> Self {
        Self {
            machine: builder.build(Rc::new(shell)),
        }
    }

    pub fn channel(&self) -> Result<Channel> {
        self.machine.channel()
    }

    pub fn escape(&self, args: &[Arg]) -> Result<String> {
        escape_posix(&self.machine, args, |w| quote(w))
    }

    /// Run a command and return its output
    pub fn exec(&self, args: &[Arg]) -> Result<String> {
        let ch = self.channel()?;
        let cmd = self.escape(args)?;
        ch.sendline(&cmd, true)?;
        let (log, sink) = CommandLog::sink(self.name(), &cmd);
        let _stream = ch.with_stream(sink, false)?;
        let output = ch.read_until_prompt(None);
        log.borrow_mut().finish();
        output
    }

    pub fn interactive(&self) -> Result<()> {
        let ch = self.channel()?;
        info!("Entering interactive Zephyr shell on {} (CTRL+] to leave)", self.name());
        ch.sendline("", false)?;
        ch.attach_interactive(None)?;
        ch.sendline("", false)?;
        ch.read_until_prompt(Some(READ_BACK_TIMEOUT))?;
        Ok(())
    }
}

/// Zephyr's parser understands double quotes only
fn quote(word: &str) -> String {
    if !word.is_empty() && !word.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        return word.to_string();
    }
    format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NullConnector;

    #[test]
    fn test_quote() {
        let z = ZephyrHost::new(
            MachineBuilder::new("zephyr").connector(NullConnector),
            ZephyrShell::default(),
        );
        assert_eq!(
            z.escape(&crate::args!["log", "enable", "dbg", "a \"b\""]).unwrap(),
            "log enable dbg \"a \\\"b\\\"\""
        );
        assert_eq!(quote(""), "\"\"");
    }
}
