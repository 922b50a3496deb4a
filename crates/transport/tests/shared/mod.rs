use anyhow::Result;
use std::time::Duration;
use tbot_core::Channel;
use tbot_transport::{SubprocessChannelIo, SubprocessOptions};

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

pub const PROMPT: &str = "TRANSPORT-TEST> ";

/// A local bash with a known prompt, ready for commands
pub fn local_bash() -> Result<Channel> {
    let ch = Channel::new(SubprocessChannelIo::bash()?);
    // split so the echoed command line does not contain the prompt
    ch.sendline("PS1='TRANSPORT-''TEST> '", false)?;
    ch.read_until_prompt_with(&PROMPT.into(), TIMEOUT)?;
    ch.set_prompt(PROMPT)?;
    Ok(ch)
}

/// Run `program args..` on a PTY and wrap it in a channel
pub fn spawn(program: &str, args: &[&str]) -> Result<Channel> {
    let mut options = SubprocessOptions::command(program);
    for arg in args {
        options = options.arg(*arg);
    }
    Ok(Channel::new(SubprocessChannelIo::spawn(options)?))
}
