//! Linux shells: bash and busybox/dash `sh`

use rand::Rng;
use rand::distr::Alphanumeric;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
use std::time::Duration;
use tbot_core::channel::READ_BACK_TIMEOUT;
use tbot_core::{Channel, Pattern, Result, TbotError};
use tracing::{info, warn};

use super::{Arg, RunCommandProxy, Shell, Special, check_retcode, escape_posix, exec_framed, mangle};
use crate::builder::Toolchain;
use crate::connector::SubprocessConnector;
use crate::machine::{InitContext, Machine, MachineBuilder, MachineHandle};
use crate::path::{Path, Workdir};

/// The prompt every Linux shell is switched to
pub const PROMPT: &str = "TBOT-VEJPVC1QUk9NUFQK$ ";

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const BANNER_SETTLE: Duration = Duration::from_millis(200);
const SANITY: &str = "TBOT-SANITY-CHECK";

/// Shell-specific part of a Linux host
pub trait LinuxShell: Shell {
    /// Program that starts another instance of this shell
    fn program(&self) -> &'static str;

    fn quote(&self, word: &str) -> String {
        super::quote(word)
    }

    /// Switch a freshly started shell to [`PROMPT`] and a predictable terminal
    fn setup(&self, ch: &Channel) -> Result<()>;

    /// Prompt for a human in [`LinuxHost::interactive`]
    fn pretty_prompt(&self, name: &str) -> String;
}

/// `text` made safe to place between single quotes
fn in_single_quotes(text: &str) -> String {
    text.replace('\'', "'\"'\"'")
}

/// Drop whatever the shell printed on startup
fn settle(ch: &Channel) -> Result<()> {
    ch.read_until_timeout(BANNER_SETTLE)?;
    Ok(())
}

fn switch_prompt(ch: &Channel, line: &str) -> Result<()> {
    ch.sendline(line, false)?;
    ch.read_until_prompt_with(&Pattern::from(PROMPT), Some(INIT_TIMEOUT))?;
    ch.set_prompt(PROMPT)
}

fn run_quiet(ch: &Channel, cmd: &str) -> Result<String> {
    ch.sendline(cmd, true)?;
    ch.read_until_prompt(Some(READ_BACK_TIMEOUT))
}

fn sanity_check(ch: &Channel) -> Result<()> {
    let out = run_quiet(ch, &format!("echo {SANITY}"))?;
    if out != format!("{SANITY}\n") {
        return Err(TbotError::unclean_shell(format!(
            "expected {SANITY:?} after init, got {out:?}"
        )));
    }
    Ok(())
}

fn local_terminal_lines() -> u16 {
    crossterm::terminal::size().map(|(_, l)| l).unwrap_or(24)
}

/// GNU bash
#[derive(Debug, Clone, Copy, Default)]
pub struct Bash;

impl Shell for Bash {
    fn init_shell(&self, cx: &mut InitContext<'_>) -> Result<()> {
        self.setup(cx.channel()?)
    }
}

impl LinuxShell for Bash {
    fn program(&self) -> &'static str {
        "bash"
    }

    fn setup(&self, ch: &Channel) -> Result<()> {
        settle(ch)?;
        switch_prompt(
            ch,
            &format!(
                "bind 'set enable-bracketed-paste off' 2>/dev/null; set +o emacs; set +o vi; \
                 unset HISTFILE; histchars=''; unset PROMPT_COMMAND; PS2=''; PS1={}",
                mangle(PROMPT)
            ),
        )?;
        let columns = crossterm::terminal::size().map(|(c, _)| c).unwrap_or(80);
        run_quiet(ch, &format!("stty cols {} rows {}", columns, local_terminal_lines()))?;
        sanity_check(ch)
    }

    fn pretty_prompt(&self, name: &str) -> String {
        let name = in_single_quotes(name);
        format!("'\\[\\033[36m\\]{name}: \\[\\033[32m\\]\\w\\[\\033[0m\\]> '")
    }
}

/// A minimal POSIX `sh` (busybox ash, dash)
///
/// Line editing cannot be switched off, so the terminal is made wide
/// enough that commands never wrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ash;

impl Shell for Ash {
    fn init_shell(&self, cx: &mut InitContext<'_>) -> Result<()> {
        self.setup(cx.channel()?)
    }
}

impl LinuxShell for Ash {
    fn program(&self) -> &'static str {
        "sh"
    }

    fn setup(&self, ch: &Channel) -> Result<()> {
        settle(ch)?;
        switch_prompt(
            ch,
            &format!("unset HISTFILE; PS2=''; PS1={}", mangle(PROMPT)),
        )?;
        run_quiet(ch, &format!("stty cols 1024 rows {}", local_terminal_lines()))?;
        sanity_check(ch)
    }

    fn pretty_prompt(&self, name: &str) -> String {
        format!("'{}: $PWD> '", in_single_quotes(name))
    }
}

/// How a lab host finds its build host
#[derive(Clone)]
pub(crate) enum BuildHostSource {
    None,
    Itself,
    Factory(Rc<dyn Fn() -> Result<LinuxHost>>),
}

#[derive(Clone)]
pub(crate) struct Extras {
    pub(crate) toolchains: Vec<(String, Rc<dyn Toolchain>)>,
    pub(crate) build_host: BuildHostSource,
}

/// A machine running a Linux shell
#[derive(Clone)]
pub struct LinuxHost {
    machine: Machine,
    shell: Rc<dyn LinuxShell>,
    pub(crate) extras: Rc<Extras>,
}

impl fmt::Debug for LinuxHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinuxHost").field(&self.machine.name()).finish()
    }
}

impl PartialEq for LinuxHost {
    fn eq(&self, other: &Self) -> bool {
        self.machine == other.machine
    }
}

impl MachineHandle for LinuxHost {
    fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl LinuxHost {
    pub fn new<S: LinuxShell + 'static>(builder: MachineBuilder, shell: S) -> Self {
        let shell = Rc::new(shell);
        Self {
            machine: builder.build(shell.clone()),
            shell,
            extras: Rc::new(Extras {
                toolchains: Vec::new(),
                build_host: BuildHostSource::None,
            }),
        }
    }

    /// A bash on this computer
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(
            MachineBuilder::new(name).connector(SubprocessConnector::bash()),
            Bash,
        )
    }

    /// An independent connection to the same host
    pub fn clone_host(&self) -> Result<LinuxHost> {
        Ok(Self {
            machine: self.machine.clone_machine()?,
            shell: self.shell.clone(),
            extras: self.extras.clone(),
        })
    }

    pub fn channel(&self) -> Result<Channel> {
        self.machine.channel()
    }

    pub fn path(&self, path: impl Into<String>) -> Path {
        Path::new(self.clone(), path)
    }

    pub fn fsroot(&self) -> Path {
        self.path("/")
    }

    /// The default scratch directory below `$XDG_RUNTIME_DIR`
    pub fn workdir(&self) -> Result<Path> {
        Workdir::xdg_runtime(self, crate::path::workdir::DEFAULT_NAME)
    }

    pub fn username(&self) -> Result<String> {
        let name = self.machine.cached("username", || {
            Ok(self.exec0(&crate::args!["id", "-un"])?.trim().to_string())
        })?;
        Ok((*name).clone())
    }

    pub fn escape(&self, args: &[Arg]) -> Result<String> {
        escape_posix(&self.machine, args, |w| self.shell.quote(w))
    }

    /// Run a command, returning its exit code and merged stdout/stderr
    pub fn exec(&self, args: &[Arg]) -> Result<(i32, String)> {
        let cmd = self.escape(args)?;
        exec_framed(&self.channel()?, self.name(), &cmd)
    }

    /// Run a command that must succeed, returning its output
    pub fn exec0(&self, args: &[Arg]) -> Result<String> {
        let cmd = self.escape(args)?;
        let result = exec_framed(&self.channel()?, self.name(), &cmd)?;
        check_retcode(self.name(), &cmd, result)
    }

    /// [`LinuxHost::exec0`] with `input` typed into the command's stdin.
    ///
    /// The input passes through the terminal, so its echo is part of the
    /// returned output and lines are limited to the terminal's line buffer.
    pub fn exec0_with_input(&self, args: &[Arg], input: &[u8]) -> Result<String> {
        let mut proxy = self.run(args)?;
        proxy.send(input)?;
        if !input.is_empty() && !input.ends_with(b"\n") {
            proxy.sendeof()?;
        }
        proxy.sendeof()?;
        proxy.terminate0()
    }

    /// Whether a command succeeds
    pub fn test(&self, args: &[Arg]) -> Result<bool> {
        Ok(self.exec(args)?.0 == 0)
    }

    /// Value of an environment variable
    pub fn env(&self, var: &str) -> Result<String> {
        check_var(var)?;
        // the leading space keeps echo from parsing values like `-E`
        let out = self.exec0(&[Special::Raw(format!("echo \" ${{{var}}}\"")).into()])?;
        let out = out.strip_suffix('\n').unwrap_or(&out);
        Ok(out.strip_prefix(' ').unwrap_or(out).to_string())
    }

    /// Export an environment variable
    pub fn env_set(&self, var: &str, value: &str) -> Result<()> {
        check_var(var)?;
        let assignment = format!("export {}={}", var, self.shell.quote(value));
        self.exec0(&[Special::Raw(assignment).into()])?;
        Ok(())
    }

    pub fn env_unset(&self, var: &str) -> Result<()> {
        check_var(var)?;
        self.exec0(&crate::args!["unset", var])?;
        Ok(())
    }

    pub fn cd(&self, dir: &Path) -> Result<()> {
        self.exec0(&crate::args!["cd", dir])?;
        Ok(())
    }

    /// Start a command and interact with it through the returned proxy
    pub fn run(&self, args: &[Arg]) -> Result<RunCommandProxy> {
        let cmd = self.escape(args)?;
        RunCommandProxy::start(self.channel()?, self.name(), cmd)
    }

    /// Start a nested shell; `args` default to this shell's program.
    ///
    /// The nested shell is initialized like the outer one and left again
    /// when the returned [`Subshell`] is dropped.
    pub fn subshell(&self, args: &[Arg]) -> Result<Subshell> {
        let ch = self.channel()?;
        let cmd = if args.is_empty() {
            self.shell.program().to_string()
        } else {
            self.escape(args)?
        };
        ch.sendline(&cmd, true)?;
        self.shell.setup(&ch)?;
        Ok(Subshell {
            host: self.clone(),
            channel: ch,
            exited: false,
        })
    }

    /// Hand the shell to the user's terminal until they exit it
    pub fn interactive(&self) -> Result<()> {
        let ch = self.channel()?;
        let end_magic: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let program = self.shell.program();

        // outer shell: its prompt tells us the user left the inner one
        ch.sendline(program, false)?;
        ch.sendline(format!("PS1={}", mangle(&end_magic)), false)?;
        ch.read_until_prompt_with(&Pattern::from(end_magic.as_str()), Some(INIT_TIMEOUT))?;

        ch.sendline(program, false)?;
        ch.sendline(format!("PS1={}", self.shell.pretty_prompt(self.name())), false)?;
        info!("Entering interactive shell on {} (exit the shell to leave)", self.name());
        ch.attach_interactive(Some(&end_magic))?;

        ch.sendline("exit", false)?;
        ch.read_until_prompt(Some(READ_BACK_TIMEOUT))?;
        info!("Leaving interactive shell on {}", self.name());
        Ok(())
    }

    /// Run `args` as the last thing this shell does and take its channel.
    ///
    /// Used to turn a lab host shell into e.g. a board console.
    pub fn open_channel(&self, args: &[Arg]) -> Result<Channel> {
        let ch = self.channel()?;
        self.exec0(&crate::args!["stty", "-isig"])?;
        let cmd = format!("{}; exit", self.escape(args)?);
        ch.sendline(cmd, true)?;
        ch.take()
    }
}

fn check_var(var: &str) -> Result<()> {
    let mut chars = var.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TbotError::internal(format!("invalid variable name {var:?}")))
    }
}

/// A nested shell; leaving it returns to the outer shell
pub struct Subshell {
    host: LinuxHost,
    channel: Channel,
    exited: bool,
}

impl Subshell {
    pub fn exit(mut self) -> Result<()> {
        self.leave()
    }

    fn leave(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        self.channel.sendline("exit", true)?;
        self.channel.read_until_prompt(Some(READ_BACK_TIMEOUT))?;
        Ok(())
    }
}

impl Deref for Subshell {
    type Target = LinuxHost;

    fn deref(&self) -> &LinuxHost {
        &self.host
    }
}

impl Drop for Subshell {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            warn!("{}: failed to leave subshell: {}", self.host.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_var() {
        assert!(check_var("PATH").is_ok());
        assert!(check_var("_x1").is_ok());
        assert!(check_var("1x").is_err());
        assert!(check_var("A-B").is_err());
        assert!(check_var("").is_err());
        assert!(check_var("X;rm").is_err());
    }

    #[test]
    fn test_pretty_prompts_are_quoted() {
        assert!(Bash.pretty_prompt("lab").starts_with('\''));
        assert!(Ash.pretty_prompt("lab").contains("lab: "));
        assert_eq!(
            Ash.pretty_prompt("bob's board"),
            "'bob'\"'\"'s board: $PWD> '"
        );
        assert!(Bash.pretty_prompt("it's").contains("it'\"'\"'s: "));
    }
}
