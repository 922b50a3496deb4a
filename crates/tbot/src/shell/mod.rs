//! Shells and command lines
//!
//! A [`Shell`] brings the far end of a freshly connected channel into a
//! known state. Command arguments are passed as [`Arg`]s and joined by
//! each host's `escape`, which quotes strings, checks that paths belong to
//! the host and renders [`Special`] tokens verbatim.

pub mod linux;
pub mod run;
pub mod uboot;
pub mod zephyr;

pub use linux::{Ash, Bash, LinuxHost, LinuxShell, PROMPT, Subshell};
pub use run::RunCommandProxy;
pub use uboot::{UBootHost, UBootShell};
pub use zephyr::{ZephyrHost, ZephyrShell};

use tbot_core::channel::READ_BACK_TIMEOUT;
use tbot_core::event::CommandLog;
use tbot_core::{Channel, Result, TbotError};

use crate::machine::{InitContext, Machine};
use crate::path::Path;

/// Brings a connected channel into a usable state
pub trait Shell {
    fn init_shell(&self, cx: &mut InitContext<'_>) -> Result<()>;
}

/// No shell at all, just the channel
#[derive(Debug, Clone, Copy, Default)]
pub struct RawShell;

impl Shell for RawShell {
    fn init_shell(&self, _cx: &mut InitContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Shell syntax that is passed through unquoted
#[derive(Debug, Clone, PartialEq)]
pub enum Special {
    /// Verbatim text
    Raw(String),
    /// `|`
    Pipe,
    /// `;`
    Then,
    /// `&`
    Background,
    /// `&&`
    AndThen,
    /// `||`
    OrElse,
    RedirStdout(Path),
    RedirStderr(Path),
    /// stdout and stderr into the same file
    RedirBoth(Path),
    AppendStdout(Path),
    AppendStderr(Path),
    /// A path whose `*` and `?` are left to the shell
    Glob(Path),
}

/// One argument of a command line
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Path(Path),
    Special(Special),
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<Path> for Arg {
    fn from(p: Path) -> Self {
        Arg::Path(p)
    }
}

impl From<&Path> for Arg {
    fn from(p: &Path) -> Self {
        Arg::Path(p.clone())
    }
}

impl From<Special> for Arg {
    fn from(s: Special) -> Self {
        Arg::Special(s)
    }
}

macro_rules! numeric_args {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(n: $t) -> Self {
                Arg::Str(n.to_string())
            }
        })*
    };
}

numeric_args!(i32, i64, u16, u32, u64, usize);

/// Build a `Vec<Arg>` from anything convertible into [`Arg`]
///
/// ```ignore
/// lh.exec0(&args!["ls", "-l", lh.workdir()?])?;
/// ```
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::shell::Arg::from($arg)),*]
    };
}

/// Quote a word for a POSIX shell, leaving safe words alone
pub fn quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    let safe = word
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\"'\"'"))
    }
}

/// Quote everything but the glob characters
pub(crate) fn quote_glob(pattern: &str) -> String {
    let mut out = String::new();
    let mut word = String::new();
    for c in pattern.chars() {
        if c == '*' || c == '?' {
            if !word.is_empty() {
                out.push_str(&quote(&word));
                word.clear();
            }
            out.push(c);
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        out.push_str(&quote(&word));
    }
    out
}

/// Join `args` into one command line for a POSIX-like shell on `host`
pub(crate) fn escape_posix(
    host: &Machine,
    args: &[Arg],
    quote: impl Fn(&str) -> String,
) -> Result<String> {
    let mut words = Vec::with_capacity(args.len());
    for arg in args {
        let word = match arg {
            Arg::Str(s) => quote(s),
            Arg::Path(p) => quote(p.checked_str(host)?),
            Arg::Special(special) => match special {
                Special::Raw(raw) => raw.clone(),
                Special::Pipe => "|".to_string(),
                Special::Then => ";".to_string(),
                Special::Background => "&".to_string(),
                Special::AndThen => "&&".to_string(),
                Special::OrElse => "||".to_string(),
                Special::RedirStdout(p) => format!(">{}", quote(p.checked_str(host)?)),
                Special::RedirStderr(p) => format!("2>{}", quote(p.checked_str(host)?)),
                Special::RedirBoth(p) => format!(">{} 2>&1", quote(p.checked_str(host)?)),
                Special::AppendStdout(p) => format!(">>{}", quote(p.checked_str(host)?)),
                Special::AppendStderr(p) => format!("2>>{}", quote(p.checked_str(host)?)),
                Special::Glob(p) => quote_glob(p.checked_str(host)?),
            },
        };
        words.push(word);
    }
    Ok(words.join(" "))
}

/// Send `cmd`, collect its prompt-framed output, then ask for `$?`
pub(crate) fn exec_framed(ch: &Channel, host: &str, cmd: &str) -> Result<(i32, String)> {
    ch.sendline(cmd, true)?;
    let output = {
        let (log, sink) = CommandLog::sink(host, cmd);
        let _stream = ch.with_stream(sink, false)?;
        let output = ch.read_until_prompt(None);
        log.borrow_mut().finish();
        output?
    };
    let retcode = query_retcode(ch, host)?;
    Ok((retcode, output))
}

pub(crate) fn query_retcode(ch: &Channel, host: &str) -> Result<i32> {
    ch.sendline("echo $?", true)?;
    let output = ch.read_until_prompt(Some(READ_BACK_TIMEOUT))?;
    output
        .trim()
        .parse()
        .map_err(|_| TbotError::InvalidRetcode {
            host: host.to_string(),
            output,
        })
}

pub(crate) fn check_retcode(host: &str, command: &str, (retcode, output): (i32, String)) -> Result<String> {
    if retcode == 0 {
        Ok(output)
    } else {
        Err(TbotError::CommandFailure {
            host: host.to_string(),
            command: command.to_string(),
            retcode,
            output,
        })
    }
}

/// Split a prompt so that the line assigning it never contains it verbatim
pub(crate) fn mangle(prompt: &str) -> String {
    let mid = prompt
        .char_indices()
        .map(|(i, _)| i)
        .nth(prompt.chars().count() / 2)
        .unwrap_or(0);
    let (head, tail) = prompt.split_at(mid);
    format!("'{}''{}'", head.replace('\'', "'\"'\"'"), tail.replace('\'', "'\"'\"'"))
}
