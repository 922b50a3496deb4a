//! # U-Boot test/py
//!
//! Runs U-Boot's `test/py` suite on the lab host against a board controlled
//! by tbot. test/py talks to the board through hook scripts; the hooks
//! found here forward everything through three FIFOs:
//!
//! * `fifo_console_send`: test/py's console input, written to the board
//! * `fifo_console_recv`: the board's console output, read by test/py
//! * `fifo_commands`: one command per line, `RESET` power-cycles the board
//!
//! tbot relays between those FIFOs and the board console while test/py
//! runs, so the board stays under tbot's control for the whole time.

use sha2::{Digest, Sha256};
use std::time::Duration;
use tbot_core::{Channel, Result, TbotError};
use tracing::{debug, info, warn};

use crate::board::Board;
use crate::machine::{MachineHandle, MachineScope};
use crate::path::Path;
use crate::shell::{Arg, LinuxHost, Special, quote};

pub const FIFO_CONSOLE_SEND: &str = "fifo_console_send";
pub const FIFO_CONSOLE_RECV: &str = "fifo_console_recv";
pub const FIFO_COMMANDS: &str = "fifo_commands";
pub const HASH_FILE: &str = "tbot-scripts.sha256";

const HOOKS_DIR: &str = "uboot-testpy-tbot";
const POLL: Duration = Duration::from_millis(10);
const CHUNK: usize = 4096;

const SELF_DIR: &str = r#"dir="$(dirname "$(readlink -f "$0")")""#;

fn hooks() -> [(&'static str, String); 5] {
    [
        (
            "tbot-console",
            format!(
                "#!/usr/bin/env bash\n\
                 {SELF_DIR}\n\
                 cat \"$dir/{FIFO_CONSOLE_RECV}\" &\n\
                 reader=$!\n\
                 trap 'kill $reader 2>/dev/null' EXIT\n\
                 cat >\"$dir/{FIFO_CONSOLE_SEND}\"\n"
            ),
        ),
        (
            "tbot-commands",
            format!("#!/usr/bin/env bash\n{SELF_DIR}\necho \"$*\" >\"$dir/{FIFO_COMMANDS}\"\n"),
        ),
        (
            "u-boot-test-console",
            format!("#!/usr/bin/env bash\n{SELF_DIR}\nexec \"$dir/tbot-console\"\n"),
        ),
        (
            "u-boot-test-reset",
            format!("#!/usr/bin/env bash\n{SELF_DIR}\nexec \"$dir/tbot-commands\" RESET\n"),
        ),
        (
            "u-boot-test-flash",
            // the board is flashed before test/py starts
            "#!/usr/bin/env bash\nexit 0\n".to_string(),
        ),
    ]
}

/// SHA-256 over the names and contents of every hook, hex encoded
pub fn hooks_digest() -> String {
    let mut hasher = Sha256::new();
    for (name, script) in hooks() {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(script.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// Install the hook scripts into `dir` on `host`.
///
/// Returns `false` without touching anything if the hooks there are
/// already current.
pub fn deploy_hooks(host: &LinuxHost, dir: &Path) -> Result<bool> {
    let digest = hooks_digest();
    let hash_file = dir.join(HASH_FILE);
    if hash_file.is_file()? && hash_file.read_text()?.trim() == digest {
        debug!("{}: test/py hooks in {} are current", host.name(), dir);
        return Ok(false);
    }

    info!("Deploying test/py hooks to {}", dir);
    dir.mkdir(true, true)?;
    for (name, script) in hooks() {
        let hook = dir.join(name);
        hook.write_text(&script)?;
        host.exec0(&crate::args!["chmod", "755", &hook])?;
    }
    hash_file.write_text(&format!("{digest}\n"))?;
    Ok(true)
}

/// How to invoke test/py
#[derive(Debug, Clone)]
pub struct TestpyOptions {
    /// U-Boot source tree on the lab host
    pub sources: Path,
    /// Build directory test/py looks for `u-boot` in; the sources if unset
    pub build_dir: Option<Path>,
    /// `--bd` argument
    pub board_type: String,
    /// Where the hooks go; the lab's workdir if unset
    pub hooks_dir: Option<Path>,
    /// Extra test/py arguments, e.g. `-k` filters
    pub args: Vec<String>,
}

/// A lab host shell dedicated to one FIFO
struct Pipe {
    channel: Channel,
    _scope: MachineScope,
}

impl Pipe {
    fn open(lab: &LinuxHost, script: String) -> Result<Self> {
        let host = lab.clone_host()?;
        let scope = host.enter()?;
        let channel = host.open_channel(&[Special::Raw(script).into()])?;
        Ok(Self {
            channel,
            _scope: scope,
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Err(e) = self.channel.close() {
            warn!("failed to close test/py relay: {}", e);
        }
    }
}

/// Whatever arrives within one poll interval
fn poll(ch: &Channel) -> Result<Vec<u8>> {
    match ch.read_some(CHUNK, Some(POLL)) {
        Err(e) if e.is_timeout() => Ok(Vec::new()),
        other => other,
    }
}

/// Split complete lines off `pending`
fn take_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(end) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=end).collect();
        lines.push(String::from_utf8_lossy(&line).trim().to_string());
    }
    lines
}

/// Run test/py on `lab` against the entered `board`.
///
/// Fails with [`TbotError::CommandFailure`] if any test failed.
pub fn run(lab: &LinuxHost, board: &Board, opts: &TestpyOptions) -> Result<()> {
    let sources = opts.sources.checked_str(lab.machine())?.to_string();
    let build_dir = match &opts.build_dir {
        Some(dir) => dir.checked_str(lab.machine())?.to_string(),
        None => sources.clone(),
    };
    let hooks = match &opts.hooks_dir {
        Some(dir) => dir.clone(),
        None => lab.workdir()?.join(HOOKS_DIR),
    };
    let hooks_str = hooks.checked_str(lab.machine())?.to_string();

    deploy_hooks(lab, &hooks)?;
    for name in [FIFO_CONSOLE_SEND, FIFO_CONSOLE_RECV, FIFO_COMMANDS] {
        let fifo = hooks.join(name);
        if !fifo.is_fifo()? {
            fifo.unlink(true)?;
            lab.exec0(&crate::args!["mkfifo", &fifo])?;
        }
    }

    let console = board.channel()?;
    let fifo = |name: &str| quote(&format!("{hooks_str}/{name}"));
    let to_board = Pipe::open(
        lab,
        format!(
            "stty raw -echo; while true; do cat {}; done",
            fifo(FIFO_CONSOLE_SEND)
        ),
    )?;
    let from_board = Pipe::open(
        lab,
        format!(
            "stty raw -echo; while true; do cat >{}; done",
            fifo(FIFO_CONSOLE_RECV)
        ),
    )?;
    let commands = Pipe::open(
        lab,
        format!(
            "stty raw -echo; while true; do cat {}; done",
            fifo(FIFO_COMMANDS)
        ),
    )?;

    let runner = lab.clone_host()?;
    let _runner_scope = runner.enter()?;
    let sub = runner.subshell(&[])?;
    sub.cd(&runner.path(sources.as_str()))?;
    let mut args: Vec<Arg> = vec![
        Special::Raw(format!("PATH={}:\"$PATH\"", quote(&hooks_str))).into(),
        "./test/py/test.py".into(),
        "--bd".into(),
        opts.board_type.as_str().into(),
        "--build-dir".into(),
        build_dir.as_str().into(),
    ];
    args.extend(opts.args.iter().map(Arg::from));

    info!("Running test/py for {} on {}", board.name(), lab.name());
    let mut testpy = sub.run(&args)?;
    let mut pending = Vec::new();
    loop {
        match testpy.read_some(CHUNK, Some(POLL)) {
            Ok(_) => {}
            Err(TbotError::CommandEnded) => break,
            Err(e) if e.is_timeout() => {}
            Err(e) => return Err(e),
        }

        let data = poll(&to_board.channel)?;
        if !data.is_empty() {
            console.send(&data, false)?;
        }
        let data = poll(&console)?;
        if !data.is_empty() {
            from_board.channel.send(&data, false)?;
        }

        pending.extend(poll(&commands.channel)?);
        for command in take_lines(&mut pending) {
            match command.as_str() {
                "RESET" => board.power_cycle()?,
                "" => {}
                other => warn!("unknown test/py hook command {:?}", other),
            }
        }
    }
    testpy.terminate0()?;
    Ok(())
}
