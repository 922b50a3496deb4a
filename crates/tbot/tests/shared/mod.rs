#![allow(dead_code)]

use anyhow::Result;
use std::path::Path as StdPath;
use tbot::board::{Board, UBootAutobootIntercept};
use tbot::connector::{BoardConnector, SubprocessConnector};
use tbot::shell::{Ash, UBootShell};
use tbot::{LinuxHost, MachineBuilder, UBootHost};
use tbot_transport::SubprocessOptions;

/// A local bash
pub fn bash(name: &str) -> LinuxHost {
    LinuxHost::local(name)
}

/// A local POSIX sh, set up like busybox ash
pub fn ash(name: &str) -> LinuxHost {
    LinuxHost::new(
        MachineBuilder::new(name).connector(SubprocessConnector::new(SubprocessOptions::command("sh"))),
        Ash,
    )
}

const MOCK_UBOOT_RC: &str = r#"set +o emacs
set +o vi
unset HISTFILE
PS2=''
version() {
    printf 'Mockhw U-Boot, running in the most fake environment you can imagine.\n\n'
    uname -a
}
setenv() {
    export "$1=$2"
}
echo "Autoboot: 3"
read -r -t 5 -n 1 _key
PS1='=> '
"#;

/// A board whose "console" is a bash pretending to be U-Boot, and the
/// U-Boot machine on top of it
pub fn mock_uboot(dir: &StdPath) -> Result<(Board, UBootHost)> {
    let rc = dir.join("mock-uboot.rc");
    std::fs::write(&rc, MOCK_UBOOT_RC)?;
    let options = SubprocessOptions::command("bash")
        .arg("--noprofile")
        .arg("--rcfile")
        .arg(rc.to_string_lossy())
        .arg("-i");
    let board = Board::new(
        MachineBuilder::new("mockhw").connector(SubprocessConnector::new(options)),
        None,
    );
    let uboot = UBootHost::new(
        MachineBuilder::new("mockhw-uboot")
            .connector(BoardConnector::borrow(board.clone()))
            .initializer(UBootAutobootIntercept::new()?.prompt("Autoboot: 3")),
        UBootShell::default(),
    );
    Ok((board, uboot))
}

/// Output of `uname -a` on this computer, as the mock prints it
pub fn local_uname() -> Result<String> {
    let out = std::process::Command::new("uname").arg("-a").output()?;
    Ok(String::from_utf8(out.stdout)?)
}
