//! Lab shells turned into consoles, and test/py hook deployment

mod shared;

use anyhow::Result;
use std::time::Duration;
use tbot::board::Board;
use tbot::connector::ConsoleConnector;
use tbot::testpy::{self, HASH_FILE};
use tbot::{MachineBuilder, MachineHandle, TbotError, args};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

#[test]
fn test_open_channel_hands_over_the_shell() -> Result<()> {
    let lab = shared::bash("lab");
    let _scope = lab.enter()?;
    let ch = lab.open_channel(&args!["sh", "-c", "echo READY; cat"])?;
    ch.expect(&["READY".into()], TIMEOUT)?;

    ch.sendline("ping", false)?;
    let m = ch.expect(&["ping".into()], TIMEOUT)?;
    assert_eq!(m.index, 0);

    // the shell is gone for good
    assert!(matches!(
        lab.exec0(&args!["true"]),
        Err(TbotError::ChannelTaken)
    ));
    Ok(())
}

#[test]
fn test_console_connector_runs_on_a_lab_clone() -> Result<()> {
    let lab = shared::bash("lab");
    let _lab_scope = lab.enter()?;
    let board = Board::new(
        MachineBuilder::new("console-board").connector(ConsoleConnector::new(
            lab.clone(),
            ["sh", "-c", "echo CONSOLE-UP; cat"],
        )),
        None,
    );
    {
        let _board_scope = board.enter()?;
        let console = board.channel()?;
        console.expect(&["CONSOLE-UP".into()], TIMEOUT)?;
        console.sendline("hello board", false)?;
        console.expect(&["hello board".into()], TIMEOUT)?;
    }
    // the lab's own shell was never touched
    assert_eq!(lab.exec0(&args!["echo", "still here"])?, "still here\n");
    Ok(())
}

#[test]
fn test_hooks_are_deployed_once() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let lab = shared::bash("lab");
    let _scope = lab.enter()?;
    let dir = lab.path(tmp.path().to_string_lossy()).join("hooks");

    assert!(testpy::deploy_hooks(&lab, &dir)?);
    let reset = dir.join("u-boot-test-reset");
    assert!(lab.test(&args!["test", "-x", &reset])?);
    let hash = dir.join(HASH_FILE);
    assert_eq!(hash.read_text()?.trim(), testpy::hooks_digest());

    // matching digest: nothing is rewritten
    lab.exec0(&args!["touch", "-d", "@1000000000", &reset])?;
    assert!(!testpy::deploy_hooks(&lab, &dir)?);
    assert_eq!(reset.stat()?.mtime, 1_000_000_000);

    // stale digest: everything is written again
    hash.write_text("0000\n")?;
    assert!(testpy::deploy_hooks(&lab, &dir)?);
    assert_ne!(reset.stat()?.mtime, 1_000_000_000);
    assert_eq!(hash.read_text()?.trim(), testpy::hooks_digest());
    Ok(())
}
