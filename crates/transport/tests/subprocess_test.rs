//! Local PTY backend driven through the channel engine

mod shared;

use anyhow::Result;
use shared::TIMEOUT;
use std::time::Duration;
use tbot_core::TbotError;

#[test]
fn test_command_output_framed_by_prompt() -> Result<()> {
    let ch = shared::local_bash()?;
    ch.sendline("echo hello-$((1+2))", true)?;
    assert_eq!(ch.read_until_prompt(TIMEOUT)?, "hello-3\n");

    ch.sendline("printf 'a\\nb\\n'", true)?;
    assert_eq!(ch.read_until_prompt(TIMEOUT)?, "a\nb\n");
    Ok(())
}

#[test]
fn test_one_byte_reads() -> Result<()> {
    let ch = shared::local_bash()?;
    ch.set_read_chunk(1)?;
    ch.sendline("echo Hello World", true)?;
    assert_eq!(ch.read_until_prompt(TIMEOUT)?, "Hello World\n");
    Ok(())
}

#[test]
fn test_read_until_close_after_exit() -> Result<()> {
    let ch = shared::spawn("sh", &["-c", "printf abc"])?;
    let out = ch.read_until_close(TIMEOUT)?;
    assert_eq!(out, b"abc");
    assert!(matches!(
        ch.read_some(1, Some(Duration::from_millis(100))),
        Err(TbotError::ChannelClosed)
    ));
    Ok(())
}

#[test]
fn test_resize_is_visible_to_the_process() -> Result<()> {
    let ch = shared::local_bash()?;
    ch.update_pty(100, 40)?;
    ch.sendline("stty size", true)?;
    assert_eq!(ch.read_until_prompt(TIMEOUT)?, "40 100\n");
    Ok(())
}

#[test]
fn test_close_kills_running_process() -> Result<()> {
    let ch = shared::spawn("sleep", &["100"])?;
    ch.close()?;
    assert!(ch.is_closed());
    assert!(matches!(ch.send("x", false), Err(TbotError::ChannelClosed)));
    Ok(())
}

#[test]
fn test_timeout_when_nothing_arrives() -> Result<()> {
    let ch = shared::local_bash()?;
    let err = ch
        .read(1, Some(Duration::from_millis(200)))
        .expect_err("bash printed something unexpected");
    assert!(err.is_timeout());
    Ok(())
}
