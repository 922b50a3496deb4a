//! `~/.ssh/config` lookup from a file on disk

use anyhow::Result;
use std::path::PathBuf;
use tbot_core::TbotError;
use tbot_transport::SshConfig;

const CONFIG: &str = "\
# lab network
User nobody

Host dut-* !dut-broken
    HostName %h.lab.example
    Port 2222
    IdentityFile /keys/lab_ed25519
    StrictHostKeyChecking no

Host *
    User root
    IdentityFile /keys/fallback
";

#[test]
fn test_load_and_lookup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config");
    std::fs::write(&path, CONFIG)?;

    let config = SshConfig::load(&path)?;
    let dut = config.lookup("dut-7");
    assert_eq!(dut.hostname.as_deref(), Some("dut-7.lab.example"));
    assert_eq!(dut.port, Some(2222));
    // options before the first Host line come first
    assert_eq!(dut.user.as_deref(), Some("nobody"));
    assert_eq!(dut.strict_host_key_checking, Some(false));
    assert_eq!(
        dut.identity_files,
        [
            PathBuf::from("/keys/lab_ed25519"),
            PathBuf::from("/keys/fallback")
        ]
    );

    let broken = config.lookup("dut-broken");
    assert_eq!(broken.hostname, None);
    assert_eq!(broken.port, None);
    assert_eq!(broken.identity_files, [PathBuf::from("/keys/fallback")]);
    Ok(())
}

#[test]
fn test_missing_file_is_an_io_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let err = SshConfig::load(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, TbotError::Io(_)));
    Ok(())
}
