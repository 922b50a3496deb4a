mod shared;

use anyhow::Result;
use std::time::Duration;
use tbot::path::workdir::Workdir;
use tbot::path::{CopyOptions, copy, copy_with};
use tbot_core::config::{WorkdirBase, WorkdirConfig};
use tbot::{LinuxHost, MachineHandle, Special, TbotError, args};

fn for_each_shell(f: impl Fn(&LinuxHost) -> Result<()>) -> Result<()> {
    for lh in [shared::bash("bash"), shared::ash("ash")] {
        let _scope = lh.enter()?;
        f(&lh)?;
    }
    Ok(())
}

#[test]
fn test_echo_and_printf() -> Result<()> {
    for_each_shell(|lh| {
        assert_eq!(lh.exec0(&args!["echo", "Hello World"])?, "Hello World\n");
        assert_eq!(lh.exec0(&args!["printf", "no newline"])?, "no newline");
        assert_eq!(lh.exec0(&args!["echo", "$?", "!#"])?, "$? !#\n");
        assert_eq!(
            lh.exec0(&args!["echo", "it's \"quoted\" `twice`"])?,
            "it's \"quoted\" `twice`\n"
        );
        Ok(())
    })
}

#[test]
fn test_exit_codes() -> Result<()> {
    for_each_shell(|lh| {
        for code in [0, 1, 2, 42, 127, 255] {
            let (retcode, _) = lh.exec(&args!["sh", "-c", format!("exit {code}")])?;
            assert_eq!(retcode, code);
        }
        assert!(lh.test(&args!["true"])?);
        assert!(!lh.test(&args!["false"])?);
        match lh.exec0(&args!["false"]) {
            Err(TbotError::CommandFailure { retcode, .. }) => assert_eq!(retcode, 1),
            other => panic!("expected a command failure, got {other:?}"),
        }
        Ok(())
    })
}

#[test]
fn test_specials() -> Result<()> {
    for_each_shell(|lh| {
        let out = lh.exec0(&args!["echo", "a b", Special::Pipe, "tr", " ", "-"])?;
        assert_eq!(out, "a-b\n");
        let out = lh.exec0(&args!["false", Special::OrElse, "echo", "recovered"])?;
        assert_eq!(out, "recovered\n");
        let out = lh.exec0(&args!["echo", "one", Special::Then, "echo", "two"])?;
        assert_eq!(out, "one\ntwo\n");
        Ok(())
    })
}

#[test]
fn test_env_round_trip() -> Result<()> {
    for_each_shell(|lh| {
        for value in ["plain", "with space", "-E", "it's $HOME `x`"] {
            lh.env_set("TBOT_TEST_VAR", value)?;
            assert_eq!(lh.env("TBOT_TEST_VAR")?, value);
        }
        lh.env_unset("TBOT_TEST_VAR")?;
        assert_eq!(lh.env("TBOT_TEST_VAR")?, "");
        Ok(())
    })
}

#[test]
fn test_run_cat_into_file() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    for_each_shell(|lh| {
        let f = lh.path(tmp.path().to_string_lossy()).join(&format!("cat-{}", lh.name()));
        let mut cat = lh.run(&args!["cat", Special::RedirStdout(f.clone())])?;
        cat.sendline("A")?;
        cat.sendline("B")?;
        cat.sendcontrol('D')?;
        cat.terminate0()?;
        assert_eq!(f.read_text()?, "A\nB\n");
        // the shell is usable again afterwards
        assert_eq!(lh.exec0(&args!["echo", "after"])?, "after\n");
        Ok(())
    })
}

#[test]
fn test_run_detects_early_exit() -> Result<()> {
    let lh = shared::bash("bash");
    let _scope = lh.enter()?;
    let mut proxy = lh.run(&args!["sh", "-c", "read line; exit 3"])?;
    proxy.sendline("go")?;
    let ended = loop {
        match proxy.read_some(64, Some(Duration::from_secs(5))) {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(ended, TbotError::CommandEnded));
    assert!(proxy.ended());
    assert_eq!(proxy.terminate()?.0, 3);
    Ok(())
}

#[test]
fn test_path_contents() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    for_each_shell(|lh| {
        let dir = lh.path(tmp.path().to_string_lossy()).join(lh.name());
        dir.mkdir(true, true)?;
        assert!(dir.is_dir()?);

        let bytes: Vec<u8> = (1..=255u8).cycle().take(1000).collect();
        let f = dir.join("blob.bin");
        f.write_bytes(&bytes)?;
        assert_eq!(f.read_bytes()?, bytes);
        assert_eq!(f.stat()?.size, 1000);

        let t = dir.join("text.txt");
        t.write_text("first line\nsecond line\n")?;
        assert_eq!(t.read_text()?, "first line\nsecond line\n");
        assert!(t.is_file()?);
        assert!(!t.is_dir()?);

        let link = dir.join("link");
        link.symlink_to("text.txt")?;
        assert!(link.is_symlink()?);
        assert_eq!(link.readlink()?.as_str(), "text.txt");
        let up = dir.join("up");
        up.symlink_to("../elsewhere/file")?;
        assert_eq!(up.readlink()?.as_str(), "../elsewhere/file");
        up.unlink(false)?;
        let abs = dir.join("abs");
        abs.symlink_to(t.as_str())?;
        assert_eq!(abs.readlink()?, t);
        abs.unlink(false)?;
        link.unlink(false)?;
        assert!(!link.exists()?);
        link.unlink(true)?;
        Ok(())
    })
}

#[test]
fn test_glob() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let lh = shared::bash("bash");
    let _scope = lh.enter()?;
    let dir = lh.path(tmp.path().to_string_lossy());
    for name in ["a.txt", "b.txt", "c.log", "with space.txt"] {
        dir.join(name).touch()?;
    }
    let mut names: Vec<String> = dir
        .glob("*.txt")?
        .iter()
        .map(|p| p.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["a.txt", "b.txt", "with space.txt"]);
    assert!(dir.glob("*.none")?.is_empty());
    assert_eq!(dir.rglob("*.log")?.len(), 1);
    Ok(())
}

#[test]
fn test_subshell_environment_is_scoped() -> Result<()> {
    for_each_shell(|lh| {
        let sub = lh.subshell(&[])?;
        sub.env_set("TBOT_INNER", "1")?;
        assert_eq!(sub.env("TBOT_INNER")?, "1");
        sub.exit()?;
        assert_eq!(lh.env("TBOT_INNER")?, "");
        Ok(())
    })
}

#[test]
fn test_paths_are_bound_to_their_host() -> Result<()> {
    let a = shared::bash("a");
    let b = shared::bash("b");
    let (_sa, _sb) = (a.enter()?, b.enter()?);
    let p = a.path("/tmp");
    assert!(a.test(&args!["test", "-d", &p])?);
    assert!(matches!(
        b.exec0(&args!["ls", &p]),
        Err(TbotError::WrongHost { .. })
    ));
    // a second connection is a different host, too
    let clone = a.clone_host()?;
    let _sc = clone.enter()?;
    assert!(matches!(
        clone.exec0(&args!["ls", &p]),
        Err(TbotError::WrongHost { .. })
    ));
    Ok(())
}

#[test]
fn test_copy_between_local_hosts() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let a = shared::bash("a");
    let b = shared::bash("b");
    let (_sa, _sb) = (a.enter()?, b.enter()?);
    let dir = tmp.path().to_string_lossy().to_string();
    let src = a.path(dir.as_str()).join("src.bin");
    let dst = b.path(dir.as_str()).join("dst.bin");
    src.write_text("payload\n")?;

    copy(&src, &dst)?;
    assert_eq!(dst.read_text()?, "payload\n");

    // identical content: nothing is copied, so the old mtime survives
    b.exec0(&args!["touch", "-d", "@1000000000", &dst])?;
    let hashcmp = CopyOptions {
        hashcmp: true,
        ..CopyOptions::default()
    };
    copy_with(&src, &dst, hashcmp)?;
    assert_eq!(dst.stat()?.mtime, 1_000_000_000);

    copy(&src, &dst)?;
    assert_ne!(dst.stat()?.mtime, 1_000_000_000);
    Ok(())
}

#[test]
fn test_workdir_from_config() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let home = tmp.path().to_string_lossy().to_string();
    for_each_shell(|lh| {
        lh.env_set("HOME", &home)?;
        lh.env_unset("XDG_RUNTIME_DIR")?;
        let config = WorkdirConfig {
            name: format!("wd-{}", lh.name()),
            base: WorkdirBase::Home,
        };
        let wd = Workdir::from_config(lh, &config)?;
        assert_eq!(wd.as_str(), format!("{home}/wd-{}", lh.name()));
        assert!(wd.is_dir()?);

        let config = WorkdirConfig {
            base: WorkdirBase::XdgRuntime,
            ..config
        };
        assert!(matches!(
            Workdir::from_config(lh, &config),
            Err(TbotError::Config { .. })
        ));
        Ok(())
    })
}

#[test]
fn test_exec0_with_input() -> Result<()> {
    for_each_shell(|lh| {
        let out = lh.exec0_with_input(&args!["wc", "-l"], b"one\ntwo\nthree\n")?;
        // the terminal echoes the typed lines before wc answers
        let lines: Vec<&str> = out.lines().map(str::trim).collect();
        assert_eq!(lines.first(), Some(&"one"));
        assert_eq!(lines.last(), Some(&"3"));

        let err = lh
            .exec0_with_input(&args!["grep", "-q", "absent"], b"present\n")
            .unwrap_err();
        assert!(matches!(err, TbotError::CommandFailure { retcode: 1, .. }));
        Ok(())
    })
}
