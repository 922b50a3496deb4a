mod shared;

use anyhow::Result;
use tbot::builder::DistroToolchain;
use tbot::context::{BoardUBoot, BuildHost, LabHost, LocalHost, register_default_machines};
use tbot::{Context, ContextOptions, MachineHandle, RequestOptions, TbotError, args};

#[test]
fn test_default_machines_share_one_local_host() -> Result<()> {
    let ctx = Context::new();
    register_default_machines(&ctx)?;
    let lab = ctx.request::<LabHost>(RequestOptions::default())?;
    let local = ctx.request::<LocalHost>(RequestOptions::default())?;
    assert_eq!(lab.machine().id(), local.machine().id());
    assert_eq!(lab.exec0(&args!["echo", "lab"])?, "lab\n");

    let build = lab.build_host()?;
    assert_eq!(build.machine().id(), lab.machine().id());
    Ok(())
}

#[test]
fn test_strong_registration_replaces_default() -> Result<()> {
    let ctx = Context::new();
    register_default_machines(&ctx)?;
    ctx.register::<BuildHost>("builder", |_| {
        Ok(shared::bash("builder").with_toolchain(
            "arm64",
            DistroToolchain::new("arm64", "aarch64-linux-gnu-"),
        ))
    })?;
    assert!(matches!(
        ctx.register::<BuildHost>("again", |_| Ok(shared::bash("again"))),
        Err(TbotError::RoleConflict { .. })
    ));

    ctx.with::<BuildHost, _>(RequestOptions::default(), |bh| {
        assert_eq!(bh.name(), "builder");
        let cc = bh.enable("arm64")?;
        assert_eq!(cc.env("CROSS_COMPILE")?, "aarch64-linux-gnu-");
        assert_eq!(cc.env("ARCH")?, "arm64");
        cc.exit()?;
        assert_eq!(bh.env("CROSS_COMPILE")?, "");
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_reset_on_error_rebuilds_the_machine() -> Result<()> {
    let ctx = Context::with_options(ContextOptions {
        keep_alive: true,
        reset_on_error_by_default: true,
    });
    register_default_machines(&ctx)?;
    let _scope = ctx.enter();

    let first = ctx.with::<LabHost, _>(RequestOptions::default(), |lh| Ok(lh.machine().id()))?;
    let again = ctx.with::<LabHost, _>(RequestOptions::default(), |lh| Ok(lh.machine().id()))?;
    assert_eq!(first, again);

    let failed: tbot::Result<()> = ctx.with::<LabHost, _>(RequestOptions::default(), |lh| {
        lh.exec0(&args!["false"])?;
        Ok(())
    });
    assert!(failed.is_err());

    let fresh = ctx.with::<LabHost, _>(RequestOptions::default(), |lh| Ok(lh.machine().id()))?;
    assert_ne!(first, fresh);
    Ok(())
}

#[test]
fn test_exclusive_request() -> Result<()> {
    let ctx = Context::new();
    register_default_machines(&ctx)?;
    let lab = ctx.request::<LabHost>(RequestOptions {
        exclusive: true,
        ..RequestOptions::default()
    })?;
    assert!(matches!(
        ctx.request::<LocalHost>(RequestOptions::default()),
        Err(TbotError::Context { .. })
    ));
    drop(lab);
    assert!(ctx.request::<LocalHost>(RequestOptions::default()).is_ok());
    Ok(())
}

#[test]
fn test_uboot_role_with_mock_board() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (_board, ub) = shared::mock_uboot(tmp.path())?;
    let ctx = Context::new();
    ctx.register::<BoardUBoot>("mockhw", move |_| Ok(ub.clone()))?;

    let ub = ctx.request::<BoardUBoot>(RequestOptions::default())?;
    ub.env_set("bootcmd", "run distro_bootcmd")?;
    assert_eq!(ub.env("bootcmd")?, "run distro_bootcmd");
    Ok(())
}
