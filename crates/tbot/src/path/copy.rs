//! Copying files between hosts

use tbot_core::config::SshSettings;
use tbot_core::{Result, TbotError};
use tracing::{debug, info};

use super::Path;
use crate::connector::lab::ssh_args;
use crate::machine::{Connection, MachineHandle, SshTarget};
use crate::shell::{Arg, LinuxHost};

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Skip the copy if both files exist with the same SHA-256
    pub hashcmp: bool,
    /// Share ssh connections through a ControlMaster socket in the workdir
    pub multiplexing: bool,
    /// Pass `-O` to scp for servers without SFTP
    pub legacy_scp: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            hashcmp: false,
            multiplexing: true,
            legacy_scp: false,
        }
    }
}

impl From<&SshSettings> for CopyOptions {
    fn from(ssh: &SshSettings) -> Self {
        Self {
            hashcmp: false,
            multiplexing: ssh.multiplexing,
            legacy_scp: ssh.legacy_scp,
        }
    }
}

enum Transfer {
    Cp {
        host: LinuxHost,
    },
    Scp {
        host: LinuxHost,
        target: SshTarget,
        /// true: remote file to local, false: local file to remote
        download: bool,
    },
}

impl Transfer {
    fn host(&self) -> &LinuxHost {
        match self {
            Transfer::Cp { host } | Transfer::Scp { host, .. } => host,
        }
    }
}

fn plan(src: &Path, dst: &Path) -> Result<Transfer> {
    let (sh, dh) = (src.host(), dst.host());
    if sh == dh {
        return Ok(Transfer::Cp { host: sh.clone() });
    }
    let transfer = match (sh.machine().connection(), dh.machine().connection()) {
        (Connection::Local, Connection::Local) => Transfer::Cp { host: sh.clone() },
        (Connection::Local, Connection::Ssh { target, via: None }) => Transfer::Scp {
            host: sh.clone(),
            target,
            download: false,
        },
        (Connection::Ssh { target, via: None }, Connection::Local) => Transfer::Scp {
            host: dh.clone(),
            target,
            download: true,
        },
        (Connection::Ssh { target, via: Some(lab) }, _) if lab == dh.machine().id() => {
            Transfer::Scp {
                host: dh.clone(),
                target,
                download: true,
            }
        }
        (_, Connection::Ssh { target, via: Some(lab) }) if lab == sh.machine().id() => {
            Transfer::Scp {
                host: sh.clone(),
                target,
                download: false,
            }
        }
        _ => {
            return Err(TbotError::not_implemented(format!(
                "copying from {} to {}",
                sh.name(),
                dh.name()
            )));
        }
    };
    Ok(transfer)
}

fn command(transfer: &Transfer, src: &Path, dst: &Path, opts: CopyOptions, multiplex: Option<&Path>) -> Vec<Arg> {
    match transfer {
        Transfer::Cp { .. } => {
            // between two local hosts both paths name the same filesystem
            crate::args!["cp", src.as_str(), dst.as_str()]
        }
        Transfer::Scp {
            target, download, ..
        } => {
            let mut args = ssh_args("scp", target, multiplex);
            if opts.legacy_scp {
                args.push("-O".into());
            }
            if *download {
                args.push(format!("{}:{}", target.destination(), src.as_str()).into());
                args.push(dst.as_str().into());
            } else {
                args.push(src.as_str().into());
                args.push(format!("{}:{}", target.destination(), dst.as_str()).into());
            }
            args
        }
    }
}

fn digest(p: &Path) -> Result<Option<String>> {
    let (retcode, out) = p.host().exec(&crate::args!["sha256sum", p])?;
    Ok((retcode == 0)
        .then(|| out.split_whitespace().next().map(str::to_string))
        .flatten())
}

/// Copy `src` to `dst`, which may live on different hosts
pub fn copy(src: &Path, dst: &Path) -> Result<()> {
    copy_with(src, dst, CopyOptions::default())
}

pub fn copy_with(src: &Path, dst: &Path, opts: CopyOptions) -> Result<()> {
    let transfer = plan(src, dst)?;
    if opts.hashcmp {
        if let (Some(a), Some(b)) = (digest(src)?, digest(dst)?) {
            if a == b {
                debug!("{:?} and {:?} are identical, not copying", src, dst);
                return Ok(());
            }
        }
    }

    let runner = transfer.host();
    let multiplex = match &transfer {
        Transfer::Scp { .. } if opts.multiplexing => {
            let dir = runner.workdir()?.join(".ssh-multi");
            dir.mkdir(true, true)?;
            Some(dir)
        }
        _ => None,
    };
    info!("Copying {:?} to {:?}", src, dst);
    runner.exec0(&command(&transfer, src, dst, opts, multiplex.as_ref()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{LabSshConnector, NullConnector};
    use crate::machine::MachineBuilder;
    use crate::shell::{Bash, quote};

    fn render(args: &[Arg]) -> String {
        args.iter()
            .filter_map(|a| match a {
                Arg::Str(s) => Some(quote(s)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_same_host_uses_cp() {
        let lh = LinuxHost::local("local");
        let (a, b) = (lh.path("/tmp/a"), lh.path("/tmp/b"));
        let t = plan(&a, &b).unwrap();
        assert!(matches!(t, Transfer::Cp { .. }));
        assert_eq!(render(&command(&t, &a, &b, CopyOptions::default(), None)), "cp /tmp/a /tmp/b");
    }

    #[test]
    fn test_options_follow_ssh_settings() {
        let ssh = SshSettings {
            multiplexing: false,
            legacy_scp: true,
            ..SshSettings::default()
        };
        let opts = CopyOptions::from(&ssh);
        assert!(!opts.multiplexing);
        assert!(opts.legacy_scp);
        assert!(!opts.hashcmp);
    }

    #[test]
    fn test_lab_to_ssh_host_uses_scp_on_lab() {
        let lab = LinuxHost::local("lab");
        let mut target = SshTarget::new("dut", "root");
        target.strict_host_key_checking = true;
        let dut = LinuxHost::new(
            MachineBuilder::new("dut").connector(LabSshConnector::new(lab.clone(), target)),
            Bash,
        );
        let (src, dst) = (lab.path("/srv/uImage"), dut.path("/boot/uImage"));
        let t = plan(&src, &dst).unwrap();
        assert!(t.host() == &lab);
        let opts = CopyOptions {
            legacy_scp: true,
            ..CopyOptions::default()
        };
        assert_eq!(
            render(&command(&t, &src, &dst, opts, None)),
            "scp -P 22 -o BatchMode=yes -O /srv/uImage root@dut:/boot/uImage"
        );

        let back = plan(&dst, &src).unwrap();
        assert!(back.host() == &lab);
        assert_eq!(
            render(&command(&back, &dst, &src, CopyOptions::default(), None)),
            "scp -P 22 -o BatchMode=yes root@dut:/boot/uImage /srv/uImage"
        );
    }

    #[test]
    fn test_unsupported_pair() {
        let a = LinuxHost::new(MachineBuilder::new("a").connector(NullConnector), Bash);
        let b = LinuxHost::local("b");
        let err = plan(&a.path("/x"), &b.path("/y")).err().unwrap();
        assert!(matches!(err, TbotError::NotImplemented { .. }));
    }
}
