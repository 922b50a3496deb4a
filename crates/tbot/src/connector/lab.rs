//! Connections made from a lab host's shell

use tbot_core::{Channel, Result};

use super::close_on_teardown;
use crate::machine::{Connection, Connector, InitContext, MachineHandle, SshTarget};
use crate::path::Path;
use crate::shell::{Arg, LinuxHost, Special, quote};

/// `ssh`/`scp` invocation for `target`, without the destination.
///
/// With a multiplexing directory the connection is shared through a
/// ControlMaster socket kept there.
pub(crate) fn ssh_args(program: &str, target: &SshTarget, multiplex: Option<&Path>) -> Vec<Arg> {
    let mut args: Vec<Arg> = Vec::new();
    if let Some(password) = &target.password {
        args.push(Special::Raw(format!("SSHPASS={}", quote(password))).into());
        args.extend(crate::args!["sshpass", "-e"]);
    }
    args.push(program.into());
    let port_flag = if program == "scp" { "-P" } else { "-p" };
    args.extend(crate::args![port_flag, target.port]);
    if !target.strict_host_key_checking {
        args.extend(crate::args![
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
        ]);
    }
    if let Some(key) = &target.key {
        args.extend(crate::args!["-i", key]);
    }
    if target.password.is_none() {
        args.extend(crate::args!["-o", "BatchMode=yes"]);
    }
    if let Some(dir) = multiplex {
        args.extend(crate::args![
            "-o",
            "ControlMaster=auto",
            "-o",
            Special::Raw(format!("ControlPath={}/%C", quote(dir.as_str()))),
            "-o",
            "ControlPersist=10m",
        ]);
    }
    args
}

/// Runs `ssh` in a fresh shell on the lab host
#[derive(Clone)]
pub struct LabSshConnector {
    lab: LinuxHost,
    target: SshTarget,
}

impl LabSshConnector {
    pub fn new(lab: LinuxHost, target: SshTarget) -> Self {
        Self { lab, target }
    }
}

impl Connector for LabSshConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        let lab = self.lab.clone_host()?;
        cx.stack.hold(lab.enter()?);
        let mut args = ssh_args("ssh", &self.target, None);
        args.push(self.target.destination().into());
        let channel = lab.open_channel(&args)?;
        close_on_teardown(cx, &channel);
        Ok(channel)
    }

    fn clone_connector(&self) -> Option<Box<dyn Connector>> {
        Some(Box::new(self.clone()))
    }

    fn connection(&self) -> Connection {
        Connection::Ssh {
            target: self.target.clone(),
            via: Some(self.lab.machine().id()),
        }
    }
}

/// Runs a console program (`picocom`, `tio`, ...) in a fresh shell on the lab host
#[derive(Clone)]
pub struct ConsoleConnector {
    lab: LinuxHost,
    command: Vec<String>,
}

impl ConsoleConnector {
    pub fn new<I, S>(lab: LinuxHost, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lab,
            command: command.into_iter().map(Into::into).collect(),
        }
    }
}

impl Connector for ConsoleConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        let lab = self.lab.clone_host()?;
        cx.stack.hold(lab.enter()?);
        let args: Vec<Arg> = self.command.iter().map(Arg::from).collect();
        let channel = lab.open_channel(&args)?;
        close_on_teardown(cx, &channel);
        Ok(channel)
    }
}
