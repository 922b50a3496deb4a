//! # Build hosts
//!
//! A [`LinuxHost`] doubles as a build host once it knows its toolchains.
//! [`LinuxHost::enable`] opens a subshell with one of them active, so the
//! environment changes vanish again when the subshell is dropped.

use std::rc::Rc;
use tbot_core::{Result, TbotError};
use tracing::debug;

use crate::machine::MachineHandle;
use crate::shell::{LinuxHost, Special, Subshell, quote};

/// A cross toolchain that can be switched on in a shell
pub trait Toolchain {
    /// Modify the environment of `host`'s current shell
    fn enable(&self, host: &LinuxHost) -> Result<()>;
}

/// A toolchain set up by sourcing a script, like the ones Yocto SDKs ship
pub struct EnvScriptToolchain {
    script: String,
}

impl EnvScriptToolchain {
    /// `script` is a path on the build host
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Toolchain for EnvScriptToolchain {
    fn enable(&self, host: &LinuxHost) -> Result<()> {
        // SDK scripts refuse to run with it set
        host.env_unset("LD_LIBRARY_PATH")?;
        host.exec0(&[Special::Raw(format!(". {}", quote(&self.script))).into()])?;
        Ok(())
    }
}

/// A toolchain installed from distro packages, e.g. `aarch64-linux-gnu-gcc`
pub struct DistroToolchain {
    arch: String,
    prefix: String,
}

impl DistroToolchain {
    /// `arch` is the kernel's name for the architecture, `prefix` the tool prefix
    pub fn new(arch: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            prefix: prefix.into(),
        }
    }
}

impl Toolchain for DistroToolchain {
    fn enable(&self, host: &LinuxHost) -> Result<()> {
        host.env_set("ARCH", &self.arch)?;
        host.env_set("CROSS_COMPILE", &self.prefix)?;
        for (var, tool) in [("CC", "gcc"), ("CXX", "g++"), ("LD", "ld"), ("AR", "ar")] {
            host.env_set(var, &format!("{}{}", self.prefix, tool))?;
        }
        Ok(())
    }
}

impl LinuxHost {
    /// Make `toolchain` available as `name`
    pub fn with_toolchain(mut self, name: impl Into<String>, toolchain: impl Toolchain + 'static) -> Self {
        Rc::make_mut(&mut self.extras)
            .toolchains
            .push((name.into(), Rc::new(toolchain)));
        self
    }

    pub fn toolchains(&self) -> Vec<String> {
        self.extras.toolchains.iter().map(|(n, _)| n.clone()).collect()
    }

    /// A subshell with the toolchain `name` enabled
    pub fn enable(&self, name: &str) -> Result<Subshell> {
        let toolchain = self
            .extras
            .toolchains
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| {
                TbotError::config(format!("{} has no toolchain named {name:?}", self.name()))
            })?;
        debug!("{}: enabling toolchain {}", self.name(), name);
        let sub = self.subshell(&[])?;
        toolchain.enable(&sub)?;
        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchains_are_registered_by_name() {
        let lh = LinuxHost::local("build")
            .with_toolchain("aarch64", DistroToolchain::new("arm64", "aarch64-linux-gnu-"))
            .with_toolchain("sdk", EnvScriptToolchain::new("/opt/sdk/environment-setup"));
        assert_eq!(lh.toolchains(), ["aarch64", "sdk"]);
    }

    #[test]
    fn test_unknown_toolchain() {
        let lh = LinuxHost::local("build");
        assert!(matches!(lh.enable("riscv"), Err(TbotError::Config { .. })));
    }
}
