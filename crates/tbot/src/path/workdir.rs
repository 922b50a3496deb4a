//! Per-host scratch directories

use tbot_core::config::{WorkdirBase, WorkdirConfig};
use tbot_core::{Result, TbotError};

use super::Path;
use crate::machine::MachineHandle;
use crate::shell::LinuxHost;

pub const DEFAULT_NAME: &str = "tbot-workdir";

/// Scratch directories, created on first use and remembered per machine instance
pub struct Workdir;

impl Workdir {
    /// `$XDG_RUNTIME_DIR/<name>`
    pub fn xdg_runtime(host: &LinuxHost, name: &str) -> Result<Path> {
        Self::below(host, "XDG_RUNTIME_DIR", name)
    }

    /// `$HOME/<name>`
    pub fn athome(host: &LinuxHost, name: &str) -> Result<Path> {
        Self::below(host, "HOME", name)
    }

    /// Placed as `config` says
    pub fn from_config(host: &LinuxHost, config: &WorkdirConfig) -> Result<Path> {
        match config.base {
            WorkdirBase::XdgRuntime => Self::xdg_runtime(host, &config.name),
            WorkdirBase::Home => Self::athome(host, &config.name),
        }
    }

    fn below(host: &LinuxHost, var: &str, name: &str) -> Result<Path> {
        // only the string is cached; a Path would keep its own machine alive
        let dir = host.machine().cached(&format!("workdir:{var}:{name}"), || {
            let base = host.env(var)?;
            if base.is_empty() {
                return Err(TbotError::config(format!(
                    "{var} is not set on {}, cannot place workdir {name}",
                    host.name()
                )));
            }
            let dir = host.path(base).join(name);
            dir.mkdir(true, true)?;
            Ok(dir.as_str().to_string())
        })?;
        Ok(host.path(dir.as_str()))
    }
}
