//! Lab hosts and their default build host

use std::rc::Rc;
use tbot_core::Result;

use crate::shell::LinuxHost;
use crate::shell::linux::BuildHostSource;

impl LinuxHost {
    /// Use the host returned by `factory` for builds started from this lab
    pub fn with_build_host(mut self, factory: impl Fn() -> Result<LinuxHost> + 'static) -> Self {
        Rc::make_mut(&mut self.extras).build_host = BuildHostSource::Factory(Rc::new(factory));
        self
    }

    /// Build on the lab host itself
    pub fn with_self_as_build_host(mut self) -> Self {
        Rc::make_mut(&mut self.extras).build_host = BuildHostSource::Itself;
        self
    }

    /// The build host configured for this lab
    pub fn build_host(&self) -> Result<LinuxHost> {
        match &self.extras.build_host {
            BuildHostSource::None => Err(crate::abstract_method("LabHost", "build_host")),
            BuildHostSource::Itself => Ok(self.clone()),
            BuildHostSource::Factory(factory) => factory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineHandle;
    use tbot_core::TbotError;

    #[test]
    fn test_build_host_sources() {
        let lab = LinuxHost::local("lab");
        assert!(matches!(
            lab.build_host(),
            Err(TbotError::AbstractMethod { method: "build_host", .. })
        ));

        let lab = lab.with_self_as_build_host();
        assert!(lab.build_host().unwrap() == lab);

        let lab = LinuxHost::local("lab").with_build_host(|| Ok(LinuxHost::local("builder")));
        assert_eq!(lab.build_host().unwrap().name(), "builder");
    }
}
