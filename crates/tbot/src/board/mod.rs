//! Boards: a console plus power control
//!
//! A [`Board`] owns the console channel and powers the hardware on when
//! it is entered. Bootloader and Linux machines are layered on top with
//! [`BoardConnector`](crate::connector::BoardConnector) and
//! [`UBootBootConnector`](crate::connector::UBootBootConnector).

mod autoboot;
mod login;

pub use autoboot::UBootAutobootIntercept;
pub use login::LinuxBootLogin;

use std::rc::Rc;
use tbot_core::{Channel, Result, event};
use tracing::info;

use crate::machine::{InitContext, InitPhase, Initializer, Machine, MachineBuilder, MachineHandle};
use crate::shell::{Arg, LinuxHost, RawShell};

/// Switches a board's power
pub trait PowerSwitch {
    fn poweron(&self) -> Result<()>;

    fn poweroff(&self) -> Result<()>;
}

/// Power control from two closures
pub struct FnPower<On, Off> {
    on: On,
    off: Off,
}

impl<On, Off> FnPower<On, Off>
where
    On: Fn() -> Result<()>,
    Off: Fn() -> Result<()>,
{
    pub fn new(on: On, off: Off) -> Self {
        Self { on, off }
    }
}

impl<On, Off> PowerSwitch for FnPower<On, Off>
where
    On: Fn() -> Result<()>,
    Off: Fn() -> Result<()>,
{
    fn poweron(&self) -> Result<()> {
        (self.on)()
    }

    fn poweroff(&self) -> Result<()> {
        (self.off)()
    }
}

/// Power control by running commands on a lab host
pub struct ShellPower {
    lab: LinuxHost,
    on: Vec<Arg>,
    off: Vec<Arg>,
}

impl ShellPower {
    pub fn new(lab: LinuxHost, on: Vec<Arg>, off: Vec<Arg>) -> Self {
        Self { lab, on, off }
    }
}

impl PowerSwitch for ShellPower {
    fn poweron(&self) -> Result<()> {
        let _scope = self.lab.enter()?;
        self.lab.exec0(&self.on)?;
        Ok(())
    }

    fn poweroff(&self) -> Result<()> {
        let _scope = self.lab.enter()?;
        self.lab.exec0(&self.off)?;
        Ok(())
    }
}

/// Powers the board on after connecting and off on teardown
pub struct PowerControl {
    switch: Rc<dyn PowerSwitch>,
}

impl PowerControl {
    pub fn new(switch: Rc<dyn PowerSwitch>) -> Self {
        Self { switch }
    }
}

impl Initializer for PowerControl {
    fn phase(&self) -> InitPhase {
        InitPhase::Power
    }

    fn init(&self, cx: &mut InitContext<'_>) -> Result<()> {
        let name = cx.name().to_string();
        event::board_on(&name);
        self.switch.poweron()?;
        let switch = self.switch.clone();
        cx.stack.push(move || {
            event::board_off(&name);
            switch.poweroff()
        });
        Ok(())
    }
}

/// A board's console with power control
#[derive(Clone)]
pub struct Board {
    machine: Machine,
    power: Option<Rc<dyn PowerSwitch>>,
}

impl MachineHandle for Board {
    fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl Board {
    /// `builder` provides the console connector and any extra initializers
    pub fn new(builder: MachineBuilder, power: Option<Rc<dyn PowerSwitch>>) -> Self {
        let builder = match &power {
            Some(switch) => builder.initializer(PowerControl::new(switch.clone())),
            None => builder,
        };
        Self {
            machine: builder.build(Rc::new(RawShell)),
            power,
        }
    }

    pub fn channel(&self) -> Result<Channel> {
        self.machine.channel()
    }

    /// Power off, then on again, outside of the machine lifecycle
    pub fn power_cycle(&self) -> Result<()> {
        let Some(switch) = &self.power else {
            return Err(crate::abstract_method("Board", "power_cycle"));
        };
        info!("Power cycling {}", self.name());
        event::board_off(self.name());
        switch.poweroff()?;
        event::board_on(self.name());
        switch.poweron()
    }

    /// Attach the user's terminal to the console; CTRL+] leaves
    pub fn interactive(&self) -> Result<()> {
        info!("Entering console of {} (CTRL+] to leave)", self.name());
        self.channel()?.attach_interactive(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NullConnector;
    use std::cell::RefCell;

    #[test]
    fn test_power_follows_lifecycle() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (on, off) = (log.clone(), log.clone());
        let power: Rc<dyn PowerSwitch> = Rc::new(FnPower::new(
            move || {
                on.borrow_mut().push("on");
                Ok(())
            },
            move || {
                off.borrow_mut().push("off");
                Ok(())
            },
        ));
        let board = Board::new(MachineBuilder::new("board").connector(NullConnector), Some(power));

        let (_, events) = tbot_core::event::capture(|| {
            let outer = board.enter().unwrap();
            let inner = board.enter().unwrap();
            drop(inner);
            assert_eq!(*log.borrow(), ["on"]);
            drop(outer);
        });
        assert_eq!(*log.borrow(), ["on", "off"]);
        let kinds: Vec<String> = events.iter().map(|e| e.path()).collect();
        assert!(kinds.contains(&"board/on".to_string()));
        assert!(kinds.contains(&"board/off".to_string()));

        board.power_cycle().unwrap();
        assert_eq!(*log.borrow(), ["on", "off", "off", "on"]);
    }

    #[test]
    fn test_power_cycle_without_switch() {
        let board = Board::new(MachineBuilder::new("board"), None);
        assert!(matches!(
            board.power_cycle(),
            Err(tbot_core::TbotError::AbstractMethod { .. })
        ));
    }
}
