//! Connections that reuse a board's console

use tbot_core::{Channel, Result};

use super::close_on_teardown;
use crate::board::Board;
use crate::machine::{Connector, InitContext, MachineHandle};
use crate::shell::{Arg, UBootHost};

/// Uses the console of a [`Board`], keeping the board entered meanwhile.
///
/// A borrowed console goes back to the board when this machine is torn
/// down; a taken one is closed with it.
#[derive(Clone)]
pub struct BoardConnector {
    board: Board,
    take: bool,
}

impl BoardConnector {
    /// Borrow the console, e.g. for a bootloader
    pub fn borrow(board: Board) -> Self {
        Self { board, take: false }
    }

    /// Take the console for good, e.g. for a Linux booting without a bootloader
    pub fn take(board: Board) -> Self {
        Self { board, take: true }
    }
}

impl Connector for BoardConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        cx.stack.hold(self.board.enter()?);
        let console = self.board.channel()?;
        if self.take {
            let channel = console.take()?;
            close_on_teardown(cx, &channel);
            Ok(channel)
        } else {
            let lent = console.borrow()?;
            let channel = (*lent).clone();
            cx.stack.hold(lent);
            Ok(channel)
        }
    }
}

/// Boots Linux from U-Boot by running `command` and taking the console
#[derive(Clone)]
pub struct UBootBootConnector {
    uboot: UBootHost,
    command: Vec<Arg>,
}

impl UBootBootConnector {
    pub fn new(uboot: UBootHost, command: Vec<Arg>) -> Self {
        Self { uboot, command }
    }

    /// `run bootcmd`
    pub fn bootcmd(uboot: UBootHost) -> Self {
        Self::new(uboot, crate::args!["run", "bootcmd"])
    }
}

impl Connector for UBootBootConnector {
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel> {
        cx.stack.hold(self.uboot.enter()?);
        let channel = self.uboot.boot(&self.command)?;
        close_on_teardown(cx, &channel);
        Ok(channel)
    }
}
