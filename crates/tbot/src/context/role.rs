//! Roles a machine can be registered for

use std::any::TypeId;
use std::marker::PhantomData;

use crate::board;
use crate::machine::MachineHandle;
use crate::shell::{LinuxHost, UBootHost};

/// A position in the lab setup, bound to a concrete machine by registration
pub trait Role: 'static {
    /// What requesting this role hands out
    type Handle: MachineHandle + Clone + 'static;

    const NAME: &'static str;
}

macro_rules! role {
    ($(#[$doc:meta])* $name:ident => $handle:ty) => {
        $(#[$doc])*
        pub struct $name;

        impl Role for $name {
            type Handle = $handle;
            const NAME: &'static str = stringify!($name);
        }
    };
}

role! {
    /// The host the test run is controlled from
    LocalHost => LinuxHost
}

role! {
    /// The host boards are attached to
    LabHost => LinuxHost
}

role! {
    /// The host software is built on
    BuildHost => LinuxHost
}

role! {
    /// The board's hardware: power and console
    Board => board::Board
}

role! {
    /// U-Boot running on the board
    BoardUBoot => UBootHost
}

role! {
    /// Linux running on the board
    BoardLinux => LinuxHost
}

/// A role whose handle is `H`, for registering one machine under several roles
pub struct RoleKey<H> {
    pub(crate) id: TypeId,
    pub(crate) name: &'static str,
    _handle: PhantomData<fn() -> H>,
}

impl<H> RoleKey<H> {
    pub fn of<R: Role<Handle = H>>() -> Self {
        Self {
            id: TypeId::of::<R>(),
            name: R::NAME,
            _handle: PhantomData,
        }
    }
}

impl<H> Clone for RoleKey<H> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name,
            _handle: PhantomData,
        }
    }
}
