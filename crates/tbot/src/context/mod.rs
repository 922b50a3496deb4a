//! # Context
//!
//! The context is the only place testcases get machines from. Machines are
//! registered for [`Role`]s; [`Context::request`] builds an instance on
//! first use and hands out further references to it while it is alive.
//!
//! An instance is entered once, when it is created, and stays entered until
//! the last [`MachineRequest`] for it is gone. With `keep_alive` it survives
//! that too and is only torn down when the entered context is left, newest
//! instance first.
//!
//! ```no_run
//! use tbot::context::{Context, LabHost, RequestOptions, register_default_machines};
//!
//! let ctx = Context::new();
//! register_default_machines(&ctx)?;
//! let lab = ctx.request::<LabHost>(RequestOptions::default())?;
//! let uname = lab.exec0(&tbot::args!["uname", "-a"])?;
//! # Ok::<(), tbot::TbotError>(())
//! ```

pub mod role;

pub use role::{Board, BoardLinux, BoardUBoot, BuildHost, LabHost, LocalHost, Role, RoleKey};

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::{Rc, Weak};
use tbot_core::{Result, TbotError};
use tracing::{debug, warn};

use crate::machine::{Machine, MachineHandle, MachineScope};
use crate::shell::LinuxHost;

type Factory = Rc<dyn Fn(&Context) -> Result<(Box<dyn Any>, Machine)>>;

struct Registration {
    name: String,
    weak: bool,
    factory: Factory,
    instance: Option<Instance>,
}

struct Instance {
    // first, so the machine is torn down before the handle goes away
    scope: MachineScope,
    handle: Box<dyn Any>,
    refs: usize,
    exclusive: bool,
    poisoned: bool,
    serial: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions {
    /// Keep instances alive without references until the context is left
    pub keep_alive: bool,
    /// Whether requests reset their machine on error unless they say otherwise
    pub reset_on_error_by_default: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// No other request for the machine while this one lives
    pub exclusive: bool,
    /// Throw away a cached instance and build a fresh one
    pub reset: bool,
    /// Tear the instance down if the request ends with an error
    pub reset_on_error: Option<bool>,
}

struct Inner {
    roles: RefCell<HashMap<TypeId, usize>>,
    registrations: RefCell<Vec<Registration>>,
    keep_alive: Cell<bool>,
    reset_on_error_by_default: Cell<bool>,
    entered: Cell<usize>,
    serial: Cell<u64>,
}

/// Registry and cache of the machines of a test run
#[derive(Clone)]
pub struct Context {
    inner: Rc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn destroy(name: &str, instance: Instance) {
    if instance.refs > 0 {
        warn!("{}: destroying instance with {} live requests", name, instance.refs);
    }
    debug!("{}: destroying instance", name);
    drop(instance);
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            inner: Rc::new(Inner {
                roles: RefCell::new(HashMap::new()),
                registrations: RefCell::new(Vec::new()),
                keep_alive: Cell::new(options.keep_alive),
                reset_on_error_by_default: Cell::new(options.reset_on_error_by_default),
                entered: Cell::new(0),
                serial: Cell::new(0),
            }),
        }
    }

    pub fn keep_alive(&self) -> bool {
        self.inner.keep_alive.get()
    }

    pub fn reset_on_error_by_default(&self) -> bool {
        self.inner.reset_on_error_by_default.get()
    }

    pub fn set_reset_on_error_by_default(&self, reset: bool) {
        self.inner.reset_on_error_by_default.set(reset);
    }

    pub fn is_entered(&self) -> bool {
        self.inner.entered.get() > 0
    }

    /// Register `factory` for the role `R`.
    ///
    /// Replaces a weak registration; fails if `R` already has a strong one.
    pub fn register<R: Role>(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&Context) -> Result<R::Handle> + 'static,
    ) -> Result<()> {
        self.register_roles(name, &[RoleKey::of::<R>()], false, factory)
    }

    /// Register `factory` for `R` unless something else is or will be
    pub fn register_weak<R: Role>(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&Context) -> Result<R::Handle> + 'static,
    ) -> Result<()> {
        self.register_roles(name, &[RoleKey::of::<R>()], true, factory)
    }

    /// Register one machine for several roles; all of them share its instance
    pub fn register_roles<H: MachineHandle + Clone + 'static>(
        &self,
        name: impl Into<String>,
        roles: &[RoleKey<H>],
        weak: bool,
        factory: impl Fn(&Context) -> Result<H> + 'static,
    ) -> Result<()> {
        let name = name.into();
        let mut registrations = self.inner.registrations.borrow_mut();
        let mut map = self.inner.roles.borrow_mut();

        let mut targets = Vec::new();
        for role in roles {
            match map.get(&role.id).map(|&i| &registrations[i]) {
                None => targets.push(role),
                Some(_) if weak => {}
                Some(existing) if existing.weak => targets.push(role),
                Some(existing) => {
                    return Err(TbotError::RoleConflict {
                        role: role.name,
                        existing: existing.name.clone(),
                        name,
                    });
                }
            }
        }
        if targets.is_empty() {
            debug!("{}: every role is taken, ignoring weak registration", name);
            return Ok(());
        }

        debug!(
            "{}: registered for {}",
            name,
            targets.iter().map(|r| r.name).collect::<Vec<_>>().join(", ")
        );
        let factory: Factory = Rc::new(move |ctx| {
            let handle = factory(ctx)?;
            let machine = handle.machine().clone();
            Ok((Box::new(handle) as Box<dyn Any>, machine))
        });
        registrations.push(Registration {
            name,
            weak,
            factory,
            instance: None,
        });
        let index = registrations.len() - 1;
        for role in targets {
            map.insert(role.id, index);
        }
        Ok(())
    }

    fn index_of<R: Role>(&self) -> Result<usize> {
        self.inner
            .roles
            .borrow()
            .get(&TypeId::of::<R>())
            .copied()
            .ok_or_else(|| TbotError::context(format!("no machine registered for {}", R::NAME)))
    }

    /// Get the machine for role `R`, building it if there is no live instance
    pub fn request<R: Role>(&self, opts: RequestOptions) -> Result<MachineRequest<R>> {
        if self.keep_alive() && !self.is_entered() {
            return Err(TbotError::context("keep_alive needs an entered context"));
        }
        let index = self.index_of::<R>()?;

        let stale = {
            let mut registrations = self.inner.registrations.borrow_mut();
            let reg = &mut registrations[index];
            let state = reg.instance.as_ref().map(|i| (i.exclusive, i.refs));
            match state {
                Some((true, _)) => {
                    return Err(TbotError::context(format!(
                        "{} ({}) is held exclusively",
                        R::NAME,
                        reg.name
                    )));
                }
                Some((_, refs)) if refs > 0 && opts.reset => {
                    return Err(TbotError::context(format!(
                        "cannot reset {} ({}) while it is in use",
                        R::NAME,
                        reg.name
                    )));
                }
                Some((_, refs)) if refs > 0 && opts.exclusive => {
                    return Err(TbotError::context(format!(
                        "cannot get exclusive access to {} ({}) while it is in use",
                        R::NAME,
                        reg.name
                    )));
                }
                Some(_) if opts.reset => reg.instance.take().map(|i| (reg.name.clone(), i)),
                _ => None,
            }
        };
        if let Some((name, instance)) = stale {
            destroy(&name, instance);
        }

        let missing = self.inner.registrations.borrow()[index].instance.is_none();
        if missing {
            self.instantiate::<R>(index)?;
        }

        let mut registrations = self.inner.registrations.borrow_mut();
        let instance = registrations[index]
            .instance
            .as_mut()
            .ok_or_else(|| TbotError::internal(format!("{} vanished while requested", R::NAME)))?;
        let handle = instance
            .handle
            .downcast_ref::<R::Handle>()
            .cloned()
            .ok_or_else(|| TbotError::internal(format!("{} has a mismatched handle type", R::NAME)))?;
        instance.refs += 1;
        instance.exclusive = opts.exclusive;

        Ok(MachineRequest {
            ctx: Rc::downgrade(&self.inner),
            index,
            handle,
            exclusive: opts.exclusive,
            reset_on_error: opts
                .reset_on_error
                .unwrap_or_else(|| self.reset_on_error_by_default()),
            done: false,
            _role: PhantomData,
        })
    }

    fn instantiate<R: Role>(&self, index: usize) -> Result<()> {
        let (name, factory) = {
            let registrations = self.inner.registrations.borrow();
            let reg = &registrations[index];
            (reg.name.clone(), reg.factory.clone())
        };
        debug!("{}: creating instance for {}", name, R::NAME);
        // the factory may request other roles, so no borrow is held here
        let (handle, machine) = factory(self)?;
        let scope = machine.enter()?;
        let serial = self.inner.serial.get() + 1;
        self.inner.serial.set(serial);

        let instance = Instance {
            scope,
            handle,
            refs: 0,
            exclusive: false,
            poisoned: false,
            serial,
        };
        let mut registrations = self.inner.registrations.borrow_mut();
        let reg = &mut registrations[index];
        if reg.instance.is_some() {
            drop(registrations);
            destroy(&name, instance);
            return Err(TbotError::context(format!("{name} requested itself while being built")));
        }
        reg.instance = Some(instance);
        Ok(())
    }

    /// Run `f` with the machine for `R`; an `Err` from `f` counts as a failure
    pub fn with<R: Role, T>(
        &self,
        opts: RequestOptions,
        f: impl FnOnce(&R::Handle) -> Result<T>,
    ) -> Result<T> {
        let request = self.request::<R>(opts)?;
        let result = f(&request);
        request.finish(result.is_err());
        result
    }

    fn release(&self, index: usize, exclusive: bool, failed: bool) {
        let doomed = {
            let keep_alive = self.keep_alive();
            let mut registrations = self.inner.registrations.borrow_mut();
            let reg = &mut registrations[index];
            let Some(instance) = reg.instance.as_mut() else {
                return;
            };
            instance.refs = instance.refs.saturating_sub(1);
            if exclusive {
                instance.exclusive = false;
            }
            if failed {
                debug!("{}: request failed, resetting on release", reg.name);
                instance.poisoned = true;
            }
            if instance.refs == 0 && (instance.poisoned || !keep_alive) {
                reg.instance.take().map(|i| (reg.name.clone(), i))
            } else {
                None
            }
        };
        if let Some((name, instance)) = doomed {
            destroy(&name, instance);
        }
    }

    /// Take the newest instance matching `pick` out of the registry
    fn take_newest(&self, pick: impl Fn(&Instance) -> bool) -> Option<(String, Instance)> {
        let mut registrations = self.inner.registrations.borrow_mut();
        let reg = registrations
            .iter_mut()
            .filter(|r| r.instance.as_ref().is_some_and(&pick))
            .max_by_key(|r| r.instance.as_ref().map_or(0, |i| i.serial))?;
        let instance = reg.instance.take()?;
        Some((reg.name.clone(), instance))
    }

    fn collect_idle(&self) {
        while let Some((name, instance)) = self.take_newest(|i| i.refs == 0) {
            destroy(&name, instance);
        }
    }

    fn teardown(&self) {
        while let Some((name, instance)) = self.take_newest(|_| true) {
            destroy(&name, instance);
        }
    }

    /// Change `keep_alive` until the returned guard is dropped.
    ///
    /// Instances only kept by the change are destroyed when it is undone.
    pub fn reconfigure(&self, keep_alive: bool) -> Result<Reconfigure> {
        if keep_alive && !self.is_entered() {
            return Err(TbotError::context("keep_alive needs an entered context"));
        }
        let previous = self.inner.keep_alive.replace(keep_alive);
        Ok(Reconfigure {
            ctx: self.clone(),
            previous,
        })
    }

    /// Enter the context; leaving the outermost scope destroys every instance
    pub fn enter(&self) -> ContextScope {
        self.inner.entered.set(self.inner.entered.get() + 1);
        ContextScope { ctx: self.clone() }
    }

    /// Number of live instances
    pub fn live_instances(&self) -> usize {
        self.inner
            .registrations
            .borrow()
            .iter()
            .filter(|r| r.instance.is_some())
            .count()
    }
}

/// Weakly register a local bash for [`LabHost`], [`LocalHost`] and [`BuildHost`]
pub fn register_default_machines(ctx: &Context) -> Result<()> {
    ctx.register_roles(
        "local",
        &[
            RoleKey::of::<LabHost>(),
            RoleKey::of::<LocalHost>(),
            RoleKey::of::<BuildHost>(),
        ],
        true,
        |_| Ok(LinuxHost::local("local").with_self_as_build_host()),
    )
}

/// An entered context
pub struct ContextScope {
    ctx: Context,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let entered = self.ctx.inner.entered.get().saturating_sub(1);
        self.ctx.inner.entered.set(entered);
        if entered == 0 {
            self.ctx.teardown();
        }
    }
}

/// Restores `keep_alive` when dropped
pub struct Reconfigure {
    ctx: Context,
    previous: bool,
}

impl Drop for Reconfigure {
    fn drop(&mut self) {
        self.ctx.inner.keep_alive.set(self.previous);
        if !self.previous {
            self.ctx.collect_idle();
        }
    }
}

/// A reference to the live machine of a role.
///
/// Dropping it during a panic counts as a failure for `reset_on_error`;
/// use [`MachineRequest::finish`] to report errors otherwise.
pub struct MachineRequest<R: Role> {
    // weak, so machines holding requests for other roles form no cycle
    ctx: Weak<Inner>,
    index: usize,
    handle: R::Handle,
    exclusive: bool,
    reset_on_error: bool,
    done: bool,
    _role: PhantomData<R>,
}

impl<R: Role> MachineRequest<R> {
    pub fn handle(&self) -> &R::Handle {
        &self.handle
    }

    /// End the request, `failed` telling whether it ended with an error
    pub fn finish(mut self, failed: bool) {
        self.release(failed);
    }

    fn release(&mut self, failed: bool) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(inner) = self.ctx.upgrade() {
            Context { inner }.release(self.index, self.exclusive, failed && self.reset_on_error);
        }
    }
}

impl<R: Role> Deref for MachineRequest<R> {
    type Target = R::Handle;

    fn deref(&self) -> &R::Handle {
        &self.handle
    }
}

impl<R: Role> Drop for MachineRequest<R> {
    fn drop(&mut self) {
        self.release(std::thread::panicking());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{self, FnPower, PowerSwitch};
    use crate::machine::{MachineBuilder, MachineId};

    type Log = Rc<RefCell<Vec<String>>>;

    struct Other;

    impl Role for Other {
        type Handle = board::Board;
        const NAME: &'static str = "Other";
    }

    fn board(name: &'static str, log: &Log) -> board::Board {
        let (on, off) = (log.clone(), log.clone());
        let power: Rc<dyn PowerSwitch> = Rc::new(FnPower::new(
            move || {
                on.borrow_mut().push(format!("on {name}"));
                Ok(())
            },
            move || {
                off.borrow_mut().push(format!("off {name}"));
                Ok(())
            },
        ));
        board::Board::new(MachineBuilder::new(name), Some(power))
    }

    fn context(options: ContextOptions, log: &Log) -> Context {
        let ctx = Context::with_options(options);
        let l = log.clone();
        ctx.register::<Board>("board", move |_| Ok(board("board", &l)))
            .unwrap();
        ctx
    }

    fn id<R: Role>(req: &MachineRequest<R>) -> MachineId {
        req.machine().id()
    }

    #[test]
    fn test_nested_requests_share_one_instance() {
        let log = Log::default();
        let ctx = context(ContextOptions::default(), &log);
        let outer = ctx.request::<Board>(RequestOptions::default()).unwrap();
        let inner = ctx.request::<Board>(RequestOptions::default()).unwrap();
        assert_eq!(id(&outer), id(&inner));
        assert_eq!(outer.machine().refs(), 1);
        drop(inner);
        assert!(outer.machine().is_live());
        let machine = outer.machine().clone();
        drop(outer);
        assert!(!machine.is_live());
        assert_eq!(*log.borrow(), ["on board", "off board"]);
    }

    #[test]
    fn test_keep_alive_lasts_until_the_context_is_left() {
        let log = Log::default();
        let ctx = context(
            ContextOptions {
                keep_alive: true,
                ..ContextOptions::default()
            },
            &log,
        );
        assert!(matches!(
            ctx.request::<Board>(RequestOptions::default()),
            Err(TbotError::Context { .. })
        ));

        let scope = ctx.enter();
        let first = ctx.with::<Board, _>(RequestOptions::default(), |b| Ok(b.machine().id())).unwrap();
        assert_eq!(ctx.live_instances(), 1);
        let second = ctx.with::<Board, _>(RequestOptions::default(), |b| Ok(b.machine().id())).unwrap();
        assert_eq!(first, second);
        drop(scope);
        assert_eq!(ctx.live_instances(), 0);
        assert_eq!(*log.borrow(), ["on board", "off board"]);
    }

    #[test]
    fn test_reset_on_error_gives_a_fresh_instance() {
        let log = Log::default();
        let ctx = context(
            ContextOptions {
                keep_alive: true,
                reset_on_error_by_default: true,
            },
            &log,
        );
        let _scope = ctx.enter();
        let mut seen = None;
        let result: Result<()> = ctx.with::<Board, _>(RequestOptions::default(), |b| {
            seen = Some(b.machine().id());
            Err(TbotError::ChannelClosed)
        });
        assert!(result.is_err());
        assert_eq!(ctx.live_instances(), 0);

        let again = ctx.request::<Board>(RequestOptions::default()).unwrap();
        assert_ne!(Some(id(&again)), seen);
    }

    #[test]
    fn test_exclusive_and_reset() {
        let log = Log::default();
        let ctx = context(ContextOptions::default(), &log);
        let excl = ctx
            .request::<Board>(RequestOptions {
                exclusive: true,
                ..RequestOptions::default()
            })
            .unwrap();
        assert!(matches!(
            ctx.request::<Board>(RequestOptions::default()),
            Err(TbotError::Context { .. })
        ));
        let reset = RequestOptions {
            reset: true,
            ..RequestOptions::default()
        };
        assert!(ctx.request::<Board>(reset).is_err());
        let first = id(&excl);
        drop(excl);

        let kept = ctx.request::<Board>(RequestOptions::default()).unwrap();
        assert!(ctx.request::<Board>(reset).is_err());
        drop(kept);
        let fresh = ctx.request::<Board>(reset).unwrap();
        assert_ne!(id(&fresh), first);
    }

    #[test]
    fn test_registration_rules() {
        let log = Log::default();
        let ctx = context(ContextOptions::default(), &log);
        let l = log.clone();
        assert!(matches!(
            ctx.register::<Board>("second", move |_| Ok(board("second", &l))),
            Err(TbotError::RoleConflict { role: "Board", .. })
        ));
        let l = log.clone();
        ctx.register_weak::<Board>("weak", move |_| Ok(board("weak", &l)))
            .unwrap();
        assert_eq!(ctx.request::<Board>(RequestOptions::default()).unwrap().name(), "board");

        let l = log.clone();
        ctx.register_weak::<Other>("weak", move |_| Ok(board("weak", &l)))
            .unwrap();
        let l = log.clone();
        ctx.register::<Other>("strong", move |_| Ok(board("strong", &l)))
            .unwrap();
        assert_eq!(ctx.request::<Other>(RequestOptions::default()).unwrap().name(), "strong");

        assert!(matches!(
            ctx.request::<BoardLinux>(RequestOptions::default()),
            Err(TbotError::Context { .. })
        ));
    }

    #[test]
    fn test_teardown_runs_newest_first() {
        let log = Log::default();
        let ctx = context(ContextOptions::default(), &log);
        let l = log.clone();
        ctx.register::<Other>("other", move |ctx| {
            let board = ctx.request::<Board>(RequestOptions::default())?;
            let builder = MachineBuilder::new("other").hold(board);
            let (on, off) = (l.clone(), l.clone());
            let power: Rc<dyn PowerSwitch> = Rc::new(FnPower::new(
                move || {
                    on.borrow_mut().push("on other".into());
                    Ok(())
                },
                move || {
                    off.borrow_mut().push("off other".into());
                    Ok(())
                },
            ));
            Ok(board::Board::new(builder, Some(power)))
        })
        .unwrap();

        let scope = ctx.enter();
        let _reconf = ctx.reconfigure(true).unwrap();
        drop(ctx.request::<Other>(RequestOptions::default()).unwrap());
        assert_eq!(ctx.live_instances(), 2);
        drop(_reconf);
        drop(scope);
        assert_eq!(
            *log.borrow(),
            ["on board", "on other", "off other", "off board"]
        );
    }

    #[test]
    fn test_reconfigure_collects_idle_instances() {
        let log = Log::default();
        let ctx = context(ContextOptions::default(), &log);
        assert!(ctx.reconfigure(true).is_err());
        let _scope = ctx.enter();
        {
            let _keep = ctx.reconfigure(true).unwrap();
            drop(ctx.request::<Board>(RequestOptions::default()).unwrap());
            assert_eq!(ctx.live_instances(), 1);
        }
        assert_eq!(ctx.live_instances(), 0);
    }
}
