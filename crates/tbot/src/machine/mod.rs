//! # Machines
//!
//! A machine is assembled from three parts:
//!
//! * a [`Connector`] that produces the [`Channel`],
//! * zero or more [`Initializer`]s, run in [`InitPhase`] order,
//! * a [`Shell`] that brings the far end into a known state.
//!
//! Entering a machine is reference counted. Only the first
//! [`Machine::enter`] connects and initializes; only dropping the last
//! [`MachineScope`] tears everything down again, in reverse order.

pub mod stack;

pub use stack::ExitStack;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tbot_core::event::ChannelLog;
use tbot_core::{Channel, Result, TbotError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::shell::Shell;

/// Unique identity of a machine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineId(Uuid);

impl MachineId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a machine can be reached from the outside, used to pick a copy strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// A process on this host
    Local,
    /// An SSH server, reachable from `via` (a lab host) or from this host if `None`
    Ssh {
        target: SshTarget,
        via: Option<MachineId>,
    },
    /// Anything without file transfer support (consoles, serial, ...)
    Other,
}

/// Where and how to reach an SSH server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub key: Option<String>,
    pub password: Option<String>,
    pub strict_host_key_checking: bool,
}

impl SshTarget {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            key: None,
            password: None,
            strict_host_key_checking: false,
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// Phase an [`Initializer`] runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitPhase {
    /// Before the connector is entered; no channel yet
    PreConnect,
    Power,
    PostConnect,
    AutobootIntercept,
    Login,
    /// After the shell was initialized
    PostShell,
}

/// State handed to connectors and initializers while a machine comes up
pub struct InitContext<'a> {
    name: &'a str,
    channel: Option<&'a Channel>,
    /// Teardown actions registered here run when the machine goes down
    pub stack: &'a mut ExitStack,
}

impl InitContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// The machine's channel; not available during [`InitPhase::PreConnect`]
    pub fn channel(&self) -> Result<&Channel> {
        self.channel.ok_or_else(|| {
            TbotError::internal(format!("{}: no channel before connecting", self.name))
        })
    }
}

/// Produces the channel of a machine
pub trait Connector {
    /// Open the channel. Anything that must be undone when the machine goes
    /// down is pushed onto `cx.stack`, including closing the channel itself.
    fn connect(&self, cx: &mut InitContext<'_>) -> Result<Channel>;

    /// A connector for an independent second connection, if possible
    fn clone_connector(&self) -> Option<Box<dyn Connector>> {
        None
    }

    fn connection(&self) -> Connection {
        Connection::Other
    }
}

/// A step between connecting and handing the shell to the user
pub trait Initializer {
    fn phase(&self) -> InitPhase;

    fn init(&self, cx: &mut InitContext<'_>) -> Result<()>;
}

struct Live {
    channel: Channel,
    stack: ExitStack,
}

struct MachineInner {
    id: MachineId,
    name: String,
    connector: Box<dyn Connector>,
    initializers: Vec<Rc<dyn Initializer>>,
    shell: Rc<dyn Shell>,
    refs: Cell<usize>,
    live: RefCell<Option<Live>>,
    cache: RefCell<HashMap<String, Rc<dyn Any>>>,
    // last, so held values outlive everything above
    held: RefCell<Vec<Box<dyn Any>>>,
}

impl Drop for MachineInner {
    fn drop(&mut self) {
        if let Some(mut live) = self.live.get_mut().take() {
            warn!("{}: machine dropped while entered, tearing down", self.name);
            for e in live.stack.unwind() {
                warn!("{}: error during teardown: {}", self.name, e);
            }
        }
    }
}

/// A reference to a machine instance; clones share the instance
#[derive(Clone)]
pub struct Machine {
    inner: Rc<MachineInner>,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("refs", &self.inner.refs.get())
            .finish()
    }
}

impl PartialEq for Machine {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Machine {}

impl Machine {
    pub fn builder(name: impl Into<String>) -> MachineBuilder {
        MachineBuilder::new(name)
    }

    pub fn id(&self) -> MachineId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connection(&self) -> Connection {
        self.inner.connector.connection()
    }

    /// Number of active [`MachineScope`]s
    pub fn refs(&self) -> usize {
        self.inner.refs.get()
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.borrow().is_some()
    }

    /// The channel of an entered machine
    pub fn channel(&self) -> Result<Channel> {
        self.inner
            .live
            .borrow()
            .as_ref()
            .map(|l| l.channel.clone())
            .ok_or_else(|| TbotError::context(format!("machine {} is not entered", self.name())))
    }

    /// Connect and initialize on first entry, count otherwise
    pub fn enter(&self) -> Result<MachineScope> {
        self.acquire()?;
        Ok(MachineScope {
            machine: self.clone(),
        })
    }

    fn acquire(&self) -> Result<()> {
        let refs = self.inner.refs.get();
        if refs > 0 {
            self.inner.refs.set(refs + 1);
            return Ok(());
        }

        debug!("{}: connecting", self.name());
        let mut stack = ExitStack::new();
        match self.bring_up(&mut stack) {
            Ok(channel) => {
                *self.inner.live.borrow_mut() = Some(Live { channel, stack });
                self.inner.refs.set(1);
                Ok(())
            }
            Err(e) => {
                for te in stack.unwind() {
                    warn!("{}: error during teardown: {}", self.name(), te);
                }
                Err(e)
            }
        }
    }

    fn bring_up(&self, stack: &mut ExitStack) -> Result<Channel> {
        let inner = &self.inner;
        let mut initializers = inner.initializers.clone();
        initializers.sort_by_key(|i| i.phase());
        let (pre, post): (Vec<_>, Vec<_>) = initializers
            .into_iter()
            .partition(|i| i.phase() == InitPhase::PreConnect);
        let (post_shell, machine): (Vec<_>, Vec<_>) = post
            .into_iter()
            .partition(|i| i.phase() == InitPhase::PostShell);

        for init in &pre {
            init.init(&mut InitContext {
                name: &inner.name,
                channel: None,
                stack,
            })?;
        }

        let channel = inner.connector.connect(&mut InitContext {
            name: &inner.name,
            channel: None,
            stack,
        })?;
        channel.set_name(inner.name.clone());
        stack.hold(channel.with_stream(ChannelLog::sink(), true)?);

        let mut cx = InitContext {
            name: &inner.name,
            channel: Some(&channel),
            stack,
        };
        for init in &machine {
            init.init(&mut cx)?;
        }
        inner.shell.init_shell(&mut cx)?;
        for init in &post_shell {
            init.init(&mut cx)?;
        }
        Ok(channel)
    }

    fn release(&self) {
        let refs = self.inner.refs.get();
        if refs == 0 {
            return;
        }
        self.inner.refs.set(refs - 1);
        if refs > 1 {
            return;
        }

        debug!("{}: tearing down", self.name());
        let live = self.inner.live.borrow_mut().take();
        if let Some(mut live) = live {
            for e in live.stack.unwind() {
                warn!("{}: error during teardown: {}", self.name(), e);
            }
            drop(live.channel);
        }
        // memoized values (workdirs) belong to the session that produced them
        self.inner.cache.borrow_mut().clear();
    }

    /// A fresh, independent machine built from the same parts.
    ///
    /// Only possible when the connector can be cloned.
    pub fn clone_machine(&self) -> Result<Machine> {
        let connector = self.inner.connector.clone_connector().ok_or_else(|| {
            TbotError::not_implemented(format!("cloning machine {}", self.name()))
        })?;
        Ok(Machine::from_parts(
            self.inner.name.clone(),
            connector,
            self.inner.initializers.clone(),
            self.inner.shell.clone(),
            Vec::new(),
        ))
    }

    /// Per-instance memo, e.g. for workdirs
    pub fn cached<T: 'static>(&self, key: &str, make: impl FnOnce() -> Result<T>) -> Result<Rc<T>> {
        if let Some(value) = self.inner.cache.borrow().get(key) {
            if let Ok(value) = Rc::clone(value).downcast::<T>() {
                return Ok(value);
            }
        }
        let value = Rc::new(make()?);
        self.inner
            .cache
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    fn from_parts(
        name: String,
        connector: Box<dyn Connector>,
        initializers: Vec<Rc<dyn Initializer>>,
        shell: Rc<dyn Shell>,
        held: Vec<Box<dyn Any>>,
    ) -> Self {
        Self {
            inner: Rc::new(MachineInner {
                id: MachineId::new(),
                name,
                connector,
                initializers,
                shell,
                refs: Cell::new(0),
                live: RefCell::new(None),
                cache: RefCell::new(HashMap::new()),
                held: RefCell::new(held),
            }),
        }
    }

    /// Keep `value` alive as long as this machine instance exists
    pub fn hold<T: 'static>(&self, value: T) {
        self.inner.held.borrow_mut().push(Box::new(value));
    }
}

/// Keeps a machine entered; dropping the last scope tears it down
pub struct MachineScope {
    machine: Machine,
}

impl MachineScope {
    pub fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl Drop for MachineScope {
    fn drop(&mut self) {
        self.machine.release();
    }
}

/// Collects the parts of a machine
pub struct MachineBuilder {
    name: String,
    connector: Option<Box<dyn Connector>>,
    initializers: Vec<Rc<dyn Initializer>>,
    held: Vec<Box<dyn Any>>,
}

impl MachineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connector: None,
            initializers: Vec::new(),
            held: Vec::new(),
        }
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn initializer(mut self, initializer: impl Initializer + 'static) -> Self {
        self.initializers.push(Rc::new(initializer));
        self
    }

    /// Keep `value` (e.g. a request for another machine) alive with the machine
    pub fn hold<T: 'static>(mut self, value: T) -> Self {
        self.held.push(Box::new(value));
        self
    }

    /// Finish with `shell`; without a connector the machine gets a null channel
    pub fn build(self, shell: Rc<dyn Shell>) -> Machine {
        let connector = self
            .connector
            .unwrap_or_else(|| Box::new(crate::connector::NullConnector));
        Machine::from_parts(self.name, connector, self.initializers, shell, self.held)
    }
}

/// Anything that wraps a [`Machine`]
pub trait MachineHandle {
    fn machine(&self) -> &Machine;

    fn enter(&self) -> Result<MachineScope> {
        self.machine().enter()
    }

    fn name(&self) -> &str {
        self.machine().name()
    }
}

impl MachineHandle for Machine {
    fn machine(&self) -> &Machine {
        self
    }
}
