//! Handle lifecycle core.
//!
//! Every resource the loop multiplexes lives in one `HandleSlot`: the
//! shared lifecycle state in `HandleCore` plus a kind-specific payload in
//! the `HandleData` variant. Slots are arena entries in the loop's handle
//! slab; the slab key doubles as the poller token. A fully closed handle
//! has its slot removed, so "slot missing" is the disposed state.

use std::os::unix::io::RawFd;

use crate::process::{ExitStatus, SpawnDescriptor};
use crate::request::RequestId;
use crate::tcp::Tcp;
use crate::Error;

/// Opaque handle identifier; index into the loop's handle slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);

/// Lifecycle state shared by all handle kinds.
///
/// `Closed` is transient: finalization removes the slot in the same step
/// that would store it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Active,
    Closing,
    Closed,
}

pub(crate) type CloseCallback = Box<dyn FnOnce()>;
pub(crate) type ConnectCallback = Box<dyn FnOnce(Result<(), Error>)>;
pub(crate) type AcceptCallback = Box<dyn FnMut(Tcp)>;
pub(crate) type ExitCallback = Box<dyn FnOnce(ExitStatus)>;

/// Shared lifecycle bookkeeping for one handle.
pub(crate) struct HandleCore {
    pub state: HandleState,
    /// Outstanding requests referencing this handle. Native release is
    /// deferred until this reaches zero.
    pub pending: usize,
    pub on_close: Option<CloseCallback>,
}

impl HandleCore {
    pub fn new() -> Self {
        Self {
            state: HandleState::Active,
            pending: 0,
            on_close: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == HandleState::Active
    }
}

/// One arena entry: lifecycle core plus the kind-specific payload.
pub(crate) struct HandleSlot {
    pub core: HandleCore,
    pub data: HandleData,
}

pub(crate) enum HandleData {
    Tcp(TcpData),
    Listener(ListenerData),
    Process(ProcessData),
}

impl HandleSlot {
    pub fn kind_name(&self) -> &'static str {
        match self.data {
            HandleData::Tcp(_) => "tcp",
            HandleData::Listener(_) => "tcp-listener",
            HandleData::Process(_) => "process",
        }
    }

    /// Whether this handle keeps `Loop::run` from returning.
    pub fn holds_loop_open(&self) -> bool {
        if self.core.pending > 0 || self.core.state == HandleState::Closing {
            return true;
        }
        match &self.data {
            HandleData::Tcp(t) => t.phase == TcpPhase::Connecting,
            HandleData::Listener(l) => l.listening,
            HandleData::Process(p) => p.running,
        }
    }
}

/// Connection phase of a stream socket, overlaid on the handle lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpPhase {
    Unbound,
    Connecting,
    Connected,
}

pub(crate) struct TcpData {
    /// Created lazily at connect time, once the address family is known.
    pub fd: Option<RawFd>,
    pub phase: TcpPhase,
    /// Request resolved by the next writability event, if a connect is
    /// in flight.
    pub connect_req: Option<RequestId>,
    pub registered: bool,
}

impl TcpData {
    pub fn unbound() -> Self {
        Self {
            fd: None,
            phase: TcpPhase::Unbound,
            connect_req: None,
            registered: false,
        }
    }

    pub fn connected(fd: RawFd) -> Self {
        Self {
            fd: Some(fd),
            phase: TcpPhase::Connected,
            connect_req: None,
            registered: false,
        }
    }
}

pub(crate) struct ListenerData {
    /// Created lazily at bind time, once the address family is known.
    pub fd: Option<RawFd>,
    pub listening: bool,
    pub registered: bool,
    pub on_accept: Option<AcceptCallback>,
    /// Accepted for API parity; inert on Unix.
    pub simultaneous_accepts: bool,
}

impl ListenerData {
    pub fn unbound() -> Self {
        Self {
            fd: None,
            listening: false,
            registered: false,
            on_accept: None,
            simultaneous_accepts: false,
        }
    }
}

pub(crate) struct ProcessData {
    pub pid: libc::pid_t,
    pub running: bool,
    /// Owned for the lifetime of the handle; dropped exactly when the
    /// exit notification is delivered.
    pub descriptor: Option<SpawnDescriptor>,
    pub on_exit: Option<ExitCallback>,
}
