//! The reactor: readiness polling, registries, callback dispatch.
//!
//! `Loop` wraps `LoopInner` in `Rc<RefCell<..>>`. The discipline that makes
//! the single-threaded model safe is that no borrow of `LoopInner` is ever
//! held while a user callback runs: the poll step and the handle methods
//! only push `Completion` items onto the ready queue, and `drain_ready`
//! pops one item at a time with the borrow released before invoking it.
//! User callbacks may therefore issue new operations freely.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::addr::SockAddr;
use crate::handle::{
    CloseCallback, ConnectCallback, ExitCallback, HandleData, HandleId, HandleSlot, HandleState,
    TcpPhase,
};
use crate::process::ExitStatus;
use crate::request::{PendingRequest, RequestId, RequestKind};
use crate::tcp::Tcp;
use crate::{sys, Error};

/// How often the poll step wakes to reap child processes.
const PROCESS_SWEEP_INTERVAL: Duration = Duration::from_millis(20);

const EVENT_CAPACITY: usize = 256;

/// Work queued by the poll step and handle methods, dispatched with no
/// borrow of `LoopInner` held.
pub(crate) enum Completion {
    /// A request resolved; invoke its callback with the outcome.
    Invoke {
        callback: ConnectCallback,
        result: Result<(), Error>,
    },
    /// A listener drained its backlog; wrap each fd in a Tcp handle and
    /// yield it to the accept callback.
    Accept {
        handle: HandleId,
        accepted: Vec<(RawFd, SockAddr)>,
    },
    /// A child process was reaped; notify, then the handle closes itself.
    Exit {
        handle: HandleId,
        callback: Option<ExitCallback>,
        status: ExitStatus,
    },
    /// A handle finished releasing its native resource.
    CloseDone { callback: CloseCallback },
}

pub(crate) struct LoopInner {
    poll: Poll,
    events: Events,
    handles: Slab<HandleSlot>,
    requests: Slab<PendingRequest>,
    /// Handles mid-close, finalized once their cancellation completions
    /// have dispatched.
    closing: Vec<HandleId>,
    ready: VecDeque<Completion>,
    running: bool,
}

/// The single-threaded reactor. Owns every handle registered against it;
/// dropped, it cancels outstanding requests and closes surviving handles.
pub struct Loop {
    inner: Rc<RefCell<LoopInner>>,
}

impl Loop {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::LoopInit)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(LoopInner {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                handles: Slab::new(),
                requests: Slab::new(),
                closing: Vec::new(),
                ready: VecDeque::new(),
                running: false,
            })),
        })
    }

    pub(crate) fn shared(&self) -> Rc<RefCell<LoopInner>> {
        self.inner.clone()
    }

    /// Drives the reactor until no handle keeps it alive: no pending
    /// request, no listening listener, no running process, no handle
    /// mid-close. Re-entrant calls from a callback fail with `LoopBusy`.
    pub fn run(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.running {
                return Err(Error::LoopBusy);
            }
            inner.running = true;
        }
        debug!("loop running");
        let result = self.turn_until_drained();
        self.inner.borrow_mut().running = false;
        debug!(ok = result.is_ok(), "loop stopped");
        result
    }

    fn turn_until_drained(&self) -> Result<(), Error> {
        loop {
            drain_ready(&self.inner);
            let (live, timeout) = {
                let inner = self.inner.borrow();
                (inner.has_live_work(), inner.poll_timeout())
            };
            if !live {
                return Ok(());
            }
            let mut inner = self.inner.borrow_mut();
            inner.poll_once(timeout)?;
            inner.sweep_processes();
        }
    }

    /// Forces every pending request to complete with `Cancelled` and
    /// closes every surviving handle. Close callbacks still fire.
    pub fn shutdown(&self) {
        debug!("loop shutdown");
        {
            let mut inner = self.inner.borrow_mut();
            let tokens: Vec<usize> = inner.requests.iter().map(|(k, _)| k).collect();
            for k in tokens {
                inner.complete_request(RequestId(k), Err(Error::Cancelled));
            }
            let ids: Vec<usize> = inner.handles.iter().map(|(k, _)| k).collect();
            for k in ids {
                inner.begin_close(HandleId(k), None);
            }
        }
        drain_ready(&self.inner);
    }

    /// Number of handles currently registered (active or closing).
    pub fn handle_count(&self) -> usize {
        self.inner.borrow().handles.len()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LoopInner {
    // ----- registries -----

    pub(crate) fn insert_handle(&mut self, slot: HandleSlot) -> HandleId {
        let kind = slot.kind_name();
        let id = HandleId(self.handles.insert(slot));
        debug!(id = id.0, kind, "handle created");
        id
    }

    pub(crate) fn slot(&self, id: HandleId) -> Option<&HandleSlot> {
        self.handles.get(id.0)
    }

    pub(crate) fn slot_mut(&mut self, id: HandleId) -> Option<&mut HandleSlot> {
        self.handles.get_mut(id.0)
    }

    /// Looks the slot up and enforces the `Active` precondition every
    /// public operation carries.
    pub(crate) fn active_slot_mut(&mut self, id: HandleId) -> Result<&mut HandleSlot, Error> {
        match self.handles.get_mut(id.0) {
            Some(slot) if slot.core.is_active() => Ok(slot),
            Some(_) | None => Err(Error::HandleDisposed),
        }
    }

    pub(crate) fn active_slot(&self, id: HandleId) -> Result<&HandleSlot, Error> {
        match self.handles.get(id.0) {
            Some(slot) if slot.core.is_active() => Ok(slot),
            Some(_) | None => Err(Error::HandleDisposed),
        }
    }

    pub(crate) fn add_request(&mut self, handle: HandleId, kind: RequestKind) -> RequestId {
        if let Some(slot) = self.handles.get_mut(handle.0) {
            slot.core.pending += 1;
        }
        let op = kind.name();
        let rid = RequestId(self.requests.insert(PendingRequest { handle, kind }));
        trace!(token = rid.0, handle = handle.0, op, "request issued");
        rid
    }

    /// Removes the registry entry and queues its callback. Removal comes
    /// first, so a request can never complete twice.
    pub(crate) fn complete_request(&mut self, rid: RequestId, result: Result<(), Error>) {
        let Some(req) = self.requests.try_remove(rid.0) else {
            return;
        };
        if let Some(slot) = self.handles.get_mut(req.handle.0) {
            slot.core.pending = slot.core.pending.saturating_sub(1);
        }
        trace!(
            token = rid.0,
            op = req.kind.name(),
            ok = result.is_ok(),
            "request completed"
        );
        match req.kind {
            RequestKind::Connect { callback } => {
                self.ready.push_back(Completion::Invoke { callback, result });
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    // ----- poller -----

    pub(crate) fn register_fd(
        &mut self,
        fd: RawFd,
        id: HandleId,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id.0), interest)
    }

    fn deregister_fd(&self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!(fd, error = %e, "deregister failed");
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let sweeping = self.handles.iter().any(|(_, s)| match &s.data {
            HandleData::Process(p) => p.running,
            _ => false,
        });
        sweeping.then_some(PROCESS_SWEEP_INTERVAL)
    }

    fn has_live_work(&self) -> bool {
        !self.ready.is_empty()
            || !self.closing.is_empty()
            || !self.requests.is_empty()
            || self.handles.iter().any(|(_, s)| s.holds_loop_open())
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::LoopInit(e));
        }
        let fired: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();
        for (token, readable, writable) in fired {
            let id = HandleId(token.0);
            trace!(id = id.0, readable, writable, "poll event");
            // Stale tokens (handle released after the kernel queued the
            // event) fall through both arms.
            let is_stream = matches!(
                self.handles.get(id.0).map(|s| &s.data),
                Some(HandleData::Tcp(_))
            );
            let is_listener = matches!(
                self.handles.get(id.0).map(|s| &s.data),
                Some(HandleData::Listener(_))
            );
            if is_stream && writable {
                self.resolve_connect(id);
            } else if is_listener && readable {
                self.accept_ready(id);
            }
        }
        Ok(())
    }

    /// A connecting socket became writable: read SO_ERROR and complete
    /// the connect request.
    fn resolve_connect(&mut self, id: HandleId) {
        let mut done: Option<(RequestId, Result<(), Error>)> = None;
        if let Some(slot) = self.handles.get_mut(id.0) {
            if let HandleData::Tcp(t) = &mut slot.data {
                if let (Some(rid), Some(fd)) = (t.connect_req.take(), t.fd) {
                    if t.registered {
                        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                            warn!(fd, error = %e, "deregister failed");
                        }
                        t.registered = false;
                    }
                    let result = match sys::take_socket_error(fd) {
                        Ok(None) => Ok(()),
                        Ok(Some(os)) => Err(Error::Connect(os)),
                        Err(os) => Err(Error::SocketQuery(os)),
                    };
                    t.phase = if result.is_ok() {
                        TcpPhase::Connected
                    } else {
                        TcpPhase::Unbound
                    };
                    done = Some((rid, result));
                }
            }
        }
        if let Some((rid, result)) = done {
            self.complete_request(rid, result);
        }
    }

    /// A listener became readable: drain the backlog.
    fn accept_ready(&mut self, id: HandleId) {
        let fd = match self.handles.get(id.0) {
            Some(slot) if slot.core.is_active() => match &slot.data {
                HandleData::Listener(l) if l.listening => match l.fd {
                    Some(fd) => fd,
                    None => return,
                },
                _ => return,
            },
            _ => return,
        };
        let mut accepted = Vec::new();
        loop {
            match sys::accept_socket(fd) {
                Ok(pair) => accepted.push(pair),
                Err(e) if sys::would_block(&e) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        if !accepted.is_empty() {
            trace!(id = id.0, count = accepted.len(), "connections accepted");
            self.ready.push_back(Completion::Accept {
                handle: id,
                accepted,
            });
        }
    }

    /// Reaps exited children without blocking.
    fn sweep_processes(&mut self) {
        let running: Vec<usize> = self
            .handles
            .iter()
            .filter(|(_, s)| matches!(&s.data, HandleData::Process(p) if p.running))
            .map(|(k, _)| k)
            .collect();
        for key in running {
            let Some(slot) = self.handles.get_mut(key) else {
                continue;
            };
            let HandleData::Process(p) = &mut slot.data else {
                continue;
            };
            let mut raw: libc::c_int = 0;
            let reaped = unsafe { libc::waitpid(p.pid, &mut raw, libc::WNOHANG) };
            if reaped == 0 {
                continue;
            }
            p.running = false;
            // The spawn descriptor's lifetime ends with the exit
            // notification.
            p.descriptor = None;
            let status = if reaped == -1 {
                warn!(pid = p.pid, "waitpid failed");
                ExitStatus {
                    exit_code: 0,
                    term_signal: 0,
                }
            } else {
                ExitStatus::from_wait(raw)
            };
            debug!(
                pid = p.pid,
                exit_code = status.exit_code,
                term_signal = status.term_signal,
                "process exited"
            );
            let callback = p.on_exit.take();
            self.ready.push_back(Completion::Exit {
                handle: HandleId(key),
                callback,
                status,
            });
        }
    }

    // ----- close lifecycle -----

    /// Starts (or completes) a close. Idempotent: a missing slot or one
    /// already past `Active` is a no-op and any new callback is dropped.
    pub(crate) fn begin_close(&mut self, id: HandleId, callback: Option<CloseCallback>) {
        let Some(slot) = self.handles.get_mut(id.0) else {
            return;
        };
        if !slot.core.is_active() {
            return;
        }
        if let Some(cb) = callback {
            slot.core.on_close = Some(cb);
        }
        if slot.core.pending == 0 {
            self.finalize_handle(id);
            return;
        }
        slot.core.state = HandleState::Closing;
        debug!(
            id = id.0,
            pending = slot.core.pending,
            "close deferred behind outstanding requests"
        );
        if let HandleData::Tcp(t) = &mut slot.data {
            t.connect_req = None;
        }
        let cancel: Vec<usize> = self
            .requests
            .iter()
            .filter(|(_, r)| r.handle == id)
            .map(|(k, _)| k)
            .collect();
        for k in cancel {
            self.complete_request(RequestId(k), Err(Error::Cancelled));
        }
        self.closing.push(id);
    }

    /// Releases the native resource, removes the slot, queues the close
    /// callback. The slot's removal is the `Closed` state.
    fn finalize_handle(&mut self, id: HandleId) {
        let Some(mut slot) = self.handles.try_remove(id.0) else {
            return;
        };
        match &mut slot.data {
            HandleData::Tcp(t) => {
                if let Some(fd) = t.fd.take() {
                    if t.registered {
                        self.deregister_fd(fd);
                    }
                    sys::close_fd(fd);
                }
            }
            HandleData::Listener(l) => {
                if let Some(fd) = l.fd.take() {
                    if l.registered {
                        self.deregister_fd(fd);
                    }
                    sys::close_fd(fd);
                }
            }
            HandleData::Process(p) => {
                // A pid is not a closable descriptor; dropping the
                // descriptor and bookkeeping is the release.
                p.descriptor = None;
            }
        }
        slot.core.state = HandleState::Closed;
        debug!(id = id.0, kind = slot.kind_name(), "handle closed");
        if let Some(callback) = slot.core.on_close.take() {
            self.ready.push_back(Completion::CloseDone { callback });
        }
    }

    /// Finalizes closing handles whose cancellations have dispatched.
    /// Returns true if new completions were queued.
    fn finalize_closing(&mut self) -> bool {
        if self.closing.is_empty() {
            return false;
        }
        let mut progressed = false;
        let ids = std::mem::take(&mut self.closing);
        for id in ids {
            let quiesced = self
                .handles
                .get(id.0)
                .map(|s| s.core.pending == 0)
                .unwrap_or(false);
            if quiesced {
                self.finalize_handle(id);
                progressed = true;
            } else {
                self.closing.push(id);
            }
        }
        progressed
    }
}

/// Dispatches queued completions one at a time, releasing the `LoopInner`
/// borrow before each callback so callbacks can issue new operations.
pub(crate) fn drain_ready(inner: &Rc<RefCell<LoopInner>>) {
    loop {
        let next = inner.borrow_mut().ready.pop_front();
        match next {
            Some(completion) => dispatch_one(inner, completion),
            None => {
                if !inner.borrow_mut().finalize_closing() {
                    break;
                }
            }
        }
    }
}

fn dispatch_one(inner: &Rc<RefCell<LoopInner>>, completion: Completion) {
    match completion {
        Completion::Invoke { callback, result } => callback(result),
        Completion::CloseDone { callback } => callback(),
        Completion::Exit {
            handle,
            callback,
            status,
        } => {
            if let Some(cb) = callback {
                cb(status);
            }
            // The process handle is unusable after its exit notification.
            inner.borrow_mut().begin_close(handle, None);
        }
        Completion::Accept { handle, accepted } => {
            let taken = {
                let mut guard = inner.borrow_mut();
                match guard.handles.get_mut(handle.0).map(|s| &mut s.data) {
                    Some(HandleData::Listener(l)) => l.on_accept.take(),
                    _ => None,
                }
            };
            let Some(mut on_accept) = taken else {
                // Listener went away between readiness and dispatch.
                for (fd, _) in accepted {
                    sys::close_fd(fd);
                }
                return;
            };
            for (fd, _peer) in accepted {
                let conn = Tcp::from_accepted(inner.clone(), fd);
                on_accept(conn);
            }
            let mut guard = inner.borrow_mut();
            if let Some(HandleData::Listener(l)) =
                guard.handles.get_mut(handle.0).map(|s| &mut s.data)
            {
                if l.on_accept.is_none() {
                    l.on_accept = Some(on_accept);
                }
            }
        }
    }
}
