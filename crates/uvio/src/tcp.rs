//! Connection-oriented stream handles: `Tcp` and `TcpListener`.
//!
//! Sockets are created lazily, once the first bind or connect supplies an
//! address family. A `Tcp` moves `Unbound -> Connecting -> Connected`; a
//! failed connect returns it to `Unbound`.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use mio::Interest;
use tracing::debug;

use crate::addr::{self, SockAddr};
use crate::event_loop::{drain_ready, Loop, LoopInner};
use crate::handle::{HandleCore, HandleData, HandleId, HandleSlot, ListenerData, TcpData, TcpPhase};
use crate::request::RequestKind;
use crate::{sys, Error};

/// A TCP stream handle bound to one loop. Clones share the same
/// underlying handle.
#[derive(Clone)]
pub struct Tcp {
    inner: Rc<RefCell<LoopInner>>,
    id: HandleId,
}

impl Tcp {
    pub fn new(lp: &Loop) -> Self {
        let inner = lp.shared();
        let id = inner.borrow_mut().insert_handle(HandleSlot {
            core: HandleCore::new(),
            data: HandleData::Tcp(TcpData::unbound()),
        });
        Self { inner, id }
    }

    /// Wraps a freshly accepted connection in a handle on the same loop.
    pub(crate) fn from_accepted(inner: Rc<RefCell<LoopInner>>, fd: RawFd) -> Self {
        let id = inner.borrow_mut().insert_handle(HandleSlot {
            core: HandleCore::new(),
            data: HandleData::Tcp(TcpData::connected(fd)),
        });
        Self { inner, id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Starts an asynchronous connect. The callback fires exactly once on
    /// the loop thread: `Ok(())` once the connection is established, or
    /// the connect failure. Only valid while the socket is unconnected.
    pub fn connect(
        &self,
        endpoint: SocketAddr,
        callback: impl FnOnce(Result<(), Error>) + 'static,
    ) -> Result<(), Error> {
        addr::check_family(&endpoint)?;
        let mut inner = self.inner.borrow_mut();
        let fd = {
            let slot = inner.active_slot_mut(self.id)?;
            let HandleData::Tcp(t) = &mut slot.data else {
                return Err(Error::InvalidState("not a tcp handle"));
            };
            if t.phase != TcpPhase::Unbound {
                return Err(Error::InvalidState("connect requires an unconnected socket"));
            }
            match t.fd {
                Some(fd) => fd,
                None => {
                    let fd = sys::create_socket(addr::domain_of(&endpoint)).map_err(Error::Connect)?;
                    t.fd = Some(fd);
                    fd
                }
            }
        };
        let native = SockAddr::from_socket_addr(&endpoint);
        sys::connect_socket(fd, &native).map_err(Error::Connect)?;
        inner
            .register_fd(fd, self.id, Interest::WRITABLE)
            .map_err(Error::Connect)?;
        let rid = inner.add_request(
            self.id,
            RequestKind::Connect {
                callback: Box::new(callback),
            },
        );
        if let Some(slot) = inner.slot_mut(self.id) {
            if let HandleData::Tcp(t) = &mut slot.data {
                t.phase = TcpPhase::Connecting;
                t.registered = true;
                t.connect_req = Some(rid);
            }
        }
        debug!(id = self.id.0, %endpoint, "connect issued");
        Ok(())
    }

    /// Address the socket is bound to. Between connect issue and
    /// completion this is the kernel-assigned local address; before any
    /// connect it fails with `SocketQuery` (no socket exists yet).
    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        let fd = self.query_fd()?;
        decode_addr(sys::local_addr(fd).map_err(Error::SocketQuery)?)
    }

    pub fn remote_address(&self) -> Result<SocketAddr, Error> {
        let fd = self.query_fd()?;
        decode_addr(sys::peer_addr(fd).map_err(Error::SocketQuery)?)
    }

    pub fn set_nodelay(&self, enable: bool) -> Result<(), Error> {
        sys::set_nodelay(self.query_fd()?, enable).map_err(Error::SocketQuery)
    }

    /// Toggles SO_KEEPALIVE; `delay_secs` is the idle time before probes
    /// when enabling.
    pub fn set_keepalive(&self, enable: bool, delay_secs: u32) -> Result<(), Error> {
        sys::set_keepalive(self.query_fd()?, enable, delay_secs).map_err(Error::SocketQuery)
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .borrow()
            .slot(self.id)
            .map(|s| s.core.is_active())
            .unwrap_or(false)
    }

    /// Releases the socket. Any in-flight connect completes with
    /// `Cancelled` first; a second close is a no-op.
    pub fn close(&self) {
        close_common(&self.inner, self.id, None);
    }

    /// As `close`, invoking `callback` once the socket is fully released.
    pub fn close_with(&self, callback: impl FnOnce() + 'static) {
        close_common(&self.inner, self.id, Some(Box::new(callback)));
    }

    fn query_fd(&self) -> Result<RawFd, Error> {
        let inner = self.inner.borrow();
        let slot = inner.active_slot(self.id)?;
        let HandleData::Tcp(t) = &slot.data else {
            return Err(Error::InvalidState("not a tcp handle"));
        };
        t.fd
            .ok_or_else(|| Error::SocketQuery(io::Error::from_raw_os_error(libc::EBADF)))
    }
}

/// A listening socket handle; accepted connections are yielded as new
/// `Tcp` handles on the same loop. Clones share the same underlying
/// handle.
#[derive(Clone)]
pub struct TcpListener {
    inner: Rc<RefCell<LoopInner>>,
    id: HandleId,
}

impl TcpListener {
    pub fn new(lp: &Loop) -> Self {
        let inner = lp.shared();
        let id = inner.borrow_mut().insert_handle(HandleSlot {
            core: HandleCore::new(),
            data: HandleData::Listener(ListenerData::unbound()),
        });
        Self { inner, id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Binds to `endpoint` (with SO_REUSEADDR). Synchronous; a non-zero
    /// native status such as an address conflict is `Error::Bind`.
    pub fn bind(&self, endpoint: SocketAddr) -> Result<(), Error> {
        addr::check_family(&endpoint)?;
        let mut inner = self.inner.borrow_mut();
        let slot = inner.active_slot_mut(self.id)?;
        let HandleData::Listener(l) = &mut slot.data else {
            return Err(Error::InvalidState("not a listener handle"));
        };
        if l.fd.is_some() {
            return Err(Error::InvalidState("listener is already bound"));
        }
        let fd = sys::create_socket(addr::domain_of(&endpoint)).map_err(Error::Bind)?;
        sys::set_reuseaddr(fd, true).map_err(Error::Bind)?;
        let native = SockAddr::from_socket_addr(&endpoint);
        if let Err(e) = sys::bind_socket(fd, &native) {
            sys::close_fd(fd);
            return Err(Error::Bind(e));
        }
        l.fd = Some(fd);
        debug!(id = self.id.0, %endpoint, "listener bound");
        Ok(())
    }

    /// Starts listening; `on_accept` is invoked on the loop thread with a
    /// connected `Tcp` for every accepted connection. Backlog overflow
    /// policy is the OS listen() semantics.
    pub fn listen(&self, backlog: i32, on_accept: impl FnMut(Tcp) + 'static) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let fd = {
            let slot = inner.active_slot_mut(self.id)?;
            let HandleData::Listener(l) = &mut slot.data else {
                return Err(Error::InvalidState("not a listener handle"));
            };
            if l.listening {
                return Err(Error::InvalidState("listener is already listening"));
            }
            l.fd
                .ok_or(Error::InvalidState("listen requires a bound listener"))?
        };
        sys::listen_socket(fd, backlog).map_err(Error::Bind)?;
        inner
            .register_fd(fd, self.id, Interest::READABLE)
            .map_err(Error::Bind)?;
        if let Some(slot) = inner.slot_mut(self.id) {
            if let HandleData::Listener(l) = &mut slot.data {
                l.listening = true;
                l.registered = true;
                l.on_accept = Some(Box::new(on_accept));
            }
        }
        debug!(id = self.id.0, backlog, "listener listening");
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddr, Error> {
        let fd = {
            let inner = self.inner.borrow();
            let slot = inner.active_slot(self.id)?;
            let HandleData::Listener(l) = &slot.data else {
                return Err(Error::InvalidState("not a listener handle"));
            };
            l.fd
                .ok_or_else(|| Error::SocketQuery(io::Error::from_raw_os_error(libc::EBADF)))?
        };
        decode_addr(sys::local_addr(fd).map_err(Error::SocketQuery)?)
    }

    /// Accepted for API parity with the Windows-era knob; inert on Unix.
    pub fn set_simultaneous_accepts(&self, enable: bool) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.active_slot_mut(self.id)?;
        if let HandleData::Listener(l) = &mut slot.data {
            l.simultaneous_accepts = enable;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .borrow()
            .slot(self.id)
            .map(|s| s.core.is_active())
            .unwrap_or(false)
    }

    pub fn close(&self) {
        close_common(&self.inner, self.id, None);
    }

    pub fn close_with(&self, callback: impl FnOnce() + 'static) {
        close_common(&self.inner, self.id, Some(Box::new(callback)));
    }
}

fn decode_addr(native: SockAddr) -> Result<SocketAddr, Error> {
    native
        .to_socket_addr()
        .ok_or_else(|| Error::SocketQuery(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)))
}

/// Shared close entry point: defers completion dispatch to the running
/// loop, or drains immediately when called outside `run`.
pub(crate) fn close_common(
    inner: &Rc<RefCell<LoopInner>>,
    id: HandleId,
    callback: Option<Box<dyn FnOnce()>>,
) {
    let idle = {
        let mut guard = inner.borrow_mut();
        guard.begin_close(id, callback);
        !guard.is_running()
    };
    if idle {
        drain_ready(inner);
    }
}
