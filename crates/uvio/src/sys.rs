//! Thin fallible wrappers over the BSD socket calls the reactor issues.
//!
//! Every socket is created non-blocking and close-on-exec; a nonblocking
//! connect that reports `EINPROGRESS` counts as accepted and completes
//! later through the poller.

use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

use crate::addr::SockAddr;
use crate::error::last_os_error;

pub(crate) fn create_socket(domain: i32) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        return Err(last_os_error());
    }
    Ok(fd)
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub(crate) fn bind_socket(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    if unsafe { libc::bind(fd, addr.as_ptr(), addr.len()) } == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

pub(crate) fn listen_socket(fd: RawFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Accepts one pending connection; the returned fd is non-blocking and
/// close-on-exec. `WouldBlock` means the backlog is drained.
pub(crate) fn accept_socket(fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
    let mut addr = SockAddr::zeroed();
    let client = unsafe {
        libc::accept4(
            fd,
            addr.as_mut_ptr(),
            addr.len_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if client == -1 {
        return Err(last_os_error());
    }
    Ok((client, addr))
}

/// Issues the nonblocking connect. `Ok(())` means the connect was accepted
/// by the OS and will resolve via writability; it does not mean connected.
pub(crate) fn connect_socket(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    let ret = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
    if ret == -1 {
        let err = last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SockAddr> {
    let mut addr = SockAddr::zeroed();
    if unsafe { libc::getsockname(fd, addr.as_mut_ptr(), addr.len_mut()) } == -1 {
        return Err(last_os_error());
    }
    Ok(addr)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SockAddr> {
    let mut addr = SockAddr::zeroed();
    if unsafe { libc::getpeername(fd, addr.as_mut_ptr(), addr.len_mut()) } == -1 {
        return Err(last_os_error());
    }
    Ok(addr)
}

fn set_opt_int(fd: RawFd, level: c_int, name: c_int, value: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const c_void,
            mem::size_of::<i32>() as socklen_t,
        )
    };
    if ret == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

pub(crate) fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32)
}

pub(crate) fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_opt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32)
}

/// SO_KEEPALIVE toggle plus the idle delay when enabling.
pub(crate) fn set_keepalive(fd: RawFd, on: bool, delay_secs: u32) -> io::Result<()> {
    set_opt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as i32)?;
    if on {
        #[cfg(target_os = "linux")]
        set_opt_int(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, delay_secs as i32)?;
        #[cfg(not(target_os = "linux"))]
        let _ = delay_secs;
    }
    Ok(())
}

/// Reads and clears SO_ERROR; `None` means the connect succeeded.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: i32 = 0;
    let mut len = mem::size_of::<i32>() as socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if ret == -1 {
        return Err(last_os_error());
    }
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}
