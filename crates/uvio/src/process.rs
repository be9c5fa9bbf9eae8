//! Child process handles: spawn, signal delivery, exit notification.
//!
//! Spawning is fork/exec with an `O_CLOEXEC` errno pipe, so an exec
//! failure (bad path, missing interpreter) is reported synchronously from
//! `spawn` and no handle is ever created for a process that never ran.
//! Exit is observed by the loop's nonblocking `waitpid` sweep; the exit
//! callback is delivered once and the handle then closes itself.

use std::cell::RefCell;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::rc::Rc;

use libc::{c_char, c_int};
use tracing::debug;

use crate::error::last_os_error;
use crate::event_loop::{Loop, LoopInner};
use crate::handle::{HandleCore, HandleData, HandleId, HandleSlot, ProcessData};
use crate::tcp::close_common;
use crate::Error;

/// POSIX signal set. `kill` also accepts a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Signum {
    Hup = 1,
    Int = 2,
    Quit = 3,
    Ill = 4,
    Trap = 5,
    Abrt = 6,
    Bus = 7,
    Fpe = 8,
    Kill = 9,
    Usr1 = 10,
    Segv = 11,
    Usr2 = 12,
    Pipe = 13,
    Alrm = 14,
    Term = 15,
    Stkflt = 16,
    Chld = 17,
    Cont = 18,
    Stop = 19,
    Tstp = 20,
    Ttin = 21,
    Ttou = 22,
    Urg = 23,
    Xcpu = 24,
    Xfsz = 25,
    Vtalrm = 26,
    Prof = 27,
    Winch = 28,
    Io = 29,
    Pwr = 30,
    Sys = 31,
}

impl Signum {
    /// System V alias for `Abrt`.
    pub const IOT: Signum = Signum::Abrt;
    /// System V alias for `Chld`.
    pub const CLD: Signum = Signum::Chld;
    /// System V alias for `Io`.
    pub const POLL: Signum = Signum::Io;
}

impl From<Signum> for i32 {
    fn from(s: Signum) -> i32 {
        s as i32
    }
}

/// How one of the child's low fds is set up before exec.
#[derive(Debug, Clone, Copy)]
pub enum StdioRedirect {
    Inherit,
    /// Redirect to /dev/null.
    Ignore,
    /// dup2 the given parent fd into place.
    Fd(i32),
}

/// Spawn parameters; immutable once passed to `Process::spawn`.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Executable path or name (PATH-resolved). The only hard
    /// precondition: must be non-empty.
    pub file: String,
    /// Arguments after argv[0]; the file itself is always argv[0].
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; `None` inherits the parent environment.
    pub env: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    /// Start the child in its own session (setsid).
    pub detached: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Redirections for fds 0..n; unlisted fds are inherited.
    pub stdio: Vec<StdioRedirect>,
}

impl ProcessOptions {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            detached: false,
            uid: None,
            gid: None,
            stdio: Vec::new(),
        }
    }
}

/// Outcome delivered to the exit callback: `exit_code` is the child's
/// status when it exited normally (else 0), `term_signal` the signal that
/// killed it (else 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i32,
    pub term_signal: i32,
}

impl ExitStatus {
    pub(crate) fn from_wait(raw: c_int) -> Self {
        let exit_code = if libc::WIFEXITED(raw) {
            libc::WEXITSTATUS(raw)
        } else {
            0
        };
        let term_signal = if libc::WIFSIGNALED(raw) {
            libc::WTERMSIG(raw)
        } else {
            0
        };
        Self {
            exit_code,
            term_signal,
        }
    }
}

/// Native spawn descriptor: NUL-terminated argv/envp arrays plus the
/// attribute flags, marshaled once and owned by the process handle until
/// its exit notification.
#[derive(Debug)]
pub(crate) struct SpawnDescriptor {
    file: CString,
    // The CStrings own the bytes the pointer arrays reference; both live
    // and die together in this struct.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    _env: Option<Vec<CString>>,
    env_ptrs: Option<Vec<*const c_char>>,
    cwd: Option<CString>,
    detached: bool,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    stdio: Vec<StdioRedirect>,
}

impl SpawnDescriptor {
    fn build(options: &ProcessOptions) -> Result<Self, Error> {
        if options.file.is_empty() {
            return Err(Error::Argument("executable path must not be empty"));
        }
        let file = CString::new(options.file.as_str())
            .map_err(|_| Error::Argument("NUL byte in executable path"))?;
        let mut argv = Vec::with_capacity(options.args.len() + 1);
        argv.push(file.clone());
        for arg in &options.args {
            argv.push(
                CString::new(arg.as_str()).map_err(|_| Error::Argument("NUL byte in argument"))?,
            );
        }
        let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let (env, env_ptrs) = match &options.env {
            None => (None, None),
            Some(entries) => {
                let mut env = Vec::with_capacity(entries.len());
                for entry in entries {
                    env.push(
                        CString::new(entry.as_str())
                            .map_err(|_| Error::Argument("NUL byte in environment entry"))?,
                    );
                }
                let mut ptrs: Vec<*const c_char> = env.iter().map(|s| s.as_ptr()).collect();
                ptrs.push(std::ptr::null());
                (Some(env), Some(ptrs))
            }
        };

        let cwd = match &options.cwd {
            None => None,
            Some(path) => Some(
                CString::new(path.clone().into_os_string().into_vec())
                    .map_err(|_| Error::Argument("NUL byte in working directory"))?,
            ),
        };

        Ok(Self {
            file,
            _argv: argv,
            argv_ptrs,
            _env: env,
            env_ptrs,
            cwd,
            detached: options.detached,
            uid: options.uid,
            gid: options.gid,
            stdio: options.stdio.clone(),
        })
    }

    /// fork + exec. The write end of a CLOEXEC pipe survives into the
    /// child only until exec; if exec fails the child sends its errno
    /// through it, so the parent can fail synchronously and reap.
    fn exec(&self) -> Result<libc::pid_t, Error> {
        let mut fds: [c_int; 2] = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(Error::Spawn(last_os_error()));
        }
        let (err_rd, err_wr) = (fds[0], fds[1]);

        let pid = unsafe { libc::fork() };
        if pid == -1 {
            let e = last_os_error();
            unsafe {
                libc::close(err_rd);
                libc::close(err_wr);
            }
            return Err(Error::Spawn(e));
        }
        if pid == 0 {
            unsafe { self.child_exec(err_wr) };
        }

        unsafe { libc::close(err_wr) };
        let mut buf = [0u8; 4];
        let n = loop {
            let r = unsafe { libc::read(err_rd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
            if r == -1 && last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break r;
        };
        unsafe { libc::close(err_rd) };

        if n == 4 {
            // Exec never happened; reap the stillborn child.
            let errno = i32::from_ne_bytes(buf);
            let mut raw: c_int = 0;
            unsafe { libc::waitpid(pid, &mut raw, 0) };
            return Err(Error::Spawn(io::Error::from_raw_os_error(errno)));
        }
        Ok(pid)
    }

    /// Runs in the forked child; never returns.
    unsafe fn child_exec(&self, err_fd: c_int) -> ! {
        if self.detached {
            libc::setsid();
        }
        for (target, redirect) in self.stdio.iter().enumerate() {
            match redirect {
                StdioRedirect::Inherit => {}
                StdioRedirect::Ignore => {
                    let null =
                        libc::open(b"/dev/null\0".as_ptr() as *const c_char, libc::O_RDWR);
                    if null == -1 || libc::dup2(null, target as c_int) == -1 {
                        Self::child_fail(err_fd);
                    }
                    if null > 2 {
                        libc::close(null);
                    }
                }
                StdioRedirect::Fd(fd) => {
                    if libc::dup2(*fd, target as c_int) == -1 {
                        Self::child_fail(err_fd);
                    }
                }
            }
        }
        if let Some(cwd) = &self.cwd {
            if libc::chdir(cwd.as_ptr()) == -1 {
                Self::child_fail(err_fd);
            }
        }
        // gid before uid: dropping uid first would forfeit the right to
        // change groups.
        if let Some(gid) = self.gid {
            if libc::setgid(gid) == -1 {
                Self::child_fail(err_fd);
            }
        }
        if let Some(uid) = self.uid {
            if libc::setuid(uid) == -1 {
                Self::child_fail(err_fd);
            }
        }
        match &self.env_ptrs {
            Some(env) => {
                libc::execvpe(
                    self.file.as_ptr(),
                    self.argv_ptrs.as_ptr(),
                    env.as_ptr(),
                );
            }
            None => {
                libc::execvp(self.file.as_ptr(), self.argv_ptrs.as_ptr());
            }
        }
        Self::child_fail(err_fd);
    }

    unsafe fn child_fail(err_fd: c_int) -> ! {
        let errno = last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
        let bytes = errno.to_ne_bytes();
        libc::write(err_fd, bytes.as_ptr() as *const libc::c_void, 4);
        libc::_exit(127);
    }
}

/// A spawned child process bound to one loop. Clones share the same
/// underlying handle.
#[derive(Clone)]
pub struct Process {
    inner: Rc<RefCell<LoopInner>>,
    id: HandleId,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("id", &self.id).finish()
    }
}

impl Process {
    /// Spawns `options.file`. Fails synchronously with `Error::Spawn` if
    /// the OS rejects the spawn (no handle is created); on success the
    /// returned handle's `id()` is valid immediately and `exit_callback`
    /// fires exactly once when the loop observes the exit.
    pub fn spawn(
        lp: &Loop,
        options: ProcessOptions,
        exit_callback: impl FnOnce(ExitStatus) + 'static,
    ) -> Result<Self, Error> {
        let descriptor = SpawnDescriptor::build(&options)?;
        let pid = descriptor.exec()?;
        let inner = lp.shared();
        let id = inner.borrow_mut().insert_handle(HandleSlot {
            core: HandleCore::new(),
            data: HandleData::Process(ProcessData {
                pid,
                running: true,
                descriptor: Some(descriptor),
                on_exit: Some(Box::new(exit_callback)),
            }),
        });
        debug!(pid, file = %options.file, "process spawned");
        Ok(Self { inner, id })
    }

    pub fn handle_id(&self) -> HandleId {
        self.id
    }

    /// OS process id while the native resource is live, `-1` once the
    /// handle has been released. Deliberately non-throwing.
    pub fn id(&self) -> i32 {
        let inner = self.inner.borrow();
        match inner.slot(self.id).map(|s| &s.data) {
            Some(HandleData::Process(p)) => p.pid,
            _ => -1,
        }
    }

    /// Delivers a signal to the live process. Does not wait for
    /// termination; that arrives later via the exit callback.
    pub fn kill(&self, signum: impl Into<i32>) -> Result<(), Error> {
        let signum = signum.into();
        let mut inner = self.inner.borrow_mut();
        let slot = inner.active_slot_mut(self.id)?;
        let HandleData::Process(p) = &mut slot.data else {
            return Err(Error::InvalidState("not a process handle"));
        };
        if !p.running {
            return Err(Error::Kill(io::Error::from_raw_os_error(libc::ESRCH)));
        }
        if unsafe { libc::kill(p.pid, signum) } == -1 {
            return Err(Error::Kill(last_os_error()));
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

    /// Stops watching the child and releases the handle. The process
    /// itself keeps running; no exit callback will be delivered.
    pub fn close(&self) {
        close_common(&self.inner, self.id, None);
    }

    pub fn close_with(&self, callback: impl FnOnce() + 'static) {
        close_common(&self.inner, self.id, Some(Box::new(callback)));
    }

    /// Process-wide title, read from the OS.
    pub fn title() -> Result<String, Error> {
        title_impl()
    }

    pub fn set_title(title: &str) -> Result<(), Error> {
        set_title_impl(title)
    }

    /// Path of the current executable. Retries with a grown buffer a
    /// bounded number of times before giving up with `BufferTooSmall`.
    pub fn executable_path() -> Result<PathBuf, Error> {
        executable_path_impl()
    }
}

#[cfg(target_os = "linux")]
const QUERY_GROWTH_ATTEMPTS: usize = 4;

#[cfg(target_os = "linux")]
fn executable_path_impl() -> Result<PathBuf, Error> {
    let mut capacity = 256usize;
    for _ in 0..QUERY_GROWTH_ATTEMPTS {
        let mut buf = vec![0u8; capacity];
        let n = unsafe {
            libc::readlink(
                b"/proc/self/exe\0".as_ptr() as *const c_char,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        };
        if n == -1 {
            return Err(Error::ProcessQuery(last_os_error()));
        }
        let n = n as usize;
        // readlink truncates silently; a full buffer means try again
        // larger.
        if n < buf.len() {
            buf.truncate(n);
            return Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)));
        }
        capacity *= 2;
    }
    Err(Error::BufferTooSmall)
}

#[cfg(target_os = "linux")]
fn title_impl() -> Result<String, Error> {
    // PR_GET_NAME always fits in 16 bytes including the NUL.
    let mut buf = [0u8; 16];
    if unsafe { libc::prctl(libc::PR_GET_NAME, buf.as_mut_ptr() as libc::c_ulong, 0, 0, 0) } == -1
    {
        return Err(Error::ProcessQuery(last_os_error()));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(target_os = "linux")]
fn set_title_impl(title: &str) -> Result<(), Error> {
    // The kernel stores at most 15 bytes plus the NUL.
    let mut bytes = title.as_bytes().to_vec();
    bytes.truncate(15);
    let name = CString::new(bytes).map_err(|_| Error::Argument("NUL byte in process title"))?;
    if unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0) } == -1 {
        return Err(Error::ProcessQuery(last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn executable_path_impl() -> Result<PathBuf, Error> {
    Err(Error::ProcessQuery(io::Error::from_raw_os_error(
        libc::ENOTSUP,
    )))
}

#[cfg(not(target_os = "linux"))]
fn title_impl() -> Result<String, Error> {
    Err(Error::ProcessQuery(io::Error::from_raw_os_error(
        libc::ENOTSUP,
    )))
}

#[cfg(not(target_os = "linux"))]
fn set_title_impl(_title: &str) -> Result<(), Error> {
    Err(Error::ProcessQuery(io::Error::from_raw_os_error(
        libc::ENOTSUP,
    )))
}
