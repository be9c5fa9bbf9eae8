use std::io;

use thiserror::Error;

/// Error taxonomy for the reactor.
///
/// Variants split into caller bugs (`Argument`, `InvalidState`,
/// `HandleDisposed`), native-call failures wrapping the OS error for the
/// caller's own retry decision, and `Cancelled` for requests forced to
/// complete by teardown.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Argument(&'static str),

    #[error("operation not valid in current state: {0}")]
    InvalidState(&'static str),

    #[error("handle has been disposed")]
    HandleDisposed,

    #[error("event loop initialization failed")]
    LoopInit(#[source] io::Error),

    #[error("event loop is already running")]
    LoopBusy,

    #[error("bind failed")]
    Bind(#[source] io::Error),

    #[error("connect failed")]
    Connect(#[source] io::Error),

    #[error("spawn failed")]
    Spawn(#[source] io::Error),

    #[error("kill failed")]
    Kill(#[source] io::Error),

    #[error("socket query failed")]
    SocketQuery(#[source] io::Error),

    #[error("process query failed")]
    ProcessQuery(#[source] io::Error),

    #[error("buffer too small for native query")]
    BufferTooSmall,

    #[error("operation cancelled by teardown")]
    Cancelled,
}

impl Error {
    /// Raw OS error code underlying a native-call failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::LoopInit(e)
            | Error::Bind(e)
            | Error::Connect(e)
            | Error::Spawn(e)
            | Error::Kill(e)
            | Error::SocketQuery(e)
            | Error::ProcessQuery(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// True for failures that indicate a bug in the calling code rather
    /// than an OS condition.
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            Error::Argument(_) | Error::InvalidState(_) | Error::HandleDisposed
        )
    }
}

/// Builds an `io::Error` from the errno value left by the last native call.
pub(crate) fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_code_survives_wrapping() {
        let err = Error::Bind(io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    }

    #[test]
    fn caller_bugs_classified() {
        assert!(Error::HandleDisposed.is_caller_bug());
        assert!(Error::Argument("endpoint").is_caller_bug());
        assert!(!Error::Cancelled.is_caller_bug());
        assert!(!Error::Connect(io::Error::from_raw_os_error(libc::ECONNREFUSED)).is_caller_bug());
    }
}
