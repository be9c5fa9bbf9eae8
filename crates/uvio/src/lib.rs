//! uvio — a single-threaded I/O reactor.
//!
//! One `Loop` multiplexes heterogeneous OS resources behind a uniform
//! handle abstraction: TCP streams, listening sockets, and child
//! processes. One-shot asynchronous operations (connect) are request
//! objects completed exactly once via callback on the loop thread; handle
//! teardown is deferred until no request referencing the handle is
//! outstanding, and loop teardown forces pending requests to complete
//! with `Error::Cancelled`.
//!
//! ```no_run
//! use uvio::{Loop, Tcp};
//!
//! let lp = Loop::new()?;
//! let tcp = Tcp::new(&lp);
//! tcp.connect("127.0.0.1:9000".parse().unwrap(), |result| {
//!     println!("connect: {result:?}");
//! })?;
//! lp.run()?;
//! # Ok::<(), uvio::Error>(())
//! ```

#![cfg(unix)]

// Error taxonomy
pub mod error;

// Native address representation
pub mod addr;

// Raw socket syscalls
mod sys;

// Handle lifecycle core
pub mod handle;

// One-shot request descriptors
pub mod request;

// The reactor
pub mod event_loop;

// Concrete handle kinds
pub mod process;
pub mod tcp;

pub use addr::SockAddr;
pub use error::Error;
pub use event_loop::Loop;
pub use handle::{HandleId, HandleState};
pub use process::{ExitStatus, Process, ProcessOptions, Signum, StdioRedirect};
pub use request::RequestId;
pub use tcp::{Tcp, TcpListener};
