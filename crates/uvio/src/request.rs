//! One-shot asynchronous operation descriptors.
//!
//! A request is an entry in the loop's request slab, keyed by `RequestId`
//! and tied to its owning handle. The slab is the completion-token
//! registry: a readiness event resolves a token to its callback, the entry
//! is removed before the callback runs (exactly-once by construction), and
//! teardown completes every entry still present with `Error::Cancelled`.

use crate::handle::{ConnectCallback, HandleId};

/// Opaque completion token; index into the loop's request slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) usize);

pub(crate) struct PendingRequest {
    /// Owning handle — a relation, never ownership.
    pub handle: HandleId,
    pub kind: RequestKind,
}

pub(crate) enum RequestKind {
    Connect { callback: ConnectCallback },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Connect { .. } => "connect",
        }
    }
}
