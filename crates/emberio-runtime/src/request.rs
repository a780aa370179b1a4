//! Request — one pending asynchronous operation on a handle.
//!
//! Requests are allocated from the reactor's slab pool at submission time
//! and released back to it when their single completion is delivered. The
//! completion callback is owned by the request; delivering the completion
//! consumes it, which is what makes "exactly once" a type-level fact.

use std::sync::Arc;

use crate::addr::NetAddress;
use crate::handle::HandleId;
use crate::reactor::Reactor;
use crate::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Accept,
    Connect,
    Read,
    Write,
}

/// An accepted connection, ready to be adopted as a stream handle.
/// Carries the listener's TLS config so the transport choice made at accept
/// time is uniform for every connection from that listener.
pub struct Accepted {
    pub socket: Socket,
    pub peer: NetAddress,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
}

/// What a completion callback receives. `error` is 0 on success, a negative
/// errno otherwise (`emberio_core::error::CANCELED` for handle-close
/// cancellation). A read with `error == 0 && len == 0` means the peer closed
/// the stream — a distinguished outcome, not an error.
pub struct Completion {
    pub handle: HandleId,
    pub kind: RequestKind,
    pub buf: Vec<u8>,
    pub len: usize,
    pub error: i32,
    pub accepted: Option<Accepted>,
}

impl Completion {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    /// Peer-closed notification (EOF read).
    #[inline]
    pub fn is_peer_closed(&self) -> bool {
        self.kind == RequestKind::Read && self.error == 0 && self.len == 0
    }

    /// The bytes a read produced.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len.min(self.buf.len())]
    }
}

pub(crate) type CompleteFn = Box<dyn FnOnce(&mut Reactor, Completion)>;

/// Pool-resident request state.
pub(crate) struct Request {
    pub kind: RequestKind,
    pub handle: HandleId,
    /// Read: destination buffer. Write: payload.
    pub buf: Vec<u8>,
    /// Read: bytes filled. Write: bytes already on the wire.
    pub len: usize,
    /// Result recorded ahead of delivery, for requests that resolve without
    /// waiting on readiness (immediate connect outcomes, empty writes).
    pub error: i32,
    pub call: Option<CompleteFn>,
}

impl Request {
    pub(crate) fn new(kind: RequestKind, handle: HandleId, buf: Vec<u8>, call: CompleteFn) -> Self {
        Self {
            kind,
            handle,
            buf,
            len: 0,
            error: 0,
            call: Some(call),
        }
    }
}
