//! Handle — one long-lived I/O resource registered with a reactor.
//!
//! A handle is addressed by a generation-tagged [`HandleId`]; the entry it
//! names lives in the reactor's slab for exactly as long as the resource.
//! The lifecycle is OPEN → CLOSING (on error/EOF/explicit close) → CLOSED
//! once every outstanding request has completed or been cancelled; the close
//! callback fires exactly once, after CLOSED.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use emberio_core::pool::SlotId;

use crate::reactor::Reactor;
use crate::socket::Socket;
use crate::timer::TimerId;
use crate::tls::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) SlotId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Listener,
    Stream,
}

/// Verdict of an idle-timeout callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    KeepOpen,
    Close,
}

pub(crate) type CloseFn = Box<dyn FnOnce(&mut Reactor, HandleId)>;
pub(crate) type TimeoutFn = Box<dyn FnMut(&mut Reactor, HandleId) -> TimeoutAction>;

pub(crate) struct IdleTimeout {
    pub timer: TimerId,
    pub max: Duration,
}

pub(crate) struct HandleEntry {
    pub sock: Socket,
    pub transport: Transport,
    pub kind: HandleKind,
    pub state: HandleState,
    /// Listener only: TLS config handed to every accepted connection.
    pub tls: Option<std::sync::Arc<rustls::ServerConfig>>,
    /// Accept/read requests, completion in submission order.
    pub read_q: VecDeque<SlotId>,
    /// Connect/write requests, completion in submission order.
    pub write_q: VecDeque<SlotId>,
    pub on_close: Option<CloseFn>,
    pub on_timeout: Option<TimeoutFn>,
    pub idle: Option<IdleTimeout>,
    pub last_activity: Instant,
    pub connect_pending: bool,
    /// epoll interest bits currently registered for this fd.
    pub registered: u32,
}

impl HandleEntry {
    pub(crate) fn new(sock: Socket, transport: Transport, kind: HandleKind) -> Self {
        Self {
            sock,
            transport,
            kind,
            state: HandleState::Open,
            tls: None,
            read_q: VecDeque::new(),
            write_q: VecDeque::new(),
            on_close: None,
            on_timeout: None,
            idle: None,
            last_activity: Instant::now(),
            connect_pending: false,
            registered: 0,
        }
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    #[inline]
    pub(crate) fn outstanding(&self) -> usize {
        self.read_q.len() + self.write_q.len()
    }

    /// epoll interest implied by the current queues and transport state.
    pub(crate) fn wanted_interest(&self) -> u32 {
        let mut ev = 0u32;
        if !self.read_q.is_empty() {
            ev |= libc::EPOLLIN as u32;
        }
        if !self.write_q.is_empty() || self.connect_pending || self.transport.wants_flush() {
            ev |= libc::EPOLLOUT as u32;
        }
        ev
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
