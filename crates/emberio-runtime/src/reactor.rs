//! The reactor: a single-threaded epoll loop that owns every handle,
//! request and timer registered with it.
//!
//! Completion discipline: every submitted request completes exactly once —
//! with a result, an OS error, or a synthesized cancellation when its handle
//! is closed first. All cancellations for a handle are delivered before that
//! handle's close callback; the close callback is the last event a handle
//! ever produces.
//!
//! epoll user data carries `(generation << 32) | slot index` so a readiness
//! event for a recycled slot fails the generation check and is dropped
//! instead of being misdelivered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use emberio_core::error::{last_os_error, EngineError, Result, CANCELED};
use emberio_core::pool::{SlabPool, SlotId};
use emberio_core::{edebug, eerror, einfo, etrace};

use crate::addr::NetAddress;
use crate::config::EngineConfig;
use crate::handle::{HandleEntry, HandleId, HandleKind, HandleState, IdleTimeout, TimeoutAction};
use crate::request::{Accepted, CompleteFn, Completion, Request, RequestKind};
use crate::socket::Socket;
use crate::timer::{TimerId, TimerWheel};
use crate::tls::{TlsSession, Transport};

/// epoll user data reserved for the cross-thread wake eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

const EVENT_BATCH: usize = 256;

#[inline]
fn token_of(h: HandleId) -> u64 {
    ((h.0.generation() as u64) << 32) | h.0.index() as u64
}

#[inline]
fn id_of(token: u64) -> HandleId {
    HandleId(SlotId::from_raw(
        (token & 0xFFFF_FFFF) as u32,
        (token >> 32) as u32,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

type InjectFn = Box<dyn FnOnce(&mut Reactor) + Send>;

/// Shared between the reactor and its wakers. Owns the eventfd.
struct Injector {
    queue: ArrayQueue<InjectFn>,
    wake_fd: libc::c_int,
}

impl Injector {
    fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain_eventfd(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.wake_fd, &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Injector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

/// The only cross-thread door into a reactor. Cloneable, `Send + Sync`;
/// posted closures run on the reactor thread between event dispatches.
#[derive(Clone)]
pub struct ReactorWaker {
    inner: Arc<Injector>,
}

impl ReactorWaker {
    /// Queue a closure for the reactor thread and wake it. Fails with
    /// [`EngineError::QueueFull`] when the injection queue is at capacity;
    /// the caller decides whether to retry or shed the work.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.inner
            .queue
            .push(Box::new(f))
            .map_err(|_| EngineError::QueueFull)?;
        self.inner.wake();
        Ok(())
    }
}

pub struct Reactor {
    epfd: libc::c_int,
    injector: Arc<Injector>,
    handles: SlabPool<HandleEntry>,
    requests: SlabPool<Request>,
    timers: TimerWheel,
    state: ReactorState,
    /// Requests cancelled by a close, awaiting CANCELED delivery.
    pending_cancel: VecDeque<SlotId>,
    /// Requests that resolved at submission time (immediate connects).
    pending_ready: VecDeque<SlotId>,
    /// Handles in CLOSING, finalized after their cancellations drain.
    pending_close: VecDeque<HandleId>,
    read_buf_size: usize,
}

impl Reactor {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(EngineError::ReactorSetup(last_os_error()));
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = last_os_error();
            unsafe { libc::close(epfd) };
            return Err(EngineError::ReactorSetup(err));
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) } < 0 {
            let err = last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(EngineError::ReactorSetup(err));
        }
        Ok(Self {
            epfd,
            injector: Arc::new(Injector {
                queue: ArrayQueue::new(config.max_queued_tasks.max(1)),
                wake_fd,
            }),
            handles: SlabPool::new(config.max_handles),
            requests: SlabPool::new(config.max_requests),
            timers: TimerWheel::new(config.max_requests.max(64)),
            state: ReactorState::Idle,
            pending_cancel: VecDeque::new(),
            pending_ready: VecDeque::new(),
            pending_close: VecDeque::new(),
            read_buf_size: config.read_buf_size,
        })
    }

    pub fn waker(&self) -> ReactorWaker {
        ReactorWaker {
            inner: Arc::clone(&self.injector),
        }
    }

    #[inline]
    pub fn state(&self) -> ReactorState {
        self.state
    }

    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn live_requests(&self) -> usize {
        self.requests.len()
    }

    /// Current lifecycle state, or `None` once the slot has been recycled.
    pub fn handle_state(&self, h: HandleId) -> Option<HandleState> {
        self.handles.get(h.0).map(|e| e.state)
    }

    pub fn local_addr(&self, h: HandleId) -> Result<NetAddress> {
        match self.handles.get(h.0) {
            Some(e) => e.sock.local_addr(),
            None => Err(EngineError::HandleClosed),
        }
    }

    // ---- handle lifecycle -------------------------------------------------

    /// Bind and listen. With a TLS config, every connection accepted from
    /// this listener speaks TLS; the choice is made here, once.
    pub fn open_listener(
        &mut self,
        addr: &NetAddress,
        backlog: i32,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<HandleId> {
        let sock = Socket::tcp(addr)?;
        sock.set_reuse()?;
        sock.bind(addr)?;
        sock.listen(backlog)?;
        let bound = sock.local_addr()?;
        let mut entry = HandleEntry::new(sock, Transport::Plain, HandleKind::Listener);
        entry.tls = tls;
        let h = HandleId(self.handles.alloc(entry)?);
        if let Err(e) = self.register(h) {
            self.handles.release(h.0);
            return Err(e);
        }
        einfo!("listener open on {}", bound);
        Ok(h)
    }

    /// Begin a nonblocking connect. The callback receives a Connect
    /// completion: error 0 once the stream is writable, a negative errno
    /// otherwise. Immediate outcomes are still delivered through the loop,
    /// never inline from this call.
    pub fn open_stream<F>(&mut self, addr: &NetAddress, on_connect: F) -> Result<HandleId>
    where
        F: FnOnce(&mut Reactor, Completion) + 'static,
    {
        let sock = Socket::tcp(addr)?;
        sock.set_nodelay();
        let mut entry = HandleEntry::new(sock, Transport::Plain, HandleKind::Stream);
        let mut immediate = 0i32;
        match entry.sock.connect(addr) {
            Ok(true) => {}
            Ok(false) => entry.connect_pending = true,
            Err(errno) => immediate = errno,
        }
        let pending = entry.connect_pending;
        let h = HandleId(self.handles.alloc(entry)?);
        let req = Request::new(RequestKind::Connect, h, Vec::new(), Box::new(on_connect));
        let rid = match self.requests.alloc(req) {
            Ok(rid) => rid,
            Err(e) => {
                self.handles.release(h.0);
                return Err(e);
            }
        };
        if pending {
            if let Some(e) = self.handles.get_mut(h.0) {
                e.write_q.push_back(rid);
            }
        } else if let Some(r) = self.requests.get_mut(rid) {
            r.error = immediate;
        }
        if let Err(e) = self.register(h) {
            self.requests.release(rid);
            self.handles.release(h.0);
            return Err(e);
        }
        if !pending {
            self.pending_ready.push_back(rid);
        }
        edebug!("stream connect to {} (pending={})", addr, pending);
        Ok(h)
    }

    /// Register an accepted connection as a stream handle, on TLS when the
    /// originating listener carried a config.
    pub fn adopt_accepted(&mut self, acc: Accepted) -> Result<HandleId> {
        let transport = match acc.tls {
            Some(cfg) => Transport::Tls(Box::new(TlsSession::accept(cfg)?)),
            None => Transport::Plain,
        };
        let entry = HandleEntry::new(acc.socket, transport, HandleKind::Stream);
        let h = HandleId(self.handles.alloc(entry)?);
        if let Err(e) = self.register(h) {
            self.handles.release(h.0);
            return Err(e);
        }
        etrace!("adopted stream from {}", acc.peer);
        Ok(h)
    }

    /// Install the close callback. Fires exactly once, after every
    /// outstanding request has been cancelled or completed.
    pub fn set_close_callback<F>(&mut self, h: HandleId, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor, HandleId) + 'static,
    {
        match self.handles.get_mut(h.0) {
            Some(e) if e.is_open() => {
                e.on_close = Some(Box::new(cb));
                Ok(())
            }
            _ => Err(EngineError::HandleClosed),
        }
    }

    /// Arm the idle timeout: every `gap` the handle's inactivity is checked
    /// against `max`; past it, the callback decides keep-open or close.
    /// `repeats < 0` checks until the handle closes. Re-arming replaces any
    /// previous timeout.
    pub fn set_timeout<F>(
        &mut self,
        h: HandleId,
        gap: Duration,
        max: Duration,
        repeats: i32,
        cb: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Reactor, HandleId) -> TimeoutAction + 'static,
    {
        let prev = match self.handles.get_mut(h.0) {
            Some(e) if e.is_open() => e.idle.take(),
            _ => return Err(EngineError::HandleClosed),
        };
        if let Some(prev) = prev {
            self.timers.cancel(prev.timer);
        }
        let timer = self
            .timers
            .insert(Box::new(move |re| re.check_idle(h)), gap, Some(gap), repeats)?;
        if let Some(e) = self.handles.get_mut(h.0) {
            e.idle = Some(IdleTimeout { timer, max });
            e.on_timeout = Some(Box::new(cb));
        }
        Ok(())
    }

    /// Request a close. Idempotent; stale ids are ignored. The handle moves
    /// to CLOSING at once: further submissions are rejected, every queued
    /// request is cancelled, and once the cancellations have been delivered
    /// the resource is released and the close callback fires.
    pub fn close(&mut self, h: HandleId) {
        let mut cancelled: Vec<SlotId> = Vec::new();
        let idle = match self.handles.get_mut(h.0) {
            Some(e) if e.is_open() => {
                e.state = HandleState::Closing;
                cancelled.extend(e.read_q.drain(..));
                cancelled.extend(e.write_q.drain(..));
                e.connect_pending = false;
                e.idle.take()
            }
            _ => return,
        };
        if let Some(idle) = idle {
            self.timers.cancel(idle.timer);
        }
        for rid in cancelled {
            self.pending_cancel.push_back(rid);
        }
        self.pending_close.push_back(h);
        etrace!("close requested for handle {:?}", h.0);
    }

    // ---- request submission -----------------------------------------------

    /// Queue one accept. Completes with an [`Accepted`] connection or an
    /// errno; one submission, one connection.
    pub fn submit_accept<F>(&mut self, h: HandleId, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor, Completion) + 'static,
    {
        self.submit(h, HandleKind::Listener, RequestKind::Accept, Vec::new(), Box::new(cb))
    }

    /// Queue one read. Completes with the bytes available, `len == 0` for
    /// peer EOF, or a negative errno.
    pub fn submit_read<F>(&mut self, h: HandleId, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor, Completion) + 'static,
    {
        let buf = vec![0u8; self.read_buf_size];
        self.submit(h, HandleKind::Stream, RequestKind::Read, buf, Box::new(cb))
    }

    /// Queue a full write of `data`. Partial sends are retried internally;
    /// the completion reports the whole payload sent or the errno that
    /// stopped it.
    pub fn submit_write<F>(&mut self, h: HandleId, data: Vec<u8>, cb: F) -> Result<()>
    where
        F: FnOnce(&mut Reactor, Completion) + 'static,
    {
        self.submit(h, HandleKind::Stream, RequestKind::Write, data, Box::new(cb))
    }

    fn submit(
        &mut self,
        h: HandleId,
        want_kind: HandleKind,
        kind: RequestKind,
        buf: Vec<u8>,
        cb: CompleteFn,
    ) -> Result<()> {
        match self.handles.get(h.0) {
            Some(e) if e.is_open() => {
                if e.kind != want_kind {
                    return Err(EngineError::Os(-libc::EINVAL));
                }
            }
            _ => return Err(EngineError::HandleClosed),
        }
        let rid = self.requests.alloc(Request::new(kind, h, buf, cb))?;
        if let Some(e) = self.handles.get_mut(h.0) {
            match kind {
                RequestKind::Accept | RequestKind::Read => e.read_q.push_back(rid),
                RequestKind::Connect | RequestKind::Write => e.write_q.push_back(rid),
            }
        }
        self.update_interest(h);
        Ok(())
    }

    // ---- timers -----------------------------------------------------------

    /// One-shot when `interval` is `None`; otherwise fires every `interval`
    /// after `delay`, `max_repeats` times (-1 = until cancelled).
    pub fn add_timer<F>(
        &mut self,
        delay: Duration,
        interval: Option<Duration>,
        max_repeats: i32,
        cb: F,
    ) -> Result<TimerId>
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.timers.insert(Box::new(cb), delay, interval, max_repeats)
    }

    /// True if the timer was live. A timer cancelled from inside its own
    /// callback will not fire again.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    // ---- the loop ---------------------------------------------------------

    /// Run until [`stop`](Self::stop). Callbacks run on this thread, between
    /// dispatches; a reactor that is already running reports `ReactorBusy`.
    pub fn run(&mut self) -> Result<()> {
        if self.state == ReactorState::Running {
            return Err(EngineError::ReactorBusy);
        }
        self.state = ReactorState::Running;
        einfo!("reactor loop entered");
        let mut events = vec![
            libc::epoll_event { events: 0, u64: 0 };
            EVENT_BATCH
        ];
        while self.state == ReactorState::Running {
            self.drain_injected();
            self.process_deferred();
            self.fire_due_timers();
            self.process_deferred();
            if self.state != ReactorState::Running {
                break;
            }
            let timeout = self.poll_timeout_ms();
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), EVENT_BATCH as i32, timeout)
            };
            if n < 0 {
                let err = last_os_error();
                if err == -libc::EINTR {
                    continue;
                }
                self.state = ReactorState::Stopped;
                eerror!("epoll_wait failed: {}", err);
                return Err(EngineError::ReactorWait(err));
            }
            for ev in events.iter().take(n as usize) {
                let token = ev.u64;
                let bits = ev.events;
                if token == WAKE_TOKEN {
                    self.injector.drain_eventfd();
                    self.drain_injected();
                } else {
                    self.dispatch(token, bits);
                }
                self.process_deferred();
            }
        }
        self.drain_injected();
        self.process_deferred();
        self.state = ReactorState::Stopped;
        einfo!("reactor loop exited");
        Ok(())
    }

    /// Ask the loop to exit after the current dispatch round. Safe from
    /// callbacks; from other threads use [`waker`](Self::waker) and call
    /// this inside the posted closure.
    pub fn stop(&mut self) {
        if self.state == ReactorState::Running {
            self.state = ReactorState::Stopping;
        }
        self.injector.wake();
    }

    fn poll_timeout_ms(&mut self) -> i32 {
        match self.timers.next_deadline() {
            None => -1,
            Some(dl) => {
                let now = Instant::now();
                if dl <= now {
                    0
                } else {
                    // round up so the deadline is past when the wait returns
                    let ms = (dl - now).as_millis().min(i32::MAX as u128 - 1) as i32;
                    ms + 1
                }
            }
        }
    }

    fn drain_injected(&mut self) {
        let inj = Arc::clone(&self.injector);
        while let Some(f) = inj.queue.pop() {
            f(self);
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((id, mut cb)) = self.timers.pop_due(now) {
            cb(self);
            self.timers.finish_fire(id, cb, Instant::now());
        }
    }

    fn check_idle(&mut self, h: HandleId) {
        let max = match self.handles.get(h.0) {
            Some(e) if e.is_open() => match &e.idle {
                Some(idle) => idle.max,
                None => return,
            },
            _ => return,
        };
        let elapsed = match self.handles.get(h.0) {
            Some(e) => e.last_activity.elapsed(),
            None => return,
        };
        if elapsed < max {
            return;
        }
        let cb = self.handles.get_mut(h.0).and_then(|e| e.on_timeout.take());
        let action = match cb {
            Some(mut cb) => {
                let action = cb(self, h);
                if let Some(e) = self.handles.get_mut(h.0) {
                    if e.on_timeout.is_none() {
                        e.on_timeout = Some(cb);
                    }
                }
                action
            }
            None => TimeoutAction::Close,
        };
        if action == TimeoutAction::Close {
            edebug!("handle {:?} idle past {:?}, closing", h.0, max);
            self.close(h);
        }
    }

    // ---- deferred work ----------------------------------------------------

    /// Delivery order per pass: submission-time results, then cancellations,
    /// then close finalizations. A close callback therefore never precedes
    /// any completion of its own handle.
    fn process_deferred(&mut self) {
        loop {
            if let Some(rid) = self.pending_ready.pop_front() {
                let err = self.requests.get(rid).map(|r| r.error).unwrap_or(0);
                self.finish_request(rid, 0, err, None);
                continue;
            }
            if let Some(rid) = self.pending_cancel.pop_front() {
                self.finish_request(rid, 0, CANCELED, None);
                continue;
            }
            if let Some(h) = self.pending_close.pop_front() {
                self.finalize_close(h);
                continue;
            }
            break;
        }
    }

    fn finalize_close(&mut self, h: HandleId) {
        let leftover: Vec<SlotId> = match self.handles.get_mut(h.0) {
            Some(e) if e.state == HandleState::Closing => {
                if e.outstanding() > 0 {
                    e.read_q.drain(..).chain(e.write_q.drain(..)).collect()
                } else {
                    Vec::new()
                }
            }
            _ => return,
        };
        if !leftover.is_empty() {
            for rid in leftover {
                self.pending_cancel.push_back(rid);
            }
            self.pending_close.push_back(h);
            return;
        }
        if let Some(e) = self.handles.get_mut(h.0) {
            e.state = HandleState::Closed;
            let fd = e.sock.fd();
            if let Transport::Tls(sess) = &mut e.transport {
                sess.send_close_notify(fd);
            }
            let mut ev = libc::epoll_event { events: 0, u64: 0 };
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev);
            }
        }
        // release drops the Socket, closing the fd
        let cb = match self.handles.release(h.0) {
            Some(mut e) => e.on_close.take(),
            None => None,
        };
        etrace!("handle {:?} closed", h.0);
        if let Some(cb) = cb {
            cb(self, h);
        }
    }

    /// Deliver exactly one completion for `rid` and recycle the slot.
    /// Safe to race with itself: the first caller takes the slot, later
    /// callers find it stale and do nothing.
    fn finish_request(&mut self, rid: SlotId, len: usize, error: i32, accepted: Option<Accepted>) {
        let mut req = match self.requests.release(rid) {
            Some(req) => req,
            None => return,
        };
        if let Some(e) = self.handles.get_mut(req.handle.0) {
            e.read_q.retain(|r| *r != rid);
            e.write_q.retain(|r| *r != rid);
            if error == 0 {
                e.touch();
            }
        }
        let cb = req.call.take();
        let done = Completion {
            handle: req.handle,
            kind: req.kind,
            buf: std::mem::take(&mut req.buf),
            len,
            error,
            accepted,
        };
        if let Some(cb) = cb {
            cb(self, done);
        }
    }

    // ---- readiness dispatch -----------------------------------------------

    fn dispatch(&mut self, token: u64, bits: u32) {
        let h = id_of(token);
        if self.handles.get(h.0).is_none() {
            return;
        }
        let err_bits = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        if bits & err_bits != 0 {
            // With nothing queued to consume the condition, level-triggered
            // epoll would redeliver it on every wait.
            let stuck = match self.handles.get(h.0) {
                Some(e) => e.is_open() && e.outstanding() == 0 && !e.connect_pending,
                None => false,
            };
            if stuck {
                edebug!("handle {:?} hung up with no requests, closing", h.0);
                self.close(h);
                return;
            }
        }
        let writable = bits & (libc::EPOLLOUT as u32 | err_bits) != 0;
        let readable = bits & (libc::EPOLLIN as u32 | err_bits) != 0;
        if writable {
            if let Some(e) = self.handles.get_mut(h.0) {
                let fd = e.sock.fd();
                if let Transport::Tls(sess) = &mut e.transport {
                    let _ = sess.flush(fd);
                }
            }
            self.drive_write(h);
        }
        if readable {
            self.drive_read(h);
        }
        self.update_interest(h);
    }

    fn drive_read(&mut self, h: HandleId) {
        loop {
            let rid = match self.handles.get(h.0) {
                Some(e) if e.is_open() => match e.read_q.front() {
                    Some(&rid) => rid,
                    None => return,
                },
                _ => return,
            };
            let kind = match self.requests.get(rid) {
                Some(r) => r.kind,
                None => {
                    if let Some(e) = self.handles.get_mut(h.0) {
                        e.read_q.pop_front();
                    }
                    continue;
                }
            };
            match kind {
                RequestKind::Accept => {
                    let res = match self.handles.get(h.0) {
                        Some(e) => e.sock.accept(),
                        None => return,
                    };
                    match res {
                        Ok((sock, peer)) => {
                            let tls = self.handles.get(h.0).and_then(|e| e.tls.clone());
                            if let Some(e) = self.handles.get_mut(h.0) {
                                e.read_q.pop_front();
                            }
                            let acc = Accepted {
                                socket: sock,
                                peer,
                                tls,
                            };
                            self.finish_request(rid, 0, 0, Some(acc));
                        }
                        Err(e) if e == -libc::EAGAIN || e == -libc::EWOULDBLOCK => return,
                        Err(e) if e == -libc::EINTR || e == -libc::ECONNABORTED => continue,
                        Err(e) => {
                            if let Some(entry) = self.handles.get_mut(h.0) {
                                entry.read_q.pop_front();
                            }
                            self.finish_request(rid, 0, e, None);
                        }
                    }
                }
                RequestKind::Read => {
                    let n = {
                        let e = match self.handles.get_mut(h.0) {
                            Some(e) => e,
                            None => return,
                        };
                        let r = match self.requests.get_mut(rid) {
                            Some(r) => r,
                            None => return,
                        };
                        let fd = e.sock.fd();
                        match &mut e.transport {
                            Transport::Plain => e.sock.read(&mut r.buf),
                            Transport::Tls(sess) => sess.read_into(fd, &mut r.buf),
                        }
                    };
                    if n >= 0 {
                        if let Some(e) = self.handles.get_mut(h.0) {
                            e.read_q.pop_front();
                        }
                        self.finish_request(rid, n as usize, 0, None);
                    } else if n == -(libc::EAGAIN as isize) || n == -(libc::EWOULDBLOCK as isize) {
                        return;
                    } else if n == -(libc::EINTR as isize) {
                        continue;
                    } else {
                        if let Some(e) = self.handles.get_mut(h.0) {
                            e.read_q.pop_front();
                        }
                        self.finish_request(rid, 0, n as i32, None);
                    }
                }
                _ => {
                    if let Some(e) = self.handles.get_mut(h.0) {
                        e.read_q.pop_front();
                    }
                    self.finish_request(rid, 0, -libc::EINVAL, None);
                }
            }
        }
    }

    fn drive_write(&mut self, h: HandleId) {
        loop {
            let (connect_pending, rid) = match self.handles.get(h.0) {
                Some(e) if e.is_open() => (e.connect_pending, e.write_q.front().copied()),
                _ => return,
            };
            if connect_pending {
                let err = match self.handles.get_mut(h.0) {
                    Some(e) => {
                        e.connect_pending = false;
                        e.sock.take_error()
                    }
                    None => return,
                };
                if let Some(rid) = rid {
                    if self.requests.get(rid).map(|r| r.kind) == Some(RequestKind::Connect) {
                        if let Some(e) = self.handles.get_mut(h.0) {
                            e.write_q.pop_front();
                        }
                        self.finish_request(rid, 0, err, None);
                    }
                }
                continue;
            }
            let rid = match rid {
                Some(rid) => rid,
                None => return,
            };
            let kind = match self.requests.get(rid) {
                Some(r) => r.kind,
                None => {
                    if let Some(e) = self.handles.get_mut(h.0) {
                        e.write_q.pop_front();
                    }
                    continue;
                }
            };
            match kind {
                RequestKind::Connect => {
                    // EINPROGRESS already resolved above; anything left here
                    // became writable without an error pending
                    if let Some(e) = self.handles.get_mut(h.0) {
                        e.write_q.pop_front();
                    }
                    self.finish_request(rid, 0, 0, None);
                }
                RequestKind::Write => {
                    let step = {
                        let e = match self.handles.get_mut(h.0) {
                            Some(e) => e,
                            None => return,
                        };
                        let r = match self.requests.get_mut(rid) {
                            Some(r) => r,
                            None => return,
                        };
                        if r.len >= r.buf.len() {
                            None
                        } else {
                            let fd = e.sock.fd();
                            let chunk = &r.buf[r.len..];
                            Some(match &mut e.transport {
                                Transport::Plain => e.sock.write(chunk),
                                Transport::Tls(sess) => sess.write_from(fd, chunk),
                            })
                        }
                    };
                    match step {
                        None => {
                            let sent = self.requests.get(rid).map(|r| r.len).unwrap_or(0);
                            if let Some(e) = self.handles.get_mut(h.0) {
                                e.write_q.pop_front();
                            }
                            self.finish_request(rid, sent, 0, None);
                        }
                        Some(n) if n > 0 => {
                            let done = match self.requests.get_mut(rid) {
                                Some(r) => {
                                    r.len += n as usize;
                                    r.len >= r.buf.len()
                                }
                                None => return,
                            };
                            if done {
                                let sent = self.requests.get(rid).map(|r| r.len).unwrap_or(0);
                                if let Some(e) = self.handles.get_mut(h.0) {
                                    e.write_q.pop_front();
                                }
                                self.finish_request(rid, sent, 0, None);
                            }
                        }
                        Some(n)
                            if n == 0
                                || n == -(libc::EAGAIN as isize)
                                || n == -(libc::EWOULDBLOCK as isize) =>
                        {
                            return;
                        }
                        Some(n) if n == -(libc::EINTR as isize) => continue,
                        Some(n) => {
                            let sent = self.requests.get(rid).map(|r| r.len).unwrap_or(0);
                            if let Some(e) = self.handles.get_mut(h.0) {
                                e.write_q.pop_front();
                            }
                            self.finish_request(rid, sent, n as i32, None);
                        }
                    }
                }
                _ => {
                    if let Some(e) = self.handles.get_mut(h.0) {
                        e.write_q.pop_front();
                    }
                    self.finish_request(rid, 0, -libc::EINVAL, None);
                }
            }
        }
    }

    // ---- epoll bookkeeping ------------------------------------------------

    fn register(&mut self, h: HandleId) -> Result<()> {
        let (fd, want) = match self.handles.get(h.0) {
            Some(e) => (e.sock.fd(), e.wanted_interest()),
            None => return Err(EngineError::HandleClosed),
        };
        let mut ev = libc::epoll_event {
            events: want,
            u64: token_of(h),
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
            return Err(EngineError::Os(last_os_error()));
        }
        if let Some(e) = self.handles.get_mut(h.0) {
            e.registered = want;
        }
        Ok(())
    }

    /// Recompute interest from the queues and MOD the registration only
    /// when it changed.
    fn update_interest(&mut self, h: HandleId) {
        let (fd, want, cur) = match self.handles.get(h.0) {
            Some(e) if e.state != HandleState::Closed => {
                (e.sock.fd(), e.wanted_interest(), e.registered)
            }
            _ => return,
        };
        if want == cur {
            return;
        }
        let mut ev = libc::epoll_event {
            events: want,
            u64: token_of(h),
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) } < 0 {
            eerror!("epoll interest update failed: {}", last_os_error());
            return;
        }
        if let Some(e) = self.handles.get_mut(h.0) {
            e.registered = want;
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::from_env()
    }

    fn loopback() -> NetAddress {
        NetAddress::loopback(0)
    }

    #[test]
    fn listener_opens_and_reports_bound_addr() {
        let mut re = Reactor::new(&config()).unwrap();
        let h = re.open_listener(&loopback(), 16, None).unwrap();
        assert_eq!(re.handle_state(h), Some(HandleState::Open));
        assert_ne!(re.local_addr(h).unwrap().port(), 0);
    }

    #[test]
    fn submissions_rejected_after_close() {
        let mut re = Reactor::new(&config()).unwrap();
        let h = re.open_listener(&loopback(), 16, None).unwrap();
        re.close(h);
        assert_eq!(re.handle_state(h), Some(HandleState::Closing));
        let res = re.submit_accept(h, |_, _| {});
        assert!(matches!(res, Err(EngineError::HandleClosed)));
        // idempotent
        re.close(h);
        re.close(h);
    }

    #[test]
    fn request_pool_exhaustion_is_an_error() {
        let mut cfg = config();
        cfg.max_requests = 1;
        let mut re = Reactor::new(&cfg).unwrap();
        let h = re.open_listener(&loopback(), 16, None).unwrap();
        re.submit_accept(h, |_, _| {}).unwrap();
        let res = re.submit_accept(h, |_, _| {});
        assert!(matches!(res, Err(EngineError::PoolExhausted)));
    }

    #[test]
    fn waker_reports_queue_full() {
        let mut cfg = config();
        cfg.max_queued_tasks = 1;
        let re = Reactor::new(&cfg).unwrap();
        let w = re.waker();
        w.post(|_| {}).unwrap();
        let res = w.post(|_| {});
        assert!(matches!(res, Err(EngineError::QueueFull)));
    }

    #[test]
    fn token_round_trips_handle_id() {
        let id = HandleId(SlotId::from_raw(42, 7));
        assert_eq!(id_of(token_of(id)), id);
    }

    #[test]
    fn read_buffer_follows_config() {
        let mut cfg = config();
        cfg.read_buf_size = 512;
        let re = Reactor::new(&cfg).unwrap();
        assert_eq!(re.read_buf_size, 512);
    }

    // ---- end-to-end over loopback ----------------------------------------

    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Stops the loop if a test wedges, so failures show up as assertions
    /// rather than hangs.
    fn arm_failsafe(re: &mut Reactor) {
        re.add_timer(Duration::from_secs(5), None, 1, |re| re.stop())
            .unwrap();
    }

    #[test]
    fn echo_round_trip_over_loopback() {
        let mut re = Reactor::new(&config()).unwrap();
        let lh = re.open_listener(&loopback(), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap();

        let server_got = Rc::new(RefCell::new(Vec::new()));
        let sg = Rc::clone(&server_got);
        re.submit_accept(lh, move |re, done| {
            assert!(done.is_ok());
            let sh = re.adopt_accepted(done.accepted.unwrap()).unwrap();
            re.submit_read(sh, move |re, done| {
                assert!(done.is_ok());
                let data = done.data().to_vec();
                sg.borrow_mut().extend_from_slice(&data);
                re.submit_write(sh, data, move |re, done| {
                    assert!(done.is_ok());
                    re.close(sh);
                })
                .unwrap();
            })
            .unwrap();
        })
        .unwrap();

        let client_got = Rc::new(RefCell::new(Vec::new()));
        let cg = Rc::clone(&client_got);
        re.open_stream(&addr, move |re, done| {
            assert!(done.is_ok());
            let ch = done.handle;
            re.submit_write(ch, b"ping".to_vec(), move |re, done| {
                assert!(done.is_ok());
                assert_eq!(done.len, 4);
                re.submit_read(ch, move |re, done| {
                    assert!(done.is_ok());
                    cg.borrow_mut().extend_from_slice(done.data());
                    re.close(ch);
                    re.stop();
                })
                .unwrap();
            })
            .unwrap();
        })
        .unwrap();

        arm_failsafe(&mut re);
        re.run().unwrap();
        assert_eq!(&*server_got.borrow(), b"ping");
        assert_eq!(&*client_got.borrow(), b"ping");
    }

    #[test]
    fn close_delivers_cancellations_before_close_callback() {
        let mut re = Reactor::new(&config()).unwrap();
        let lh = re.open_listener(&loopback(), 16, None).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        re.submit_accept(lh, move |_, done| {
            assert_eq!(done.error, CANCELED);
            o.borrow_mut().push("cancel");
        })
        .unwrap();
        let o = Rc::clone(&order);
        re.set_close_callback(lh, move |re, _| {
            o.borrow_mut().push("close");
            re.stop();
        })
        .unwrap();
        re.close(lh);
        arm_failsafe(&mut re);
        re.run().unwrap();
        assert_eq!(&*order.borrow(), &["cancel", "close"]);
    }

    #[test]
    fn peer_close_reads_as_eof_not_error() {
        let mut re = Reactor::new(&config()).unwrap();
        let lh = re.open_listener(&loopback(), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap();
        let saw_eof = Rc::new(Cell::new(false));
        let flag = Rc::clone(&saw_eof);
        re.submit_accept(lh, move |re, done| {
            let sh = re.adopt_accepted(done.accepted.unwrap()).unwrap();
            re.submit_read(sh, move |re, done| {
                assert!(done.is_peer_closed());
                flag.set(true);
                re.close(sh);
                re.stop();
            })
            .unwrap();
        })
        .unwrap();
        let client = std::net::TcpStream::connect(addr.as_socket_addr()).unwrap();
        drop(client);
        arm_failsafe(&mut re);
        re.run().unwrap();
        assert!(saw_eof.get());
    }

    #[test]
    fn hangup_with_no_requests_closes_the_handle() {
        use std::os::unix::io::AsRawFd;
        let mut re = Reactor::new(&config()).unwrap();
        let lh = re.open_listener(&loopback(), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap();
        let closed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed);
        re.submit_accept(lh, move |re, done| {
            let sh = re.adopt_accepted(done.accepted.unwrap()).unwrap();
            // no read armed; only the error condition can surface this peer
            re.set_close_callback(sh, move |re, _| {
                flag.set(true);
                re.stop();
            })
            .unwrap();
        })
        .unwrap();
        let client = std::net::TcpStream::connect(addr.as_socket_addr()).unwrap();
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                client.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
        // RST instead of FIN
        drop(client);
        arm_failsafe(&mut re);
        re.run().unwrap();
        assert!(closed.get());
    }

    #[test]
    fn idle_timeout_closes_a_silent_stream() {
        let mut re = Reactor::new(&config()).unwrap();
        let lh = re.open_listener(&loopback(), 16, None).unwrap();
        let addr = re.local_addr(lh).unwrap();
        let closed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed);
        re.submit_accept(lh, move |re, done| {
            let sh = re.adopt_accepted(done.accepted.unwrap()).unwrap();
            re.set_timeout(
                sh,
                Duration::from_millis(10),
                Duration::from_millis(25),
                -1,
                |_, _| TimeoutAction::Close,
            )
            .unwrap();
            re.set_close_callback(sh, move |re, _| {
                flag.set(true);
                re.stop();
            })
            .unwrap();
        })
        .unwrap();
        let _client = std::net::TcpStream::connect(addr.as_socket_addr()).unwrap();
        arm_failsafe(&mut re);
        re.run().unwrap();
        assert!(closed.get());
    }

    #[test]
    fn waker_reaches_a_running_reactor() {
        let mut re = Reactor::new(&config()).unwrap();
        let w = re.waker();
        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            w.post(|re| re.stop()).unwrap();
        });
        arm_failsafe(&mut re);
        re.run().unwrap();
        poster.join().unwrap();
        assert_eq!(re.state(), ReactorState::Stopped);
    }
}
