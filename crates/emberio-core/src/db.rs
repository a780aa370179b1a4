//! Database connector pool collaborator.
//!
//! Out of the engine's core path, but it follows the same acquire/release
//! discipline as requests and handles: a bounded idle list behind a mutex,
//! `acquire` with a deadline, explicit `release`. Connector construction is
//! delegated to a factory so the pool knows nothing about wire protocols.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};

/// One pooled connection. Implementations wrap whatever driver handle the
/// application uses; the pool only tracks liveness.
pub trait Connector: Send {
    /// Cheap health probe; dead connectors are dropped instead of recycled.
    fn is_alive(&self) -> bool {
        true
    }
}

struct PoolState<C> {
    idle: VecDeque<C>,
    // connectors currently handed out
    outstanding: usize,
}

pub struct ConnectorPool<C: Connector> {
    state: Mutex<PoolState<C>>,
    available: Condvar,
    cap: usize,
    factory: Box<dyn Fn() -> Result<C> + Send + Sync>,
}

impl<C: Connector> ConnectorPool<C> {
    pub fn new(cap: usize, factory: impl Fn() -> Result<C> + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                outstanding: 0,
            }),
            available: Condvar::new(),
            cap: cap.max(1),
            factory: Box::new(factory),
        }
    }

    /// Take a connector, waiting up to `timeout` if the pool is at capacity
    /// with nothing idle. Returns `AcquireTimeout` past the deadline.
    pub fn acquire(&self, timeout: Duration) -> Result<C> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            while let Some(conn) = state.idle.pop_front() {
                if conn.is_alive() {
                    state.outstanding += 1;
                    return Ok(conn);
                }
                // dead connector: forget it, its slot frees up
            }
            if state.outstanding < self.cap {
                state.outstanding += 1;
                drop(state);
                return match (self.factory)() {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                        state.outstanding -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::AcquireTimeout);
            }
            let (guard, res) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if res.timed_out() && state.idle.is_empty() && state.outstanding >= self.cap {
                return Err(EngineError::AcquireTimeout);
            }
        }
    }

    /// Return a connector to the idle list and wake one waiter.
    pub fn release(&self, conn: C) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.outstanding -= 1;
        if conn.is_alive() {
            state.idle.push_back(conn);
        }
        self.available.notify_one();
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeConn {
        alive: bool,
    }

    impl Connector for FakeConn {
        fn is_alive(&self) -> bool {
            self.alive
        }
    }

    fn pool(cap: usize) -> ConnectorPool<FakeConn> {
        ConnectorPool::new(cap, || Ok(FakeConn { alive: true }))
    }

    #[test]
    fn acquire_release_cycle() {
        let p = pool(2);
        let a = p.acquire(Duration::from_millis(10)).unwrap();
        let b = p.acquire(Duration::from_millis(10)).unwrap();
        p.release(a);
        p.release(b);
        assert_eq!(p.idle_count(), 2);
        // recycled, not re-created
        let _c = p.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(p.idle_count(), 1);
    }

    #[test]
    fn acquire_times_out_at_capacity() {
        let p = pool(1);
        let held = p.acquire(Duration::from_millis(10)).unwrap();
        match p.acquire(Duration::from_millis(20)) {
            Err(EngineError::AcquireTimeout) => {}
            other => panic!("expected timeout, got {:?}", other.err()),
        }
        p.release(held);
        assert!(p.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn dead_connectors_are_dropped() {
        let p = pool(1);
        let mut c = p.acquire(Duration::from_millis(10)).unwrap();
        c.alive = false;
        p.release(c);
        assert_eq!(p.idle_count(), 0);
    }

    #[test]
    fn waiter_wakes_on_release() {
        let p = Arc::new(pool(1));
        let held = p.acquire(Duration::from_millis(10)).unwrap();
        let p2 = Arc::clone(&p);
        let waiter = std::thread::spawn(move || p2.acquire(Duration::from_secs(2)).is_ok());
        std::thread::sleep(Duration::from_millis(50));
        p.release(held);
        assert!(waiter.join().unwrap());
    }
}
