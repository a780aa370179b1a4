//! Worker pool for blocking and CPU-bound work.
//!
//! Spawns N OS threads at creation. Workers dequeue boxed tasks from a
//! lock-free MPMC queue and run them to completion; a task that needs the
//! reactor posts its follow-up through a [`ReactorWaker`] it captured at
//! submission time. No dynamic scaling.
//!
//! [`ReactorWaker`]: crate::reactor::ReactorWaker

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use emberio_core::error::{EngineError, Result};
use emberio_core::ewarn;

type TaskFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Runs once on each worker thread as it starts (`true`) and again as it
/// exits (`false`). For thread-local setup like allocator arenas.
pub type ThreadHook = Arc<dyn Fn(usize, bool) + Send + Sync>;

struct PoolInner {
    /// Work queue: submitters → workers.
    queue: ArrayQueue<TaskFn>,
    /// Per-worker "currently parked" flags; `submit` wakes one.
    parked: Vec<AtomicBool>,
    /// Number of workers currently executing a task.
    active: AtomicUsize,
    /// Tasks executed, success or failure.
    executed: AtomicU64,
    shutdown: AtomicBool,
    hook: Option<ThreadHook>,
    total: usize,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool with `n` workers and room for `queue_depth` pending
    /// tasks.
    pub fn new(n: usize, queue_depth: usize) -> Self {
        Self::with_hook(n, queue_depth, None)
    }

    pub fn with_hook(n: usize, queue_depth: usize, hook: Option<ThreadHook>) -> Self {
        let n = n.max(1).min(64);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(queue_depth.max(1)),
            parked: (0..n).map(|_| AtomicBool::new(false)).collect(),
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            hook,
            total: n,
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("emberio-worker-{}", worker_id))
                .spawn(move || worker_loop(inner, worker_id))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerPool { inner, handles }
    }

    /// Default pool sizing: min(8, nproc/2), at least 2.
    pub fn auto_sized(queue_depth: usize) -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let n = (cpus / 2).max(2).min(8);
        Self::new(n, queue_depth)
    }

    /// Hand a task to the pool. Fails with
    /// [`EngineError::WorkerUnavailable`] when the pool is shutting down or
    /// the queue is full; the caller sheds or retries.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(EngineError::WorkerUnavailable);
        }
        self.inner
            .queue
            .push(Box::new(task))
            .map_err(|_| EngineError::WorkerUnavailable)?;
        // Wake one parked worker; busy workers pull from the queue on
        // their own
        for (i, h) in self.handles.iter().enumerate() {
            if self.inner.parked[i].swap(false, Ordering::SeqCst) {
                h.thread().unpark();
                break;
            }
        }
        Ok(())
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total_workers(&self) -> usize {
        self.inner.total
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Stop accepting tasks, let workers drain the queue, and join them.
    pub fn stop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for h in &self.handles {
            h.thread().unpark();
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    if let Some(hook) = &inner.hook {
        hook(worker_id, true);
    }
    loop {
        match inner.queue.pop() {
            Some(task) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = task() {
                    ewarn!("worker {} task failed: {}", worker_id, e);
                }
                inner.active.fetch_sub(1, Ordering::Relaxed);
                inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                // Drain fully before honoring shutdown
                if inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                inner.parked[worker_id].store(true, Ordering::SeqCst);
                // The short timeout covers a submit racing the empty pop
                thread::park_timeout(Duration::from_millis(1));
                inner.parked[worker_id].store(false, Ordering::SeqCst);
            }
        }
    }
    if let Some(hook) = &inner.hook {
        hook(worker_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_submitted_tasks() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut pool = WorkerPool::new(2, 16);
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(pool.executed(), 8);
    }

    #[test]
    fn rejects_when_queue_full() {
        // 1 worker parked on an in-flight task, depth-1 queue
        let gate = Arc::new(AtomicBool::new(false));
        let mut pool = WorkerPool::new(1, 1);
        let g = Arc::clone(&gate);
        pool.submit(move || {
            while !g.load(Ordering::SeqCst) {
                thread::park_timeout(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();
        // wait until the worker has taken the blocker off the queue
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.active_workers() == 0 && std::time::Instant::now() < deadline {
            thread::park_timeout(Duration::from_millis(1));
        }
        pool.submit(|| Ok(())).unwrap();
        let res = pool.submit(|| Ok(()));
        assert!(matches!(res, Err(EngineError::WorkerUnavailable)));
        gate.store(true, Ordering::SeqCst);
        pool.stop();
    }

    #[test]
    fn submit_wakes_a_parked_worker() {
        let mut pool = WorkerPool::new(2, 8);
        // let both workers reach their parked state
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            let parked = pool
                .inner
                .parked
                .iter()
                .filter(|p| p.load(Ordering::SeqCst))
                .count();
            if parked == 2 {
                break;
            }
            thread::park_timeout(Duration::from_millis(1));
        }
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        pool.submit(move || {
            while !g.load(Ordering::SeqCst) {
                thread::park_timeout(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();
        while pool.active_workers() == 0 && std::time::Instant::now() < deadline {
            thread::park_timeout(Duration::from_millis(1));
        }
        // exactly one worker took the task; the other stays down
        assert_eq!(pool.active_workers(), 1);
        gate.store(true, Ordering::SeqCst);
        pool.stop();
        assert_eq!(pool.executed(), 1);
    }

    #[test]
    fn rejects_after_shutdown() {
        let mut pool = WorkerPool::new(1, 4);
        pool.stop();
        let res = pool.submit(|| Ok(()));
        assert!(matches!(res, Err(EngineError::WorkerUnavailable)));
    }

    #[test]
    fn thread_hook_fires_on_start_and_exit() {
        let starts = Arc::new(AtomicU32::new(0));
        let exits = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&starts);
        let e = Arc::clone(&exits);
        let hook: ThreadHook = Arc::new(move |_, starting| {
            if starting {
                s.fetch_add(1, Ordering::SeqCst);
            } else {
                e.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut pool = WorkerPool::with_hook(3, 8, Some(hook));
        pool.stop();
        assert_eq!(starts.load(Ordering::SeqCst), 3);
        assert_eq!(exits.load(Ordering::SeqCst), 3);
    }
}
