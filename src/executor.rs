//! The executor contract and a small worker pool.
//!
//! The library consumes executors through the [`Executor`] trait: submit a
//! callable, receive nothing back. No receipt is needed because every
//! submitted task drives a completion cell of its own; the framework never
//! tracks the submission itself.
//!
//! [`ThreadPoolExecutor`] is the bundled implementation: worker threads are
//! spawned lazily up to a bound, park on a condvar when the run queue is
//! empty, and drain the queue before exiting on shutdown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use core::fmt;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

/// A task submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Submits callables for execution on some other thread.
pub trait Executor: Send + Sync + 'static {
    /// Submits `task` for eventual execution.
    ///
    /// Implementations may run the task at any later point, on any thread;
    /// after shutdown they may run it inline on the submitting thread.
    fn execute(&self, task: Task);
}

/// A fixed-bound worker pool backed by a lock-free run queue.
pub struct ThreadPoolExecutor {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Work queue.
    queue: SegQueue<Task>,
    /// Mutex for the parking condvar.
    mutex: Mutex<()>,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Shutdown flag; workers drain the queue and exit once set.
    shutdown: AtomicBool,
    /// Number of spawned workers.
    active: AtomicUsize,
    /// Number of workers currently parked.
    idle: AtomicUsize,
    /// Maximum number of workers.
    max_threads: usize,
    /// Thread name prefix.
    name: String,
    /// Worker join handles for shutdown.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// Creates a pool that will spawn at most `max_threads` workers.
    ///
    /// Workers are spawned on demand; an idle pool holds no threads.
    #[must_use]
    pub fn new(max_threads: usize) -> Self {
        Self::with_name("eventually-worker", max_threads)
    }

    /// Creates a pool whose worker threads carry the given name prefix.
    #[must_use]
    pub fn with_name(name: &str, max_threads: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue: SegQueue::new(),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                max_threads: max_threads.max(1),
                name: name.to_owned(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signals shutdown and joins all workers.
    ///
    /// Queued tasks are drained before the workers exit. Tasks submitted
    /// after shutdown run inline on the submitting thread.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.inner.mutex.lock();
            self.inner.condvar.notify_all();
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }

    /// Number of worker threads currently spawned.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn maybe_spawn(&self) {
        let inner = &self.inner;
        if inner.idle.load(Ordering::Acquire) > 0 {
            let _guard = inner.mutex.lock();
            inner.condvar.notify_one();
            return;
        }
        loop {
            let active = inner.active.load(Ordering::Acquire);
            if active >= inner.max_threads {
                // All workers busy; one of them will pick the task up.
                let _guard = inner.mutex.lock();
                inner.condvar.notify_one();
                return;
            }
            if inner
                .active
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let worker = Arc::clone(inner);
        let name = format!("{}-{}", inner.name, inner.active.load(Ordering::Relaxed));
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&worker));
        match spawned {
            Ok(handle) => inner.handles.lock().push(handle),
            Err(error) => {
                inner.active.fetch_sub(1, Ordering::AcqRel);
                tracing::error!(%error, "failed to spawn worker thread");
            }
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        if let Some(task) = inner.queue.pop() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                drop(payload);
                tracing::error!("executor task panicked");
            }
            continue;
        }
        let mut guard = inner.mutex.lock();
        // Re-check under the lock so a submit between pop and park is seen.
        if !inner.queue.is_empty() {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        inner.idle.fetch_add(1, Ordering::AcqRel);
        inner.condvar.wait(&mut guard);
        inner.idle.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            task();
            return;
        }
        self.inner.queue.push(task);
        self.maybe_spawn();
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("max_threads", &self.inner.max_threads)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .field("idle", &self.inner.idle.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Signal only; joining here could deadlock a worker dropping the pool.
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }
}
