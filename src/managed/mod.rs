//! Reference-counted resources with asynchronous setup and teardown.
//!
//! A [`Managed`] wraps a heavy resource behind an async lifecycle:
//! `start` runs the user's setup and makes the value borrowable once it
//! resolves; `borrow` hands out [`Borrowed`] guards that release on drop;
//! `stop` refuses new borrows and runs the user's teardown once the last
//! guard is gone. [`ReloadableManaged`] adds an atomic swap: a fresh value
//! is constructed, installed in place of the old one, and the old one is
//! torn down as soon as its borrows drain.
//!
//! # Lifecycle
//!
//! ```text
//! Initial -> Starting -> Started -> Stopping -> Stopped
//! ```
//!
//! Borrows are only served in `Started`. Setup failure or cancellation
//! moves straight to `Stopped`; the start future carries the outcome.
//!
//! # Lock Discipline
//!
//! Reference counts mutate only under the lifecycle lock, and every guard
//! drops its generation handle inside that lock. The guard that takes the
//! count to zero therefore holds the only remaining handle, which is what
//! lets teardown claim the value by unwrapping it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use core::fmt;
use core::ops::Deref;
use parking_lot::Mutex;

use crate::caller::Caller;
use crate::future::Eventual;
use crate::types::Completion;

/// User-provided setup and teardown for a managed resource.
pub trait ManagedSetup<T, E>: Send + Sync + 'static {
    /// Constructs the resource.
    fn construct(&self) -> Eventual<T, E>;

    /// Destroys the resource once no borrows remain.
    fn destruct(&self, value: T) -> Eventual<(), E>;
}

/// Error returned when a borrow cannot be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowError {
    /// The managed reference has not finished starting.
    NotStarted,
    /// The managed reference is stopping or stopped.
    Stopped,
}

impl fmt::Display for BorrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "managed reference is not started"),
            Self::Stopped => write!(f, "managed reference has stopped"),
        }
    }
}

impl std::error::Error for BorrowError {}

/// One constructed value plus its borrow count.
///
/// `refs` and `retired` are guarded by the owning [`Shared`]'s lifecycle
/// lock; the atomics only make the struct shareable.
struct Generation<T, E> {
    value: T,
    refs: AtomicUsize,
    retired: AtomicBool,
    /// Completes when this generation's teardown finishes.
    drained: Eventual<(), E>,
}

enum Lifecycle<T, E> {
    Initial,
    Starting,
    Started(Arc<Generation<T, E>>),
    Stopping,
    Stopped,
}

impl<T, E> Lifecycle<T, E> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Starting => "starting",
            Self::Started(_) => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

struct Shared<T, E> {
    setup: Box<dyn ManagedSetup<T, E>>,
    caller: Arc<dyn Caller>,
    state: Mutex<Lifecycle<T, E>>,
    start_future: Eventual<(), E>,
    stop_future: Eventual<(), E>,
}

/// A reference-counted resource with async setup and teardown.
///
/// Handles are cheaply cloneable and share one lifecycle.
pub struct Managed<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Managed<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> fmt::Debug for Managed<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("state", &self.shared.state.lock().name())
            .finish()
    }
}

impl<T, E> Managed<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(setup: impl ManagedSetup<T, E>, caller: Arc<dyn Caller>) -> Self {
        Self {
            shared: Arc::new(Shared {
                setup: Box::new(setup),
                start_future: Eventual::pending(Arc::clone(&caller)),
                stop_future: Eventual::pending(Arc::clone(&caller)),
                caller,
                state: Mutex::new(Lifecycle::Initial),
            }),
        }
    }

    /// Starts the resource, invoking the user setup on first call.
    ///
    /// The returned value completes when setup does; repeated calls return
    /// the same value.
    pub fn start(&self) -> Eventual<(), E> {
        let begin = {
            let mut state = self.shared.state.lock();
            if matches!(&*state, Lifecycle::Initial) {
                *state = Lifecycle::Starting;
                true
            } else {
                false
            }
        };
        if begin {
            tracing::debug!("starting managed reference");
            let constructed = self.shared.setup.construct();
            let shared = Arc::clone(&self.shared);
            constructed.on_done(move |completion| Shared::constructed(&shared, completion));
        }
        self.shared.start_future.clone()
    }

    /// Borrows the value, incrementing the reference count.
    ///
    /// Fails unless the reference is `Started`; after `stop`, borrows are
    /// refused.
    pub fn borrow(&self) -> Result<Borrowed<T, E>, BorrowError> {
        let state = self.shared.state.lock();
        match &*state {
            Lifecycle::Started(generation) => {
                generation.refs.fetch_add(1, Ordering::AcqRel);
                Ok(Borrowed {
                    generation: Some(Arc::clone(generation)),
                    shared: Arc::clone(&self.shared),
                })
            }
            Lifecycle::Initial | Lifecycle::Starting => Err(BorrowError::NotStarted),
            Lifecycle::Stopping | Lifecycle::Stopped => Err(BorrowError::Stopped),
        }
    }

    /// Stops the resource: refuses new borrows and tears the value down
    /// once the last outstanding borrow is released.
    ///
    /// The returned value completes when teardown does; repeated calls
    /// return the same value.
    pub fn stop(&self) -> Eventual<(), E> {
        let teardown = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, Lifecycle::Stopping) {
                Lifecycle::Started(generation) => {
                    generation.retired.store(true, Ordering::Release);
                    let shared = Arc::clone(&self.shared);
                    generation.drained.on_done(move |completion| {
                        *shared.state.lock() = Lifecycle::Stopped;
                        shared.stop_future.complete_with(completion);
                    });
                    if generation.refs.load(Ordering::Acquire) == 0 {
                        Some(generation)
                    } else {
                        // Outstanding guards own the generation now; the
                        // last release tears it down.
                        drop(generation);
                        None
                    }
                }
                Lifecycle::Initial => {
                    *state = Lifecycle::Stopped;
                    self.shared.stop_future.resolve(());
                    None
                }
                Lifecycle::Starting => {
                    // Setup is in flight; its completion handler sees
                    // Stopping and tears the fresh value down.
                    None
                }
                previous @ (Lifecycle::Stopping | Lifecycle::Stopped) => {
                    *state = previous;
                    None
                }
            }
        };
        if let Some(generation) = teardown {
            self.shared.teardown(generation);
        }
        self.shared.stop_future.clone()
    }

    /// Returns true if the reference is currently serving borrows.
    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(&*self.shared.state.lock(), Lifecycle::Started(_))
    }
}

impl<T, E> Shared<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    fn new_generation(&self, value: T) -> Arc<Generation<T, E>> {
        Arc::new(Generation {
            value,
            refs: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            drained: Eventual::pending(Arc::clone(&self.caller)),
        })
    }

    /// Handles the completion of the user setup.
    fn constructed(this: &Arc<Self>, completion: Completion<T, E>) {
        match completion {
            Completion::Resolved(value) => {
                let generation = this.new_generation(value);
                let late_stop = {
                    let mut state = this.state.lock();
                    if matches!(&*state, Lifecycle::Starting) {
                        *state = Lifecycle::Started(Arc::clone(&generation));
                        false
                    } else {
                        true
                    }
                };
                if late_stop {
                    // Stop raced the setup; the fresh value goes straight
                    // back down.
                    generation.retired.store(true, Ordering::Release);
                    let shared = Arc::clone(this);
                    generation.drained.on_done(move |completion| {
                        *shared.state.lock() = Lifecycle::Stopped;
                        shared.stop_future.complete_with(completion);
                    });
                    this.start_future.cancel();
                    this.teardown(generation);
                } else {
                    tracing::debug!("managed reference started");
                    this.start_future.resolve(());
                }
            }
            Completion::Failed(cause) => {
                this.settle_failed_start();
                tracing::debug!("managed setup failed");
                this.start_future.fail(cause);
            }
            Completion::Cancelled => {
                this.settle_failed_start();
                this.start_future.cancel();
            }
        }
    }

    /// Setup did not produce a value; the reference is finished. A stop
    /// that raced the setup gets its future completed here.
    fn settle_failed_start(&self) {
        let was_stopping = {
            let mut state = self.state.lock();
            let was_stopping = matches!(&*state, Lifecycle::Stopping);
            *state = Lifecycle::Stopped;
            was_stopping
        };
        if was_stopping {
            self.stop_future.resolve(());
        }
    }

    /// Releases one borrow; tears the generation down when it was the last
    /// borrow of a retired generation.
    fn release(&self, generation: Arc<Generation<T, E>>) {
        let teardown = {
            let _state = self.state.lock();
            let remaining = generation.refs.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 && generation.retired.load(Ordering::Acquire) {
                Some(generation)
            } else {
                // Dropped inside the lock so a concurrent zero-observation
                // sees every other handle already gone.
                drop(generation);
                None
            }
        };
        if let Some(generation) = teardown {
            self.teardown(generation);
        }
    }

    /// Runs the user teardown on a fully drained generation.
    ///
    /// The caller must hold the only handle to the generation.
    fn teardown(&self, generation: Arc<Generation<T, E>>) {
        match Arc::try_unwrap(generation) {
            Ok(generation) => {
                tracing::debug!("tearing down managed value");
                let drained = generation.drained;
                let stopped = self.setup.destruct(generation.value);
                stopped.on_done(move |completion| {
                    drained.complete_with(completion);
                });
            }
            Err(_) => {
                // Unreachable by the lock discipline above.
                tracing::error!("managed value still referenced at teardown");
            }
        }
    }

    /// Installs `generation` in place of the current one, retiring the old
    /// generation. Returns the old generation when it can be torn down
    /// immediately, and forwards its drain into `reloaded`. When the
    /// reference is not started, the fresh generation is handed back.
    #[allow(clippy::type_complexity)]
    fn swap_generation(
        &self,
        generation: Arc<Generation<T, E>>,
        reloaded: &Eventual<(), E>,
    ) -> Result<Option<Arc<Generation<T, E>>>, Arc<Generation<T, E>>> {
        let mut state = self.state.lock();
        match &*state {
            Lifecycle::Started(old) => {
                let old = Arc::clone(old);
                old.retired.store(true, Ordering::Release);
                *state = Lifecycle::Started(generation);
                let reloaded = reloaded.clone();
                old.drained.on_done(move |completion| {
                    reloaded.complete_with(completion);
                });
                if old.refs.load(Ordering::Acquire) == 0 {
                    Ok(Some(old))
                } else {
                    drop(old);
                    Ok(None)
                }
            }
            _ => Err(generation),
        }
    }
}

impl<T, E> Drop for Shared<T, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if matches!(state, Lifecycle::Started(_) | Lifecycle::Starting) {
            self.caller.sink().leaked("managed reference");
        }
    }
}

/// A borrowed managed value; releases its reference on drop.
pub struct Borrowed<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    generation: Option<Arc<Generation<T, E>>>,
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Deref for Borrowed<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        match &self.generation {
            Some(generation) => &generation.value,
            None => unreachable!("borrowed value accessed after release"),
        }
    }
}

impl<T, E> fmt::Debug for Borrowed<T, E>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Borrowed").field(&**self).finish()
    }
}

impl<T, E> Drop for Borrowed<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            self.shared.release(generation);
        }
    }
}

/// A managed reference whose value can be swapped atomically.
pub struct ReloadableManaged<T, E> {
    managed: Managed<T, E>,
}

impl<T, E> Clone for ReloadableManaged<T, E> {
    fn clone(&self) -> Self {
        Self {
            managed: self.managed.clone(),
        }
    }
}

impl<T, E> fmt::Debug for ReloadableManaged<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableManaged")
            .field("state", &self.managed.shared.state.lock().name())
            .finish()
    }
}

impl<T, E> Deref for ReloadableManaged<T, E> {
    type Target = Managed<T, E>;

    fn deref(&self) -> &Managed<T, E> {
        &self.managed
    }
}

impl<T, E> ReloadableManaged<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(setup: impl ManagedSetup<T, E>, caller: Arc<dyn Caller>) -> Self {
        Self {
            managed: Managed::new(setup, caller),
        }
    }

    /// Constructs a fresh value and swaps it in, stopping the old one.
    ///
    /// The returned value completes once the new value is installed and
    /// the old value's teardown has finished. Fails with the setup's cause
    /// if constructing the fresh value fails; cancelled if the reference
    /// is not started when the swap would happen.
    pub fn reload(&self) -> Eventual<(), E> {
        let shared = Arc::clone(&self.managed.shared);
        let reloaded: Eventual<(), E> = Eventual::pending(Arc::clone(&shared.caller));
        tracing::debug!("reloading managed reference");

        let constructed = shared.setup.construct();
        let target = reloaded.clone();
        constructed.on_done(move |completion| match completion {
            Completion::Resolved(value) => {
                let generation = shared.new_generation(value);
                match shared.swap_generation(generation, &target) {
                    Ok(Some(old)) => shared.teardown(old),
                    Ok(None) => {}
                    Err(fresh) => {
                        // Not started (or already stopping); the fresh
                        // value has no slot to occupy, so it goes straight
                        // back down.
                        shared.teardown(fresh);
                        target.cancel();
                    }
                }
            }
            Completion::Failed(cause) => {
                target.fail(cause);
            }
            Completion::Cancelled => {
                target.cancel();
            }
        });
        reloaded
    }
}
