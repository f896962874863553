//! Deferred callbacks drained once per tick.
//!
//! The scheduler owns two queues. The first is a FIFO of zero-argument
//! callbacks that run together at the next tick, i.e. once the current
//! synchronous code and every task that is ready to make progress have
//! finished. The second is a [`LocalPool`] of background tasks, used for
//! work nobody awaits (a deferred asynchronous release, for example).
//!
//! Failures from either queue never reach a caller: they go to the
//! [`Reporter`] the scheduler was built with, which logs through `tracing`
//! unless a test or an embedding application injects its own.

use futures::channel::oneshot;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use pin_project::pin_project;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc as StdRc;
use std::task::{Context, Poll};

use crate::BoxError;

/// Failure raised by work that no caller is waiting on.
#[derive(Debug, thiserror::Error)]
pub enum DeferredError {
    #[error("error during object disposal")]
    Dispose(#[source] BoxError),

    #[error("error during async disposal")]
    AsyncDispose(#[source] BoxError),

    /// A wrapped future failed after every handle to it was dropped.
    #[error("unobserved failure of a dropped future")]
    Unobserved(#[source] BoxError),

    #[error("resource was still borrowed when its deferred release ran")]
    Busy,

    #[error("deferred callback panicked: {0}")]
    Panicked(String),
}

/// Diagnostic side channel for [`DeferredError`]s.
pub type Reporter = StdRc<dyn Fn(&DeferredError)>;

type Deferred = Box<dyn FnOnce() -> Result<(), DeferredError>>;

struct Shared {
    queue: RefCell<VecDeque<Deferred>>,
    drain_scheduled: Cell<bool>,
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    reporter: Reporter,
}

/// Handle to a deferred-callback queue and its background task pool.
///
/// Cloning is cheap; every clone refers to the same queues.
#[derive(Clone)]
pub struct Scheduler {
    shared: StdRc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates a scheduler that reports through `tracing::error!`.
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Appends `callback` to the queue and requests a tick if none is pending.
    pub fn schedule<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), DeferredError> + 'static,
    {
        self.shared.queue.borrow_mut().push_back(Box::new(callback));
        if !self.shared.drain_scheduled.replace(true) {
            tracing::trace!("drain scheduled");
        }
    }

    /// Whether a tick has been requested and not yet run.
    pub fn is_drain_scheduled(&self) -> bool {
        self.shared.drain_scheduled.get()
    }

    /// Number of callbacks waiting for the next tick.
    pub fn pending(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// Runs one tick: every queued callback, in enqueue order, including the
    /// ones enqueued by callbacks of this same tick. Returns how many ran.
    ///
    /// A failing or panicking callback is reported and does not stop the
    /// rest of the drain.
    pub fn run_tick(&self) -> usize {
        self.shared.drain_scheduled.set(false);

        let mut ran = 0;
        loop {
            // Capture the current length; the borrow ends before any callback
            // runs so that callbacks may schedule more work.
            let batch: Vec<Deferred> = {
                let mut queue = self.shared.queue.borrow_mut();
                let length = queue.len();
                queue.drain(..length).collect()
            };
            if batch.is_empty() {
                break;
            }

            for callback in batch {
                ran += 1;
                match panic::catch_unwind(AssertUnwindSafe(callback)) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => self.report(&error),
                    Err(payload) => self.report(&DeferredError::Panicked(panic_message(&*payload))),
                }
            }
        }

        // Anything scheduled during the drain already ran above.
        self.shared.drain_scheduled.set(false);
        tracing::trace!(ran, "tick drained");
        ran
    }

    /// Returns a future that resolves once the next tick has run.
    pub fn next_tick(&self) -> NextTick {
        let (sender, receiver) = oneshot::channel();
        self.schedule(move || {
            // The receiver may be gone; nobody is waiting then.
            let _ = sender.send(());
            Ok(())
        });
        NextTick { receiver }
    }

    /// Spawns a background task whose failure is reported, not returned.
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = Result<(), DeferredError>> + 'static,
    {
        let reporter = self.shared.reporter.clone();
        let task = async move {
            if let Err(error) = future.await {
                reporter(&error);
            }
        };
        if let Err(error) = self.shared.spawner.spawn_local(task) {
            tracing::error!(%error, "failed to spawn background task");
        }
    }

    /// Drives background tasks until none of them can make progress.
    ///
    /// Re-entrant calls from inside a background task are ignored.
    pub fn run_background(&self) {
        match self.shared.pool.try_borrow_mut() {
            Ok(mut pool) => pool.run_until_stalled(),
            Err(_) => tracing::trace!("background pool already running"),
        }
    }

    /// Sends `error` to the diagnostic channel.
    pub fn report(&self, error: &DeferredError) {
        (self.shared.reporter)(error);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("drain_scheduled", &self.is_drain_scheduled())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_reporter(error: &DeferredError) {
    match std::error::Error::source(error) {
        Some(source) => tracing::error!(%source, "{error}"),
        None => tracing::error!("{error}"),
    }
}

/// Move-based builder for [`Scheduler`].
#[derive(Default)]
pub struct Builder {
    reporter: Option<Reporter>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the default `tracing` reporter.
    pub fn reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&DeferredError) + 'static,
    {
        self.reporter = Some(StdRc::new(reporter));
        self
    }

    pub fn build(self) -> Scheduler {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let reporter: Reporter = match self.reporter {
            Some(reporter) => reporter,
            None => StdRc::new(log_reporter),
        };

        Scheduler {
            shared: StdRc::new(Shared {
                queue: RefCell::new(VecDeque::new()),
                drain_scheduled: Cell::new(false),
                pool: RefCell::new(pool),
                spawner,
                reporter,
            }),
        }
    }
}

/// Future returned by [`Scheduler::next_tick`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct NextTick {
    #[pin]
    receiver: oneshot::Receiver<()>,
}

impl Future for NextTick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A cancelled sender means the scheduler is gone, so no tick will
        // ever come; resolve rather than hang.
        self.project().receiver.poll(cx).map(|_| ())
    }
}
