//! The single-threaded executor that defines a tick.
//!
//! [`Runtime::block_on`] alternates between the main future and the
//! scheduler's background tasks. Only when neither can make progress does it
//! run the scheduler's deferred callbacks, which is what makes a tick "after
//! the current synchronous code and every ready continuation". If no drain is
//! pending either, the thread parks until some waker fires.

use futures::task::waker_ref;
use std::future::{Future, poll_fn};
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crate::scheduler::{self, DeferredError, Scheduler};
use crate::waker::ThreadNotify;

pub struct Runtime {
    scheduler: Scheduler,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The scheduler to hand to [`Rc`](crate::Rc) and [`Used`](crate::Used).
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Spawns a background task; see [`Scheduler::spawn_local`].
    pub fn spawn_local<F>(&self, future: F)
    where
        F: Future<Output = Result<(), DeferredError>> + 'static,
    {
        self.scheduler.spawn_local(future);
    }

    /// Blocks the current thread until `future` completes, running background
    /// tasks and ticks in between.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);

        let notify = Arc::new(ThreadNotify::new());
        let waker = waker_ref(&notify);
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                tracing::trace!("main future completed");
                return output;
            }

            loop {
                self.scheduler.run_background();
                if notify.take_wakeup() {
                    break;
                }
                if self.scheduler.is_drain_scheduled() {
                    self.scheduler.run_tick();
                    continue;
                }
                tracing::trace!("runtime parked");
                thread::park();
            }
        }
    }
}

/// Move-based builder for [`Runtime`].
#[derive(Default)]
pub struct Builder {
    scheduler: scheduler::Builder,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the default `tracing` reporter of the runtime's scheduler.
    pub fn reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn(&DeferredError) + 'static,
    {
        self.scheduler = self.scheduler.reporter(reporter);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            scheduler: self.scheduler.build(),
        }
    }
}

/// Yields once, letting every other ready task run first.
pub async fn yield_now() {
    let mut yielded = false;
    poll_fn(move |cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}
