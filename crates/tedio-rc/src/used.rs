//! Futures whose failure cannot go unnoticed.
//!
//! [`Used`] starts a fallible future on a [`Scheduler`] and remembers whether
//! anyone attached a failure handler to it. When the owning scope exits,
//! [`Used::dispose`] waits for the outcome: a failure nobody handled becomes
//! the disposal's own failure, while a handled one is swallowed.
//!
//! This covers the common mistake of starting two operations, awaiting the
//! first, and bailing out with `?` before ever looking at the second.

use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use pin_project::pin_project;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc as StdRc;
use std::task::{Context, Poll, ready};

use crate::scheduler::{DeferredError, Scheduler};

type Outcome<T, E> = Shared<LocalBoxFuture<'static, Result<T, E>>>;

#[derive(Default)]
struct State {
    /// Set for good once a failure handler is attached.
    caught: Cell<bool>,
    disposed: Cell<bool>,
    /// Every handle was dropped before the outcome was known.
    abandoned: Cell<bool>,
}

struct Inner<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    outcome: Outcome<T, E>,
    state: StdRc<State>,
    scheduler: Scheduler,
}

impl<T, E> Drop for Inner<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    fn drop(&mut self) {
        if self.state.disposed.get() || self.state.caught.get() {
            return;
        }
        match self.outcome.peek() {
            Some(Err(error)) => self
                .scheduler
                .report(&DeferredError::Unobserved(Box::new(error.clone()))),
            Some(Ok(_)) => {}
            // The driver task reports once the outcome arrives.
            None => self.state.abandoned.set(true),
        }
    }
}

/// A running fallible future, disposed of at scope exit.
pub struct Used<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    inner: StdRc<Inner<T, E>>,
}

impl<T, E> Used<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    /// Spawns `future` on `scheduler`, so it runs to completion whether or
    /// not anyone polls the returned handle.
    pub fn new<F>(future: F, scheduler: &Scheduler) -> Self
    where
        F: Future<Output = Result<T, E>> + 'static,
    {
        let outcome = future.boxed_local().shared();
        let state = StdRc::new(State::default());

        let driver = outcome.clone();
        let driver_state = state.clone();
        scheduler.spawn_local(async move {
            match driver.await {
                Err(error) if driver_state.abandoned.get() && !driver_state.caught.get() => {
                    Err(DeferredError::Unobserved(Box::new(error)))
                }
                _ => Ok(()),
            }
        });

        Self {
            inner: StdRc::new(Inner {
                outcome,
                state,
                scheduler: scheduler.clone(),
            }),
        }
    }

    /// Another handle to the same future, sharing its flags.
    pub(crate) fn alias(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Whether a failure handler was ever attached.
    pub fn is_caught(&self) -> bool {
        self.inner.state.caught.get()
    }

    fn mark_caught(&self) {
        if !self.inner.state.caught.replace(true) {
            tracing::trace!("failure of used future is observed");
        }
    }

    /// Waits for the outcome. Counts as handling the failure, since the
    /// caller receives it.
    pub fn result(&self) -> impl Future<Output = Result<T, E>> {
        self.mark_caught();
        self.inner.outcome.clone()
    }

    /// Continues with `on_ok` or `on_err`, whichever applies.
    pub fn then<U>(
        &self,
        on_ok: impl FnOnce(T) -> U,
        on_err: impl FnOnce(E) -> U,
    ) -> impl Future<Output = U> {
        self.mark_caught();
        let outcome = self.inner.outcome.clone();
        async move {
            match outcome.await {
                Ok(value) => on_ok(value),
                Err(error) => on_err(error),
            }
        }
    }

    /// Continues with `on_ok` on success. A failure passes through and is
    /// not considered handled.
    pub fn map<U>(&self, on_ok: impl FnOnce(T) -> U) -> impl Future<Output = Result<U, E>> {
        let outcome = self.inner.outcome.clone();
        async move { outcome.await.map(on_ok) }
    }

    /// Recovers from a failure with `on_err`.
    pub fn catch(&self, on_err: impl FnOnce(E) -> T) -> impl Future<Output = T> {
        self.mark_caught();
        let outcome = self.inner.outcome.clone();
        async move { outcome.await.unwrap_or_else(on_err) }
    }

    /// Runs `on_settled` once the outcome is known, passing the outcome on.
    pub fn finally<F: FnOnce()>(
        &self,
        on_settled: F,
    ) -> Finally<Shared<LocalBoxFuture<'static, Result<T, E>>>, F> {
        Finally {
            future: self.inner.outcome.clone(),
            on_settled: Some(on_settled),
        }
    }

    /// Waits for the outcome at scope exit.
    ///
    /// Fails with the future's error only if no failure handler was ever
    /// attached. The first disposal to receive the outcome answers for it;
    /// later ones resolve `Ok(())`. A disposal dropped before that leaves
    /// the failure to the unobserved-failure report.
    pub fn dispose(&self) -> impl Future<Output = Result<(), E>> {
        let caught = self.inner.state.caught.get();
        let state = self.inner.state.clone();
        let outcome = self.inner.outcome.clone();
        async move {
            if state.disposed.get() {
                return Ok(());
            }
            let outcome = outcome.await;
            if state.disposed.replace(true) {
                return Ok(());
            }
            match outcome {
                Err(error) if !caught => Err(error),
                _ => Ok(()),
            }
        }
    }
}

impl<T, E> fmt::Debug for Used<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Used")
            .field("caught", &self.inner.state.caught.get())
            .field("settled", &self.inner.outcome.peek().is_some())
            .finish()
    }
}

/// Future returned by [`Used::finally`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Finally<Fut, F> {
    #[pin]
    future: Fut,
    on_settled: Option<F>,
}

impl<Fut: Future, F: FnOnce()> Future for Finally<Fut, F> {
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.future.poll(cx));
        if let Some(on_settled) = this.on_settled.take() {
            on_settled();
        }
        Poll::Ready(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rc::tests::Failure;
    use crate::runtime::{Runtime, yield_now};
    use std::cell::RefCell;

    fn runtime() -> (Runtime, StdRc<RefCell<Vec<String>>>) {
        let reports = StdRc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        let runtime = Runtime::builder()
            .reporter(move |error| {
                let source = std::error::Error::source(error)
                    .map(|source| source.to_string())
                    .unwrap_or_default();
                sink.borrow_mut().push(format!("{error}: {source}"));
            })
            .build();
        (runtime, reports)
    }

    async fn fail_later(message: &'static str) -> Result<u32, Failure> {
        yield_now().await;
        Err(Failure(message))
    }

    #[test]
    fn test_result_marks_caught() {
        let (runtime, _) = runtime();
        let used = Used::<_, Failure>::new(async { Ok("success") }, runtime.scheduler());
        assert!(!used.is_caught());

        assert_eq!(runtime.block_on(used.result()), Ok("success"));
        assert!(used.is_caught());
        assert_eq!(runtime.block_on(used.dispose()), Ok(()));
    }

    #[test]
    fn test_unobserved_failure_fails_disposal() {
        let (runtime, _) = runtime();
        let used = Used::new(fail_later("test error"), runtime.scheduler());

        let error = runtime.block_on(used.dispose()).unwrap_err();
        assert_eq!(error.to_string(), "test error");
    }

    #[test]
    fn test_caught_failure_is_suppressed_on_disposal() {
        let (runtime, _) = runtime();
        let used = Used::new(fail_later("catch test"), runtime.scheduler());

        let recovered = runtime.block_on(used.catch(|error| {
            assert_eq!(error.0, "catch test");
            0
        }));
        assert_eq!(recovered, 0);
        assert_eq!(runtime.block_on(used.dispose()), Ok(()));
    }

    #[test]
    fn test_attaching_failure_handler_is_enough() {
        let (runtime, _) = runtime();
        let used = Used::new(fail_later("ignored"), runtime.scheduler());

        // The handler is attached but its future is never awaited.
        let _ = used.then(|_| (), |_| ());
        assert!(used.is_caught());
        assert_eq!(runtime.block_on(used.dispose()), Ok(()));
    }

    #[test]
    fn test_map_and_finally_leave_failure_unhandled() {
        let (runtime, _) = runtime();
        let used = Used::new(fail_later("still failing"), runtime.scheduler());
        let settled = StdRc::new(Cell::new(false));

        let mapped = runtime.block_on(used.map(|value| value + 1));
        assert_eq!(mapped, Err(Failure("still failing")));

        let flag = settled.clone();
        let outcome = runtime.block_on(used.finally(move || flag.set(true)));
        assert!(settled.get());
        assert_eq!(outcome, Err(Failure("still failing")));

        assert!(!used.is_caught());
        assert!(runtime.block_on(used.dispose()).is_err());
    }

    #[test]
    fn test_then_receives_value() {
        let (runtime, _) = runtime();
        let used = Used::<_, Failure>::new(async { Ok("then test") }, runtime.scheduler());

        let length = runtime.block_on(used.then(|value| value.len(), |_| 0));
        assert_eq!(length, 9);
    }

    #[test]
    fn test_future_runs_without_being_polled() {
        let (runtime, _) = runtime();
        let completed = StdRc::new(Cell::new(false));

        let flag = completed.clone();
        let used = Used::<_, Failure>::new(
            async move {
                yield_now().await;
                flag.set(true);
                Ok(())
            },
            runtime.scheduler(),
        );

        runtime.block_on(runtime.scheduler().next_tick());
        assert!(completed.get());
        assert_eq!(runtime.block_on(used.dispose()), Ok(()));
    }

    #[test]
    fn test_second_disposal_is_a_no_op() {
        let (runtime, _) = runtime();
        let used = Used::new(fail_later("once"), runtime.scheduler());

        assert!(runtime.block_on(used.dispose()).is_err());
        assert_eq!(runtime.block_on(used.dispose()), Ok(()));
    }

    #[test]
    fn test_dropped_failure_is_reported_when_it_arrives() {
        let (runtime, reports) = runtime();
        drop(Used::new(fail_later("lost"), runtime.scheduler()));
        assert!(reports.borrow().is_empty());

        runtime.block_on(runtime.scheduler().next_tick());
        assert_eq!(
            *reports.borrow(),
            vec!["unobserved failure of a dropped future: lost".to_string()]
        );
    }

    #[test]
    fn test_unawaited_disposal_still_reports_failure() {
        let (runtime, reports) = runtime();
        let used = Used::new(fail_later("lost"), runtime.scheduler());

        drop(used.dispose());
        drop(used);
        runtime.block_on(runtime.scheduler().next_tick());
        assert_eq!(
            *reports.borrow(),
            vec!["unobserved failure of a dropped future: lost".to_string()]
        );
    }

    #[test]
    fn test_dropped_settled_failure_is_reported_on_drop() {
        let (runtime, reports) = runtime();
        let used = Used::new(fail_later("settled"), runtime.scheduler());

        runtime.block_on(runtime.scheduler().next_tick());
        assert!(reports.borrow().is_empty());

        drop(used);
        assert_eq!(
            *reports.borrow(),
            vec!["unobserved failure of a dropped future: settled".to_string()]
        );
    }
}
