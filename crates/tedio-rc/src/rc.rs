//! Reference-counted handles over disposable resources.
//!
//! An [`Rc`] wraps a resource that knows how to release itself (a file, a
//! socket, a timer) and counts its holders. Every scope that wants the
//! resource to stay alive takes a counted handle with [`Rc::share`] and gives
//! it back with [`Rc::dispose`] or [`Rc::dispose_async`]; the resource is
//! released exactly once, when the last holder gives its handle back.
//!
//! Unlike [`std::rc::Rc`], handles are not tied to Rust ownership: dropping a
//! handle does not decrement the counter, only an explicit release does. This
//! lets a handle be returned across an `.await` with [`Rc::keep`], which
//! holds the resource until the next tick so the caller has time to share it.
//!
//! ```
//! use tedio_rc::{Dispose, Rc, Resource, Scheduler};
//!
//! struct Connection;
//!
//! impl Resource for Connection {
//!     type Error = std::io::Error;
//! }
//!
//! impl Dispose for Connection {
//!     fn dispose(&mut self) -> std::io::Result<()> {
//!         println!("closed");
//!         Ok(())
//!     }
//! }
//!
//! let scheduler = Scheduler::new();
//! let conn = Rc::new(Connection, &scheduler);
//! let other = conn.share();
//! assert!(Rc::ptr_eq(&conn, &other));
//!
//! other.dispose().unwrap(); // still open
//! conn.dispose().unwrap(); // prints "closed"
//! ```

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::{BorrowError, BorrowMutError, Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::Rc as StdRc;
use std::task::{Context, Poll, ready};

use crate::scheduler::{DeferredError, Scheduler};

/// Names the error type both release capabilities share.
pub trait Resource {
    type Error: std::error::Error + 'static;
}

/// Synchronous release capability.
pub trait Dispose: Resource {
    fn dispose(&mut self) -> Result<(), Self::Error>;
}

/// Asynchronous release capability.
pub trait AsyncDispose: Resource {
    fn dispose_async(&mut self) -> impl Future<Output = Result<(), Self::Error>>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// Every holder already gave its handle back.
    #[error("resource was already released")]
    Released,

    /// The last holder tried to release while the resource was borrowed.
    #[error("resource is borrowed and cannot be released")]
    Busy,

    #[error(transparent)]
    Release(E),
}

type AsyncRelease<T> =
    for<'a> fn(&'a mut T) -> LocalBoxFuture<'a, Result<(), <T as Resource>::Error>>;

/// The real release, chosen when the resource is wrapped.
enum Release<T: Resource> {
    Sync(fn(&mut T) -> Result<(), T::Error>),
    Async(AsyncRelease<T>),
}

impl<T: Resource> Clone for Release<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Resource> Copy for Release<T> {}

fn release_async<T: AsyncDispose>(resource: &mut T) -> LocalBoxFuture<'_, Result<(), T::Error>> {
    resource.dispose_async().boxed_local()
}

struct Inner<T: Resource> {
    resource: RefCell<T>,
    count: Cell<usize>,
    release: Release<T>,
    scheduler: Scheduler,
}

impl<T: Resource + 'static> Inner<T> {
    /// Exclusive access for the real release, taken once the counter hit
    /// zero. A borrowed resource gives the holder back, so the release can
    /// be retried once the borrow ends.
    fn acquire(&self) -> Result<RefMut<'_, T>, Error<T::Error>> {
        match self.resource.try_borrow_mut() {
            Ok(resource) => {
                tracing::debug!("releasing shared resource");
                Ok(resource)
            }
            Err(_) => {
                self.count.set(self.count.get() + 1);
                Err(Error::Busy)
            }
        }
    }

    fn release_with(
        &self,
        release: fn(&mut T) -> Result<(), T::Error>,
    ) -> Result<(), Error<T::Error>> {
        let mut resource = self.acquire()?;
        release(&mut *resource).map_err(Error::Release)
    }

    /// Runs the real release, preferring the asynchronous one.
    async fn release(&self) -> Result<(), Error<T::Error>> {
        match self.release {
            Release::Sync(release) => self.release_with(release),
            Release::Async(release) => {
                let mut resource = self.acquire()?;
                release(&mut *resource).await.map_err(Error::Release)
            }
        }
    }

    /// Decrements the counter; `true` when it reached zero.
    fn release_one(&self) -> Result<bool, Error<T::Error>> {
        let count = self.count.get();
        if count == 0 {
            return Err(Error::Released);
        }
        self.count.set(count - 1);
        tracing::trace!(count = count - 1, "released one holder");
        Ok(count == 1)
    }

    /// The decrement owed by [`Rc::keep`], run by the scheduler.
    fn release_deferred(self: StdRc<Self>) -> Result<(), DeferredError> {
        match self.release_one() {
            Ok(true) => {}
            Ok(false) | Err(_) => return Ok(()),
        }

        let release = self.release;
        match release {
            Release::Sync(release) => self.release_with(release).map_err(|error| match error {
                Error::Busy => DeferredError::Busy,
                error => DeferredError::Dispose(Box::new(error)),
            }),
            Release::Async(_) => {
                let scheduler = self.scheduler.clone();
                scheduler
                    .spawn_local(async move { self.release().await.map_err(background_failure) });
                Ok(())
            }
        }
    }
}

/// Maps the failure of an asynchronous release nobody is waiting on.
fn background_failure<E: std::error::Error + 'static>(error: Error<E>) -> DeferredError {
    match error {
        Error::Busy => DeferredError::Busy,
        Error::Release(error) => DeferredError::AsyncDispose(Box::new(error)),
        error @ Error::Released => DeferredError::AsyncDispose(Box::new(error)),
    }
}

/// A counted handle to a shared resource.
///
/// All handles obtained from one [`Rc::new`] or [`Rc::new_async`] call share
/// a single counter and compare equal under [`Rc::ptr_eq`].
pub struct Rc<T: Resource> {
    inner: StdRc<Inner<T>>,
}

impl<T: Dispose + 'static> Rc<T> {
    /// Wraps a resource that releases synchronously. The counter starts at 1.
    pub fn new(resource: T, scheduler: &Scheduler) -> Self {
        Self::from_parts(resource, Release::Sync(T::dispose), scheduler)
    }

    /// Gives back one holder; the last one releases the resource and
    /// returns its error, if any.
    pub fn dispose(&self) -> Result<(), Error<T::Error>> {
        if !self.inner.release_one()? {
            return Ok(());
        }
        self.inner.release_with(T::dispose)
    }

    /// Turns this handle into a guard that gives it back when dropped.
    pub fn guard(self) -> DisposeGuard<T> {
        DisposeGuard {
            rc: self,
            armed: true,
        }
    }
}

impl<T: AsyncDispose + 'static> Rc<T> {
    /// Wraps a resource whose asynchronous release is preferred.
    ///
    /// If `T` also implements [`Dispose`], [`Rc::dispose`] stays available
    /// and releases synchronously.
    pub fn new_async(resource: T, scheduler: &Scheduler) -> Self {
        Self::from_parts(resource, Release::Async(release_async::<T>), scheduler)
    }
}

impl<T: Resource + 'static> Rc<T> {
    fn from_parts(resource: T, release: Release<T>, scheduler: &Scheduler) -> Self {
        Self {
            inner: StdRc::new(Inner {
                resource: RefCell::new(resource),
                count: Cell::new(1),
                release,
                scheduler: scheduler.clone(),
            }),
        }
    }

    /// Another handle to the same resource, without counting a holder.
    pub(crate) fn alias(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Counts one more holder and returns a handle with the same identity.
    pub fn share(&self) -> Self {
        let count = self.inner.count.get();
        if count == 0 {
            tracing::warn!("share() on a released resource");
        } else {
            self.inner.count.set(count + 1);
            tracing::trace!(count = count + 1, "shared resource");
        }
        self.alias()
    }

    /// Holds the resource until the next tick.
    ///
    /// The counter is incremented now and decremented by the scheduler on
    /// its next tick, so a scope may return the handle to a caller after its
    /// own release has run. A release triggered by that decrement has no
    /// caller; its failure goes to the scheduler's reporter.
    pub fn keep(&self) -> Self {
        let count = self.inner.count.get();
        if count == 0 {
            tracing::warn!("keep() on a released resource");
            return self.alias();
        }
        self.inner.count.set(count + 1);
        tracing::trace!(count = count + 1, "kept resource until next tick");

        let inner = self.inner.clone();
        self.inner.scheduler.schedule(move || inner.release_deferred());
        self.alias()
    }

    /// Gives back one holder. Resolves immediately unless this was the last
    /// one, in which case the real release runs: the asynchronous one if the
    /// resource was wrapped with [`Rc::new_async`], the synchronous one
    /// otherwise.
    ///
    /// The counter moves when this is called, and a synchronous release runs
    /// right away. An asynchronous release whose future is dropped before it
    /// completes is finished on the scheduler's background pool.
    pub fn dispose_async(&self) -> DisposeAsync<T::Error> {
        let state = match self.inner.release_one() {
            Err(error) => State::Ready(Some(Err(error))),
            Ok(false) => State::Ready(Some(Ok(()))),
            Ok(true) => match self.inner.release {
                Release::Sync(release) => State::Ready(Some(self.inner.release_with(release))),
                Release::Async(_) => {
                    let inner = self.inner.clone();
                    State::Releasing(Some(async move { inner.release().await }.boxed_local()))
                }
            },
        };
        DisposeAsync {
            state,
            scheduler: self.inner.scheduler.clone(),
        }
    }

    /// Number of live holders.
    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    pub fn is_released(&self) -> bool {
        self.inner.count.get() == 0
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        StdRc::ptr_eq(&this.inner, &other.inner)
    }

    /// Panics if the resource is mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.inner.resource.borrow()
    }

    /// Panics if the resource is already borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.inner.resource.borrow_mut()
    }

    pub fn try_borrow(&self) -> Result<Ref<'_, T>, BorrowError> {
        self.inner.resource.try_borrow()
    }

    pub fn try_borrow_mut(&self) -> Result<RefMut<'_, T>, BorrowMutError> {
        self.inner.resource.try_borrow_mut()
    }
}

impl<T: Resource> fmt::Debug for Rc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rc")
            .field("count", &self.inner.count.get())
            .finish_non_exhaustive()
    }
}

enum State<E> {
    Ready(Option<Result<(), Error<E>>>),
    Releasing(Option<LocalBoxFuture<'static, Result<(), Error<E>>>>),
}

/// Future returned by [`Rc::dispose_async`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct DisposeAsync<E: std::error::Error + 'static> {
    state: State<E>,
    scheduler: Scheduler,
}

// Never pinned structurally: the release future is boxed.
impl<E: std::error::Error + 'static> Unpin for DisposeAsync<E> {}

impl<E: std::error::Error + 'static> Future for DisposeAsync<E> {
    type Output = Result<(), Error<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            State::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            State::Releasing(future) => {
                let Some(release) = future.as_mut() else {
                    return Poll::Ready(Ok(()));
                };
                let output = ready!(release.as_mut().poll(cx));
                *future = None;
                Poll::Ready(output)
            }
        }
    }
}

impl<E: std::error::Error + 'static> Drop for DisposeAsync<E> {
    fn drop(&mut self) {
        match &mut self.state {
            State::Ready(result) => {
                if let Some(Err(Error::Release(error))) = result.take() {
                    self.scheduler.report(&DeferredError::Dispose(Box::new(error)));
                }
            }
            State::Releasing(future) => {
                if let Some(release) = future.take() {
                    tracing::trace!("unfinished release moved to background");
                    self.scheduler
                        .spawn_local(async move { release.await.map_err(background_failure) });
                }
            }
        }
    }
}

/// Gives its handle back when dropped.
///
/// A release failure during drop can only be logged; call
/// [`DisposeGuard::dispose`] to observe it.
pub struct DisposeGuard<T: Dispose + 'static> {
    rc: Rc<T>,
    armed: bool,
}

impl<T: Dispose + 'static> DisposeGuard<T> {
    pub fn dispose(mut self) -> Result<(), Error<T::Error>> {
        self.armed = false;
        self.rc.dispose()
    }
}

impl<T: Dispose + 'static> Deref for DisposeGuard<T> {
    type Target = Rc<T>;

    fn deref(&self) -> &Self::Target {
        &self.rc
    }
}

impl<T: Dispose + 'static> Drop for DisposeGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(error) = self.rc.dispose() {
            tracing::error!(%error, "error during object disposal");
        }
    }
}
