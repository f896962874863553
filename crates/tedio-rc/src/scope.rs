//! Block-scoped disposal.
//!
//! [`scope`] runs an async body with a [`Scope`] on which handles are
//! registered with [`Scope::using`]. When the body finishes, successfully or
//! not, every registered handle is disposed of in reverse registration order
//! and each disposal is awaited.
//!
//! Failures aggregate the way nested `finally` blocks would: the first one
//! becomes the scope's error, and each later disposal failure wraps the error
//! pending at that point as [`ScopeError::Suppressed`].
//!
//! ```
//! use tedio_rc::{BoxError, Dispose, Rc, Resource, Runtime, Scope, scope};
//!
//! struct Socket;
//!
//! impl Resource for Socket {
//!     type Error = std::io::Error;
//! }
//!
//! impl Dispose for Socket {
//!     fn dispose(&mut self) -> std::io::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let runtime = Runtime::new();
//! let scheduler = runtime.scheduler().clone();
//! let socket = Rc::new(Socket, &scheduler);
//!
//! runtime
//!     .block_on(scope(async |s: &Scope| {
//!         let borrowed = s.using(socket.share());
//!         assert_eq!(borrowed.count(), 2);
//!         Ok::<_, BoxError>(())
//!     }))
//!     .unwrap();
//!
//! assert_eq!(socket.count(), 1);
//! ```

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::cell::RefCell;
use std::fmt;

use crate::BoxError;
use crate::rc::{Rc, Resource};
use crate::used::Used;

/// Deferred release run by [`Scope`] on exit.
pub type ExitAction = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<(), BoxError>>>;

/// A handle that can be registered with [`Scope::using`].
pub trait ScopeExit {
    /// Captures the release to run when the scope exits. Nothing is released
    /// until the returned action is called.
    fn on_exit(&self) -> ExitAction;
}

impl<T: Resource + 'static> ScopeExit for Rc<T> {
    fn on_exit(&self) -> ExitAction {
        let handle = self.alias();
        Box::new(move || {
            async move { handle.dispose_async().await.map_err(BoxError::from) }.boxed_local()
        })
    }
}

impl<T, E> ScopeExit for Used<T, E>
where
    T: Clone + 'static,
    E: Clone + std::error::Error + 'static,
{
    fn on_exit(&self) -> ExitAction {
        let handle = self.alias();
        Box::new(move || async move { handle.dispose().await.map_err(BoxError::from) }.boxed_local())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Failed(BoxError),

    /// A disposal failed while `suppressed` was already pending.
    #[error("an error was suppressed during disposal")]
    Suppressed {
        #[source]
        error: BoxError,
        suppressed: Box<ScopeError>,
    },
}

impl ScopeError {
    /// The most recent failure.
    pub fn error(&self) -> &(dyn std::error::Error + 'static) {
        match self {
            ScopeError::Failed(error) => error.as_ref(),
            ScopeError::Suppressed { error, .. } => error.as_ref(),
        }
    }

    /// The failure that was pending when [`ScopeError::error`] happened.
    pub fn suppressed(&self) -> Option<&ScopeError> {
        match self {
            ScopeError::Failed(_) => None,
            ScopeError::Suppressed { suppressed, .. } => Some(suppressed.as_ref()),
        }
    }
}

/// Handles registered for disposal when a [`scope`] body finishes.
#[derive(Default)]
pub struct Scope {
    exits: RefCell<Vec<ExitAction>>,
}

impl Scope {
    /// Registers `handle` for disposal at scope exit and hands it back.
    pub fn using<H: ScopeExit>(&self, handle: H) -> H {
        self.exits.borrow_mut().push(handle.on_exit());
        handle
    }

    async fn exit<T>(self, mut result: Result<T, ScopeError>) -> Result<T, ScopeError> {
        let exits = self.exits.into_inner();
        tracing::trace!(handles = exits.len(), "scope exit");

        for exit in exits.into_iter().rev() {
            if let Err(error) = exit().await {
                result = Err(match result {
                    Ok(_) => ScopeError::Failed(error),
                    Err(suppressed) => ScopeError::Suppressed {
                        error,
                        suppressed: Box::new(suppressed),
                    },
                });
            }
        }
        result
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("handles", &self.exits.borrow().len())
            .finish()
    }
}

/// Runs `body`, then disposes of everything it registered.
pub async fn scope<T, E, F>(body: F) -> Result<T, ScopeError>
where
    F: AsyncFnOnce(&Scope) -> Result<T, E>,
    E: Into<BoxError>,
{
    let scope = Scope::default();
    let result = body(&scope)
        .await
        .map_err(|error| ScopeError::Failed(error.into()));
    scope.exit(result).await
}
