//! # Tedio Rc
//!
//! Reference-counted scoped disposal for a minimal single-threaded async runtime.
//!
//! ## Overview
//!
//! A resource such as a file or a socket often has to stay open across several
//! scopes: the function that opened it, the helpers it is passed to, and the
//! caller it is returned to, possibly across `.await` points. Tedio Rc counts
//! the holders of such a resource and releases it exactly once, when the last
//! one lets go.
//!
//! ## Features
//!
//! - **🔢 Counted handles**: [`Rc`] shares one counter between every handle to a resource
//! - **⏭️ Next-tick keep**: [`Rc::keep`] returns a resource from a scope without closing it
//! - **🧯 Observed futures**: [`Used`] turns an unawaited failure into a scope error
//! - **🧹 Scoped disposal**: [`scope`] releases registered handles in reverse order
//!
//! ## Quick Start
//!
//! ```rust
//! use tedio_rc::{BoxError, Dispose, Rc, Resource, Runtime, Scheduler, Scope, scope};
//!
//! struct File {
//!     lines: Vec<String>,
//! }
//!
//! impl Resource for File {
//!     type Error = std::io::Error;
//! }
//!
//! impl Dispose for File {
//!     fn dispose(&mut self) -> std::io::Result<()> {
//!         println!("closing after {} lines", self.lines.len());
//!         Ok(())
//!     }
//! }
//!
//! async fn open(scheduler: &Scheduler) -> Rc<File> {
//!     scope(async |s: &Scope| {
//!         let file = s.using(Rc::new(File { lines: Vec::new() }, scheduler));
//!         file.borrow_mut().lines.push("header".to_string());
//!         // Released by this scope on exit, but kept until the next tick.
//!         Ok::<_, BoxError>(file.keep())
//!     })
//!     .await
//!     .unwrap()
//! }
//!
//! let runtime = Runtime::new();
//! let scheduler = runtime.scheduler();
//! runtime
//!     .block_on(scope(async |s: &Scope| {
//!         let file = s.using(open(scheduler).await.share());
//!         file.borrow_mut().lines.push("body".to_string());
//!         Ok::<_, BoxError>(())
//!     }))
//!     .unwrap();
//!
//! runtime.block_on(scheduler.next_tick()); // Output: closing after 2 lines
//! ```

pub mod rc;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod used;
mod waker;

/// Type-erased error at the crate's reporting and aggregation seams.
pub type BoxError = Box<dyn std::error::Error + 'static>;

// Re-export commonly used items for convenience
pub use rc::{AsyncDispose, Dispose, DisposeGuard, Rc, Resource};
pub use runtime::{Runtime, yield_now};
pub use scheduler::{DeferredError, Scheduler};
pub use scope::{Scope, ScopeError, ScopeExit, scope};
pub use used::Used;
