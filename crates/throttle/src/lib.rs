//! Admission control for calls against a rate-limited upstream
//!
//! Two coordination primitives live here:
//!
//! - `RateLimiter` admits at most `calls` operations in any trailing
//!   `period`. Denials carry the exact time until the oldest admission leaves
//!   the window. Window state can be persisted through a `StateStore` so a
//!   restart does not reset the budget.
//! - `BatchCoordinator` groups individually submitted items into batches of
//!   up to `batch_size`, flushing on size or after `batch_timeout`, and hands
//!   each caller the outcome for its own item.
//!
//! Each instance guards its state with a single lock. The coordinator also
//! spawns one processor task lazily and tears it down on `close()`.

pub mod batch;
mod clock;
pub mod error;
pub mod rate_limiter;
pub mod store;

pub use batch::BatchCoordinator;
pub use error::{BatchError, Error, Result};
pub use rate_limiter::{LimiterMetrics, RateLimiter};
pub use store::{FileStateStore, MemoryStateStore, StateStore, WindowSnapshot};
