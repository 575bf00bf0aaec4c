//! Cancellable units of asynchronously-completing work for
//! bounded-concurrency pools.
//!
//! An [`AsyncUnit`] wraps a work function that reports its own completion
//! through a [`Completion`] callback, possibly long after `start()` returned
//! and from another thread. The unit guarantees a single terminal transition
//! no matter how `start()`, `cancel()` and completion calls interleave.
//! [`UnitPool`] is a Tokio-based driver that runs units under a concurrency
//! limit.

mod completion;
mod error;
mod handle;
mod manager;
mod outcome;
mod state;
mod unit;

pub use completion::Completion;
pub use error::{PoolError, UnitError};
pub use handle::UnitHandle;
pub use manager::{ShutdownMode, UnitPool};
pub use outcome::{CompletionStatus, UnitOutcome};
pub use state::UnitState;
pub use unit::{AsyncUnit, CancelDisposition, CancelFn, UnitBuilder, UnitLabel, WorkFn};
