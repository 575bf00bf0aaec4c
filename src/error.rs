use thiserror::Error;

/// Errors raised by an [`AsyncUnit`](crate::AsyncUnit) itself.
///
/// These only describe misuse of the unit's API. Failures of the work are
/// data and travel inside [`UnitOutcome`](crate::UnitOutcome).
#[derive(Error, Debug, PartialEq)]
pub enum UnitError {
  #[error("Unit cannot be built without a work function")]
  MissingWorkFn,

  #[error("Unit (id: {unit_id}) was already started; start() has no effect the second time")]
  AlreadyStarted { unit_id: u64 },
}

/// Errors that can occur within the reference [`UnitPool`](crate::UnitPool).
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Pool's internal unit queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Pool's internal semaphore was closed unexpectedly")]
  SemaphoreClosed,

  #[error("Unit (id: {0}) was already started outside the pool and cannot be submitted")]
  UnitAlreadyStarted(u64),

  #[error("Unit (id: {0}) is already queued or executing in this pool")]
  UnitAlreadySubmitted(u64),

  #[error("Pool is shutting down or already shut down, cannot accept new units")]
  PoolShuttingDown,
}
