use crate::outcome::{CompletionStatus, UnitOutcome};
use crate::unit::UnitCore;

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Callback a work function (or cancel function) uses to report that its
/// unit is done.
///
/// It can be cloned, sent to other threads and called any number of times.
/// Only the first report has an effect; the ones after it return `false` and
/// leave the unit as it is.
pub struct Completion<T, E> {
  core: Arc<UnitCore<T, E>>,
}

impl<T, E> Clone for Completion<T, E> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
    }
  }
}

impl<T, E> fmt::Debug for Completion<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Completion")
      .field("unit_id", &self.core.unit_id)
      .field("signaled", &self.is_signaled())
      .finish()
  }
}

impl<T, E> Completion<T, E> {
  pub(crate) fn new(core: Arc<UnitCore<T, E>>) -> Self {
    Self { core }
  }

  pub fn unit_id(&self) -> u64 {
    self.core.unit_id
  }

  /// Reports `outcome`. Returns `true` if this call completed the unit.
  pub fn complete(&self, outcome: UnitOutcome<T, E>) -> bool {
    self.core.finish(outcome)
  }

  /// Reports `Finished` without a payload.
  pub fn finish(&self) -> bool {
    self.complete(UnitOutcome::finished())
  }

  pub fn finish_with(&self, value: T) -> bool {
    self.complete(UnitOutcome::success(value))
  }

  /// Reports `Finished` with `error` set.
  pub fn fail(&self, error: E) -> bool {
    self.complete(UnitOutcome::failure(error))
  }

  /// Acknowledges a cancellation by reporting `Cancelled`.
  pub fn cancelled(&self) -> bool {
    self.complete(UnitOutcome::with_status(CompletionStatus::Cancelled))
  }

  /// `true` once someone called `cancel()` on the unit.
  pub fn is_cancel_requested(&self) -> bool {
    self.core.cancel_token().is_cancelled()
  }

  /// A token that fires when the unit's cancellation is requested.
  ///
  /// This is a child token: cancelling it does not cancel the unit.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.core.cancel_token().child_token()
  }

  /// `true` once any completion for the unit has been accepted.
  pub fn is_signaled(&self) -> bool {
    self.core.state().is_terminal()
  }
}
