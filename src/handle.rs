use crate::outcome::UnitOutcome;
use crate::state::UnitState;
use crate::unit::{AsyncUnit, CancelDisposition, UnitLabel};
use std::collections::HashSet;
use std::sync::Arc;

/// A handle to a unit submitted to a [`UnitPool`](crate::UnitPool).
///
/// Allows for requesting cancellation of the unit and awaiting its outcome.
#[derive(Debug)]
pub struct UnitHandle<T, E> {
  pub(crate) unit: AsyncUnit<T, E>,
  pub(crate) pool_name: Arc<String>,
}

impl<T, E> UnitHandle<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Returns the unique ID of the submitted unit.
  pub fn id(&self) -> u64 {
    self.unit.id()
  }

  /// Returns a clone of the labels associated with this unit.
  pub fn labels(&self) -> HashSet<UnitLabel> {
    self.unit.labels().clone()
  }

  pub fn is_cancellation_requested(&self) -> bool {
    self.unit.is_cancel_requested()
  }

  pub fn state(&self) -> UnitState {
    self.unit.state()
  }

  /// The submitted unit itself, for callers that want its flags directly.
  pub fn unit(&self) -> &AsyncUnit<T, E> {
    &self.unit
  }

  /// Requests cancellation of the unit, queued or executing.
  pub fn cancel(&self) -> CancelDisposition {
    tracing::debug!(pool_name = %self.pool_name, unit_id = %self.unit.id(), "UnitHandle: Cancellation requested.");
    self.unit.cancel()
  }

  /// Awaits the unit's terminal state and returns its outcome.
  ///
  /// Resolves for every unit the pool dequeues or drains on shutdown. A unit
  /// that is executing and never reports completion keeps this pending.
  pub async fn await_outcome(self) -> Arc<UnitOutcome<T, E>> {
    self.unit.wait().await
  }
}
