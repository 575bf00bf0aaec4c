use crate::state::UnitState;

/// Status reported through a unit's completion callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
  /// The work ran to an end. It may still carry an error in its outcome.
  #[default]
  Finished,
  /// The work acknowledged a cancellation.
  Cancelled,
}

impl CompletionStatus {
  /// The terminal state a unit lands in when completed with this status.
  pub fn terminal_state(self) -> UnitState {
    match self {
      CompletionStatus::Finished => UnitState::Finished,
      CompletionStatus::Cancelled => UnitState::Cancelled,
    }
  }
}

/// Result of a unit, written once by the winning completion call.
///
/// `value` and `error` are stored exactly as the work handed them over. A
/// failed unit is a `Finished` unit whose `error` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome<T, E> {
  pub status: CompletionStatus,
  pub value: Option<T>,
  pub error: Option<E>,
  /// Message of a panic that escaped the work function, if one did.
  pub panic: Option<String>,
}

impl<T, E> UnitOutcome<T, E> {
  /// A finished outcome with no payload.
  pub fn finished() -> Self {
    Self::with_status(CompletionStatus::Finished)
  }

  /// A cancelled outcome with no payload.
  pub fn cancelled() -> Self {
    Self::with_status(CompletionStatus::Cancelled)
  }

  pub fn with_status(status: CompletionStatus) -> Self {
    Self {
      status,
      value: None,
      error: None,
      panic: None,
    }
  }

  /// A finished outcome carrying `value`.
  pub fn success(value: T) -> Self {
    Self::finished().value(value)
  }

  /// A finished outcome carrying `error`.
  pub fn failure(error: E) -> Self {
    Self::finished().error(error)
  }

  pub fn value(mut self, value: T) -> Self {
    self.value = Some(value);
    self
  }

  pub fn error(mut self, error: E) -> Self {
    self.error = Some(error);
    self
  }

  pub(crate) fn panicked(message: String) -> Self {
    let mut outcome = Self::finished();
    outcome.panic = Some(message);
    outcome
  }

  pub fn is_cancelled(&self) -> bool {
    self.status == CompletionStatus::Cancelled
  }

  /// `true` when the unit finished without an error and without panicking.
  pub fn is_success(&self) -> bool {
    self.status == CompletionStatus::Finished && self.error.is_none() && self.panic.is_none()
  }
}

impl<T, E> Default for UnitOutcome<T, E> {
  fn default() -> Self {
    Self::finished()
  }
}

impl<T, E> From<Result<T, E>> for UnitOutcome<T, E> {
  fn from(result: Result<T, E>) -> Self {
    match result {
      Ok(value) => UnitOutcome::success(value),
      Err(error) => UnitOutcome::failure(error),
    }
  }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
