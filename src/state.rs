use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an [`AsyncUnit`](crate::AsyncUnit).
///
/// States only ever advance: `Pending -> Executing -> {Finished | Cancelled}`,
/// or `Pending -> Cancelled` when cancellation wins before `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnitState {
  /// Constructed, not yet started.
  Pending = 0,
  /// `start()` ran and the work has not reported completion yet.
  Executing = 1,
  /// Completion was reported with a finished status.
  Finished = 2,
  /// Cancelled before start, or completion was reported as cancelled.
  Cancelled = 3,
}

impl UnitState {
  /// Returns `true` for `Finished` and `Cancelled`.
  pub fn is_terminal(self) -> bool {
    matches!(self, UnitState::Finished | UnitState::Cancelled)
  }

  fn from_u8(value: u8) -> Self {
    match value {
      0 => UnitState::Pending,
      1 => UnitState::Executing,
      2 => UnitState::Finished,
      _ => UnitState::Cancelled,
    }
  }
}

impl fmt::Display for UnitState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      UnitState::Pending => "pending",
      UnitState::Executing => "executing",
      UnitState::Finished => "finished",
      UnitState::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Lock-free readable mirror of a unit's state.
///
/// Writers hold the unit's transition lock; readers never do. A store is
/// published with `Release` and every load is `Acquire`, so anything written
/// before a transition (the outcome in particular) is visible to a reader
/// that observes the new state.
pub(crate) struct AtomicUnitState(AtomicU8);

impl AtomicUnitState {
  pub(crate) fn new(state: UnitState) -> Self {
    Self(AtomicU8::new(state as u8))
  }

  pub(crate) fn load(&self) -> UnitState {
    UnitState::from_u8(self.0.load(Ordering::Acquire))
  }

  pub(crate) fn store(&self, state: UnitState) {
    debug_assert!(
      state as u8 >= self.0.load(Ordering::Relaxed),
      "unit state must never move backwards"
    );
    self.0.store(state as u8, Ordering::Release);
  }
}

impl fmt::Debug for AtomicUnitState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&self.load(), f)
  }
}
