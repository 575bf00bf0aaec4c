use crate::completion::Completion;
use crate::error::UnitError;
use crate::outcome::{panic_message, UnitOutcome};
use crate::state::{AtomicUnitState, UnitState};

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_UNIT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// A descriptive label for a unit, used by pools for group cancellation.
pub type UnitLabel = String;

/// The work a unit runs once it is started. It must eventually report
/// completion through the [`Completion`] it receives.
pub type WorkFn<T, E> = Box<dyn FnOnce(Completion<T, E>) + Send + 'static>;

/// Hook run at most once when a started unit is cancelled. It receives the
/// same kind of [`Completion`] as the work and should use it to report
/// `Cancelled`.
pub type CancelFn<T, E> = Box<dyn FnOnce(Completion<T, E>) + Send + 'static>;

/// What a call to [`AsyncUnit::cancel`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
  /// The unit had not started. It is now `Cancelled` and its work will never run.
  CancelledBeforeStart,
  /// The unit is executing and this call ran its cancel function.
  CancelFnInvoked,
  /// The unit is executing and has no cancel function left to run. The request
  /// is recorded and the work decides when (and whether) to report `Cancelled`.
  Requested,
  /// The unit was already `Finished` or `Cancelled`.
  AlreadyTerminal,
}

struct UnitSlots<T, E> {
  started: bool,
  work: Option<WorkFn<T, E>>,
  cancel: Option<CancelFn<T, E>>,
}

/// State shared between a unit, its clones and every `Completion` handed out.
pub(crate) struct UnitCore<T, E> {
  pub(crate) unit_id: u64,
  pub(crate) name: Option<Arc<str>>,
  pub(crate) labels: Arc<HashSet<UnitLabel>>,
  state: AtomicUnitState,
  cancel_token: CancellationToken,
  outcome: OnceLock<Arc<UnitOutcome<T, E>>>,
  // Every transition happens under this lock. User code never runs under it.
  slots: Mutex<UnitSlots<T, E>>,
  state_tx: watch::Sender<UnitState>,
}

impl<T, E> UnitCore<T, E> {
  pub(crate) fn state(&self) -> UnitState {
    self.state.load()
  }

  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.cancel_token
  }

  pub(crate) fn outcome(&self) -> Option<Arc<UnitOutcome<T, E>>> {
    if self.state.load().is_terminal() {
      self.outcome.get().cloned()
    } else {
      None
    }
  }

  /// Claims the finish transition for `outcome`.
  ///
  /// Returns `false` when another call already claimed it; the unit is left
  /// untouched in that case.
  pub(crate) fn finish(&self, outcome: UnitOutcome<T, E>) -> bool {
    let status = outcome.status;
    let discarded_cancel_fn = {
      let mut slots = self.slots.lock();
      if self.state.load().is_terminal() {
        drop(slots);
        debug!(unit_id = %self.unit_id, ?status, "Duplicate completion ignored; unit already terminal.");
        return false;
      }
      let unclaimed = slots.cancel.take();
      self.settle(&mut slots, outcome);
      unclaimed
    };
    drop(discarded_cancel_fn);
    debug!(unit_id = %self.unit_id, ?status, "Unit completed.");
    true
  }

  // Caller holds the slots lock; the `&mut` borrow is the proof.
  fn settle(&self, _slots: &mut UnitSlots<T, E>, outcome: UnitOutcome<T, E>) {
    let terminal = outcome.status.terminal_state();
    if self.outcome.set(Arc::new(outcome)).is_err() {
      error!(unit_id = %self.unit_id, "Outcome slot already filled during a settle; keeping the first outcome.");
    }
    self.publish(terminal);
  }

  fn publish(&self, state: UnitState) {
    self.state.store(state);
    self.state_tx.send_replace(state);
  }
}

/// A cancellable unit of work whose completion is reported through a callback.
///
/// The unit moves through [`UnitState`] exactly once: `start()` takes it from
/// `Pending` to `Executing` and runs the work function, and the first
/// completion call takes it to `Finished` or `Cancelled`. Completion may be
/// reported synchronously from inside the work function, or later from any
/// thread. Every method takes `&self`; clones share the same unit.
///
/// The unit never waits on its own. A unit whose work never reports
/// completion stays `Executing` forever, including after `cancel()`; drivers
/// that need a bound must apply their own timeout.
pub struct AsyncUnit<T, E> {
  pub(crate) core: Arc<UnitCore<T, E>>,
}

impl<T, E> Clone for AsyncUnit<T, E> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
    }
  }
}

impl<T, E> fmt::Debug for AsyncUnit<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AsyncUnit")
      .field("unit_id", &self.core.unit_id)
      .field("name", &self.core.name)
      .field("state", &self.core.state)
      .field("cancel_requested", &self.core.cancel_token.is_cancelled())
      .finish_non_exhaustive()
  }
}

enum StartAction<T, E> {
  Run(WorkFn<T, E>),
  Skip(UnitState, Option<WorkFn<T, E>>, Option<CancelFn<T, E>>),
}

enum CancelAction<T, E> {
  Invoke(CancelFn<T, E>),
  Discard(Option<WorkFn<T, E>>, Option<CancelFn<T, E>>),
  Report(CancelDisposition),
}

impl<T, E> AsyncUnit<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Creates a unit without a cancel function.
  pub fn new<F>(work: F) -> Self
  where
    F: FnOnce(Completion<T, E>) + Send + 'static,
  {
    Self::assemble(Box::new(work), None, None, HashSet::new())
  }

  /// Creates a unit whose `cancel` hook runs if it is cancelled while executing.
  pub fn cancellable<F, C>(work: F, cancel: C) -> Self
  where
    F: FnOnce(Completion<T, E>) + Send + 'static,
    C: FnOnce(Completion<T, E>) + Send + 'static,
  {
    Self::assemble(Box::new(work), Some(Box::new(cancel)), None, HashSet::new())
  }

  /// Creates a unit from already boxed functions.
  ///
  /// # Errors
  /// Returns `UnitError::MissingWorkFn` if `work` is `None`.
  pub fn from_parts(work: Option<WorkFn<T, E>>, cancel: Option<CancelFn<T, E>>) -> Result<Self, UnitError> {
    let work = work.ok_or(UnitError::MissingWorkFn)?;
    Ok(Self::assemble(work, cancel, None, HashSet::new()))
  }

  pub fn builder() -> UnitBuilder<T, E> {
    UnitBuilder::default()
  }

  fn assemble(
    work: WorkFn<T, E>,
    cancel: Option<CancelFn<T, E>>,
    name: Option<String>,
    labels: HashSet<UnitLabel>,
  ) -> Self {
    let unit_id = NEXT_UNIT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (state_tx, _) = watch::channel(UnitState::Pending);
    trace!(%unit_id, ?name, cancellable = cancel.is_some(), "Unit created.");
    Self {
      core: Arc::new(UnitCore {
        unit_id,
        name: name.map(Arc::from),
        labels: Arc::new(labels),
        state: AtomicUnitState::new(UnitState::Pending),
        cancel_token: CancellationToken::new(),
        outcome: OnceLock::new(),
        slots: Mutex::new(UnitSlots {
          started: false,
          work: Some(work),
          cancel,
        }),
        state_tx,
      }),
    }
  }

  /// Starts the unit and returns the state it is in when this call returns.
  ///
  /// If cancellation was requested first, the work function is never run and
  /// `Ok(UnitState::Cancelled)` is returned. Otherwise the unit becomes
  /// `Executing` and the work function runs on the calling thread; a work
  /// function that completes synchronously leaves the unit terminal by the time
  /// this returns. A panic escaping the work function is caught and, unless the
  /// work already completed, finishes the unit with the panic message.
  ///
  /// # Errors
  /// Returns `UnitError::AlreadyStarted` on every call after the first. Such a
  /// call changes nothing.
  pub fn start(&self) -> Result<UnitState, UnitError> {
    let core = &self.core;
    let action = {
      let mut slots = core.slots.lock();
      if slots.started {
        drop(slots);
        warn!(unit_id = %core.unit_id, "start() called on a unit that was already started; ignoring.");
        return Err(UnitError::AlreadyStarted { unit_id: core.unit_id });
      }
      slots.started = true;

      match core.state.load() {
        UnitState::Pending if core.cancel_token.is_cancelled() => {
          let work = slots.work.take();
          let cancel = slots.cancel.take();
          core.settle(&mut slots, UnitOutcome::cancelled());
          StartAction::Skip(UnitState::Cancelled, work, cancel)
        }
        UnitState::Pending => match slots.work.take() {
          Some(work) => {
            core.publish(UnitState::Executing);
            StartAction::Run(work)
          }
          None => {
            core.settle(&mut slots, UnitOutcome::cancelled());
            StartAction::Skip(UnitState::Cancelled, None, slots.cancel.take())
          }
        },
        state => StartAction::Skip(state, None, None),
      }
    };

    let work = match action {
      StartAction::Run(work) => work,
      StartAction::Skip(state, unrun_work, unrun_cancel) => {
        drop(unrun_work);
        drop(unrun_cancel);
        debug!(unit_id = %core.unit_id, %state, "Unit cancelled before start; work function not run.");
        return Ok(state);
      }
    };

    let completion = Completion::new(core.clone());
    let span = info_span!("async_unit", unit_id = %core.unit_id, name = ?core.name);
    let run_result = span.in_scope(|| {
      trace!("Invoking work function.");
      catch_unwind(AssertUnwindSafe(move || work(completion)))
    });

    if let Err(payload) = run_result {
      let message = panic_message(payload.as_ref());
      error!(unit_id = %core.unit_id, "Work function panicked: {}", message);
      if !core.finish(UnitOutcome::panicked(message)) {
        debug!(unit_id = %core.unit_id, "Panicking work had already reported completion; outcome kept.");
      }
    }

    let state = core.state.load();
    trace!(unit_id = %core.unit_id, %state, "start() returning.");
    Ok(state)
  }

  /// Requests cancellation. Safe to call any number of times from any thread.
  ///
  /// A pending unit becomes `Cancelled` immediately. An executing unit runs its
  /// cancel function, at most once across all calls; without one, the request
  /// is only recorded and the work decides how to react.
  pub fn cancel(&self) -> CancelDisposition {
    let core = &self.core;
    core.cancel_token.cancel();

    let action = {
      let mut slots = core.slots.lock();
      match core.state.load() {
        UnitState::Pending => {
          let work = slots.work.take();
          let cancel = slots.cancel.take();
          core.settle(&mut slots, UnitOutcome::cancelled());
          CancelAction::Discard(work, cancel)
        }
        UnitState::Executing => match slots.cancel.take() {
          Some(cancel_fn) => CancelAction::Invoke(cancel_fn),
          None => CancelAction::Report(CancelDisposition::Requested),
        },
        UnitState::Finished | UnitState::Cancelled => CancelAction::Report(CancelDisposition::AlreadyTerminal),
      }
    };

    match action {
      CancelAction::Discard(work, cancel) => {
        drop(work);
        drop(cancel);
        debug!(unit_id = %core.unit_id, "Unit cancelled before start.");
        CancelDisposition::CancelledBeforeStart
      }
      CancelAction::Invoke(cancel_fn) => {
        // A completion may have landed since the lock was released.
        if core.state().is_terminal() {
          drop(cancel_fn);
          trace!(unit_id = %core.unit_id, "Unit finished before its cancel function ran; skipping it.");
          return CancelDisposition::AlreadyTerminal;
        }
        let completion = Completion::new(core.clone());
        debug!(unit_id = %core.unit_id, "Cancellation requested while executing; invoking cancel function.");
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || cancel_fn(completion))) {
          error!(
            unit_id = %core.unit_id,
            "Cancel function panicked: {}. Unit stays executing until its work reports completion.",
            panic_message(payload.as_ref())
          );
        }
        CancelDisposition::CancelFnInvoked
      }
      CancelAction::Report(disposition) => {
        trace!(unit_id = %core.unit_id, ?disposition, "Cancellation recorded.");
        disposition
      }
    }
  }

  /// Waits until the unit is terminal and returns its outcome.
  ///
  /// This only observes the unit; it does not start it. Waiting on a unit that
  /// nobody starts or whose work never completes never resolves.
  pub async fn wait(&self) -> Arc<UnitOutcome<T, E>> {
    let mut state_rx = self.core.state_tx.subscribe();
    loop {
      if let Some(outcome) = self.core.outcome() {
        return outcome;
      }
      // The sender lives in the core that `self` keeps alive, so this cannot fail.
      let _ = state_rx.changed().await;
    }
  }
}

impl<T, E> AsyncUnit<T, E> {
  /// Process-unique id of this unit.
  pub fn id(&self) -> u64 {
    self.core.unit_id
  }

  pub fn name(&self) -> Option<&str> {
    self.core.name.as_deref()
  }

  pub fn labels(&self) -> &HashSet<UnitLabel> {
    &self.core.labels
  }

  pub fn state(&self) -> UnitState {
    self.core.state()
  }

  pub fn is_executing(&self) -> bool {
    self.state() == UnitState::Executing
  }

  /// `true` once the unit is done with its pool slot, cancelled or not.
  pub fn is_finished(&self) -> bool {
    self.state().is_terminal()
  }

  pub fn is_cancelled(&self) -> bool {
    self.state() == UnitState::Cancelled
  }

  /// `true` once `start()` has been called, whatever it did.
  pub fn is_started(&self) -> bool {
    self.core.slots.lock().started
  }

  pub fn is_cancel_requested(&self) -> bool {
    self.core.cancel_token.is_cancelled()
  }

  /// The outcome, available once the unit is `Finished` or `Cancelled`.
  pub fn outcome(&self) -> Option<Arc<UnitOutcome<T, E>>> {
    self.core.outcome()
  }
}

/// Builder for units that carry a name or labels, or whose work function is
/// only known at runtime.
pub struct UnitBuilder<T, E> {
  work: Option<WorkFn<T, E>>,
  cancel: Option<CancelFn<T, E>>,
  name: Option<String>,
  labels: HashSet<UnitLabel>,
}

impl<T, E> Default for UnitBuilder<T, E> {
  fn default() -> Self {
    Self {
      work: None,
      cancel: None,
      name: None,
      labels: HashSet::new(),
    }
  }
}

impl<T, E> fmt::Debug for UnitBuilder<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnitBuilder")
      .field("has_work", &self.work.is_some())
      .field("has_cancel", &self.cancel.is_some())
      .field("name", &self.name)
      .field("labels", &self.labels)
      .finish()
  }
}

impl<T, E> UnitBuilder<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  pub fn work<F>(mut self, work: F) -> Self
  where
    F: FnOnce(Completion<T, E>) + Send + 'static,
  {
    self.work = Some(Box::new(work));
    self
  }

  pub fn on_cancel<C>(mut self, cancel: C) -> Self
  where
    C: FnOnce(Completion<T, E>) + Send + 'static,
  {
    self.cancel = Some(Box::new(cancel));
    self
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn label(mut self, label: impl Into<UnitLabel>) -> Self {
    self.labels.insert(label.into());
    self
  }

  pub fn labels<I, L>(mut self, labels: I) -> Self
  where
    I: IntoIterator<Item = L>,
    L: Into<UnitLabel>,
  {
    self.labels.extend(labels.into_iter().map(Into::into));
    self
  }

  /// # Errors
  /// Returns `UnitError::MissingWorkFn` if no work function was set.
  pub fn build(self) -> Result<AsyncUnit<T, E>, UnitError> {
    let work = self.work.ok_or(UnitError::MissingWorkFn)?;
    Ok(AsyncUnit::assemble(work, self.cancel, self.name, self.labels))
  }
}
