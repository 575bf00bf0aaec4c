use crate::error::{PoolError, UnitError};
use crate::handle::UnitHandle;
use crate::unit::{AsyncUnit, UnitLabel};

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fibre::mpsc::{self, UnboundedAsyncReceiver as AsyncReceiver, UnboundedAsyncSender as AsyncSender};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

type UnitRegistry<T, E> = Arc<DashMap<u64, AsyncUnit<T, E>>>;

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for executing units to reach a terminal state.
  /// Queued units that haven't started are cancelled.
  Graceful,
  /// Calls `cancel()` on every executing unit and returns without waiting
  /// for them. Queued units that haven't started are cancelled.
  ForcefulCancel,
}

/// A Tokio-driven pool that starts submitted units in FIFO order while never
/// holding more than `concurrency_limit` of them in the executing state.
///
/// A unit keeps its slot from `start()` until it is observed terminal, so
/// units that complete asynchronously occupy the pool for as long as their
/// work is in flight.
pub struct UnitPool<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  unit_queue_tx: AsyncSender<AsyncUnit<T, E>>,
  queued_units: UnitRegistry<T, E>,
  active_units: UnitRegistry<T, E>,
  shutdown_token: CancellationToken,
  worker_join_handle_internal: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T, E> UnitPool<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  pub fn new(concurrency_limit: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let (tx, rx) = mpsc::unbounded_async();
    let shutdown_token = CancellationToken::new();
    let worker_join_handle_internal_arc = Arc::new(Mutex::new(None));

    let pool_arc = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
      unit_queue_tx: tx,
      queued_units: Arc::new(DashMap::new()),
      active_units: Arc::new(DashMap::new()),
      shutdown_token: shutdown_token.clone(),
      worker_join_handle_internal: worker_join_handle_internal_arc.clone(),
    });

    let worker = WorkerContext {
      pool_name: pool_arc.pool_name.clone(),
      semaphore: pool_arc.semaphore.clone(),
      tokio_handle: tokio_handle.clone(),
      queued_units: pool_arc.queued_units.clone(),
      active_units: pool_arc.active_units.clone(),
      shutdown_token,
    };

    let worker_loop_join_handle = tokio_handle.spawn(
      Self::run_worker_loop(worker, rx).instrument(info_span!("unit_pool_worker_loop", name = %pool_name)),
    );
    *worker_join_handle_internal_arc.lock() = Some(worker_loop_join_handle);

    pool_arc
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of units the pool has started that are not yet terminal.
  pub fn active_unit_count(&self) -> usize {
    self.active_units.len()
  }

  /// Number of submitted units waiting for a slot.
  pub fn queued_unit_count(&self) -> usize {
    self.queued_units.len()
  }

  /// Queues `unit` to be started once a slot is free.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once shutdown began,
  /// `PoolError::UnitAlreadySubmitted` if the unit (or a clone of it) is
  /// already queued or executing here, and `PoolError::UnitAlreadyStarted` if
  /// something else already started the unit.
  pub async fn submit(&self, unit: AsyncUnit<T, E>) -> Result<UnitHandle<T, E>, PoolError> {
    if self.shutdown_token.is_cancelled() || self.unit_queue_tx.is_closed() {
      warn!(pool_name = %self.pool_name, "Submit: Attempted to submit unit to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let unit_id = unit.id();
    // The worker records a unit as active before dropping its queued record,
    // so holding the queued entry makes this check atomic with dequeueing.
    match self.queued_units.entry(unit_id) {
      Entry::Occupied(_) => {
        warn!(pool_name = %self.pool_name, %unit_id, "Submit: Unit is already queued in this pool.");
        return Err(PoolError::UnitAlreadySubmitted(unit_id));
      }
      Entry::Vacant(vacant) => {
        if self.active_units.contains_key(&unit_id) {
          warn!(pool_name = %self.pool_name, %unit_id, "Submit: Unit is already executing in this pool.");
          return Err(PoolError::UnitAlreadySubmitted(unit_id));
        }
        if unit.is_started() {
          warn!(pool_name = %self.pool_name, %unit_id, "Submit: Unit was already started elsewhere.");
          return Err(PoolError::UnitAlreadyStarted(unit_id));
        }
        debug!(pool_name = %self.pool_name, %unit_id, labels = ?unit.labels(), "Submitting unit to queue.");
        vacant.insert(unit.clone());
      }
    }

    match self.unit_queue_tx.send(unit.clone()).await {
      Ok(()) => Ok(UnitHandle {
        unit,
        pool_name: self.pool_name.clone(),
      }),
      Err(send_error) => {
        self.queued_units.remove(&unit_id);
        error!(
          pool_name = %self.pool_name,
          %unit_id,
          "Submit: Failed to send unit to queue: {:?}",
          send_error
        );
        if self.shutdown_token.is_cancelled() || self.unit_queue_tx.is_closed() {
          Err(PoolError::PoolShuttingDown)
        } else {
          Err(PoolError::QueueSendChannelClosed)
        }
      }
    }
  }

  pub fn cancel_units_by_label(&self, label_to_cancel: &UnitLabel) {
    self.cancel_units_by_labels_internal(&HashSet::from_iter([label_to_cancel.clone()]));
  }

  pub fn cancel_units_by_labels(&self, labels_to_cancel: &HashSet<UnitLabel>) {
    self.cancel_units_by_labels_internal(labels_to_cancel);
  }

  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      let _ = self.unit_queue_tx.close();

      if mode == ShutdownMode::ForcefulCancel {
        self.cancel_active_units();
      }
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let handle_to_await: Option<JoinHandle<()>> = self.worker_join_handle_internal.lock().take();

    if let Some(handle) = handle_to_await {
      info!(pool_name = %self.pool_name, "Waiting for worker loop to join.");
      match handle.await {
        Ok(()) => info!(pool_name = %self.pool_name, "Worker loop successfully joined."),
        Err(join_error) => {
          error!(pool_name = %self.pool_name, "Error joining worker loop during shutdown: {:?}.", join_error);
        }
      }
    } else {
      trace!(pool_name = %self.pool_name, "Worker join handle already taken (concurrent shutdown call).");
    }

    // The worker may have dequeued units after the first pass; none can
    // become active once it has joined.
    if mode == ShutdownMode::ForcefulCancel {
      self.cancel_active_units();
    }

    if mode == ShutdownMode::Graceful {
      let still_active = Self::snapshot(&self.active_units);
      if !still_active.is_empty() {
        info!(pool_name = %self.pool_name, "Graceful shutdown: waiting for {} active units.", still_active.len());
        join_all(still_active.iter().map(|unit| unit.wait())).await;
      }
    }

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }

  fn cancel_active_units(&self) {
    let units_to_cancel = Self::snapshot(&self.active_units);
    if units_to_cancel.is_empty() {
      info!(pool_name = %self.pool_name, "No active units to cancel forcefully.");
    }
    for unit in units_to_cancel {
      let disposition = unit.cancel();
      debug!(pool_name = %self.pool_name, unit_id = %unit.id(), ?disposition, "Forcefully cancelled active unit during shutdown.");
    }
  }

  fn snapshot(registry: &UnitRegistry<T, E>) -> Vec<AsyncUnit<T, E>> {
    registry.iter().map(|entry| entry.value().clone()).collect()
  }

  fn cancel_units_by_labels_internal(&self, labels_to_cancel: &HashSet<UnitLabel>) {
    if labels_to_cancel.is_empty() {
      return;
    }
    info!(pool_name = %self.pool_name, "Requesting cancellation for units with labels: {:?}", labels_to_cancel);
    // Collect first: cancel() may run user code that submits or completes units.
    let matching: Vec<AsyncUnit<T, E>> = Self::snapshot(&self.queued_units)
      .into_iter()
      .chain(Self::snapshot(&self.active_units))
      .filter(|unit| !unit.labels().is_disjoint(labels_to_cancel))
      .collect();
    for unit in matching {
      let disposition = unit.cancel();
      debug!(pool_name = %self.pool_name, unit_id = %unit.id(), ?disposition, "Signaled cancellation due to label match.");
    }
  }

  async fn run_worker_loop(ctx: WorkerContext<T, E>, mut unit_queue_rx: AsyncReceiver<AsyncUnit<T, E>>) {
    let pool_name = ctx.pool_name.clone();
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = ctx.shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal received. Worker loop terminating.");
          break;
        }

        permit_acquisition_result = ctx.semaphore.clone().acquire_owned() => {
          let permit = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!(name = %*pool_name, "Semaphore closed. Worker loop exiting. ({})", PoolError::SemaphoreClosed);
              break;
            }
          };
          trace!(name = %*pool_name, "Acquired slot permit. Available: {}", ctx.semaphore.available_permits());

          let next_unit = tokio::select! {
            biased;
            _ = ctx.shutdown_token.cancelled() => {
              info!(name = %*pool_name, "Shutdown signal received while holding a permit. Releasing permit.");
              None
            }
            recv_result = unit_queue_rx.recv() => {
              match recv_result {
                Ok(unit) => Some(unit),
                Err(_) => {
                  info!(name = %*pool_name, "Unit queue closed and empty. Releasing permit.");
                  None
                }
              }
            }
          };

          let Some(unit) = next_unit else {
            drop(permit);
            continue;
          };

          let unit_id = unit.id();

          if unit.is_finished() {
            ctx.queued_units.remove(&unit_id);
            debug!(name = %*pool_name, %unit_id, labels = ?unit.labels(), "Dequeued unit already cancelled; skipping.");
            drop(permit);
            continue;
          }

          // Active first, then unqueued: submit() must see one or the other.
          ctx.active_units.insert(unit_id, unit.clone());
          ctx.queued_units.remove(&unit_id);
          debug!(name = %*pool_name, %unit_id, labels = ?unit.labels(), "Dequeued unit. Starting with permit.");

          let active_units_cleanup = ctx.active_units.clone();
          let pool_name_for_then_block = pool_name.clone();
          let start_handle = ctx.tokio_handle.clone();
          let drive_span = info_span!("driven_unit", pool_name = %*pool_name, %unit_id);

          ctx.tokio_handle.spawn(
            Self::drive_unit(unit, start_handle, pool_name.clone(), permit)
              .instrument(drive_span)
              .then(move |driven| {
                if let Err(start_error) = driven {
                  debug!(name = %*pool_name_for_then_block, %unit_id, "Unit was driven by another starter: {}", start_error);
                }
                active_units_cleanup.remove(&unit_id);
                debug!(name = %*pool_name_for_then_block, %unit_id, "Driven unit done, removed active info.");
                async {}
              }),
          );
        }
      }
    }

    // Nothing dequeued from here on will ever start.
    while let Ok(unit) = unit_queue_rx.recv().await {
      ctx.queued_units.remove(&unit.id());
      let disposition = unit.cancel();
      debug!(name = %*pool_name, unit_id = %unit.id(), ?disposition, "Cancelled queued unit during shutdown.");
    }

    info!(
      name = %*pool_name,
      "Worker loop stopped. Active units remaining: {}",
      ctx.active_units.len()
    );
  }

  /// Starts one unit off the async workers and holds its slot until the unit
  /// is terminal.
  ///
  /// Returns once the unit's active record may be dropped. A unit that
  /// someone else started while it sat in the queue gives its slot back at
  /// once, but stays tracked until it is terminal; that case is reported as
  /// `UnitError::AlreadyStarted`.
  async fn drive_unit(
    unit: AsyncUnit<T, E>,
    tokio_handle: TokioHandle,
    pool_name: Arc<String>,
    permit: OwnedSemaphorePermit,
  ) -> Result<(), UnitError> {
    let unit_to_start = unit.clone();
    match tokio_handle.spawn_blocking(move || unit_to_start.start()).await {
      Ok(Ok(state)) => trace!(pool_name = %*pool_name, %state, "start() returned."),
      Ok(Err(start_error)) => {
        warn!(pool_name = %*pool_name, "Unit could not be started by the pool: {}", start_error);
        drop(permit);
        unit.wait().await;
        return Err(start_error);
      }
      Err(join_error) => {
        // start() never ran to completion; cancel so waiters resolve.
        let disposition = unit.cancel();
        error!(pool_name = %*pool_name, ?disposition, "Start task failed to join: {:?}", join_error);
        return Ok(());
      }
    }

    let outcome = unit.wait().await;
    debug!(pool_name = %*pool_name, status = ?outcome.status, "Unit reached a terminal state; releasing slot.");
    drop(permit);
    Ok(())
  }
}

struct WorkerContext<T, E> {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  tokio_handle: TokioHandle,
  queued_units: UnitRegistry<T, E>,
  active_units: UnitRegistry<T, E>,
  shutdown_token: CancellationToken,
}

impl<T, E> Drop for UnitPool<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "UnitPool dropped. Initiating implicit shutdown (signaling worker to stop, closing queue)."
      );
      self.shutdown_token.cancel();
      // The worker drains and cancels whatever is still queued once the queue closes.
      let _ = self.unit_queue_tx.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
