use async_unit::{AsyncUnit, CancelDisposition, Completion, CompletionStatus, UnitError, UnitOutcome, UnitState, WorkFn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tokio::time::sleep;

type TestUnit = AsyncUnit<String, String>;

// Helper to initialize tracing for tests (Once ensures it runs a single time per test binary)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,async_unit=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// A unit whose work parks its completion callback so the test can fire it later.
fn parked_unit() -> (TestUnit, Arc<Mutex<Option<Completion<String, String>>>>) {
  let slot = Arc::new(Mutex::new(None));
  let slot_for_work = slot.clone();
  let unit = TestUnit::new(move |done| {
    *slot_for_work.lock().unwrap() = Some(done);
  });
  (unit, slot)
}

fn take_parked(slot: &Arc<Mutex<Option<Completion<String, String>>>>) -> Completion<String, String> {
  slot.lock().unwrap().take().expect("work function should have parked its completion")
}

fn assert_flags(unit: &TestUnit, executing: bool, finished: bool, cancelled: bool) {
  assert_eq!(
    (unit.is_executing(), unit.is_finished(), unit.is_cancelled()),
    (executing, finished, cancelled),
    "unexpected flags for unit in state {}",
    unit.state()
  );
}

#[test]
fn test_start_then_single_completion_finishes_with_payload() {
  setup_tracing_for_test();
  let (unit, slot) = parked_unit();

  assert_eq!(unit.start(), Ok(UnitState::Executing));
  assert_flags(&unit, true, false, false);
  assert!(unit.outcome().is_none(), "Outcome must not be readable while executing.");

  let done = take_parked(&slot);
  let completer = thread::spawn(move || done.finish_with("payload".to_string()));
  assert!(completer.join().unwrap());

  assert_flags(&unit, false, true, false);
  let outcome = unit.outcome().unwrap();
  assert_eq!(outcome.status, CompletionStatus::Finished);
  assert_eq!(outcome.value.as_deref(), Some("payload"));
  assert!(outcome.error.is_none());
}

#[test]
fn test_cancel_before_start_never_runs_work() {
  setup_tracing_for_test();
  let work_ran = Arc::new(AtomicBool::new(false));
  let work_ran_clone = work_ran.clone();
  let unit = TestUnit::new(move |done| {
    work_ran_clone.store(true, Ordering::SeqCst);
    done.finish();
  });

  assert_eq!(unit.cancel(), CancelDisposition::CancelledBeforeStart);
  assert_flags(&unit, false, true, true);
  assert!(unit.is_cancel_requested());

  assert_eq!(unit.start(), Ok(UnitState::Cancelled));
  assert!(!work_ran.load(Ordering::SeqCst), "Work must not run after cancel-before-start.");
  assert_flags(&unit, false, true, true);
  assert!(unit.outcome().unwrap().is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_start_invokes_cancel_fn_once() {
  setup_tracing_for_test();
  let rt = tokio::runtime::Handle::current();
  let cancel_calls = Arc::new(AtomicUsize::new(0));
  let cancel_calls_clone = cancel_calls.clone();

  let unit = TestUnit::cancellable(
    |_done| {
      // In-flight work that never finishes by itself.
    },
    move |done| {
      cancel_calls_clone.fetch_add(1, Ordering::SeqCst);
      rt.spawn(async move {
        sleep(Duration::from_millis(30)).await;
        done.cancelled();
      });
    },
  );

  assert_eq!(unit.start(), Ok(UnitState::Executing));
  assert_eq!(unit.cancel(), CancelDisposition::CancelFnInvoked);
  assert_eq!(unit.cancel(), CancelDisposition::Requested);
  assert_flags(&unit, true, false, false);

  let outcome = tokio::time::timeout(Duration::from_secs(2), unit.wait())
    .await
    .expect("Unit should reach a terminal state after the cancel function reports.");
  assert!(outcome.is_cancelled());
  assert_flags(&unit, false, true, true);
  assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
  assert_eq!(unit.cancel(), CancelDisposition::AlreadyTerminal);
}

#[test]
fn test_concurrent_completions_have_exactly_one_winner() {
  setup_tracing_for_test();
  const THREADS: usize = 16;

  for _round in 0..20 {
    let (unit, slot) = parked_unit();
    unit.start().unwrap();
    let done = take_parked(&slot);

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
      .map(|i| {
        let done = done.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          let outcome = UnitOutcome::success(format!("value_{}", i)).error(format!("error_{}", i));
          (i, done.complete(outcome))
        })
      })
      .collect();

    let winners: Vec<usize> = workers
      .into_iter()
      .map(|w| w.join().unwrap())
      .filter(|(_, won)| *won)
      .map(|(i, _)| i)
      .collect();

    assert_eq!(winners.len(), 1, "Exactly one completion must take effect.");
    let winner = winners[0];
    let outcome = unit.outcome().unwrap();
    assert_eq!(outcome.value, Some(format!("value_{}", winner)));
    assert_eq!(outcome.error, Some(format!("error_{}", winner)), "Outcome must not mix payloads.");
    assert_flags(&unit, false, true, false);
  }
}

#[test]
fn test_concurrent_cancels_run_cancel_fn_at_most_once() {
  setup_tracing_for_test();
  const THREADS: usize = 12;
  let cancel_calls = Arc::new(AtomicUsize::new(0));
  let cancel_calls_clone = cancel_calls.clone();

  let unit = TestUnit::cancellable(
    |_done| {},
    move |done| {
      cancel_calls_clone.fetch_add(1, Ordering::SeqCst);
      thread::sleep(Duration::from_millis(5));
      done.cancelled();
    },
  );
  unit.start().unwrap();

  let barrier = Arc::new(Barrier::new(THREADS));
  let dispositions: Vec<CancelDisposition> = (0..THREADS)
    .map(|_| {
      let unit = unit.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        unit.cancel()
      })
    })
    .collect::<Vec<_>>()
    .into_iter()
    .map(|h| h.join().unwrap())
    .collect();

  assert_eq!(cancel_calls.load(Ordering::SeqCst), 1);
  assert_eq!(
    dispositions.iter().filter(|d| **d == CancelDisposition::CancelFnInvoked).count(),
    1
  );
  assert!(dispositions
    .iter()
    .all(|d| matches!(d, CancelDisposition::CancelFnInvoked | CancelDisposition::Requested | CancelDisposition::AlreadyTerminal)));
  assert_flags(&unit, false, true, true);
}

#[test]
fn test_cancel_racing_genuine_completion_has_one_outcome() {
  setup_tracing_for_test();

  for round in 0..200 {
    let slot = Arc::new(Mutex::new(None));
    let slot_for_work = slot.clone();
    let cancel_calls = Arc::new(AtomicUsize::new(0));
    let cancel_calls_clone = cancel_calls.clone();
    let unit = TestUnit::cancellable(
      move |done| {
        *slot_for_work.lock().unwrap() = Some(done);
      },
      move |done| {
        cancel_calls_clone.fetch_add(1, Ordering::SeqCst);
        done.cancelled();
      },
    );
    unit.start().unwrap();
    let done = take_parked(&slot);

    let barrier = Arc::new(Barrier::new(2));
    let completer = {
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        done.finish_with(format!("value_{}", round))
      })
    };
    let canceller = {
      let unit = unit.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        unit.cancel()
      })
    };
    let completed = completer.join().unwrap();
    let disposition = canceller.join().unwrap();

    let outcome = unit.outcome().expect("Unit must be terminal once both sides returned.");
    match unit.state() {
      UnitState::Finished => {
        assert!(completed, "round {}: Finished state requires the completion to have won.", round);
        assert_eq!(outcome.status, CompletionStatus::Finished);
        assert_eq!(outcome.value, Some(format!("value_{}", round)));
        assert_flags(&unit, false, true, false);
      }
      UnitState::Cancelled => {
        assert!(!completed, "round {}: the losing completion must report false.", round);
        assert_eq!(disposition, CancelDisposition::CancelFnInvoked);
        assert_eq!(outcome.status, CompletionStatus::Cancelled);
        assert!(outcome.value.is_none(), "round {}: a cancelled outcome carries no payload.", round);
        assert_flags(&unit, false, true, true);
      }
      other => panic!("round {}: unit left in non-terminal state {}", round, other),
    }

    let calls = cancel_calls.load(Ordering::SeqCst);
    assert!(calls <= 1, "round {}: cancel function ran {} times.", round, calls);
    assert_eq!(
      calls == 1,
      disposition == CancelDisposition::CancelFnInvoked,
      "round {}: disposition {:?} disagrees with {} cancel function run(s).",
      round,
      disposition,
      calls
    );
    assert!(matches!(
      disposition,
      CancelDisposition::CancelFnInvoked | CancelDisposition::AlreadyTerminal
    ));
  }
}

#[test]
fn test_synchronous_completion_is_terminal_when_start_returns() {
  setup_tracing_for_test();
  let unit = TestUnit::new(|done| {
    assert!(done.finish());
  });
  assert_eq!(unit.start(), Ok(UnitState::Finished));
  assert_flags(&unit, false, true, false);
  let outcome = unit.outcome().unwrap();
  assert!(outcome.is_success());
  assert!(outcome.value.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_cancelled_report_without_cancel_fn() {
  setup_tracing_for_test();
  let rt = tokio::runtime::Handle::current();
  let unit = TestUnit::new(move |done| {
    let token = done.cancellation_token();
    rt.spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {
          sleep(Duration::from_millis(20)).await;
          done.cancelled();
        }
        _ = sleep(Duration::from_secs(5)) => {
          done.finish_with("too late".to_string());
        }
      }
    });
  });

  assert_eq!(unit.start(), Ok(UnitState::Executing));
  sleep(Duration::from_millis(20)).await;
  assert_eq!(unit.cancel(), CancelDisposition::Requested);
  assert!(unit.is_cancel_requested());
  assert_flags(&unit, true, false, false);

  let outcome = tokio::time::timeout(Duration::from_secs(2), unit.wait()).await.unwrap();
  assert_eq!(outcome.status, CompletionStatus::Cancelled);
  assert_flags(&unit, false, true, true);
}

#[test]
fn test_cancel_without_cancel_fn_does_not_interrupt_work() {
  setup_tracing_for_test();
  let (unit, slot) = parked_unit();
  unit.start().unwrap();

  assert_eq!(unit.cancel(), CancelDisposition::Requested);
  assert_flags(&unit, true, false, false);

  // The work ignores the request and finishes normally.
  assert!(take_parked(&slot).finish_with("done anyway".to_string()));
  assert_flags(&unit, false, true, false);
  assert!(unit.is_cancel_requested());
}

#[test]
fn test_missing_work_fn_fails_at_construction() {
  setup_tracing_for_test();
  let missing: Option<WorkFn<String, String>> = None;
  assert_eq!(TestUnit::from_parts(missing, None).err(), Some(UnitError::MissingWorkFn));
  assert_eq!(
    TestUnit::builder()
      .on_cancel(|done| {
        done.cancelled();
      })
      .build()
      .err(),
    Some(UnitError::MissingWorkFn)
  );

  let work: WorkFn<String, String> = Box::new(|done| {
    done.finish();
  });
  let unit = TestUnit::from_parts(Some(work), None).unwrap();
  assert_eq!(unit.start(), Ok(UnitState::Finished));
}

#[test]
fn test_second_start_is_reported_and_ignored() {
  setup_tracing_for_test();
  let runs = Arc::new(AtomicUsize::new(0));
  let runs_clone = runs.clone();
  let unit = TestUnit::new(move |_done| {
    runs_clone.fetch_add(1, Ordering::SeqCst);
  });

  assert_eq!(unit.start(), Ok(UnitState::Executing));
  assert_eq!(unit.start(), Err(UnitError::AlreadyStarted { unit_id: unit.id() }));
  assert_eq!(runs.load(Ordering::SeqCst), 1);
  assert_flags(&unit, true, false, false);
}

#[test]
fn test_work_reported_error_is_a_finished_outcome() {
  setup_tracing_for_test();
  let unit = TestUnit::new(|done| {
    done.fail("connection refused".to_string());
  });
  assert_eq!(unit.start(), Ok(UnitState::Finished));
  assert_flags(&unit, false, true, false);
  let outcome = unit.outcome().unwrap();
  assert_eq!(outcome.status, CompletionStatus::Finished);
  assert_eq!(outcome.error.as_deref(), Some("connection refused"));
  assert!(!outcome.is_success());
}

#[test]
fn test_panicking_work_finishes_with_panic_message() {
  setup_tracing_for_test();
  let unit = TestUnit::new(|_done| {
    panic!("work exploded");
  });
  assert_eq!(unit.start(), Ok(UnitState::Finished));
  let outcome = unit.outcome().unwrap();
  assert_eq!(outcome.panic.as_deref(), Some("work exploded"));
  assert!(!outcome.is_success());

  let unit = TestUnit::new(|done| {
    done.finish_with("kept".to_string());
    panic!("after completion");
  });
  assert_eq!(unit.start(), Ok(UnitState::Finished));
  let outcome = unit.outcome().unwrap();
  assert_eq!(outcome.value.as_deref(), Some("kept"));
  assert!(outcome.panic.is_none());
}

#[test]
fn test_panicking_cancel_fn_leaves_unit_executing() {
  setup_tracing_for_test();
  let slot = Arc::new(Mutex::new(None));
  let slot_for_work = slot.clone();
  let unit = TestUnit::cancellable(
    move |done| {
      *slot_for_work.lock().unwrap() = Some(done);
    },
    |_done| panic!("cancel hook exploded"),
  );
  unit.start().unwrap();

  assert_eq!(unit.cancel(), CancelDisposition::CancelFnInvoked);
  assert_flags(&unit, true, false, false);

  assert!(take_parked(&slot).cancelled());
  assert_flags(&unit, false, true, true);
}

#[test]
fn test_start_racing_cancel_always_lands_consistently() {
  setup_tracing_for_test();
  for _round in 0..200 {
    let work_ran = Arc::new(AtomicBool::new(false));
    let work_ran_clone = work_ran.clone();
    let unit = TestUnit::new(move |done| {
      work_ran_clone.store(true, Ordering::SeqCst);
      done.finish();
    });

    let barrier = Arc::new(Barrier::new(2));
    let starter = {
      let (unit, barrier) = (unit.clone(), barrier.clone());
      thread::spawn(move || {
        barrier.wait();
        unit.start()
      })
    };
    let canceller = {
      let (unit, barrier) = (unit.clone(), barrier.clone());
      thread::spawn(move || {
        barrier.wait();
        unit.cancel()
      })
    };

    let start_result = starter.join().unwrap();
    let disposition = canceller.join().unwrap();

    assert!(start_result.is_ok());
    assert!(unit.is_finished());
    if work_ran.load(Ordering::SeqCst) {
      assert_eq!(unit.state(), UnitState::Finished);
      assert_ne!(disposition, CancelDisposition::CancelledBeforeStart);
    } else {
      assert_eq!(unit.state(), UnitState::Cancelled);
    }
  }
}

#[test]
fn test_started_unit_never_appears_idle() {
  setup_tracing_for_test();
  for _round in 0..50 {
    let unit = TestUnit::new(|done| {
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(1));
        done.finish();
      });
    });

    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
      let (unit, stop) = (unit.clone(), stop.clone());
      thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
          if unit.is_started() {
            assert!(
              unit.is_executing() || unit.is_finished(),
              "A started unit must be executing or terminal."
            );
          }
        }
      })
    };

    unit.start().unwrap();
    while !unit.is_finished() {
      thread::yield_now();
    }
    stop.store(true, Ordering::SeqCst);
    observer.join().unwrap();
    assert_flags(&unit, false, true, false);
  }
}

#[tokio::test]
async fn test_wait_resolves_for_completion_from_another_thread() {
  setup_tracing_for_test();
  let (unit, slot) = parked_unit();
  unit.start().unwrap();
  let done = take_parked(&slot);

  let waiter = {
    let unit = unit.clone();
    tokio::spawn(async move { unit.wait().await })
  };
  thread::spawn(move || {
    thread::sleep(Duration::from_millis(20));
    done.finish_with("from a thread".to_string());
  });

  let outcome = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
  assert_eq!(outcome.value.as_deref(), Some("from a thread"));
  // Waiting again on a terminal unit resolves immediately with the same outcome.
  assert!(Arc::ptr_eq(&outcome, &unit.wait().await));
}
