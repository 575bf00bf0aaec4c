use async_unit::{AsyncUnit, ShutdownMode, UnitPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

// Simulates a callback-style request: the work returns immediately and the
// result arrives later on another task.
fn fetch_unit(id: u32, delay_ms: u64, rt: Handle) -> AsyncUnit<String, String> {
  AsyncUnit::builder()
    .name(format!("fetch_{}", id))
    .label("fetch")
    .work(move |done| {
      let token = done.cancellation_token();
      rt.spawn(async move {
        tokio::select! {
          _ = token.cancelled() => {
            info!("Fetch {} noticed cancellation.", id);
            done.cancelled();
          }
          _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
            if id % 4 == 0 {
              done.fail(format!("fetch {} failed: upstream timeout", id));
            } else {
              done.finish_with(format!("payload of fetch {}", id));
            }
          }
        }
      });
    })
    .build()
    .expect("work function is set")
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Basic Usage Example ---");

  let pool = UnitPool::<String, String>::new(5, Handle::current(), "basic_pool");

  let mut handles = Vec::new();
  for id in 1..=8 {
    let unit = fetch_unit(id, 100 + u64::from(id) * 25, Handle::current());
    handles.push(pool.submit(unit).await.expect("pool accepts units"));
  }
  info!(
    "Submitted 8 units: {} active, {} queued.",
    pool.active_unit_count(),
    pool.queued_unit_count()
  );

  // Cancel the last one; it is still queued behind the concurrency limit.
  if let Some(last) = handles.last() {
    info!("Cancelling unit {}: {:?}", last.id(), last.cancel());
  }

  for handle in handles {
    let id = handle.id();
    let outcome = handle.await_outcome().await;
    match (&outcome.value, &outcome.error) {
      _ if outcome.is_cancelled() => info!("Unit {} was cancelled.", id),
      (Some(value), _) => info!("Unit {} finished: {}", id, value),
      (_, Some(error)) => info!("Unit {} finished with error: {}", id, error),
      (None, None) => info!("Unit {} finished without payload.", id),
    }
  }

  pool.shutdown(ShutdownMode::Graceful).await.expect("shutdown");
  info!("--- Basic Usage Example Finished ---");
}
