use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::runner::CommandRunner;
use crate::error::{CoreError, CoreResult};
use crate::helpers::lock;

pub type Pending = Shared<BoxFuture<'static, CoreResult<String>>>;

/// Coalesces concurrent executions of the same command line.
///
/// The pending handle is registered under the lock before the caller can
/// yield, so a second caller arriving at any later point observes it. The
/// execution itself is spawned: it completes and clears its slot even if every
/// waiter goes away.
pub struct SingleFlight {
    runner: Arc<dyn CommandRunner>,
    in_flight: Arc<Mutex<HashMap<String, Slot>>>,
    next_id: AtomicU64,
}

struct Slot {
    id: u64,
    pending: Pending,
}

impl SingleFlight {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn execute(&self, args: Vec<String>, timeout: Duration) -> Pending {
        let signature = args.join(" ");
        let mut in_flight = lock(&self.in_flight);

        if let Some(slot) = in_flight.get(&signature) {
            debug!("reusing active query: {}", signature);
            return slot.pending.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let run = self.runner.run(args, timeout);
        let slots = Arc::clone(&self.in_flight);
        let key = signature.clone();
        let task = tokio::spawn(async move {
            let result = run.await;
            let mut map = lock(&slots);
            // A newer execution may own the slot after an invalidate.
            if map.get(&key).is_some_and(|s| s.id == id) {
                map.remove(&key);
            }
            drop(map);
            result
        });

        let command = signature.clone();
        let pending = async move {
            task.await.unwrap_or_else(|e| {
                Err(CoreError::ExternalExecution {
                    command,
                    stderr: format!("execution task failed: {}", e),
                })
            })
        }
        .boxed()
        .shared();

        in_flight.insert(
            signature,
            Slot {
                id,
                pending: pending.clone(),
            },
        );
        pending
    }

    /// Detaches every pending execution: callers already waiting still get
    /// its result, later callers start a new one.
    pub fn invalidate(&self) -> usize {
        let mut in_flight = lock(&self.in_flight);
        let detached = in_flight.len();
        in_flight.clear();
        if detached > 0 {
            debug!("detached {} in-flight queries", detached);
        }
        detached
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use futures_util::future::join_all;

    fn args(s: &str) -> Vec<String> {
        s.split(' ').map(str::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_queries_run_once() {
        let runner = FakeRunner::new(Duration::from_millis(500));
        runner.respond("get pods -o json", Ok("{\"items\":[]}".into()));
        let flights = SingleFlight::new(runner.clone());

        let waiters: Vec<_> = (0..8)
            .map(|_| flights.execute(args("get pods -o json"), Duration::from_secs(15)))
            .collect();
        assert_eq!(flights.in_flight(), 1);

        let results = join_all(waiters).await;
        assert_eq!(runner.calls(), 1);
        assert!(
            results
                .iter()
                .all(|r| matches!(r, Ok(out) if out == "{\"items\":[]}"))
        );

        tokio::task::yield_now().await;
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_share_the_failure() {
        let runner = FakeRunner::new(Duration::from_millis(100));
        runner.respond(
            "get services -o json",
            Err(CoreError::Timeout {
                command: "kubectl get services -o json".into(),
                timeout_ms: 15_000,
            }),
        );
        let flights = SingleFlight::new(runner.clone());

        let a = flights.execute(args("get services -o json"), Duration::from_secs(15));
        let b = flights.execute(args("get services -o json"), Duration::from_secs(15));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(runner.calls(), 1);
        assert!(matches!(a, Err(CoreError::Timeout { .. })));
        assert!(matches!(b, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_signatures_and_later_calls_execute_again() {
        let runner = FakeRunner::new(Duration::from_millis(10));
        runner.respond("get pods -o json", Ok("p".into()));
        runner.respond("get nodes -o json", Ok("n".into()));
        let flights = SingleFlight::new(runner.clone());

        let (p, n) = tokio::join!(
            flights.execute(args("get pods -o json"), Duration::from_secs(1)),
            flights.execute(args("get nodes -o json"), Duration::from_secs(1)),
        );
        assert_eq!((p.unwrap(), n.unwrap()), ("p".to_string(), "n".to_string()));
        assert_eq!(runner.calls(), 2);

        tokio::task::yield_now().await;
        flights
            .execute(args("get pods -o json"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_starts_a_fresh_execution() {
        let runner = FakeRunner::new(Duration::from_millis(500));
        runner.respond("get pods -o json", Ok("p".into()));
        let flights = SingleFlight::new(runner.clone());

        let first = flights.execute(args("get pods -o json"), Duration::from_secs(15));
        assert_eq!(flights.invalidate(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = flights.execute(args("get pods -o json"), Duration::from_secs(15));
        assert_eq!(runner.calls(), 2);

        assert_eq!(first.await.unwrap(), "p");
        tokio::task::yield_now().await;
        assert_eq!(flights.in_flight(), 1);

        let third = flights.execute(args("get pods -o json"), Duration::from_secs(15));
        let (second, third) = tokio::join!(second, third);
        assert_eq!((second.unwrap(), third.unwrap()), ("p".to_string(), "p".to_string()));
        assert_eq!(runner.calls(), 2);
    }
}
