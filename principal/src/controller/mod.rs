//! Event-driven reconcile runner shared by the controllers.
//!
//! A controller maps store events to resource keys and reconciles one key at
//! a time. Failed keys are retried with exponential backoff (1s doubling to a
//! 10s cap); a reconcile may also ask to be re-run after a delay, which is how
//! the time-based gates (pause, transition delay, concurrency window) wake up
//! without polling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use crate::store::{Store, StoreEvent};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What a successful reconcile wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Outcome::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Outcome {
            requeue_after: Some(delay),
        }
    }
}

pub trait Reconciler: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    fn name(&self) -> &'static str;

    /// Keys to enqueue for a store event.
    fn interest(&self, event: &StoreEvent) -> Vec<String>;

    /// Every key this controller manages; used for the initial sync and to
    /// recover after the event channel lagged.
    fn all_keys(&self) -> Vec<String>;

    fn reconcile(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Outcome, Self::Error>> + Send;
}

/// Retry delay after `attempts` consecutive failures of one key.
pub(crate) fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    BASE_BACKOFF
        .saturating_mul(1u32 << exp)
        .min(MAX_BACKOFF)
}

struct WorkQueue {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    scheduled: Vec<(Instant, String)>,
}

impl WorkQueue {
    fn new() -> Self {
        WorkQueue {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            scheduled: Vec::new(),
        }
    }

    fn enqueue(&mut self, key: String) {
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn schedule(&mut self, key: String, delay: Duration) {
        let due = Instant::now() + delay;
        // A key keeps only its earliest wake-up.
        if let Some(existing) = self.scheduled.iter_mut().find(|(_, k)| *k == key) {
            if due < existing.0 {
                existing.0 = due;
            }
            return;
        }
        self.scheduled.push((due, key));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(due, _)| *due).min()
    }

    fn promote_due(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.scheduled.len() {
            if self.scheduled[index].0 <= now {
                let (_, key) = self.scheduled.swap_remove(index);
                self.enqueue(key);
            } else {
                index += 1;
            }
        }
    }

    fn pop(&mut self) -> Option<String> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }
}

pub async fn run_controller<R: Reconciler>(reconciler: R, store: Arc<Store>) {
    let mut events = store.subscribe();
    let mut queue = WorkQueue::new();
    let mut failures: HashMap<String, u32> = HashMap::new();

    for key in reconciler.all_keys() {
        queue.enqueue(key);
    }

    loop {
        while let Some(key) = queue.pop() {
            match reconciler.reconcile(&key).await {
                Ok(outcome) => {
                    failures.remove(&key);
                    if let Some(delay) = outcome.requeue_after {
                        tracing::debug!(
                            controller = reconciler.name(),
                            key = %key,
                            delay_secs = delay.as_secs(),
                            "requeueing"
                        );
                        queue.schedule(key, delay);
                    }
                }
                Err(error) => {
                    let attempts = failures.entry(key.clone()).or_insert(0);
                    *attempts += 1;
                    let delay = backoff_delay(*attempts);
                    tracing::warn!(
                        controller = reconciler.name(),
                        key = %key,
                        attempts = *attempts,
                        "reconcile failed, backing off: {}",
                        error
                    );
                    queue.schedule(key, delay);
                }
            }
        }

        let deadline = queue.next_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for key in reconciler.interest(&event) {
                        queue.enqueue(key);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        controller = reconciler.name(),
                        missed,
                        "event channel lagged, resyncing all keys"
                    );
                    for key in reconciler.all_keys() {
                        queue.enqueue(key);
                    }
                }
                Err(RecvError::Closed) => return,
            },
            _ = async {
                match deadline {
                    Some(due) => tokio::time::sleep_until(due).await,
                    // No timers pending; park until an event arrives.
                    None => std::future::pending().await,
                }
            } => {
                queue.promote_due();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_doubles_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_queue_deduplicates_pending_keys() {
        let mut queue = WorkQueue::new();
        queue.enqueue("a".to_string());
        queue.enqueue("a".to_string());
        queue.enqueue("b".to_string());
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_schedule_keeps_earliest_deadline() {
        let mut queue = WorkQueue::new();
        queue.schedule("a".to_string(), Duration::from_secs(30));
        queue.schedule("a".to_string(), Duration::from_secs(5));
        queue.schedule("a".to_string(), Duration::from_secs(60));
        assert_eq!(queue.scheduled.len(), 1);
        let deadline = queue.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(5));
    }

    struct CountingReconciler {
        count: Arc<AtomicUsize>,
    }

    impl Reconciler for CountingReconciler {
        type Error = std::convert::Infallible;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn interest(&self, event: &StoreEvent) -> Vec<String> {
            vec![event.key.clone()]
        }

        fn all_keys(&self) -> Vec<String> {
            Vec::new()
        }

        async fn reconcile(&self, _key: &str) -> Result<Outcome, Self::Error> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::done())
        }
    }

    #[tokio::test]
    async fn test_events_drive_reconciles() {
        let store = Arc::new(Store::new());
        let count = Arc::new(AtomicUsize::new(0));
        let reconciler = CountingReconciler {
            count: count.clone(),
        };
        let runner = tokio::spawn(run_controller(reconciler, store.clone()));

        // Give the runner a beat to subscribe, then produce an event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.upsert_hosted_cluster(models::cluster::HostedCluster::new("clusters", "a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        runner.abort();
    }
}
