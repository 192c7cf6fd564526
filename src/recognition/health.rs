use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum BackendHealth {
    Unknown,
    Healthy,
    /// Recent calls failed; the loop keeps running with empty batches.
    Degraded { consecutive_failures: u32 },
    /// The backend cannot match yet (no reference set loaded).
    NotReady,
}

/// Shared, cloneable health state published over a watch channel.
#[derive(Clone)]
pub struct HealthIndicator {
    tx: Arc<watch::Sender<BackendHealth>>,
    failures: Arc<AtomicU32>,
}

impl Default for HealthIndicator {
    fn default() -> Self {
        Self::new(BackendHealth::Unknown)
    }
}

impl HealthIndicator {
    pub fn new(initial: BackendHealth) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.set(BackendHealth::Healthy);
    }

    pub fn record_failure(&self) {
        let consecutive_failures = self.failures.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        self.set(BackendHealth::Degraded {
            consecutive_failures,
        });
    }

    pub fn set_not_ready(&self) {
        self.set(BackendHealth::NotReady);
    }

    pub fn current(&self) -> BackendHealth {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendHealth> {
        self.tx.subscribe()
    }

    fn set(&self, health: BackendHealth) {
        self.tx.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_until_success() {
        let health = HealthIndicator::default();
        assert_eq!(health.current(), BackendHealth::Unknown);

        health.record_failure();
        health.record_failure();
        assert_eq!(
            health.current(),
            BackendHealth::Degraded {
                consecutive_failures: 2
            }
        );

        health.record_success();
        assert_eq!(health.current(), BackendHealth::Healthy);

        health.record_failure();
        assert_eq!(
            health.current(),
            BackendHealth::Degraded {
                consecutive_failures: 1
            }
        );
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let health = HealthIndicator::default();
        let mut rx = health.subscribe();

        health.set_not_ready();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), BackendHealth::NotReady);
    }
}
