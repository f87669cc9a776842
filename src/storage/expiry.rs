//! Background TTL sweep.
//!
//! Each tick walks every Block under its exclusive lock and drops slots whose
//! `expires` has passed. A full pass is O(total keys); the period trades the
//! window in which expired slots still occupy memory against sweep overhead.

use super::store::Store;
use super::types::now_ms;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct ExpirySweeper {
    store: Arc<Store>,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<Store>, period: Duration) -> Arc<Self> {
        Arc::new(Self { store, period })
    }

    /// Runs a single pass. Returns the number of slots removed.
    pub fn sweep_once(&self) -> usize {
        let removed = self.store.remove_expired(now_ms());
        if removed > 0 {
            tracing::debug!("Expiry sweep removed {} keys", removed);
        }
        removed
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!("Starting expiry sweeper (period {:?})", self.period);
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let sweeper = self.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                tracing::error!("Expiry sweep task failed: {}", e);
            }
        }
    }
}
