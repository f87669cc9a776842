//! Periodic persistence of dirty Blocks, decoupled from the request path.

use super::store::{PersistReport, Store};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Persister {
    store: Arc<Store>,
    period: Duration,
}

impl Persister {
    pub fn new(store: Arc<Store>, period: Duration) -> Arc<Self> {
        Arc::new(Self { store, period })
    }

    /// Persists every dirty Block on a blocking thread.
    pub async fn flush(&self) -> PersistReport {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.persist_all()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Persist task failed: {}", e);
                PersistReport::default()
            }
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tracing::info!("Starting persister (period {:?})", self.period);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.flush().await;
            }
        })
    }
}
