use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info};

use vpnshop_db::Store;
use vpnshop_db::models::activity::{Event, EventCategory};

/// Periodic job that moves matured referral bonuses into wallets.
pub struct ReferralSweep {
    store: Arc<dyn Store>,
    period: Duration,
}

impl ReferralSweep {
    pub fn new(store: Arc<dyn Store>, period: Duration) -> Self {
        Self { store, period }
    }

    /// One pass. Returns how many bonuses were credited.
    pub async fn run_once(&self) -> anyhow::Result<u64> {
        let credited = self.store.mature_referral_bonuses(Utc::now()).await?;
        if credited > 0 {
            info!(credited, "referral bonuses matured");
            let event = Event::info(EventCategory::System, "referral_sweep")
                .context(serde_json::json!({ "credited": credited }));
            self.store.log_event(&event).await?;
        }
        Ok(credited)
    }

    pub async fn start(self, mut shutdown: broadcast::Receiver<()>) {
        info!(period_secs = self.period.as_secs(), "starting referral sweep");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("referral sweep error: {:#}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("referral sweep stopped");
                    return;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.start(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnshop_db::MemoryStore;

    #[tokio::test]
    async fn empty_sweep_logs_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sweep = ReferralSweep::new(store.clone(), Duration::from_secs(60));
        assert_eq!(sweep.run_once().await.unwrap(), 0);
        assert!(store.events().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = broadcast::channel(1);
        let handle = ReferralSweep::new(store, Duration::from_secs(60)).spawn(rx);
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
