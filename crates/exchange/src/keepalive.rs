use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::traits::SessionKeyProvider;

/// Refreshes `key` every `period` until the returned task is aborted. The
/// first refresh happens one full period after spawning.
pub fn spawn_keepalive(provider: Arc<dyn SessionKeyProvider>, key: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut refreshes: u64 = 0;
        loop {
            ticker.tick().await;
            match provider.refresh(&key).await {
                Ok(()) => {
                    refreshes += 1;
                    debug!(refreshes, "Session key refreshed");
                }
                Err(e) => warn!(error = %e, "Session key refresh failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSessionKeys;

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_on_period() {
        let keys = Arc::new(RecordingSessionKeys::new());
        let task = spawn_keepalive(keys.clone(), "key-1".to_string(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(keys.refresh_count(), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(keys.refresh_count(), 2);

        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(keys.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_keeps_running() {
        let keys = Arc::new(RecordingSessionKeys::new());
        keys.fail_refreshes(true);
        let task = spawn_keepalive(keys.clone(), "key-1".to_string(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(keys.refresh_attempts(), 2);
        assert_eq!(keys.refresh_count(), 0);

        keys.fail_refreshes(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(keys.refresh_count(), 1);
        task.abort();
    }
}
