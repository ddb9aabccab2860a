//! 本地降级存储的定期清理

use std::sync::Arc;
use std::time::Duration;

use guard_adapter_local::LocalKvStore;
use guard_ports::KvStore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 清理一遍所有存储，返回清理条目数
pub async fn purge_all(stores: &[Arc<LocalKvStore>]) -> usize {
    let mut purged = 0;

    for store in stores {
        match store.purge_expired().await {
            Ok(count) => purged += count,
            Err(e) => warn!(error = %e, "Failed to purge expired entries"),
        }
    }

    if purged > 0 {
        debug!(purged, "Expired fallback entries purged");
    }

    purged
}

/// 按固定间隔清理，直到取消
pub fn spawn_cleanup(
    stores: Vec<Arc<LocalKvStore>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Fallback cleanup started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    purge_all(&stores).await;
                }
            }
        }

        info!("Fallback cleanup stopped");
    })
}
