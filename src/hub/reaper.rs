use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::HubHandle;

/// 过期会话清理任务
///
/// 每隔 `every` 请求引擎移除活跃时间早于 `now - stale_after` 的会话。
/// 清理走与正常断开相同的注销路径。
pub fn spawn_reaper(
    hub: HubHandle,
    every: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stale_after = chrono::Duration::from_std(stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        info!(
            "🧹 过期会话清理任务已启动 (interval={}s, threshold={}s)",
            every.as_secs(),
            stale_after.num_seconds()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - stale_after;
                    if let Err(e) = hub.sweep(cutoff).await {
                        warn!("调度引擎已关闭，清理任务退出: {}", e);
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("过期会话清理任务已停止");
    })
}
