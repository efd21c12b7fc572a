//! 保留压缩 / Retention compaction
//!
//! 每天低峰期扫描会话消息窗口，把每个窗口裁剪到保留上限，只留最新的
//! 条目。裁剪只作用于缓存窗口，持久存储不受影响。
//! A daily off-peak sweep over the conversation message windows, trimming
//! each to the retention cap and keeping only the newest entries. Trimming
//! touches the cache window only, never the durable store.

use crate::cache::SharedCache;
use chrono::Timelike;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

/// 会话窗口键模式 / Conversation window key pattern
const WINDOW_PATTERN: &str = "message-*";

/// 扫描全部会话窗口并裁剪超限的 / Sweep every conversation window and trim
/// the ones over the cap. Per-window faults are logged and the sweep
/// continues. Returns how many windows were trimmed.
pub async fn compact(cache: &dyn SharedCache, keep: u64) -> usize {
    let windows = match cache.keys(WINDOW_PATTERN).await {
        Ok(windows) => windows,
        Err(e) => {
            warn!("压缩扫描失败 compaction scan failed: {}", e);
            return 0;
        }
    };

    let mut trimmed = 0;
    for window in &windows {
        let len = match cache.zset_len(window).await {
            Ok(len) => len,
            Err(e) => {
                warn!("压缩读取失败 compaction read failed {}: {}", window, e);
                continue;
            }
        };
        if len <= keep {
            continue;
        }
        match cache.zset_trim_oldest(window, keep).await {
            Ok(_) => trimmed += 1,
            Err(e) => warn!("压缩裁剪失败 compaction trim failed {}: {}", window, e),
        }
    }
    info!(
        "🧹 Compaction swept {} window(s), trimmed {}",
        windows.len(),
        trimmed
    );
    trimmed
}

/// 每小时醒来一次，命中配置的时辰才执行压缩 / Wakes hourly and runs the
/// sweep only when the configured hour comes around
pub fn spawn_compaction_task(
    cache: Arc<dyn SharedCache>,
    keep: u64,
    hour: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        info!("⏰ Compaction scheduled daily at hour {}", hour);
        let mut tick = interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if chrono::Local::now().hour() == hour {
                        compact(cache.as_ref(), keep).await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
}
