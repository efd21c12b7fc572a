//! 分布式原语服务 / Distributed primitives service
//!
//! 互斥锁、固定窗口限流与已读水位线的唯一入口。所有原语在缓存服务端以
//! 单次原子脚本执行；任何执行故障一律失败关闭——锁视为未获得，限流视为
//! 不允许，水位线视为未推进。
//! The single entry point for mutual exclusion, fixed-window rate limiting
//! and the read watermark. Every primitive executes as one atomic script on
//! the cache server; any execution fault fails closed — the lock is not
//! granted, the request is not allowed, the watermark is not advanced.

use crate::cache::SharedCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Primitives {
    cache: Arc<dyn SharedCache>,
}

impl Primitives {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    /// 随机持有者令牌，释放时校验 / Random holder token, checked on release
    pub fn lock_token() -> String {
        use rand::Rng;
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(16)
            .map(char::from)
            .collect()
    }

    /// 尝试获取锁 / Try to acquire a lock with an ownership token
    pub async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> bool {
        match self.cache.acquire_lock(key, token, ttl).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!("协调失败 coordination fault on try_lock key={}: {}", key, e);
                false
            }
        }
    }

    /// 释放锁，仅当令牌仍然匹配 / Release, only while the token still matches
    pub async fn unlock(&self, key: &str, token: &str) -> bool {
        match self.cache.release_lock(key, token).await {
            Ok(released) => released,
            Err(e) => {
                warn!("协调失败 coordination fault on unlock key={}: {}", key, e);
                false
            }
        }
    }

    /// 固定窗口限流 / Fixed-window rate limit, true = allowed
    pub async fn rate_limit(&self, key: &str, window: Duration, max_count: u64) -> bool {
        match self.cache.rate_incr(key, window, max_count).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(
                    "协调失败 coordination fault on rate_limit key={}: {}",
                    key, e
                );
                false
            }
        }
    }

    /// 推进已读水位线，过期的时间戳被拒绝 / Advance a read watermark;
    /// out-of-order timestamps are rejected
    pub async fn advance_watermark(&self, key: &str, timestamp: i64) -> bool {
        match self.cache.advance_watermark(key, timestamp).await {
            Ok(advanced) => advanced,
            Err(e) => {
                warn!(
                    "协调失败 coordination fault on watermark key={}: {}",
                    key, e
                );
                false
            }
        }
    }
}
