//! 共享缓存访问层 / Shared cache access layer
//!
//! 所有跨实例敏感的状态（聊天列表、锁、限流计数、消息窗口、键事件）都经由
//! 这一层；组件只依赖 [`SharedCache`]，测试用内存实现替换线上 Redis 实现。
//! Every cross-instance-sensitive piece of state goes through this seam;
//! components depend on [`SharedCache`] only, so tests substitute the
//! in-memory implementation for the wire-level Redis one.

pub mod memory;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// 缓存条目的TTL档位，按内容类别推导 / TTL tier of a cache entry, derived
/// from its content class so a refresh is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// 短期切片文件 / Short-lived segment files
    Segment,
    /// 长期静态资源 / Long-lived static assets
    StaticAsset,
    /// 头像 / Avatars
    Avatar,
}

impl TtlClass {
    pub fn ttl(&self) -> Duration {
        match self {
            TtlClass::Segment => Duration::from_secs(5 * 60),
            TtlClass::StaticAsset => Duration::from_secs(7 * 24 * 3600),
            TtlClass::Avatar => Duration::from_secs(24 * 3600),
        }
    }
}

/// 共享缓存操作集 / Shared cache operation set
///
/// 带脚本语义的方法（锁、限流、水位线）在线上实现里必须是单次往返的原子
/// 脚本；内存实现以进程内互斥达到同样的原子性。
/// The scripted methods (lock, rate limit, watermark) must be single
/// round-trip atomic scripts on the wire implementation; the in-memory one
/// gets the same atomicity from a process-local mutex.
#[async_trait]
pub trait SharedCache: Send + Sync {
    // 值操作 / Value operations
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    // 列表操作（聊天列表、群成员）/ List operations (chat lists, members)
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn list_push_front(&self, key: &str, value: &str) -> Result<()>;
    async fn list_remove(&self, key: &str, value: &str) -> Result<()>;

    // 有序集合操作（会话消息窗口）/ Sorted-set operations (message windows)
    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()>;
    async fn zset_len(&self, key: &str) -> Result<u64>;
    /// 保留分数最高的 `keep` 个成员，返回删除数量。
    /// Keep the `keep` highest-scored members, return how many were removed.
    async fn zset_trim_oldest(&self, key: &str, keep: u64) -> Result<u64>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    // 原子脚本原语 / Atomic scripted primitives
    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;
    /// 窗口计数加一并比较上限，单次往返。
    /// Increment-and-check against the window limit in one round trip.
    async fn rate_incr(&self, key: &str, window: Duration, max_count: u64) -> Result<bool>;
    /// 只在新时间戳更大时推进水位线。
    /// Advance the watermark only when the new timestamp is greater.
    async fn advance_watermark(&self, key: &str, timestamp: i64) -> Result<bool>;
}

/// 按内容类别写入缓存条目 / Write a classed cache entry; TTL comes from the
/// class, never from the caller.
pub async fn put_classed(
    cache: &dyn SharedCache,
    key: &str,
    value: &str,
    class: TtlClass,
) -> Result<()> {
    cache.set_ex(key, value, class.ttl()).await
}
