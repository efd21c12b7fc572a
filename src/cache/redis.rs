//! Redis 实现 / Redis-backed implementation of [`SharedCache`]
//!
//! 锁、限流、水位线是嵌入的 Lua 脚本：有序的 KEYS/ARGV，整数返回，
//! 1 表示成功/允许，0 表示失败/拒绝，调用方不解释其他返回形态。
//! Lock, rate limit and watermark are embedded Lua scripts: ordered
//! KEYS/ARGV, integer return, 1 = success/allowed, 0 = failure/denied;
//! callers never interpret any other return shape.

use super::SharedCache;
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// 仅当键不存在或已被同一令牌持有时设置，并重置TTL。
/// Set only when absent or already held by the same token, refreshing the ttl.
const LOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[2]))
    return 1
end
return 0
"#;

/// 令牌匹配才删除，避免释放他人持有的锁。
/// Delete only on token match so a stale caller cannot release a lock it
/// no longer owns.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// INCR 后仅在首次设置窗口TTL，再与上限比较，全部在一次往返内。
/// INCR, set the window ttl on first increment only, then compare against
/// the limit, all in one round trip.
const RATE_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
if count > tonumber(ARGV[2]) then
    return 0
end
return 1
"#;

/// 只在新值更大时写入（已读水位线单调性）。
/// Set only when the new value is greater (read-watermark monotonicity).
const WATERMARK_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false or tonumber(ARGV[1]) > tonumber(cur) then
    redis.call('SET', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// 连接并建立自动重连的连接管理器 / Connect with an auto-reconnecting
    /// connection manager
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("🔌 Connected to shared cache at {}", url);
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn eval_flag(&self, source: &str, key: &str, args: &[String]) -> Result<bool> {
        let script = Script::new(source);
        let mut call = script.prepare_invoke();
        call.key(key);
        for arg in args {
            call.arg(arg);
        }
        let flag: i64 = call.invoke_async(&mut self.conn()).await?;
        Ok(flag == 1)
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self.conn().set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().lpush(key, value).await?;
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().lrem(key, 0, value).await?;
        Ok(())
    }

    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let _: () = self.conn().zadd(key, member, score).await?;
        Ok(())
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zset_trim_oldest(&self, key: &str, keep: u64) -> Result<u64> {
        // 按排名删除最旧的部分，保留分数最高的 keep 个
        // Remove by rank, keeping the keep highest-scored members
        let len: u64 = self.conn().zcard(key).await?;
        if len <= keep {
            return Ok(0);
        }
        let stop = (len - keep) as isize - 1;
        let removed: u64 = self.conn().zremrangebyrank(key, 0, stop).await?;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.conn().keys(pattern).await?)
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.eval_flag(
            LOCK_SCRIPT,
            key,
            &[token.to_string(), ttl.as_secs().to_string()],
        )
        .await
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        self.eval_flag(UNLOCK_SCRIPT, key, &[token.to_string()]).await
    }

    async fn rate_incr(&self, key: &str, window: Duration, max_count: u64) -> Result<bool> {
        self.eval_flag(
            RATE_SCRIPT,
            key,
            &[window.as_secs().to_string(), max_count.to_string()],
        )
        .await
    }

    async fn advance_watermark(&self, key: &str, timestamp: i64) -> Result<bool> {
        self.eval_flag(WATERMARK_SCRIPT, key, &[timestamp.to_string()])
            .await
    }
}
