//! 内存实现 / In-memory implementation of [`SharedCache`]
//!
//! 单进程部署与测试使用。脚本原语以一把互斥锁达到与 Lua 脚本相同的
//! 原子性。
//! Used by single-process deployments and tests. The scripted primitives
//! get the same atomicity as the Lua scripts from one mutex.

use super::SharedCache;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MemState {
    values: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(i64, String)>>,
}

impl MemState {
    /// 惰性清理过期值 / Lazily purge expired values
    fn purge(&mut self, key: &str) {
        if let Some((_, Some(deadline))) = self.values.get(key) {
            if Instant::now() >= *deadline {
                self.values.remove(key);
            }
        }
    }

    fn live_value(&mut self, key: &str) -> Option<String> {
        self.purge(key);
        self.values.get(key).map(|(v, _)| v.clone())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<MemState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .values
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.state.lock().values.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.values.remove(key);
        state.lists.remove(key);
        state.zsets.remove(key);
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.state.lock();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        // LRANGE 语义：负索引从尾部起算，起点越界返回空
        // LRANGE semantics: negative indexes count from the tail, an
        // out-of-range start yields an empty page
        let from = if start < 0 { (len + start).max(0) } else { start };
        let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if from >= len || to < from {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<()> {
        if let Some(list) = self.state.lock().lists.get_mut(key) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn zset_add(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        zset.sort_by_key(|(s, _)| *s);
        Ok(())
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .zsets
            .get(key)
            .map(|z| z.len() as u64)
            .unwrap_or(0))
    }

    async fn zset_trim_oldest(&self, key: &str, keep: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(0);
        };
        let len = zset.len() as u64;
        if len <= keep {
            return Ok(0);
        }
        let removed = len - keep;
        zset.drain(0..removed as usize);
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // 仅支持尾部通配，足以覆盖 message-* 类扫描
        // Prefix-star patterns only, enough for message-* style scans
        let state = self.state.lock();
        let matches = |k: &str| -> bool {
            match pattern.strip_suffix('*') {
                Some(prefix) => k.starts_with(prefix),
                None => k == pattern,
            }
        };
        let mut out: Vec<String> = state
            .values
            .keys()
            .chain(state.lists.keys())
            .chain(state.zsets.keys())
            .filter(|k| matches(k))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn acquire_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        match state.live_value(key) {
            Some(holder) if holder != token => Ok(false),
            _ => {
                state.values.insert(
                    key.to_string(),
                    (token.to_string(), Some(Instant::now() + ttl)),
                );
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.live_value(key) {
            Some(holder) if holder == token => {
                state.values.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rate_incr(&self, key: &str, window: Duration, max_count: u64) -> Result<bool> {
        let mut state = self.state.lock();
        let current: u64 = state
            .live_value(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = current + 1;
        // 仅首次计数时设置窗口 / Window ttl set on first increment only
        let deadline = if current == 0 {
            Some(Instant::now() + window)
        } else {
            state.values.get(key).and_then(|(_, d)| *d)
        };
        state
            .values
            .insert(key.to_string(), (next.to_string(), deadline));
        Ok(next <= max_count)
    }

    async fn advance_watermark(&self, key: &str, timestamp: i64) -> Result<bool> {
        let mut state = self.state.lock();
        let current: Option<i64> = state.live_value(key).and_then(|v| v.parse().ok());
        match current {
            Some(cur) if timestamp <= cur => Ok(false),
            _ => {
                state
                    .values
                    .insert(key.to_string(), (timestamp.to_string(), None));
                Ok(true)
            }
        }
    }
}
