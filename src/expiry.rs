//! 缓存过期协调器 / Cache-expiry coordinator
//!
//! 订阅缓存的键空间事件与业务频道，把通知路由到对应的清理或业务处理。
//! 单条通知的处理失败只记录，订阅循环本身永不因此退出。
//! Subscribes to the cache's keyspace events and the business channels and
//! routes each notification to its cleanup or business handler. A fault in
//! one notification is logged and never brings down the subscription loop.

use crate::cache::SharedCache;
use crate::error::ImError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

/// 键空间事件频道前缀 / Keyspace event channel prefix
const KEYEVENT_PREFIX: &str = "__keyevent@";

/// 业务频道 / Business channels
pub const CHANNEL_MESSAGE: &str = "im:message";
pub const CHANNEL_NOTICE: &str = "im:notice";
pub const CHANNEL_NOTIFICATION: &str = "im:notification";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEventKind {
    Expired,
    HashFieldExpired,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// 缓存逻辑库编号 / Logical cache database number
    pub db: u32,
    pub kind: KeyEventKind,
}

/// 解析 `__keyevent@<db>__:<event>` 形式的频道名 / Parse a
/// `__keyevent@<db>__:<event>` channel name
pub fn parse_key_event(channel: &str) -> Option<KeyEvent> {
    let rest = channel.strip_prefix(KEYEVENT_PREFIX)?;
    let sep = rest.find("__:")?;
    let db: u32 = rest[..sep].parse().ok()?;
    let kind = match &rest[sep + 3..] {
        "expired" => KeyEventKind::Expired,
        "hexpired" => KeyEventKind::HashFieldExpired,
        other => KeyEventKind::Other(other.to_string()),
    };
    Some(KeyEvent { db, kind })
}

type BusinessHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ExpiryCoordinator {
    cache: Arc<dyn SharedCache>,
    business: RwLock<HashMap<String, BusinessHandler>>,
}

impl ExpiryCoordinator {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self {
            cache,
            business: RwLock::new(HashMap::new()),
        }
    }

    /// 注册业务频道处理器 / Register a handler for one business channel
    pub fn register_business<F>(&self, channel: &str, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.business
            .write()
            .insert(channel.to_string(), Arc::new(handler));
    }

    /// 路由一条通知 / Route one notification
    pub async fn handle_notification(&self, channel: &str, payload: &str) {
        if channel.starts_with(KEYEVENT_PREFIX) {
            let Some(event) = parse_key_event(channel) else {
                let err = ImError::NotificationParse(format!(
                    "unparseable keyspace channel {:?}",
                    channel
                ));
                warn!("{}", err);
                return;
            };
            match event.kind {
                KeyEventKind::Expired => self.dispose_expired(payload).await,
                KeyEventKind::HashFieldExpired => self.drop_file_mappings(payload).await,
                KeyEventKind::Other(kind) => {
                    debug!("忽略键事件 ignoring key event {} on db {}", kind, event.db);
                }
            }
            return;
        }

        let handler = self.business.read().get(channel).cloned();
        match channel {
            CHANNEL_MESSAGE | CHANNEL_NOTICE | CHANNEL_NOTIFICATION => {
                info!("📨 Business notification on {}: {}", channel, payload);
                if let Some(handler) = handler {
                    handler(payload);
                }
            }
            _ => {
                if let Some(handler) = handler {
                    handler(payload);
                } else {
                    debug!("无人认领的频道 unclaimed channel {}", channel);
                }
            }
        }
    }

    /// 会话键过期 → 清理其根文件映射 / An expired session key drops its
    /// root file mapping
    async fn dispose_expired(&self, key: &str) {
        let Some(session_id) = key.strip_prefix("sess:") else {
            debug!("过期键无需处理 expired key needs no cleanup: {}", key);
            return;
        };
        if let Err(e) = self.cache.del(&format!("files:root:{}", session_id)).await {
            warn!("过期清理失败 expiry cleanup failed key={}: {}", key, e);
        }
    }

    /// 哈希字段过期 → 清理发布文件映射 / An expired hash field drops the
    /// published file mappings
    async fn drop_file_mappings(&self, field: &str) {
        let pattern = format!("files:pub:{}:*", field);
        let keys = match self.cache.keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("过期清理失败 expiry cleanup failed field={}: {}", field, e);
                return;
            }
        };
        for key in keys {
            if let Err(e) = self.cache.del(&key).await {
                warn!("过期清理失败 expiry cleanup failed key={}: {}", key, e);
            }
        }
    }

    /// 订阅循环，直到收到停机信号 / Subscription loop, runs until shutdown
    pub async fn run(
        self: Arc<Self>,
        client: redis::Client,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe("__keyevent@*__:*").await?;
        pubsub.psubscribe("im:*").await?;
        info!("🔔 Expiry coordinator subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let channel = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("通知载荷解码失败 payload decode failed on {}: {}", channel, e);
                            continue;
                        }
                    };
                    self.handle_notification(&channel, &payload).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("👋 Expiry coordinator shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_keyevent_channels() {
        assert_eq!(
            parse_key_event("__keyevent@3__:expired"),
            Some(KeyEvent {
                db: 3,
                kind: KeyEventKind::Expired
            })
        );
        assert_eq!(
            parse_key_event("__keyevent@0__:hexpired"),
            Some(KeyEvent {
                db: 0,
                kind: KeyEventKind::HashFieldExpired
            })
        );
        assert_eq!(
            parse_key_event("__keyevent@1__:del"),
            Some(KeyEvent {
                db: 1,
                kind: KeyEventKind::Other("del".into())
            })
        );
        assert_eq!(parse_key_event("bogus"), None);
        assert_eq!(parse_key_event("__keyevent@x__:expired"), None);
    }

    #[tokio::test]
    async fn expired_session_key_drops_root_file_mapping() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("files:root:abc", "f-1").await.unwrap();
        let coordinator = ExpiryCoordinator::new(cache.clone());

        coordinator
            .handle_notification("__keyevent@3__:expired", "sess:abc")
            .await;
        assert!(cache.get("files:root:abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_hash_field_drops_published_mappings() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("files:pub:k1:a", "1").await.unwrap();
        cache.set("files:pub:k1:b", "2").await.unwrap();
        cache.set("files:pub:k2:a", "3").await.unwrap();
        let coordinator = ExpiryCoordinator::new(cache.clone());

        coordinator
            .handle_notification("__keyevent@0__:hexpired", "k1")
            .await;
        assert!(cache.get("files:pub:k1:a").await.unwrap().is_none());
        assert!(cache.get("files:pub:k1:b").await.unwrap().is_none());
        assert!(cache.get("files:pub:k2:a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn business_channel_reaches_registered_handler() {
        let cache = Arc::new(MemoryCache::new());
        let coordinator = ExpiryCoordinator::new(cache);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        coordinator.register_business(CHANNEL_MESSAGE, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator
            .handle_notification(CHANNEL_MESSAGE, "{\"id\":\"m1\"}")
            .await;
        coordinator.handle_notification("im:unrelated", "x").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_channel_is_swallowed() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("files:root:abc", "f-1").await.unwrap();
        let coordinator = ExpiryCoordinator::new(cache.clone());

        coordinator
            .handle_notification("__keyevent@??__:expired", "sess:abc")
            .await;
        // 解析失败不触发任何清理 / A parse failure triggers no cleanup
        assert!(cache.get("files:root:abc").await.unwrap().is_some());
    }
}
