//! 投递引擎 / Delivery engine
//!
//! 收件人解析、先落库后推送、在线扇出与离线标记。
//! Recipient resolution, durable-append-before-push, live fan-out and
//! offline markers.
//!
//! 顺序不变量：落库恰好一次，发生在收件人解析之后、任何推送之前——即使
//! 所有推送都失败，消息在宣布"已发送"前已经持久。
//! Ordering invariant: the append happens exactly once, after recipient
//! resolution and before any push attempt, so the message is durable
//! before it is declared sent even if every push fails.

use crate::cache::SharedCache;
use crate::domain::{ChatType, Envelope, Message, SendCode};
use crate::error::ImError;
use crate::registry::ConnectionRegistry;
use crate::service::GroupDirectory;
use crate::store::MessageStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// 单次群成员查询的上限 / Upper bound of one membership query
pub const MAX_MEMBER_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub message_id: String,
    /// 成功推送的连接数 / Connections pushed successfully
    pub delivered: usize,
    /// 记了离线标记的接收者数 / Recipients marked offline
    pub offline: usize,
    /// 推送失败的连接数 / Connections whose push failed
    pub failed: usize,
}

pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    groups: Arc<dyn GroupDirectory>,
    cache: Arc<dyn SharedCache>,
    page_size: usize,
}

impl DeliveryEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        groups: Arc<dyn GroupDirectory>,
        cache: Arc<dyn SharedCache>,
        page_size: usize,
    ) -> Self {
        Self {
            registry,
            store,
            groups,
            cache,
            page_size: page_size.clamp(1, MAX_MEMBER_BATCH),
        }
    }

    pub async fn deliver(&self, message: Message) -> Result<DeliveryOutcome, ImError> {
        let recipients = self.resolve_recipients(&message).await?;

        // 先落库，恰好一次 / Durable append first, exactly once
        self.store.append(&message).await?;

        let payload =
            serde_json::to_value(&message).map_err(|e| ImError::persistence(e.to_string()))?;
        let frame = Envelope::new(SendCode::Message, payload).to_frame()?;

        // 会话的活动缓存窗口，供保留压缩任务修剪；写失败仅记录
        // Live cache window for the retention task; a failed write is
        // advisory only
        if let Err(e) = self
            .cache
            .zset_add(&message.window_key(), message.timestamp, &frame)
            .await
        {
            debug!("消息窗口写入失败 window write failed chat={}: {}", message.chat_id, e);
        }

        let mut outcome = DeliveryOutcome {
            message_id: message.id.clone(),
            delivered: 0,
            offline: 0,
            failed: 0,
        };

        for recipient in &recipients {
            let conns = self.registry.connections_for(recipient);
            if conns.is_empty() {
                // 即发即弃的标记写入 / Fire-and-forget marker write
                match self.store.mark_offline(recipient, &message).await {
                    Ok(()) => outcome.offline += 1,
                    Err(e) => warn!(
                        "离线标记写入失败 offline marker failed chat={} recipient={}: {}",
                        message.chat_id, recipient, e
                    ),
                }
                continue;
            }
            for conn in conns {
                match conn.push(frame.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(e) => {
                        // 单连接失败不拖垮整次发送 / One connection never
                        // fails the whole send
                        warn!(
                            "投递失败 push failed chat={} recipient={}: {}",
                            message.chat_id, recipient, e
                        );
                        outcome.failed += 1;
                    }
                }
            }
        }

        // 回显到发送者自己的各端 / Echo to the sender's own devices
        for conn in self.registry.connections_for(&message.from_id) {
            if let Err(e) = conn.push(frame.clone()) {
                debug!("发送者回显失败 sender echo failed: {}", e);
            }
        }

        Ok(outcome)
    }

    /// 私聊收件人即会话对端；群聊分页拉取成员，单批不超过
    /// [`MAX_MEMBER_BATCH`]，发送者除外。
    /// The private recipient is the conversation peer; group recipients are
    /// fetched in pages of at most [`MAX_MEMBER_BATCH`], sender excluded.
    async fn resolve_recipients(&self, message: &Message) -> Result<Vec<String>, ImError> {
        match message.chat_type {
            ChatType::Private => Ok(vec![message.chat_id.clone()]),
            ChatType::Group => {
                let mut recipients = Vec::new();
                let mut page = 0;
                loop {
                    let batch = self
                        .groups
                        .members_of(&message.chat_id, self.page_size, page)
                        .await
                        .map_err(|e| {
                            ImError::Collaborator(format!(
                                "membership query failed for group {}: {}",
                                message.chat_id, e
                            ))
                        })?;
                    let last_page = batch.len() < self.page_size;
                    recipients.extend(batch.into_iter().filter(|uid| uid != &message.from_id));
                    if last_page {
                        break;
                    }
                    page += 1;
                }
                Ok(recipients)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::domain::MessageType;
    use crate::registry::ConnectionHandle;
    use crate::service::StaticGroupDirectory;
    use crate::store::memory::MemoryMessageStore;
    use crate::store::{MessageFilter, Page};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn message(chat_id: &str, chat_type: ChatType, from_id: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            chat_type,
            from_id: from_id.into(),
            message_type: MessageType::Text,
            content: "hello".into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            extension: serde_json::Value::Null,
        }
    }

    fn engine(
        registry: Arc<ConnectionRegistry>,
        store: Arc<MemoryMessageStore>,
        groups: Arc<dyn GroupDirectory>,
    ) -> DeliveryEngine {
        DeliveryEngine::new(
            registry,
            store,
            groups,
            Arc::new(MemoryCache::new()),
            MAX_MEMBER_BATCH,
        )
    }

    fn connect(
        registry: &ConnectionRegistry,
        conn_id: &str,
        uid: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(ConnectionHandle::new(
            conn_id.into(),
            uid.into(),
            "pc".into(),
            tx,
        ));
        rx
    }

    #[tokio::test]
    async fn offline_private_message_is_durable_with_one_marker() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryMessageStore::new());
        let engine = engine(
            registry.clone(),
            store.clone(),
            Arc::new(StaticGroupDirectory::new()),
        );

        let outcome = engine
            .deliver(message("u2", ChatType::Private, "u1"))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.offline, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.offline_for("u2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn online_private_message_reaches_every_device() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryMessageStore::new());
        let engine = engine(
            registry.clone(),
            store.clone(),
            Arc::new(StaticGroupDirectory::new()),
        );
        let mut rx_a = connect(&registry, "c1", "u2");
        let mut rx_b = connect(&registry, "c2", "u2");

        let outcome = engine
            .deliver(message("u2", ChatType::Private, "u1"))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.offline, 0);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    /// 记录分页次数的群目录 / Group directory counting page fetches
    struct CountingDirectory {
        inner: StaticGroupDirectory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GroupDirectory for CountingDirectory {
        async fn members_of(
            &self,
            group_id: &str,
            page_size: usize,
            page: usize,
        ) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.members_of(group_id, page_size, page).await
        }

        async fn groups_of(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
            self.inner.groups_of(user_id).await
        }
    }

    #[tokio::test]
    async fn large_group_resolves_in_bounded_batches_and_appends_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryMessageStore::new());
        let directory = Arc::new(CountingDirectory {
            inner: StaticGroupDirectory::new(),
            calls: AtomicUsize::new(0),
        });
        for i in 0..2500 {
            directory.inner.add_member("g1", &format!("m{}", i));
        }
        let engine = engine(registry.clone(), store.clone(), directory.clone());

        let outcome = engine
            .deliver(message("g1", ChatType::Group, "m0"))
            .await
            .unwrap();
        // 2500 名成员 → 3 个 ≤1000 的批次 / 2500 members, 3 batches of ≤1000
        assert_eq!(directory.calls.load(Ordering::SeqCst), 3);
        // 落库恰好一次，而非每批一次 / Appended once, not once per batch
        assert_eq!(store.len(), 1);
        assert_eq!(outcome.offline, 2499);
    }

    #[tokio::test]
    async fn dead_connection_does_not_fail_the_send() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryMessageStore::new());
        let engine = engine(
            registry.clone(),
            store.clone(),
            Arc::new(StaticGroupDirectory::new()),
        );
        let rx_dead = connect(&registry, "c1", "u2");
        drop(rx_dead);
        let mut rx_live = connect(&registry, "c2", "u2");

        let outcome = engine
            .deliver(message("u2", ChatType::Private, "u1"))
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, 1);
        assert!(rx_live.recv().await.is_some());
    }

    /// 落库失败的存储 / A store whose append always faults
    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _: &Message) -> Result<(), ImError> {
            Err(ImError::persistence("document store unreachable"))
        }
        async fn query(&self, _: &MessageFilter, _: Page) -> Result<Vec<Message>, ImError> {
            Ok(Vec::new())
        }
        async fn mark_offline(&self, _: &str, _: &Message) -> Result<(), ImError> {
            Ok(())
        }
        async fn offline_for(&self, _: &str) -> Result<Vec<Message>, ImError> {
            Ok(Vec::new())
        }
        async fn clear_offline(&self, _: &str, _: Option<&str>) -> Result<(), ImError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn append_failure_is_fatal_and_nothing_is_pushed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = DeliveryEngine::new(
            registry.clone(),
            Arc::new(FailingStore),
            Arc::new(StaticGroupDirectory::new()),
            Arc::new(MemoryCache::new()),
            MAX_MEMBER_BATCH,
        );
        let mut rx = connect(&registry, "c1", "u2");

        let err = engine
            .deliver(message("u2", ChatType::Private, "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImError::Persistence(_)));
        assert!(rx.try_recv().is_err());
    }
}
