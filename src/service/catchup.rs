//! 离线补发 / Offline catch-up
//!
//! ready 成功后的回放钩子：先补发私聊离线标记，再按每个群的已读水位线
//! 补发群消息，只发给新上线的这一个连接。
//! The hook invoked after a successful ready: replay private offline
//! markers first, then group messages newer than the user's per-group
//! watermark, pushed to the newly connected device only.

use crate::cache::SharedCache;
use crate::domain::{Envelope, Message, SendCode};
use crate::registry::ConnectionHandle;
use crate::service::GroupDirectory;
use crate::store::{MessageFilter, MessageStore, Page};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// 已读水位线键 / Read-watermark key for (reader, conversation)
pub fn read_key(user_id: &str, chat_id: &str) -> String {
    format!("read:{}:{}", user_id, chat_id)
}

pub struct CatchUpService {
    store: Arc<dyn MessageStore>,
    groups: Arc<dyn GroupDirectory>,
    cache: Arc<dyn SharedCache>,
}

impl CatchUpService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        groups: Arc<dyn GroupDirectory>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            store,
            groups,
            cache,
        }
    }

    /// 回放离线消息，返回补发条数 / Replay missed messages, returning how
    /// many were pushed
    pub async fn replay(&self, user_id: &str, conn: &ConnectionHandle) -> anyhow::Result<usize> {
        let mut replayed = 0;

        // 离线标记：全部推送成功才清除。连接在 ready 中途断开时标记保留，
        // 下一次 ready 重放。
        // Offline markers, cleared only once every one of them was pushed.
        // A connection dying mid-ready keeps them for the next ready.
        let offline = self.store.offline_for(user_id).await?;
        let mut marker_ids: HashSet<&str> = HashSet::new();
        for message in &offline {
            if self.push(conn, message) == 1 {
                marker_ids.insert(message.id.as_str());
            }
        }
        replayed += marker_ids.len();
        if !offline.is_empty() && marker_ids.len() == offline.len() {
            self.store.clear_offline(user_id, None).await?;
        }

        // 群消息按水位线补发；标记已补发过的ID跳过，避免同一条推两次
        // Group messages newer than the watermark; ids already replayed
        // from their markers are skipped so no message is pushed twice
        let now = chrono::Utc::now().timestamp_millis();
        for group_id in self.groups.groups_of(user_id).await? {
            let watermark: i64 = self
                .cache
                .get(&read_key(user_id, &group_id))
                .await
                .ok()
                .flatten()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let filter = MessageFilter {
                chat_id: Some(group_id.clone()),
                date_range: Some((watermark + 1, now)),
                ..Default::default()
            };
            let missed = self
                .store
                .query(
                    &filter,
                    Page {
                        offset: 0,
                        limit: 1000,
                    },
                )
                .await?;
            for message in &missed {
                if message.from_id != user_id && !marker_ids.contains(message.id.as_str()) {
                    replayed += self.push(conn, message);
                }
            }
        }

        debug!("📦 Catch-up for {}: {} message(s)", user_id, replayed);
        Ok(replayed)
    }

    fn push(&self, conn: &ConnectionHandle, message: &Message) -> usize {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("补发消息序列化失败 catch-up serialize failed: {}", e);
                return 0;
            }
        };
        let frame = match Envelope::new(SendCode::Message, payload).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("补发消息序列化失败 catch-up serialize failed: {}", e);
                return 0;
            }
        };
        match conn.push(frame) {
            Ok(()) => 1,
            Err(e) => {
                debug!("补发推送失败 catch-up push failed: {}", e);
                0
            }
        }
    }
}
