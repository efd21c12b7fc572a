//! 内存消息存储 / In-memory message store

use super::{MessageFilter, MessageStore, Page};
use crate::domain::Message;
use crate::error::ImError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
    offline: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

fn matches(filter: &MessageFilter, message: &Message) -> bool {
    if let Some(chat_id) = &filter.chat_id {
        if &message.chat_id != chat_id {
            return false;
        }
    }
    if let Some(from_id) = &filter.from_id {
        if &message.from_id != from_id {
            return false;
        }
    }
    if let Some(message_type) = &filter.message_type {
        if &message.message_type != message_type {
            return false;
        }
    }
    if let Some((start, end)) = filter.date_range {
        if message.timestamp < start || message.timestamp > end {
            return false;
        }
    }
    if let Some(text) = &filter.search_text {
        if !message.content.contains(text.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &Message) -> Result<(), ImError> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn query(&self, filter: &MessageFilter, page: Page) -> Result<Vec<Message>, ImError> {
        let mut hits: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .filter(|m| matches(filter, m))
            .cloned()
            .collect();
        hits.sort_by_key(|m| m.timestamp);
        Ok(hits.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn mark_offline(&self, recipient: &str, message: &Message) -> Result<(), ImError> {
        let mut offline = self.offline.lock();
        let markers = offline.entry(recipient.to_string()).or_default();
        if !markers.iter().any(|m| m.id == message.id) {
            markers.push(message.clone());
        }
        Ok(())
    }

    async fn offline_for(&self, recipient: &str) -> Result<Vec<Message>, ImError> {
        let mut markers = self
            .offline
            .lock()
            .get(recipient)
            .cloned()
            .unwrap_or_default();
        markers.sort_by_key(|m| m.timestamp);
        Ok(markers)
    }

    async fn clear_offline(&self, recipient: &str, chat_id: Option<&str>) -> Result<(), ImError> {
        let mut offline = self.offline.lock();
        match chat_id {
            None => {
                offline.remove(recipient);
            }
            Some(chat_id) => {
                if let Some(markers) = offline.get_mut(recipient) {
                    markers.retain(|m| m.chat_id != chat_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatType, MessageType};

    fn message(id: &str, chat_id: &str, from_id: &str, ts: i64, content: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: chat_id.into(),
            chat_type: ChatType::Private,
            from_id: from_id.into(),
            message_type: MessageType::Text,
            content: content.into(),
            timestamp: ts,
            extension: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let store = MemoryMessageStore::new();
        for i in 0..10 {
            store
                .append(&message(
                    &format!("m{}", i),
                    "c1",
                    if i % 2 == 0 { "u1" } else { "u2" },
                    100 + i,
                    &format!("note {}", i),
                ))
                .await
                .unwrap();
        }
        store
            .append(&message("x", "c2", "u1", 200, "elsewhere"))
            .await
            .unwrap();

        let filter = MessageFilter {
            chat_id: Some("c1".into()),
            from_id: Some("u1".into()),
            ..Default::default()
        };
        let hits = store.query(&filter, Page::default()).await.unwrap();
        assert_eq!(hits.len(), 5);
        assert!(hits.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let ranged = MessageFilter {
            chat_id: Some("c1".into()),
            date_range: Some((103, 106)),
            ..Default::default()
        };
        assert_eq!(store.query(&ranged, Page::default()).await.unwrap().len(), 4);

        let text = MessageFilter {
            search_text: Some("note 3".into()),
            ..Default::default()
        };
        assert_eq!(store.query(&text, Page::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_markers_dedupe_and_clear_by_chat() {
        let store = MemoryMessageStore::new();
        let m1 = message("m1", "c1", "u2", 100, "hi");
        let m2 = message("m2", "c9", "u3", 110, "yo");
        store.mark_offline("u1", &m1).await.unwrap();
        store.mark_offline("u1", &m1).await.unwrap();
        store.mark_offline("u1", &m2).await.unwrap();
        assert_eq!(store.offline_for("u1").await.unwrap().len(), 2);

        store.clear_offline("u1", Some("c1")).await.unwrap();
        let rest = store.offline_for("u1").await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "m2");

        store.clear_offline("u1", None).await.unwrap();
        assert!(store.offline_for("u1").await.unwrap().is_empty());
    }
}
