//! 消息存储 / Message store
//!
//! 离线补发与历史检索的事实来源。落库引擎是外部协作方，这里只定义窄接口；
//! [`memory::MemoryMessageStore`] 供单机部署与测试使用。
//! Source of truth for offline catch-up and history search. The durable
//! engine is an external collaborator behind this narrow interface;
//! [`memory::MemoryMessageStore`] backs single-node runs and tests.

pub mod memory;

use crate::domain::{Message, MessageType};
use crate::error::ImError;
use async_trait::async_trait;

/// 历史查询条件 / History query filter
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub chat_id: Option<String>,
    pub from_id: Option<String>,
    pub message_type: Option<MessageType>,
    /// 毫秒闭区间 / Inclusive millisecond range
    pub date_range: Option<(i64, i64)>,
    pub search_text: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 追加一条消息，失败对发送致命 / Append one message; failure is fatal
    /// to the send
    async fn append(&self, message: &Message) -> Result<(), ImError>;

    /// 按条件查询，时间升序 / Query by filter, ascending by timestamp
    async fn query(&self, filter: &MessageFilter, page: Page) -> Result<Vec<Message>, ImError>;

    /// 为离线接收者记一条待补发标记，按消息ID去重。
    /// Record an offline marker for a recipient, deduplicated by message id.
    async fn mark_offline(&self, recipient: &str, message: &Message) -> Result<(), ImError>;

    async fn offline_for(&self, recipient: &str) -> Result<Vec<Message>, ImError>;

    /// 清除补发标记；`chat_id` 为空时清除该接收者的全部标记。
    /// Clear markers; all of the recipient's markers when `chat_id` is None.
    async fn clear_offline(&self, recipient: &str, chat_id: Option<&str>) -> Result<(), ImError>;
}
