//! 聊天列表管理 / Chat list manager
//!
//! 每个用户两条有序去重的会话列表：置顶表与普通表，落在共享缓存的
//! list 结构上。插入前必须线性扫描目标列表做存在性检查——list 没有
//! 位置索引，不能依赖集合式的成员捷径。
//! Two ordered, duplicate-free conversation lists per user — pinned and
//! normal — backed by shared-cache lists. A linear membership scan before
//! insert is mandatory: a list without positional lookup cannot use a
//! set-membership shortcut.

use crate::cache::SharedCache;
use anyhow::Result;
use std::sync::Arc;

fn list_key(user_id: &str) -> String {
    format!("chat:list:{}", user_id)
}

fn top_key(user_id: &str) -> String {
    format!("chat:top:list:{}", user_id)
}

pub struct ChatListManager {
    cache: Arc<dyn SharedCache>,
}

impl ChatListManager {
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache }
    }

    async fn push_if_absent(&self, key: &str, chat_id: &str) -> Result<()> {
        let existing = self.cache.list_range(key, 0, -1).await?;
        if existing.iter().any(|id| id == chat_id) {
            return Ok(());
        }
        self.cache.list_push_front(key, chat_id).await
    }

    /// 不存在时插入到普通列表最前 / Insert at the front of the normal list
    /// when absent
    pub async fn add_if_absent(&self, user_id: &str, chat_id: &str) -> Result<()> {
        self.push_if_absent(&list_key(user_id), chat_id).await
    }

    /// 最近活跃的会话移到最前 / Move a recently active conversation to the
    /// front
    pub async fn move_to_front(&self, user_id: &str, chat_id: &str) -> Result<()> {
        let key = list_key(user_id);
        let existing = self.cache.list_range(&key, 0, -1).await?;
        if existing.iter().any(|id| id == chat_id) {
            self.cache.list_remove(&key, chat_id).await?;
            self.cache.list_push_front(&key, chat_id).await?;
        }
        Ok(())
    }

    /// 置顶：移出普通表，去重插入置顶表 / Pin: remove from the normal list,
    /// insert-if-absent into the pinned one
    pub async fn pin(&self, user_id: &str, chat_id: &str) -> Result<()> {
        self.cache.list_remove(&list_key(user_id), chat_id).await?;
        self.push_if_absent(&top_key(user_id), chat_id).await
    }

    /// 取消置顶，镜像操作 / Unpin, the mirror operation
    pub async fn unpin(&self, user_id: &str, chat_id: &str) -> Result<()> {
        self.cache.list_remove(&top_key(user_id), chat_id).await?;
        self.push_if_absent(&list_key(user_id), chat_id).await
    }

    /// 从两个列表里无条件移除：对此前部分失败留下的残留是防御性的。
    /// Remove from both lists unconditionally, tolerant of residue left by
    /// an earlier partial failure.
    pub async fn remove(&self, user_id: &str, chat_id: &str) -> Result<()> {
        self.cache.list_remove(&list_key(user_id), chat_id).await?;
        self.cache.list_remove(&top_key(user_id), chat_id).await?;
        Ok(())
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<String>> {
        self.cache.list_range(&list_key(user_id), 0, -1).await
    }

    pub async fn pinned_list(&self, user_id: &str) -> Result<Vec<String>> {
        self.cache.list_range(&top_key(user_id), 0, -1).await
    }
}
