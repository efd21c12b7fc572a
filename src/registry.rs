//! 连接注册表 / Connection registry
//!
//! 进程内的在线状态：一个已验证用户对应零或多个活动连接（多端登录），
//! 连接可绑定到若干群。无持久化，每次 ready 时从群目录重建。
//! Process-local liveness: one verified user maps to zero or more live
//! connections (multi-device), each optionally bound to groups. No
//! persistence — rebuilt from the group directory on every ready.

use crate::error::ImError;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

/// 已绑定用户的活动连接 / A live connection bound to a verified user
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: String,
    /// 客户端类型（pc/mobile/web），用于同端互踢 / Client type, used for
    /// same-client other-login notices
    pub client: String,
    sender: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(
        conn_id: String,
        user_id: String,
        client: String,
        sender: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            conn_id,
            user_id,
            client,
            sender,
        }
    }

    /// 推送一帧文本 / Push one text frame
    pub fn push(&self, frame: String) -> Result<(), ImError> {
        self.sender
            .send(frame)
            .map_err(|_| ImError::delivery(self.conn_id.clone(), "connection channel closed"))
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionHandle>,
    user_index: DashMap<String, DashSet<String>>,
    group_index: DashMap<String, DashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.user_index
            .entry(handle.user_id.clone())
            .or_default()
            .insert(handle.conn_id.clone());
        self.connections.insert(handle.conn_id.clone(), handle);
    }

    /// 幂等注销 / Idempotent unregister
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, handle)) = self.connections.remove(conn_id) {
            if let Some(conns) = self.user_index.get(&handle.user_id) {
                conns.remove(conn_id);
            }
            self.user_index
                .remove_if(&handle.user_id, |_, conns| conns.is_empty());
        }
        for entry in self.group_index.iter() {
            entry.value().remove(conn_id);
        }
    }

    pub fn bind_group(&self, conn_id: &str, group_id: &str) {
        self.group_index
            .entry(group_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn connections_for(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let Some(conn_ids) = self.user_index.get(user_id) else {
            return Vec::new();
        };
        conn_ids
            .iter()
            .filter_map(|id| self.connections.get(id.key()).map(|h| h.clone()))
            .collect()
    }

    pub fn connections_in_group(&self, group_id: &str) -> Vec<ConnectionHandle> {
        let Some(conn_ids) = self.group_index.get(group_id) else {
            return Vec::new();
        };
        conn_ids
            .iter()
            .filter_map(|id| self.connections.get(id.key()).map(|h| h.clone()))
            .collect()
    }

    pub fn online(&self, user_id: &str) -> bool {
        self.user_index
            .get(user_id)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }

    pub fn is_bound_to_group(&self, conn_id: &str, group_id: &str) -> bool {
        self.group_index
            .get(group_id)
            .map(|conns| conns.contains(conn_id))
            .unwrap_or(false)
    }
}
