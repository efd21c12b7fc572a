//! 统一的故障分类 / Unified fault taxonomy
//!
//! 每个变体对应一条明确的传播策略：局部故障不影响兄弟操作，
//! 持久化故障对发送是致命的，协调故障一律失败关闭。
//! Each variant carries a fixed propagation policy: faults local to one
//! recipient or notification never abort siblings, persistence faults are
//! fatal to the send, coordination faults always fail closed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImError {
    /// 报文格式错误，丢弃报文但保持连接 / Malformed or unknown envelope,
    /// dropped while the connection stays open
    #[error("协议错误 protocol error: {0}")]
    Protocol(String),

    /// ready 之前收到业务报文，或身份解析失败 / Envelope before a successful
    /// ready, or identity resolution failed
    #[error("认证错误 auth error: {0}")]
    Auth(String),

    /// 单个连接推送失败，不影响整体投递 / Push to one connection failed,
    /// never fails the whole send
    #[error("投递失败 delivery fault on connection {conn_id}: {reason}")]
    Delivery { conn_id: String, reason: String },

    /// 消息落库失败，对本次发送致命 / Durable append failed, fatal to the send
    #[error("持久化失败 persistence fault: {0}")]
    Persistence(String),

    /// 脚本原语执行失败或超时 / Scripted primitive failed or timed out
    #[error("协调失败 coordination fault: {0}")]
    Coordination(String),

    /// 发送频率超出窗口上限，报文被丢弃 / Send rate above the window cap,
    /// envelope dropped
    #[error("发送限流 rate limited: {0}")]
    RateLimited(String),

    /// 键事件频道名无法解析 / Malformed key-lifecycle channel name
    #[error("通知解析失败 notification parse fault: channel {0:?}")]
    NotificationParse(String),

    /// 外部协作方查询失败（群成员、群列表）/ External collaborator query
    /// failed (group membership, group list)
    #[error("协作方错误 collaborator fault: {0}")]
    Collaborator(String),
}

impl ImError {
    pub fn protocol<T: Into<String>>(message: T) -> Self {
        Self::Protocol(message.into())
    }

    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth(message.into())
    }

    pub fn delivery<A: Into<String>, B: Into<String>>(conn_id: A, reason: B) -> Self {
        Self::Delivery {
            conn_id: conn_id.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence<T: Into<String>>(message: T) -> Self {
        Self::Persistence(message.into())
    }

    pub fn rate_limited<T: Into<String>>(message: T) -> Self {
        Self::RateLimited(message.into())
    }
}

pub type ImResult<T> = Result<T, ImError>;
