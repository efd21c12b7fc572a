//! 消息与信封的线缆结构 / Wire structures for envelopes and messages

use crate::error::ImError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 信封指令码，封闭枚举 / Envelope codes, a closed enumeration
///
/// 未列出的 code 在反序列化阶段即失败，作为协议错误丢弃。
/// Codes outside this set fail at deserialization and are dropped as
/// protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SendCode {
    Ping,
    Ready,
    Message,
    Read,
    OtherLogin,
    FriendRequest,
    GroupRequest,
    /// 服务端错误通知，出站为主 / Server-side error notice, mostly outbound
    Error,
}

/// 外层信封 / Outer wire envelope: `{ "code": ..., "message": ... }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub code: SendCode,
    #[serde(default)]
    pub message: Value,
}

impl Envelope {
    pub fn new(code: SendCode, message: Value) -> Self {
        Self { code, message }
    }

    pub fn to_frame(&self) -> Result<String, ImError> {
        serde_json::to_string(self).map_err(|e| ImError::protocol(e.to_string()))
    }
}

/// 会话类型 / Conversation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatType {
    /// 私聊，会话ID即对端用户ID / Private chat, conversation id is the peer uid
    #[serde(rename = "private", alias = "friend")]
    Private,
    #[serde(rename = "group")]
    Group,
}

/// 消息类型 / Message payload type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    Voice,
    Video,
    Forward,
    Event,
}

/// 聊天消息，创建后不可变 / Chat message, immutable once created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    pub from_id: String,
    pub message_type: MessageType,
    pub content: String,
    /// 服务端时间戳（毫秒）/ Server timestamp in milliseconds
    pub timestamp: i64,
    /// 扩展属性 / Extension attributes
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extension: Value,
}

impl Message {
    /// 从信封载荷构造消息：补发ID、盖服务端时间戳、以连接身份覆盖发送者。
    /// Build a message from an envelope payload: fill a missing id, stamp
    /// the server timestamp, and pin the sender to the connection identity.
    pub fn from_wire(payload: Value, from_id: &str) -> Result<Self, ImError> {
        let mut value = payload;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ImError::protocol("message payload is not an object"))?;
        let missing_id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map_or(true, |s| s.is_empty());
        if missing_id {
            obj.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        obj.insert(
            "timestamp".into(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        obj.insert("fromId".into(), Value::String(from_id.to_string()));
        serde_json::from_value(value).map_err(|e| ImError::protocol(e.to_string()))
    }

    /// 会话的缓存窗口键 / Live cache window key for this conversation
    pub fn window_key(&self) -> String {
        format!("message-{}", self.chat_id)
    }
}

/// ready 信封携带的认证引用 / Credential reference carried by ready
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyAuth {
    pub token: String,
    /// 客户端类型（pc/mobile/web）/ Client type
    #[serde(default)]
    pub client: String,
    /// 本次登录的设备标识 / Device identifier of this login
    #[serde(default)]
    pub uuid: String,
}

/// 已读回执，是水位线而非逐条标记 / Read receipt — a watermark, not a
/// per-message flag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub chat_id: String,
    /// 读取者ID，由服务端以连接身份填充 / Reader id, pinned server-side
    #[serde(default)]
    pub from_id: String,
    pub chat_type: ChatType,
    #[serde(default)]
    pub timestamp: i64,
}

/// 透传类通知的目标 / Routing target of an opaque presence-style notice
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeTarget {
    pub chat_id: String,
    pub chat_type: ChatType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_code_matches_wire_tags() {
        let codes = [
            (SendCode::Ping, "\"ping\""),
            (SendCode::Ready, "\"ready\""),
            (SendCode::Message, "\"message\""),
            (SendCode::Read, "\"read\""),
            (SendCode::OtherLogin, "\"other-login\""),
            (SendCode::FriendRequest, "\"friend-request\""),
            (SendCode::GroupRequest, "\"group-request\""),
            (SendCode::Error, "\"error\""),
        ];
        for (code, tag) in codes {
            assert_eq!(serde_json::to_string(&code).unwrap(), tag);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let err = serde_json::from_str::<Envelope>(r#"{"code":"selfie","message":{}}"#);
        assert!(err.is_err());
    }

    #[test]
    fn from_wire_stamps_id_and_sender() {
        let payload = serde_json::json!({
            "chatId": "u2",
            "chatType": "private",
            "messageType": "text",
            "content": "hello",
            "fromId": "spoofed",
        });
        let msg = Message::from_wire(payload, "u1").unwrap();
        assert!(!msg.id.is_empty());
        assert_eq!(msg.from_id, "u1");
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn emitted_error_frame_parses_back() {
        let frame = Envelope::new(
            SendCode::Error,
            serde_json::json!({"error": "unauthorized"}),
        )
        .to_frame()
        .unwrap();
        let parsed: Envelope = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed.code, SendCode::Error);
        assert_eq!(parsed.message["error"], "unauthorized");
    }

    #[test]
    fn friend_alias_still_parses_as_private() {
        let t: ChatType = serde_json::from_str("\"friend\"").unwrap();
        assert_eq!(t, ChatType::Private);
    }
}
