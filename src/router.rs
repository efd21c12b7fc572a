//! 消息路由器 / Message router — the protocol state machine
//!
//! 每个入站信封的唯一入口。按封闭的指令码枚举分发；`ready` 必须是连接上
//! 的第一个信封，之前的任何业务信封都被拒绝且不产生其他副作用。
//! The single entry point for every inbound envelope, dispatched over the
//! closed code enumeration. `ready` must be the first envelope on a
//! connection; anything before it is rejected with no other side effect.

use crate::cache::SharedCache;
use crate::coordination::Primitives;
use crate::delivery::{DeliveryEngine, DeliveryOutcome};
use crate::domain::{
    ChatType, Envelope, Message, NoticeTarget, ReadReceipt, ReadyAuth, SendCode,
};
use crate::error::ImError;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::service::{read_key, CatchUpService, GroupDirectory, IdentityResolver};
use crate::store::MessageStore;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// 一条连接的协议状态 / Per-connection protocol state
///
/// 由传输层在握手后创建，`ready` 成功前 `user_id()` 为空。
/// Created by the transport layer after the handshake; `user_id()` is empty
/// until a successful `ready`.
pub struct ConnContext {
    pub conn_id: String,
    sender: tokio::sync::mpsc::UnboundedSender<String>,
    authed: Mutex<Option<String>>,
}

impl ConnContext {
    pub fn new(conn_id: String, sender: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self {
            conn_id,
            sender,
            authed: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> Option<String> {
        self.authed.lock().clone()
    }

    fn bind(&self, user_id: String) {
        *self.authed.lock() = Some(user_id);
    }

    pub fn send(&self, frame: String) -> Result<(), ImError> {
        self.sender
            .send(frame)
            .map_err(|_| ImError::delivery(self.conn_id.clone(), "connection channel closed"))
    }
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    delivery: Arc<DeliveryEngine>,
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityResolver>,
    groups: Arc<dyn GroupDirectory>,
    primitives: Arc<Primitives>,
    cache: Arc<dyn SharedCache>,
    catchup: Arc<CatchUpService>,
    /// 每用户每分钟的发送上限，0 表示不限流 / Per-user sends per minute,
    /// 0 disables the limit
    send_per_minute: u64,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        delivery: Arc<DeliveryEngine>,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        groups: Arc<dyn GroupDirectory>,
        primitives: Arc<Primitives>,
        cache: Arc<dyn SharedCache>,
        catchup: Arc<CatchUpService>,
        send_per_minute: u64,
    ) -> Self {
        Self {
            registry,
            delivery,
            store,
            identity,
            groups,
            primitives,
            cache,
            catchup,
            send_per_minute,
        }
    }

    /// 处理一帧文本 / Handle one text frame
    pub async fn handle_text(&self, ctx: &ConnContext, text: &str) -> Result<(), ImError> {
        debug!("📨 Received text from {}: {}", ctx.conn_id, text);

        // 裸心跳，握手前后都应答 / Bare liveness probe, answered pre- and
        // post-ready
        if text == PING {
            return ctx.send(PONG.to_string());
        }

        let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
            warn!("协议错误 malformed envelope on {}: {}", ctx.conn_id, e);
            ImError::protocol(e.to_string())
        })?;

        match envelope.code {
            SendCode::Ping => {
                debug!("🏓 Ping from {}", ctx.conn_id);
                ctx.send(PONG.to_string())
            }
            SendCode::Ready => self.handle_ready(ctx, envelope.message).await,
            code => {
                let Some(user_id) = ctx.user_id() else {
                    return Err(ImError::auth(format!(
                        "envelope {:?} received before ready on {}",
                        code, ctx.conn_id
                    )));
                };
                match code {
                    SendCode::Message => {
                        self.handle_message(ctx, &user_id, envelope.message).await?;
                        Ok(())
                    }
                    SendCode::Read => self.handle_read(ctx, &user_id, envelope.message).await,
                    SendCode::OtherLogin
                    | SendCode::FriendRequest
                    | SendCode::GroupRequest => self.forward_notice(ctx, envelope.message, text),
                    // 错误通知为出站帧，入站仅记录 / Error notices are
                    // outbound; inbound ones are only logged
                    SendCode::Error => {
                        debug!("客户端错误帧 client error frame from {}", user_id);
                        Ok(())
                    }
                    // Ping/Ready 已在上面分支处理 / Handled above
                    SendCode::Ping | SendCode::Ready => unreachable!(),
                }
            }
        }
    }

    /// 认证绑定：解析凭据、注册连接、订阅群、同端互踢、离线补发。
    /// Auth-bind: resolve the credential, register the connection, bind
    /// groups, kick same-client sessions, run offline catch-up.
    async fn handle_ready(&self, ctx: &ConnContext, payload: serde_json::Value) -> Result<(), ImError> {
        let auth: ReadyAuth = serde_json::from_value(payload)
            .map_err(|e| ImError::protocol(format!("malformed ready payload: {}", e)))?;
        let user_id = self
            .identity
            .resolve(&auth.token)
            .await
            .map_err(|e| ImError::auth(format!("identity resolution failed: {}", e)))?;

        // 同端其他登录收到下线通知 / Other sessions of the same client type
        // get an other-login notice
        self.notify_other_login(ctx, &user_id, &auth);

        let handle = ConnectionHandle::new(
            ctx.conn_id.clone(),
            user_id.clone(),
            auth.client.clone(),
            ctx.sender.clone(),
        );
        self.registry.register(handle.clone());
        ctx.bind(user_id.clone());

        // 在线状态标记，失败不阻断绑定 / Online flag; a failed write never
        // blocks the bind
        if let Err(e) = self
            .cache
            .set(&format!("conn:status:{}", user_id), "1")
            .await
        {
            warn!("在线状态写入失败 conn status write failed uid={}: {}", user_id, e);
        }

        let groups = self
            .groups
            .groups_of(&user_id)
            .await
            .map_err(|e| ImError::auth(format!("group subscription failed: {}", e)))?;
        for group_id in &groups {
            self.registry.bind_group(&ctx.conn_id, group_id);
        }
        info!(
            "✅ {} ready on {} ({} group(s))",
            user_id,
            ctx.conn_id,
            groups.len()
        );

        // 离线补发只推给新上线的这条连接 / Catch-up goes to this connection
        // only
        if let Err(e) = self.catchup.replay(&user_id, &handle).await {
            warn!("离线补发失败 catch-up failed uid={}: {}", user_id, e);
        }
        Ok(())
    }

    fn notify_other_login(&self, ctx: &ConnContext, user_id: &str, auth: &ReadyAuth) {
        let peers = self.registry.connections_for(user_id);
        if peers.is_empty() {
            return;
        }
        let frame = match Envelope::new(SendCode::OtherLogin, json!({ "uuid": auth.uuid }))
            .to_frame()
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("下线通知序列化失败 other-login serialize failed: {}", e);
                return;
            }
        };
        for peer in peers {
            if peer.conn_id != ctx.conn_id && peer.client == auth.client {
                let _ = peer.push(frame.clone());
            }
        }
    }

    async fn handle_message(
        &self,
        ctx: &ConnContext,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryOutcome, ImError> {
        if self.send_per_minute > 0 {
            let allowed = self
                .primitives
                .rate_limit(
                    &format!("rate:send:{}", user_id),
                    Duration::from_secs(60),
                    self.send_per_minute,
                )
                .await;
            if !allowed {
                warn!("发送限流 send rate limited uid={}", user_id);
                return Err(ImError::rate_limited(format!(
                    "uid {} above {} sends per minute",
                    user_id, self.send_per_minute
                )));
            }
        }

        let message = Message::from_wire(payload, user_id)?;
        if message.chat_type == ChatType::Group
            && !self.registry.is_bound_to_group(&ctx.conn_id, &message.chat_id)
        {
            warn!(
                "群发送未授权 uid={} not a member of group {}",
                user_id, message.chat_id
            );
            return Err(ImError::auth("not a member of the target group"));
        }
        self.delivery.deliver(message).await
    }

    /// 推进已读水位线并转发回执 / Advance the read watermark and forward the
    /// receipt to the other online participants
    async fn handle_read(
        &self,
        ctx: &ConnContext,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), ImError> {
        let mut receipt: ReadReceipt = serde_json::from_value(payload)
            .map_err(|e| ImError::protocol(format!("malformed read payload: {}", e)))?;
        // 读取者以连接身份为准 / The reader is the connection identity
        receipt.from_id = user_id.to_string();
        if receipt.timestamp <= 0 {
            receipt.timestamp = chrono::Utc::now().timestamp_millis();
        }

        let advanced = self
            .primitives
            .advance_watermark(&read_key(user_id, &receipt.chat_id), receipt.timestamp)
            .await;
        if !advanced {
            debug!(
                "乱序回执被拒绝 out-of-order receipt rejected chat={} reader={}",
                receipt.chat_id, user_id
            );
            return Ok(());
        }

        // 已读即清掉该会话的补发标记 / Reading clears the conversation's
        // offline markers
        if let Err(e) = self
            .store
            .clear_offline(user_id, Some(&receipt.chat_id))
            .await
        {
            warn!(
                "补发标记清理失败 offline clear failed chat={} reader={}: {}",
                receipt.chat_id, user_id, e
            );
        }

        let payload = serde_json::to_value(&receipt)
            .map_err(|e| ImError::protocol(e.to_string()))?;
        let frame = Envelope::new(SendCode::Read, payload).to_frame()?;
        let targets = match receipt.chat_type {
            ChatType::Private => self.registry.connections_for(&receipt.chat_id),
            ChatType::Group => self.registry.connections_in_group(&receipt.chat_id),
        };
        for conn in targets {
            if conn.conn_id != ctx.conn_id && conn.user_id != user_id {
                if let Err(e) = conn.push(frame.clone()) {
                    debug!("回执转发失败 receipt forward failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// 在场类通知原文转发，不持久化 / Presence-style notices forwarded
    /// verbatim, never persisted
    fn forward_notice(
        &self,
        ctx: &ConnContext,
        payload: serde_json::Value,
        raw: &str,
    ) -> Result<(), ImError> {
        let target: NoticeTarget = serde_json::from_value(payload)
            .map_err(|e| ImError::protocol(format!("malformed notice payload: {}", e)))?;
        let conns = match target.chat_type {
            ChatType::Private => self.registry.connections_for(&target.chat_id),
            ChatType::Group => self.registry.connections_in_group(&target.chat_id),
        };
        if conns.is_empty() {
            debug!("通知目标不在线 notice target offline chat={}", target.chat_id);
            return Ok(());
        }
        for conn in conns {
            if conn.conn_id != ctx.conn_id {
                if let Err(e) = conn.push(raw.to_string()) {
                    debug!("通知转发失败 notice forward failed: {}", e);
                }
            }
        }
        Ok(())
    }
}
