//! 连接生命周期 / Connection lifecycle
//!
//! 握手、收发分离、读循环分发到路由器、断开清理。认证失败关闭连接；
//! 其余单帧错误记录后继续读。
//! Handshake, split send/receive, read-loop dispatch into the router and
//! disconnect cleanup. An authentication failure closes the connection;
//! any other per-frame error is logged and the loop keeps reading.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Envelope, SendCode};
use crate::error::ImError;
use crate::router::ConnContext;
use crate::server::ImServer;

/// 处理新连接 / Handle new connection
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    server: Arc<ImServer>,
) -> Result<()> {
    info!("📨 New connection from: {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = Uuid::new_v4().to_string();

    let send_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                warn!("Failed to send frame to {}: {}", send_conn_id, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let ctx = ConnContext::new(conn_id.clone(), tx);
    info!("✅ Client {} connected from {}", conn_id, peer_addr);

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                match server.router.handle_text(&ctx, &text).await {
                    Ok(()) => {}
                    Err(ImError::Auth(reason)) => {
                        // 认证失败即断开 / An auth failure closes the connection
                        warn!("🔒 Auth failure on {}: {}", conn_id, reason);
                        let notice = Envelope::new(
                            SendCode::Error,
                            serde_json::json!({"error": "unauthorized"}),
                        );
                        if let Ok(frame) = notice.to_frame() {
                            let _ = ctx.send(frame);
                        }
                        break;
                    }
                    Err(e) => {
                        debug!("Frame error on {}: {}", conn_id, e);
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            // 控制帧由 tungstenite 自动应答，业务心跳走文本帧
            // Control frames are answered by tungstenite itself; the
            // business heartbeat runs over text frames
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error from {}: {}", conn_id, e);
                break;
            }
        }
    }

    server.disconnect(&ctx).await;
    send_task.abort();
    info!("👋 Client {} disconnected", conn_id);
    Ok(())
}
