//! 端到端投递流程 / End-to-end delivery flow over the assembled server
//! with the in-memory cache and store.

use std::sync::Arc;
use tokio::sync::mpsc;
use v_im_server::cache::memory::MemoryCache;
use v_im_server::cache::SharedCache;
use v_im_server::domain::{Envelope, SendCode};
use v_im_server::router::ConnContext;
use v_im_server::service::{StaticGroupDirectory, StaticIdentityResolver};
use v_im_server::store::MessageStore;
use v_im_server::{ImConfig, ImError, ImServer};

struct Harness {
    server: Arc<ImServer>,
    identity: Arc<StaticIdentityResolver>,
    groups: Arc<StaticGroupDirectory>,
}

fn harness() -> Harness {
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let identity = Arc::new(StaticIdentityResolver::new());
    let groups = Arc::new(StaticGroupDirectory::new());
    let server = ImServer::builder(ImConfig::default())
        .with_cache(cache)
        .with_identity(identity.clone())
        .with_groups(groups.clone())
        .build();
    Harness {
        server,
        identity,
        groups,
    }
}

fn context(conn_id: &str) -> (Arc<ConnContext>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ConnContext::new(conn_id.into(), tx)), rx)
}

async fn ready(h: &Harness, ctx: &ConnContext, token: &str) {
    let frame = serde_json::json!({
        "code": "ready",
        "message": {"token": token, "client": "pc", "uuid": "dev"}
    });
    h.server
        .router
        .handle_text(ctx, &frame.to_string())
        .await
        .unwrap();
}

#[tokio::test]
async fn offline_message_is_replayed_on_next_ready() {
    let h = harness();
    h.identity.insert("tok-a", "alice");
    h.identity.insert("tok-b", "bob");

    let (alice, _rx_alice) = context("c-alice");
    ready(&h, &alice, "tok-a").await;

    // bob 离线时发给他 / Sent to bob while he is offline
    let frame = serde_json::json!({
        "code": "message",
        "message": {
            "chatId": "bob",
            "chatType": "private",
            "messageType": "text",
            "content": "see you at nine"
        }
    });
    h.server
        .router
        .handle_text(&alice, &frame.to_string())
        .await
        .unwrap();
    assert_eq!(h.server.store.offline_for("bob").await.unwrap().len(), 1);

    // bob 上线即补发，标记清除 / bob comes online, replay happens, marker
    // cleared
    let (bob, mut rx_bob) = context("c-bob");
    ready(&h, &bob, "tok-b").await;
    let replayed: Envelope = serde_json::from_str(&rx_bob.recv().await.unwrap()).unwrap();
    assert_eq!(replayed.code, SendCode::Message);
    assert_eq!(replayed.message["content"], "see you at nine");
    assert_eq!(replayed.message["fromId"], "alice");
    assert!(h.server.store.offline_for("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn group_message_fans_out_to_online_members_and_marks_the_rest() {
    let h = harness();
    for (token, uid) in [("tok-a", "alice"), ("tok-b", "bob"), ("tok-c", "carol")] {
        h.identity.insert(token, uid);
        h.groups.add_member("g-standup", uid);
    }

    let (alice, mut rx_alice) = context("c-alice");
    ready(&h, &alice, "tok-a").await;
    let (bob, mut rx_bob) = context("c-bob");
    ready(&h, &bob, "tok-b").await;
    // carol 不上线 / carol stays offline

    let frame = serde_json::json!({
        "code": "message",
        "message": {
            "chatId": "g-standup",
            "chatType": "group",
            "messageType": "text",
            "content": "standup in five"
        }
    });
    h.server
        .router
        .handle_text(&alice, &frame.to_string())
        .await
        .unwrap();

    let to_bob: Envelope = serde_json::from_str(&rx_bob.recv().await.unwrap()).unwrap();
    assert_eq!(to_bob.message["content"], "standup in five");
    // 发送者自己的端也收到回显 / The sender's own device gets the echo
    let echo: Envelope = serde_json::from_str(&rx_alice.recv().await.unwrap()).unwrap();
    assert_eq!(echo.message["fromId"], "alice");
    assert_eq!(h.server.store.offline_for("carol").await.unwrap().len(), 1);
}

#[tokio::test]
async fn disconnect_clears_presence_only_for_the_last_device() {
    let h = harness();
    h.identity.insert("tok-a", "alice");

    let (first, _rx1) = context("c1");
    ready(&h, &first, "tok-a").await;
    let (second, _rx2) = context("c2");
    ready(&h, &second, "tok-a").await;
    assert_eq!(
        h.server.cache.get("conn:status:alice").await.unwrap().as_deref(),
        Some("1")
    );

    h.server.disconnect(&first).await;
    // 还有一台在线 / One device still online
    assert!(h.server.registry.online("alice"));
    assert_eq!(
        h.server.cache.get("conn:status:alice").await.unwrap().as_deref(),
        Some("1")
    );

    h.server.disconnect(&second).await;
    assert!(!h.server.registry.online("alice"));
    assert_eq!(
        h.server.cache.get("conn:status:alice").await.unwrap().as_deref(),
        Some("0")
    );
}

#[tokio::test]
async fn rate_limited_sender_is_denied_on_the_excess_call() {
    let h = harness();
    h.identity.insert("tok-a", "alice");
    let mut config = ImConfig::default();
    config.delivery.send_per_minute = 2;
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let server = ImServer::builder(config)
        .with_cache(cache)
        .with_identity(h.identity.clone())
        .with_groups(h.groups.clone())
        .build();

    let (alice, _rx) = context("c1");
    let ready_frame = serde_json::json!({
        "code": "ready",
        "message": {"token": "tok-a", "client": "pc", "uuid": "dev"}
    });
    server
        .router
        .handle_text(&alice, &ready_frame.to_string())
        .await
        .unwrap();

    let frame = serde_json::json!({
        "code": "message",
        "message": {
            "chatId": "bob",
            "chatType": "private",
            "messageType": "text",
            "content": "hi"
        }
    })
    .to_string();
    assert!(server.router.handle_text(&alice, &frame).await.is_ok());
    assert!(server.router.handle_text(&alice, &frame).await.is_ok());
    // 第三次超过每分钟上限 / The third call exceeds the per-minute cap
    assert!(matches!(
        server.router.handle_text(&alice, &frame).await,
        Err(ImError::RateLimited(_))
    ));
    assert_eq!(server.store.offline_for("bob").await.unwrap().len(), 2);
}
