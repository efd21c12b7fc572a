//! 服务器装配 / Server assembly
//!
//! 把缓存、存储、注册表、路由器和后台协调器装配成一个可共享的实例。
//! builder 默认使用内存实现，生产入口注入缓存后端与协作方实现。
//! Wires the cache, store, registry, router and background coordinators
//! into one shared instance. The builder defaults to the in-memory
//! implementations; the production entry point injects the cache backend
//! and collaborator implementations.

use crate::cache::memory::MemoryCache;
use crate::cache::SharedCache;
use crate::chat_list::ChatListManager;
use crate::config::ImConfig;
use crate::coordination::Primitives;
use crate::delivery::DeliveryEngine;
use crate::expiry::ExpiryCoordinator;
use crate::registry::ConnectionRegistry;
use crate::router::{ConnContext, MessageRouter};
use crate::service::{
    CacheGroupDirectory, CacheTokenResolver, CatchUpService, GroupDirectory, IdentityResolver,
};
use crate::store::memory::MemoryMessageStore;
use crate::store::MessageStore;
use std::sync::Arc;
use tracing::warn;

pub struct ImServer {
    pub config: ImConfig,
    pub cache: Arc<dyn SharedCache>,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub primitives: Arc<Primitives>,
    pub chat_lists: Arc<ChatListManager>,
    pub delivery: Arc<DeliveryEngine>,
    pub router: Arc<MessageRouter>,
    pub expiry: Arc<ExpiryCoordinator>,
}

impl ImServer {
    pub fn builder(config: ImConfig) -> ImServerBuilder {
        ImServerBuilder {
            config,
            cache: None,
            store: None,
            identity: None,
            groups: None,
        }
    }

    /// 连接关闭后的清理 / Cleanup after a connection closes
    pub async fn disconnect(&self, ctx: &ConnContext) {
        self.registry.unregister(&ctx.conn_id);
        if let Some(user_id) = ctx.user_id() {
            if !self.registry.online(&user_id) {
                if let Err(e) = self
                    .cache
                    .set(&format!("conn:status:{}", user_id), "0")
                    .await
                {
                    warn!("在线状态写入失败 conn status write failed uid={}: {}", user_id, e);
                }
            }
        }
    }
}

pub struct ImServerBuilder {
    config: ImConfig,
    cache: Option<Arc<dyn SharedCache>>,
    store: Option<Arc<dyn MessageStore>>,
    identity: Option<Arc<dyn IdentityResolver>>,
    groups: Option<Arc<dyn GroupDirectory>>,
}

impl ImServerBuilder {
    pub fn with_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn build(self) -> Arc<ImServer> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryMessageStore::new()));
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(CacheTokenResolver::new(cache.clone())));
        let groups = self
            .groups
            .unwrap_or_else(|| Arc::new(CacheGroupDirectory::new(cache.clone())));

        let registry = Arc::new(ConnectionRegistry::new());
        let primitives = Arc::new(Primitives::new(cache.clone()));
        let chat_lists = Arc::new(ChatListManager::new(cache.clone()));
        let delivery = Arc::new(DeliveryEngine::new(
            registry.clone(),
            store.clone(),
            groups.clone(),
            cache.clone(),
            self.config.delivery.group_page_size,
        ));
        let catchup = Arc::new(CatchUpService::new(
            store.clone(),
            groups.clone(),
            cache.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            delivery.clone(),
            store.clone(),
            identity,
            groups,
            primitives.clone(),
            cache.clone(),
            catchup,
            self.config.delivery.send_per_minute,
        ));
        let expiry = Arc::new(ExpiryCoordinator::new(cache.clone()));

        Arc::new(ImServer {
            config: self.config,
            cache,
            store,
            registry,
            primitives,
            chat_lists,
            delivery,
            router,
            expiry,
        })
    }
}
