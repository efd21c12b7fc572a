//! v-im-server 实时投递核心 / Real-time delivery core
//!
//! WebSocket 即时通讯后端：消息路由、投递引擎、连接注册表、会话列表、
//! 分布式协调原语、缓存过期协调器与保留压缩任务。
//! The WebSocket IM backend: message router, delivery engine, connection
//! registry, chat lists, distributed coordination primitives, the
//! cache-expiry coordinator and the retention compaction task.

pub mod cache;
pub mod chat_list;
pub mod config;
pub mod coordination;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod expiry;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod store;
pub mod tasks;
pub mod ws;

pub use config::ImConfig;
pub use error::{ImError, ImResult};
pub use server::{ImServer, ImServerBuilder};
