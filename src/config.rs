//! 配置 / Configuration
//!
//! 文件 + `VIM__` 前缀环境变量，环境变量优先。缺失的键全部取默认值，
//! 因此空配置也能启动。
//! File plus `VIM__`-prefixed environment variables, environment winning.
//! Every key has a default, so an empty configuration still boots.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ws_port: 5200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// 每个会话窗口保留的条数 / Entries kept per conversation window
    pub keep: u64,
    /// 每日压缩时辰（本地时间 0-23）/ Daily compaction hour, local time
    pub hour: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep: 100, hour: 4 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// 群成员单批查询条数 / Members fetched per membership page
    pub group_page_size: usize,
    /// 每用户每分钟发送上限，0 不限 / Per-user sends per minute, 0 unlimited
    pub send_per_minute: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            group_page_size: 1000,
            send_per_minute: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub retention: RetentionConfig,
    pub delivery: DeliveryConfig,
}

impl ImConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix("VIM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}
