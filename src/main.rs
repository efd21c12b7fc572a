use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use v_im_server::cache::redis::RedisCache;
use v_im_server::tasks::spawn_compaction_task;
use v_im_server::{ImConfig, ImServer};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-im-server WebSocket delivery core", long_about = None)]
struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = ImConfig::load(args.config.as_deref())?;

    let redis_url = config.redis.url.clone();
    let cache = Arc::new(RedisCache::connect(&redis_url).await?);
    info!("🗄️  Shared cache connected at {}", redis_url);

    let server = ImServer::builder(config.clone())
        .with_cache(cache)
        .build();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    spawn_compaction_task(
        server.cache.clone(),
        config.retention.keep,
        config.retention.hour,
        shutdown_rx.clone(),
    );

    // 过期与业务通知订阅 / Expiry and business notification subscription
    let pubsub_client = redis::Client::open(redis_url.as_str())?;
    let expiry = server.expiry.clone();
    let expiry_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = expiry.run(pubsub_client, expiry_shutdown).await {
            error!("过期协调器退出 expiry coordinator exited: {}", e);
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.ws_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 v-im-server listening on ws://{}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                v_im_server::ws::handle_connection(stream, peer_addr, server).await
                            {
                                warn!("连接处理失败 connection failed {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("👋 Shutdown signal received");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }
    Ok(())
}
