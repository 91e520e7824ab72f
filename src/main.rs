//! Manus 桥接服务入口
//!
//! 加载配置、初始化日志、装配组件、预热浏览器，然后提供 HTTP 服务直到收到关闭信号。
//! 用法：`manus-bridge [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use manus_bridge::api;
use manus_bridge::config::{load_config, AppConfig};
use manus_bridge::core::{
    BridgeBuilder, BrowserCleanup, ExecutorCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
use manus_bridge::observability::{self, LogFormat};

/// 关闭时等待执行中任务落到终态的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, load_error) = match load_config(config_path) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    observability::init(LogFormat::parse(&config.log.format));
    if let Some(e) = load_error {
        tracing::warn!("Config load failed ({}), using defaults", e);
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = %config.platform.name,
        max_contexts = config.browser.max_contexts,
        "Starting Manus bridge"
    );

    let components = BridgeBuilder::new(config).build();
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    if components.config.browser.warm_up {
        let pool = Arc::clone(&components.pool);
        let sessions = Arc::clone(&components.sessions);
        tokio::spawn(async move {
            let session = sessions
                .store()
                .load()
                .await
                .filter(|s| !sessions.store().is_expired(s));
            pool.warm_up(session.as_ref()).await;
        });
    }

    let tasks = &components.config.tasks;
    let sweeper = components.registry.spawn_retention_sweeper(
        Duration::from_secs(tasks.retention_hours * 3600),
        Duration::from_secs(tasks.cleanup_interval_secs.max(1)),
        shutdown.token(),
    );

    let mut coordinator = ShutdownCoordinator::new().with_timeout(10);
    coordinator.register(ExecutorCleanup::new(
        Arc::clone(&components.executor),
        SHUTDOWN_GRACE,
    ));
    coordinator.register(BrowserCleanup::new(
        Arc::clone(&components.pool),
        Arc::clone(&components.login),
    ));

    // 收到信号后立即取消任务，避免同步请求拖住 HTTP 的优雅关闭
    let cleanup = {
        let manager = Arc::clone(&shutdown);
        tokio::spawn(async move {
            manager.wait_for_shutdown().await;
            coordinator.run_cleanup().await;
        })
    };

    let served = api::serve(components, shutdown.token())
        .await
        .context("Server failed");

    if !shutdown.is_shutdown() {
        let reason = match &served {
            Err(e) => e.to_string(),
            Ok(()) => "server exited".to_string(),
        };
        shutdown.shutdown(ShutdownReason::FatalError(reason));
    }
    let _ = cleanup.await;
    let _ = sweeper.await;

    served
}
