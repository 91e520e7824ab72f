//! HTTP 服务启动与优雅关闭

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use super::{router, AppState};
use crate::core::BridgeComponents;

/// 绑定配置中的地址并提供服务，直到 `shutdown` 被取消
pub async fn serve(components: BridgeComponents, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = components.config.server.bind_addr();
    let state = Arc::new(AppState::new(components));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Manus bridge listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .context("HTTP server error")?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
