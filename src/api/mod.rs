//! HTTP API 层（axum）
//!
//! 路由、共享状态与错误到 HTTP 状态码的映射。处理器只做参数转换，业务逻辑都在
//! `task` / `session` 模块中。

pub mod handlers;
pub mod rate_limit;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::core::{BridgeComponents, BridgeError, ErrorKind};

pub use rate_limit::RateLimiter;
pub use server::serve;

/// 处理器共享状态
pub struct AppState {
    pub components: BridgeComponents,
    pub started_at: Instant,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(components: BridgeComponents) -> Self {
        let limiter = RateLimiter::new(components.config.server.rate_limit_per_minute);
        Self {
            components,
            started_at: Instant::now(),
            limiter,
        }
    }
}

/// API 错误：`{ "error": kind, "detail": message }`
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

/// 错误类别到 HTTP 状态码
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::Driver => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::InvalidTransition | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        if let BridgeError::InvalidTransition { .. } = err {
            tracing::error!(error = %err, "State machine violation");
        }
        Self::new(err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = self.kind.as_str(), detail = %self.detail, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": self.kind.as_str(),
                "detail": self.detail,
            })),
        )
            .into_response()
    }
}

/// 构建路由；限流只作用于提交消息的端点
pub fn router(state: Arc<AppState>) -> Router {
    let submit = Router::new()
        .route("/send-message", post(handlers::send_message))
        .route("/send-message-sync", post(handlers::send_message_sync))
        .route("/send-message-quick", post(handlers::send_message_quick))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::throttle,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/task/:task_id",
            get(handlers::get_task).delete(handlers::cancel_task),
        )
        .route("/tasks", get(handlers::list_tasks))
        .route("/setup-login", post(handlers::setup_login))
        .route("/session-status", get(handlers::session_status))
        .route("/force-save-session", post(handlers::force_save_session))
        .merge(submit)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Authentication), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Driver), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Cancelled), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorKind::InvalidTransition),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_from_bridge_error() {
        let err: ApiError = BridgeError::NotFound("task_x".into()).into();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(err.detail.contains("task_x"));
    }
}
