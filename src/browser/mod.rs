//! 浏览器层：驱动能力接口、驱动工厂与上下文池
//!
//! 页面 DOM 细节封装在具体驱动中（`chrome` 为真实实现，`stub` 为脚本化实现），
//! 执行器只依赖 [`BrowserDriver`] 的几项能力。

#[cfg(feature = "browser")]
pub mod chrome;
pub mod pool;
mod reply_wait;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::BridgeError;
use crate::session::{Session, StorageState};

pub use pool::{ContextLease, ContextPool};
pub use stub::{StubBehavior, StubDriverFactory};

/// 驱动错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// 浏览器启动失败（瞬时故障，可重试一次）
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// 页面要求登录或会话被拒绝
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("No reply within {0}s")]
    ReplyTimeout(u64),

    /// 浏览器上下文已断开或崩溃
    #[error("Browser context lost: {0}")]
    ContextLost(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// 是否属于可自动重试的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Launch(_))
    }

    /// 出错后上下文是否不可再复用
    pub fn poisons_context(&self) -> bool {
        matches!(
            self,
            DriverError::Navigation(_) | DriverError::ContextLost(_) | DriverError::Other(_)
        )
    }
}

impl From<DriverError> for BridgeError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::AuthenticationRejected(msg) => BridgeError::Authentication(msg),
            DriverError::ReplyTimeout(secs) => BridgeError::Timeout(secs),
            DriverError::Launch(msg) => BridgeError::Unavailable(msg),
            other => BridgeError::Driver(other.to_string()),
        }
    }
}

/// 浏览器驱动能力接口：一个驱动对应一个浏览器上下文（一个页面）
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// 打开 URL；落在登录页时返回 AuthenticationRejected
    async fn open(&mut self, url: &str) -> Result<(), DriverError>;

    /// 在输入框中提交消息
    async fn submit(&mut self, message: &str) -> Result<(), DriverError>;

    /// 等待 AI 回复并返回其文本
    async fn wait_for_reply(&mut self, timeout: Duration) -> Result<String, DriverError>;

    /// 上下文是否仍可用
    fn is_ready(&self) -> bool;

    /// 当前页面 URL（会话 URL）
    async fn current_url(&self) -> Option<String>;

    /// 向上下文写入会话（cookies / localStorage）
    async fn install_session(&mut self, session: &Session) -> Result<(), DriverError>;

    /// 导出当前上下文的 storage state
    async fn capture_session(&self) -> Result<StorageState, DriverError>;

    async fn close(&mut self);
}

/// 驱动工厂：启动新的浏览器上下文
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// 启动上下文并安装会话（如有）
    async fn launch(&self, session: Option<&Session>) -> Result<Box<dyn BrowserDriver>, DriverError>;

    /// 启动供人工登录使用的上下文（可配置为有界面）
    async fn launch_interactive(&self) -> Result<Box<dyn BrowserDriver>, DriverError> {
        self.launch(None).await
    }

    /// 能否同时运行多个相互独立的上下文；不能时上下文池容量固定为 1
    fn supports_independent_contexts(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str;
}

/// 未启用 `browser` feature 时的占位工厂，所有启动均失败
#[derive(Debug, Default)]
pub struct DisabledFactory;

#[async_trait]
impl DriverFactory for DisabledFactory {
    async fn launch(&self, _session: Option<&Session>) -> Result<Box<dyn BrowserDriver>, DriverError> {
        Err(DriverError::Launch(
            "built without the `browser` feature".to_string(),
        ))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
