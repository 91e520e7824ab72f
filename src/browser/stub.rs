//! 脚本化驱动（用于测试与本地运行，无需浏览器）
//!
//! 行为由 [`StubBehavior`] 固定：延迟后回复、从不回复、拒绝会话、找不到输入框。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{BrowserDriver, DriverError, DriverFactory};
use crate::session::{Session, StorageState};

/// 驱动行为脚本
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// 等待 `delay` 后回复；`reply` 为空时回显消息
    Reply { reply: Option<String>, delay: Duration },
    /// 提交成功但永远不回复
    Silent,
    /// 打开页面时落在登录页
    RejectAuth,
    /// 找不到消息输入框
    MissingInput,
}

impl StubBehavior {
    pub fn reply(text: impl Into<String>, delay: Duration) -> Self {
        StubBehavior::Reply {
            reply: Some(text.into()),
            delay,
        }
    }

    pub fn echo() -> Self {
        StubBehavior::Reply {
            reply: None,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct StubStats {
    launches: AtomicUsize,
    closes: AtomicUsize,
    conversations: AtomicUsize,
    submitted: Mutex<Vec<String>>,
}

/// 脚本化驱动工厂
pub struct StubDriverFactory {
    behavior: StubBehavior,
    base_url: String,
    independent: bool,
    failing_launches: AtomicUsize,
    login_landing: Option<String>,
    stats: Arc<StubStats>,
}

impl StubDriverFactory {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            base_url: "https://www.manus.im".to_string(),
            independent: false,
            failing_launches: AtomicUsize::new(0),
            login_landing: None,
            stats: Arc::new(StubStats::default()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// 前 `count` 次启动失败
    pub fn failing_launches(self, count: usize) -> Self {
        self.failing_launches.store(count, Ordering::SeqCst);
        self
    }

    /// 允许多个独立上下文并行
    pub fn independent_contexts(mut self) -> Self {
        self.independent = true;
        self
    }

    /// 交互式上下文打开后跳转到的地址（模拟人工登录完成）
    pub fn with_login_landing(mut self, url: impl Into<String>) -> Self {
        self.login_landing = Some(url.into());
        self
    }

    pub fn launch_count(&self) -> usize {
        self.stats.launches.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<String> {
        self.stats
            .submitted
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    fn driver(&self, session: Option<&Session>, landing: Option<String>) -> StubDriver {
        StubDriver {
            behavior: self.behavior.clone(),
            base_url: self.base_url.clone(),
            url: None,
            landing,
            pending: None,
            ready: true,
            session: session.map(|s| s.state.clone()),
            stats: Arc::clone(&self.stats),
        }
    }

    fn try_launch(&self) -> Result<(), DriverError> {
        let failed = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DriverError::Launch("stub browser refused to start".to_string()));
        }
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DriverFactory for StubDriverFactory {
    async fn launch(&self, session: Option<&Session>) -> Result<Box<dyn BrowserDriver>, DriverError> {
        self.try_launch()?;
        Ok(Box::new(self.driver(session, None)))
    }

    async fn launch_interactive(&self) -> Result<Box<dyn BrowserDriver>, DriverError> {
        self.try_launch()?;
        Ok(Box::new(self.driver(None, self.login_landing.clone())))
    }

    fn supports_independent_contexts(&self) -> bool {
        self.independent
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// 脚本化驱动
pub struct StubDriver {
    behavior: StubBehavior,
    base_url: String,
    url: Option<String>,
    landing: Option<String>,
    pending: Option<String>,
    ready: bool,
    session: Option<StorageState>,
    stats: Arc<StubStats>,
}

#[async_trait]
impl BrowserDriver for StubDriver {
    async fn open(&mut self, url: &str) -> Result<(), DriverError> {
        if !self.ready {
            return Err(DriverError::ContextLost("stub context closed".to_string()));
        }
        if matches!(self.behavior, StubBehavior::RejectAuth) {
            self.url = Some(format!("{}/login", self.base_url));
            return Err(DriverError::AuthenticationRejected(
                "redirected to login page".to_string(),
            ));
        }
        self.url = Some(self.landing.clone().unwrap_or_else(|| url.to_string()));
        Ok(())
    }

    async fn submit(&mut self, message: &str) -> Result<(), DriverError> {
        if matches!(self.behavior, StubBehavior::MissingInput) {
            return Err(DriverError::ElementNotFound("message input".to_string()));
        }
        if let Ok(mut submitted) = self.stats.submitted.lock() {
            submitted.push(message.to_string());
        }
        // 在首页提交会开启新会话
        let on_conversation = self.url.as_deref().map_or(false, |url| url.contains("/app/"));
        if !on_conversation {
            let n = self.stats.conversations.fetch_add(1, Ordering::SeqCst) + 1;
            self.url = Some(format!("{}/app/stub-{}", self.base_url, n));
        }
        self.pending = Some(message.to_string());
        Ok(())
    }

    async fn wait_for_reply(&mut self, timeout: Duration) -> Result<String, DriverError> {
        let message = self
            .pending
            .take()
            .ok_or_else(|| DriverError::Other("no message submitted".to_string()))?;
        match &self.behavior {
            StubBehavior::Reply { reply, delay } => {
                if *delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(DriverError::ReplyTimeout(timeout.as_secs()));
                }
                tokio::time::sleep(*delay).await;
                Ok(reply.clone().unwrap_or(message))
            }
            _ => std::future::pending().await,
        }
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn current_url(&self) -> Option<String> {
        self.url.clone()
    }

    async fn install_session(&mut self, session: &Session) -> Result<(), DriverError> {
        self.session = Some(session.state.clone());
        Ok(())
    }

    async fn capture_session(&self) -> Result<StorageState, DriverError> {
        if let Some(state) = &self.session {
            return Ok(state.clone());
        }
        Ok(StorageState {
            cookies: vec![json!({
                "name": "session_token",
                "value": "stub-session",
                "domain": ".manus.im",
                "path": "/",
            })],
            origins: vec![],
        })
    }

    async fn close(&mut self) {
        if self.ready {
            self.ready = false;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
