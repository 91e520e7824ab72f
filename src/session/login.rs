//! 人工登录流程
//!
//! `start` 打开一个交互式浏览器上下文并进入 pending_login，后台每隔几秒检查页面 URL；
//! URL 路径出现登录后标记（chat / dashboard / app）即保存会话。
//! 等待超时也会保存当前状态；`force_save` 可随时立即保存。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::manager::SessionManager;
use super::types::Session;
use crate::browser::{BrowserDriver, DriverError, DriverFactory};
use crate::core::BridgeError;

/// /setup-login 的返回
#[derive(Debug, Clone, Serialize)]
pub struct LoginStart {
    pub message: String,
    pub url: String,
    pub status: &'static str,
    pub timeout_minutes: u64,
}

/// 登录流程参数
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub base_url: String,
    pub markers: Vec<String>,
    pub poll_interval: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.manus.im".to_string(),
            markers: vec!["chat".into(), "dashboard".into(), "app".into()],
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// 当前打开的登录浏览器；每次 `start` 分配新的代号，旧的后台等待据此退出
struct ActiveLogin {
    generation: u64,
    driver: Box<dyn BrowserDriver>,
}

type ActiveBrowser = Arc<Mutex<Option<ActiveLogin>>>;

/// 人工登录流程
pub struct LoginFlow {
    factory: Arc<dyn DriverFactory>,
    sessions: Arc<SessionManager>,
    config: LoginConfig,
    active: ActiveBrowser,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

impl LoginFlow {
    pub fn new(factory: Arc<dyn DriverFactory>, sessions: Arc<SessionManager>, config: LoginConfig) -> Self {
        Self {
            factory,
            sessions,
            config,
            active: Arc::new(Mutex::new(None)),
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// 打开登录页并开始等待
    pub async fn start(self: &Arc<Self>, timeout: Duration) -> Result<LoginStart, BridgeError> {
        if !self.sessions.begin_login().await {
            return Err(BridgeError::Validation("a login flow is already in progress".to_string()));
        }

        let mut driver = match self.factory.launch_interactive().await {
            Ok(driver) => driver,
            Err(e) => {
                self.sessions.abort_login().await;
                return Err(BridgeError::Unavailable(e.to_string()));
            }
        };
        match driver.open(&self.config.base_url).await {
            // 未登录时落在登录页是预期情况
            Ok(()) | Err(DriverError::AuthenticationRejected(_)) => {}
            Err(e) => {
                driver.close().await;
                self.sessions.abort_login().await;
                return Err(e.into());
            }
        }
        let url = driver
            .current_url()
            .await
            .unwrap_or_else(|| self.config.base_url.clone());
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *self.active.lock().await = Some(ActiveLogin { generation, driver });

        let flow = Arc::clone(self);
        tokio::spawn(async move { flow.watch(generation, timeout).await });

        tracing::info!(url = %url, timeout_secs = timeout.as_secs(), "Login page opened, waiting for sign-in");
        Ok(LoginStart {
            message: "Login page opened, sign in within the browser window".to_string(),
            url,
            status: "waiting_for_login",
            timeout_minutes: timeout.as_secs() / 60,
        })
    }

    /// URL 路径中是否出现登录后标记
    fn looks_signed_in(&self, url: &str) -> bool {
        let lower = url.to_lowercase();
        let path = lower
            .split("://")
            .nth(1)
            .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or("");
        if path.contains("/login") || path.contains("/signin") {
            return false;
        }
        self.config.markers.iter().any(|marker| path.contains(marker.as_str()))
    }

    async fn watch(&self, generation: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.discard().await;
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let url = {
                let guard = self.active.lock().await;
                match guard.as_ref() {
                    Some(active) if active.generation == generation => active.driver.current_url().await,
                    // 已被 force_save 保存，或已被新的登录流程取代
                    _ => return,
                }
            };
            if url.as_deref().map_or(false, |url| self.looks_signed_in(url)) {
                tracing::info!(url = ?url, "Sign-in detected");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Login wait timed out, saving current state anyway");
                break;
            }
        }
        match self.take_active(Some(generation)).await {
            Some(driver) => {
                if let Err(e) = self.save(driver).await {
                    tracing::error!(error = %e, "Failed to save login session");
                }
            }
            None => tracing::debug!(generation, "Login flow superseded before save"),
        }
    }

    /// 立即保存当前登录浏览器的会话
    pub async fn force_save(&self) -> Result<Session, BridgeError> {
        let driver = self.take_active(None).await.ok_or_else(|| {
            BridgeError::Validation("no login browser is open, call /setup-login first".to_string())
        })?;
        self.save(driver).await
    }

    /// 取走登录浏览器；给定代号时只取属于该流程的
    async fn take_active(&self, generation: Option<u64>) -> Option<Box<dyn BrowserDriver>> {
        let mut guard = self.active.lock().await;
        if let (Some(expected), Some(active)) = (generation, guard.as_ref()) {
            if active.generation != expected {
                return None;
            }
        }
        guard.take().map(|active| active.driver)
    }

    async fn save(&self, mut driver: Box<dyn BrowserDriver>) -> Result<Session, BridgeError> {
        let captured = driver.capture_session().await;
        driver.close().await;

        let state = match captured {
            Ok(state) => state,
            Err(e) => {
                self.sessions.abort_login().await;
                return Err(e.into());
            }
        };
        let session = self
            .sessions
            .complete_login(state)
            .await
            .map_err(|e| BridgeError::Internal(format!("failed to save session: {}", e)))?;
        tracing::info!(cookies = session.state.cookies.len(), "Login session saved");
        Ok(session)
    }

    async fn discard(&self) {
        if let Some(mut driver) = self.take_active(None).await {
            driver.close().await;
            self.sessions.abort_login().await;
        }
    }

    /// 停止等待并关闭登录浏览器
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.discard().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{StubBehavior, StubDriverFactory};
    use crate::session::{MemorySessionStore, SessionSource, SessionState};

    fn flow(factory: StubDriverFactory) -> (Arc<LoginFlow>, Arc<SessionManager>) {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            chrono::Duration::days(30),
        ));
        let flow = Arc::new(LoginFlow::new(
            Arc::new(factory),
            Arc::clone(&sessions),
            LoginConfig {
                poll_interval: Duration::from_millis(10),
                ..LoginConfig::default()
            },
        ));
        (flow, sessions)
    }

    #[test]
    fn test_marker_matching() {
        let (flow, _) = flow(StubDriverFactory::new(StubBehavior::echo()));
        assert!(flow.looks_signed_in("https://www.manus.im/app/123"));
        assert!(!flow.looks_signed_in("https://www.manus.im/"));
        assert!(!flow.looks_signed_in("https://app.example.com/login"));
    }

    #[tokio::test]
    async fn test_watcher_saves_after_sign_in() {
        let (flow, sessions) = flow(
            StubDriverFactory::new(StubBehavior::echo()).with_login_landing("https://www.manus.im/app"),
        );
        let started = flow.start(Duration::from_secs(60)).await.unwrap();
        assert_eq!(started.status, "waiting_for_login");
        assert!(flow.start(Duration::from_secs(60)).await.is_err());

        for _ in 0..100 {
            if !sessions.is_login_pending().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let report = sessions.status().await;
        assert_eq!(report.state, SessionState::Valid);
        assert_eq!(report.source, Some(SessionSource::InteractiveLogin));
    }

    #[tokio::test]
    async fn test_force_save() {
        let (flow, sessions) = flow(StubDriverFactory::new(StubBehavior::echo()));
        assert!(matches!(flow.force_save().await, Err(BridgeError::Validation(_))));

        flow.start(Duration::from_secs(60)).await.unwrap();
        let session = flow.force_save().await.unwrap();
        assert!(!session.state.is_empty());
        assert!(sessions.current_for_task().await.unwrap().is_some());
        assert!(matches!(flow.force_save().await, Err(BridgeError::Validation(_))));
    }

    #[tokio::test]
    async fn test_timeout_saves_anyway() {
        let (flow, sessions) = flow(StubDriverFactory::new(StubBehavior::echo()));
        flow.start(Duration::from_millis(30)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sessions.status().await.state, SessionState::Valid);
    }

    #[tokio::test]
    async fn test_stale_watcher_leaves_new_flow_alone() {
        let (flow, sessions) = flow(StubDriverFactory::new(StubBehavior::echo()));
        flow.start(Duration::from_millis(50)).await.unwrap();
        flow.force_save().await.unwrap();
        assert!(!sessions.is_login_pending().await);

        // 第一次流程的等待期限过去后，新流程仍在等待用户登录
        flow.start(Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sessions.is_login_pending().await);
        assert!(flow.force_save().await.is_ok());
        assert!(!sessions.is_login_pending().await);
    }
}
