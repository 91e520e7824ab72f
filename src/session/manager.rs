//! 会话生命周期管理
//!
//! 状态机：absent → pending_login → valid → {expired | invalidated} → absent。
//! 为每个任务解析会话的优先级：已持久化的登录会话 > 凭据 API > 环境变量注入。
//! 已知过期的会话绝不交给任务使用：先清除，再以 AuthenticationError 快速失败。

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::RwLock;

use super::store::{SessionError, SessionStore};
use super::types::{Session, SessionReport, SessionSource, SessionState, StorageState};
use super::SessionProvider;
use crate::core::BridgeError;

#[derive(Debug, Default)]
struct Lifecycle {
    pending_login: bool,
    /// 会话被判定失效后置位，直到保存新的登录会话；期间不再使用注入来源
    invalidated: bool,
    /// 最近一次因过期被清除
    expired: bool,
}

/// 会话管理器
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    /// 按优先级排列的注入来源
    providers: Vec<Arc<dyn SessionProvider>>,
    validity: Duration,
    lifecycle: RwLock<Lifecycle>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, validity: Duration) -> Self {
        Self {
            store,
            providers: Vec::new(),
            validity,
            lifecycle: RwLock::new(Lifecycle::default()),
        }
    }

    /// 追加注入来源，先添加的优先
    pub fn with_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// 为一个任务解析会话；没有任何会话时返回 Ok(None)，任务以未登录状态继续
    pub async fn current_for_task(&self) -> Result<Option<Session>, BridgeError> {
        if let Some(session) = self.store.load().await {
            if self.store.is_expired(&session) {
                tracing::warn!(
                    source = session.source.as_str(),
                    expires_at = %session.expires_at,
                    "Persisted session expired, clearing it"
                );
                self.mark_expired().await;
                return Err(BridgeError::Authentication(
                    "session expired, run /setup-login to sign in again".to_string(),
                ));
            }
            return Ok(Some(session));
        }

        if self.lifecycle.read().await.invalidated {
            tracing::debug!("Session invalidated, skipping injected sources");
            return Ok(None);
        }

        for provider in &self.providers {
            if let Some(session) = provider.fetch().await {
                if session.is_expired() {
                    tracing::warn!(provider = provider.name(), "Injected session expired");
                    return Err(BridgeError::Authentication(format!(
                        "session from {} expired",
                        provider.name()
                    )));
                }
                tracing::debug!(provider = provider.name(), "Using injected session");
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    async fn mark_expired(&self) {
        if let Err(e) = self.store.invalidate().await {
            tracing::error!("Failed to clear expired session: {}", e);
        }
        let mut lifecycle = self.lifecycle.write().await;
        lifecycle.expired = true;
        lifecycle.invalidated = true;
    }

    /// 平台拒绝了当前会话：清除存储并停止使用注入来源
    pub async fn invalidate(&self, reason: &str) -> Result<(), SessionError> {
        tracing::warn!(reason = %reason, store = %self.store.describe(), "Invalidating session");
        let result = self.store.invalidate().await;
        let mut lifecycle = self.lifecycle.write().await;
        lifecycle.invalidated = true;
        lifecycle.expired = false;
        result
    }

    /// 进入 pending_login；已有登录流程在进行时返回 false
    pub async fn begin_login(&self) -> bool {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.pending_login {
            return false;
        }
        lifecycle.pending_login = true;
        true
    }

    pub async fn is_login_pending(&self) -> bool {
        self.lifecycle.read().await.pending_login
    }

    /// 保存登录得到的会话，状态变为 valid
    pub async fn complete_login(&self, state: StorageState) -> Result<Session, SessionError> {
        let session = Session::new(state, SessionSource::InteractiveLogin, self.validity);
        let result = self.store.save(&session).await;
        let mut lifecycle = self.lifecycle.write().await;
        lifecycle.pending_login = false;
        if result.is_ok() {
            lifecycle.invalidated = false;
            lifecycle.expired = false;
        }
        result.map(|_| session)
    }

    pub async fn abort_login(&self) {
        self.lifecycle.write().await.pending_login = false;
    }

    /// 当前会话状态报告（只读，不会清除过期会话）
    pub async fn status(&self) -> SessionReport {
        let (pending_login, invalidated, expired) = {
            let lifecycle = self.lifecycle.read().await;
            (lifecycle.pending_login, lifecycle.invalidated, lifecycle.expired)
        };

        let mut session = self.store.load().await;
        if session.is_none() && !invalidated {
            for provider in &self.providers {
                if let Some(found) = provider.fetch().await {
                    session = Some(found);
                    break;
                }
            }
        }

        let state = match &session {
            _ if pending_login => SessionState::PendingLogin,
            Some(s) if s.is_expired() => SessionState::Expired,
            Some(_) => SessionState::Valid,
            None if expired => SessionState::Expired,
            None if invalidated => SessionState::Invalidated,
            None => SessionState::Absent,
        };
        let message = match state {
            SessionState::PendingLogin => "Waiting for interactive login to complete",
            SessionState::Valid => "Session active",
            SessionState::Expired => "Session expired, use /setup-login to sign in again",
            SessionState::Invalidated => "Session rejected by the platform, use /setup-login to sign in again",
            SessionState::Absent => "No session found, use /setup-login to sign in",
        }
        .to_string();

        SessionReport {
            session_exists: session.is_some(),
            state,
            source: session.as_ref().map(|s| s.source),
            created_at: session.as_ref().map(|s| s.created_at),
            expires_at: session.as_ref().map(|s| s.expires_at),
            age_days: session.as_ref().map(Session::age_days),
            expires_in_days: session.as_ref().map(Session::expires_in_days),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemorySessionStore;
    use crate::session::EnvSessionProvider;
    use serde_json::json;
    use std::collections::HashMap;

    fn state() -> StorageState {
        StorageState {
            cookies: vec![json!({"name": "session_token", "value": "abc"})],
            origins: vec![],
        }
    }

    fn env_provider() -> Arc<dyn SessionProvider> {
        let mut vars = HashMap::new();
        vars.insert("MANUS_SESSION_TOKEN".to_string(), "from-env".to_string());
        Arc::new(EnvSessionProvider::from_vars("https://www.manus.im", Duration::days(30), vars))
    }

    #[tokio::test]
    async fn test_absent_then_login_then_valid() {
        let manager = SessionManager::new(Arc::new(MemorySessionStore::new()), Duration::days(30));
        assert_eq!(manager.status().await.state, SessionState::Absent);
        assert!(manager.current_for_task().await.unwrap().is_none());

        assert!(manager.begin_login().await);
        assert!(!manager.begin_login().await);
        assert_eq!(manager.status().await.state, SessionState::PendingLogin);

        manager.complete_login(state()).await.unwrap();
        let report = manager.status().await;
        assert_eq!(report.state, SessionState::Valid);
        assert_eq!(report.source, Some(SessionSource::InteractiveLogin));
        assert_eq!(report.expires_in_days, Some(29));
        assert!(manager.current_for_task().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_session_fails_fast_and_is_cleared() {
        let mut session = Session::new(state(), SessionSource::InteractiveLogin, Duration::days(30));
        session.created_at = chrono::Utc::now() - Duration::days(31);
        session.expires_at = chrono::Utc::now() - Duration::days(1);
        let store = Arc::new(MemorySessionStore::with_session(session));
        let manager = SessionManager::new(store.clone(), Duration::days(30)).with_provider(env_provider());

        let err = manager.current_for_task().await.unwrap_err();
        assert!(matches!(err, BridgeError::Authentication(_)));
        assert!(store.load().await.is_none());
        assert_eq!(manager.status().await.state, SessionState::Expired);
        // 环境变量会话在重新登录前不再使用
        assert!(manager.current_for_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_session_takes_precedence_over_env() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), Duration::days(30)).with_provider(env_provider());

        let injected = manager.current_for_task().await.unwrap().unwrap();
        assert_eq!(injected.source, SessionSource::Environment);

        manager.complete_login(state()).await.unwrap();
        let persisted = manager.current_for_task().await.unwrap().unwrap();
        assert_eq!(persisted.source, SessionSource::InteractiveLogin);
    }

    #[tokio::test]
    async fn test_invalidate_suppresses_injection_until_login() {
        let manager = SessionManager::new(Arc::new(MemorySessionStore::new()), Duration::days(30))
            .with_provider(env_provider());
        manager.invalidate("rejected").await.unwrap();
        assert!(manager.current_for_task().await.unwrap().is_none());
        assert_eq!(manager.status().await.state, SessionState::Invalidated);

        manager.begin_login().await;
        manager.complete_login(state()).await.unwrap();
        assert!(!manager.is_login_pending().await);
        assert_eq!(manager.status().await.state, SessionState::Valid);
    }
}
