//! 登录会话模型
//!
//! 会话载荷沿用浏览器「storage state」格式（cookies + origins/localStorage），
//! 因此可直接读取浏览器导出的 `session_state.json`。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 不透明的认证载荷
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<Value>,
    #[serde(default)]
    pub origins: Vec<Value>,
}

impl StorageState {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }
}

/// 会话来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// 通过 /setup-login 人工登录后保存
    InteractiveLogin,
    /// 由 MANUS_* 环境变量注入
    Environment,
    /// 外部凭据 API
    CredentialsApi,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::InteractiveLogin => "interactive_login",
            SessionSource::Environment => "environment",
            SessionSource::CredentialsApi => "credentials_api",
        }
    }
}

/// 登录会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub state: StorageState,
    pub source: SessionSource,
    pub created_at: DateTime<Utc>,
    /// 估算的过期时间（创建时间 + 固定有效期）
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(state: StorageState, source: SessionSource, validity: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            state,
            source,
            created_at,
            expires_at: created_at + validity,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn age_days(&self) -> i64 {
        (Utc::now() - self.created_at).num_days()
    }

    pub fn expires_in_days(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days().max(0)
    }
}

/// 会话生命周期：absent → pending_login → valid → {expired | invalidated} → absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    PendingLogin,
    Valid,
    Expired,
    Invalidated,
}

/// /session-status 返回的报告
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_exists: bool,
    pub state: SessionState,
    pub source: Option<SessionSource>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub age_days: Option<i64>,
    pub expires_in_days: Option<i64>,
    pub message: String,
}
