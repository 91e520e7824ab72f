//! 外部凭据 API 会话来源
//!
//! `GET {base}/platform/{platform}/user/{user}`，头部 `X-API-Key`。
//! 200 返回凭据（`sessionData.cookies` / `sessionData.local_storage`），404 表示没有凭据；
//! 其它错误只记录警告并视为没有会话。

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::env::{cookie_entry, local_storage_origin, plain_value};
use super::store::SessionError;
use super::types::{Session, SessionSource, StorageState};
use super::SessionProvider;

/// 凭据 API 客户端配置
#[derive(Debug, Clone)]
pub struct CredentialsConfig {
    pub api_url: String,
    pub api_token: String,
    pub timeout_secs: u64,
    pub platform: String,
    pub user: String,
    /// 平台站点地址，用于 cookie 作用域
    pub base_url: String,
    pub validity: Duration,
}

impl CredentialsConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.api_token.trim().is_empty() && !self.user.trim().is_empty()
    }
}

/// 凭据 API 客户端
pub struct CredentialsClient {
    client: Client,
    config: CredentialsConfig,
}

impl CredentialsClient {
    pub fn new(config: CredentialsConfig) -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// 拉取当前用户在该平台上的凭据
    pub async fn fetch_credential(&self) -> Result<Option<Value>, SessionError> {
        let url = format!(
            "{}/platform/{}/user/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.platform,
            self.config.user
        );
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.config.api_token)
            .send()
            .await
            .map_err(|e| SessionError::Credentials(format!("request failed: {}", e)))?;

        match resp.status() {
            StatusCode::OK => {
                let credential = resp
                    .json::<Value>()
                    .await
                    .map_err(|e| SessionError::Credentials(format!("invalid body: {}", e)))?;
                let credential_id = credential.get("id").cloned().unwrap_or(Value::Null);
                tracing::info!(
                    platform = %self.config.platform,
                    credential_id = %credential_id,
                    "Credential fetched from API"
                );
                Ok(Some(credential))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(SessionError::Credentials(format!("HTTP {}", status))),
        }
    }

    /// 将凭据转换为会话；没有可用的 sessionData 时返回 None
    pub fn session_from_credential(&self, credential: &Value) -> Option<Session> {
        let state = state_from_credential(&self.config.base_url, credential)?;
        let mut session = Session::new(state, SessionSource::CredentialsApi, self.config.validity);
        if let Some(expires_at) = credential
            .get("expiresAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            session.expires_at = expires_at.with_timezone(&Utc);
        }
        Some(session)
    }
}

/// 凭据中的 `sessionData` → storage state
pub fn state_from_credential(base_url: &str, credential: &Value) -> Option<StorageState> {
    let data = credential.get("sessionData")?.as_object()?;
    let mut state = StorageState::default();

    if let Some(cookies) = data.get("cookies").and_then(Value::as_object) {
        for (name, value) in cookies {
            state.cookies.push(cookie_entry(base_url, name, &plain_value(value)));
        }
    }
    if let Some(items) = data.get("local_storage").and_then(Value::as_object) {
        if !items.is_empty() {
            state.origins.push(local_storage_origin(base_url, items));
        }
    }

    if state.is_empty() {
        None
    } else {
        Some(state)
    }
}

#[async_trait]
impl SessionProvider for CredentialsClient {
    async fn fetch(&self) -> Option<Session> {
        if !self.is_configured() {
            return None;
        }
        match self.fetch_credential().await {
            Ok(Some(credential)) => {
                let session = self.session_from_credential(&credential);
                if session.is_none() {
                    tracing::warn!("Credential has no usable sessionData");
                }
                session
            }
            Ok(None) => {
                tracing::info!(platform = %self.config.platform, "No credential found in API");
                None
            }
            Err(e) => {
                tracing::warn!("Credentials API unavailable, falling back: {}", e);
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "credentials_api"
    }
}
