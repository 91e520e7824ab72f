//! 环境变量注入的会话
//!
//! 读取 `MANUS_COOKIES`（JSON 对象 name → value）、`MANUS_SESSION_TOKEN`、
//! `MANUS_AUTH_TOKEN`、`MANUS_LOCAL_STORAGE`（JSON 对象），拼装成 storage state。

use std::collections::HashMap;
use std::env;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Map, Value};

use super::types::{Session, SessionSource, StorageState};
use super::SessionProvider;

const COOKIES_VAR: &str = "MANUS_COOKIES";
const SESSION_TOKEN_VAR: &str = "MANUS_SESSION_TOKEN";
const AUTH_TOKEN_VAR: &str = "MANUS_AUTH_TOKEN";
const LOCAL_STORAGE_VAR: &str = "MANUS_LOCAL_STORAGE";

/// 这些 cookie 在浏览器中为 httpOnly
const HTTP_ONLY_COOKIES: [&str; 3] = ["session_id", "session_token", "auth_token"];

/// 环境变量会话来源
pub struct EnvSessionProvider {
    base_url: String,
    validity: Duration,
    /// 为空时读取进程环境
    vars: Option<HashMap<String, String>>,
}

impl EnvSessionProvider {
    pub fn from_env(base_url: &str, validity: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            validity,
            vars: None,
        }
    }

    /// 使用给定变量表（测试用，不触碰进程环境）
    pub fn from_vars(base_url: &str, validity: Duration, vars: HashMap<String, String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            validity,
            vars: Some(vars),
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        let value = match &self.vars {
            Some(vars) => vars.get(key).cloned(),
            None => env::var(key).ok(),
        }?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn cookie(&self, name: &str, value: &str) -> Value {
        cookie_entry(&self.base_url, name, value)
    }

    /// 从环境变量拼装 storage state；没有任何变量时返回 None
    pub fn build_state(&self) -> Option<StorageState> {
        let mut state = StorageState::default();

        if let Some(raw) = self.var(COOKIES_VAR) {
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(cookies) => {
                    for (name, value) in &cookies {
                        state.cookies.push(self.cookie(name, &plain_value(value)));
                    }
                }
                Err(e) => tracing::warn!("Ignoring {}: not a JSON object ({})", COOKIES_VAR, e),
            }
        }

        for (var, name) in [(SESSION_TOKEN_VAR, "session_token"), (AUTH_TOKEN_VAR, "auth_token")] {
            if let Some(token) = self.var(var) {
                state.cookies.retain(|c| c.get("name").and_then(Value::as_str) != Some(name));
                state.cookies.push(self.cookie(name, &token));
            }
        }

        if let Some(raw) = self.var(LOCAL_STORAGE_VAR) {
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(items) => state.origins.push(local_storage_origin(&self.base_url, &items)),
                Err(e) => tracing::warn!("Ignoring {}: not a JSON object ({})", LOCAL_STORAGE_VAR, e),
            }
        }

        if state.is_empty() {
            None
        } else {
            Some(state)
        }
    }
}

#[async_trait]
impl SessionProvider for EnvSessionProvider {
    async fn fetch(&self) -> Option<Session> {
        let state = self.build_state()?;
        tracing::debug!(
            cookies = state.cookies.len(),
            origins = state.origins.len(),
            "Built session from MANUS_* environment variables"
        );
        Some(Session::new(state, SessionSource::Environment, self.validity))
    }

    fn name(&self) -> &'static str {
        "environment"
    }
}

/// cookie 作用域：取站点主域名，如 https://www.manus.im → .manus.im
pub(crate) fn cookie_domain(base_url: &str) -> String {
    let host = base_url
        .split("://")
        .nth(1)
        .unwrap_or(base_url)
        .split('/')
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);
    format!(".{}", host)
}

pub(crate) fn cookie_entry(base_url: &str, name: &str, value: &str) -> Value {
    json!({
        "name": name,
        "value": value,
        "domain": cookie_domain(base_url),
        "path": "/",
        "httpOnly": HTTP_ONLY_COOKIES.contains(&name),
        "secure": true,
        "sameSite": "Lax",
    })
}

pub(crate) fn local_storage_origin(base_url: &str, items: &Map<String, Value>) -> Value {
    let entries: Vec<Value> = items
        .iter()
        .map(|(name, value)| json!({"name": name, "value": plain_value(value)}))
        .collect();
    json!({
        "origin": base_url.trim_end_matches('/'),
        "localStorage": entries,
    })
}

pub(crate) fn plain_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
