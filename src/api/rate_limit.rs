//! 按客户端 IP 的固定窗口限流
//!
//! 只挂在提交消息的路由上；`limit_per_minute == 0` 表示不限流。

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::AppState;

const WINDOW: Duration = Duration::from_secs(60);
/// 桶数量超过该值时顺带清理过期窗口
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

pub struct RateLimiter {
    limit_per_minute: u32,
    buckets: Mutex<HashMap<IpAddr, Window>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit_per_minute > 0
    }

    pub fn check(&self, ip: IpAddr) -> RateDecision {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> RateDecision {
        if !self.is_enabled() {
            return RateDecision::Allowed;
        }
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buckets.len() > SWEEP_THRESHOLD {
            buckets.retain(|_, w| now.duration_since(w.started) < WINDOW);
        }

        let window = buckets.entry(ip).or_insert(Window { started: now, count: 0 });
        if now.duration_since(window.started) >= WINDOW {
            *window = Window { started: now, count: 0 };
        }
        if window.count >= self.limit_per_minute {
            let elapsed = now.duration_since(window.started);
            let retry_after_secs = WINDOW.saturating_sub(elapsed).as_secs().max(1);
            return RateDecision::Limited { retry_after_secs };
        }
        window.count += 1;
        RateDecision::Allowed
    }
}

/// 取客户端 IP：未携带连接信息（如进程内测试）时归入同一个未指定地址桶
fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn throttle(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let ip = client_ip(&request);
    match state.limiter.check(ip) {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Limited { retry_after_secs } => {
            tracing::warn!(client = %ip, path = %request.uri().path(), "Rate limit exceeded");
            rate_limited_response(retry_after_secs)
        }
    }
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limited",
            "detail": "Too many requests, please retry later",
            "retry_after_seconds": retry_after_secs,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}
