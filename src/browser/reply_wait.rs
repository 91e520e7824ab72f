//! 阻塞线程里的回复轮询
//!
//! 浏览器驱动的页面调用是同步的，只能放进 `spawn_blocking`；而被丢弃的 future 不会让
//! 阻塞线程停下。等待方持有 [`AbandonOnDrop`]，轮询循环每一轮检查它设置的标志。
#![cfg_attr(not(feature = "browser"), allow(dead_code))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::DriverError;

/// 离开作用域时置位共享标志（含所在 future 被丢弃的情况）
pub(crate) struct AbandonOnDrop(Arc<AtomicBool>);

impl AbandonOnDrop {
    pub(crate) fn new() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self(Arc::clone(&flag)), flag)
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// 轮询直到读到与 `baseline` 不同的回复、超时，或 `stop()` 为真
pub(crate) fn poll_reply(
    baseline: Option<&str>,
    timeout: Duration,
    interval: Duration,
    stop: impl Fn() -> bool,
    mut read: impl FnMut() -> Option<String>,
) -> Result<String, DriverError> {
    let deadline = Instant::now() + timeout;
    loop {
        if stop() {
            return Err(DriverError::ContextLost("reply wait abandoned".to_string()));
        }
        if let Some(text) = read() {
            if baseline != Some(text.as_str()) {
                return Ok(text);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DriverError::ReplyTimeout(timeout.as_secs()));
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}
