//! Headless Chrome 驱动
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 为阻塞 API，所有页面操作都放进 `spawn_blocking`。
//! 每个上下文是一个独立的浏览器进程；使用持久化 profile 目录时无法并行，池容量固定为 1。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::{json, Value};

use super::reply_wait::{poll_reply, AbandonOnDrop};
use super::{BrowserDriver, DriverError, DriverFactory};
use crate::session::{Session, StorageState};

/// 消息输入框候选选择器，按优先级排列
const INPUT_SELECTORS: &[&str] = &[
    "textarea[placeholder*='Attribuez une tâche']",
    "textarea[placeholder*='posez une question']",
    "textarea[placeholder*='message']",
    "textarea[placeholder*='Message']",
    "textarea[placeholder*='Tapez']",
    "input[placeholder*='message']",
    "input[placeholder*='Message']",
    "[contenteditable='true']",
    "textarea:not([readonly])",
    ".message-input textarea",
    "#message-input",
];

const SEND_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "[data-testid='send-button']",
    ".send-button",
];

const REPLY_SELECTORS: &[&str] = &[
    ".message:last-child",
    ".chat-message:last-child",
    ".ai-response:last-child",
    "[data-role='assistant']:last-child",
];

/// 出现即说明停在登录页
const LOGIN_FORM_SELECTORS: &[&str] = &["input[type='email']", "input[name='email']"];

const REPLY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Chrome 启动参数
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    /// 人工登录时是否仍然无界面
    pub headless_setup: bool,
    /// 持久化 profile 目录；设置后池容量固定为 1
    pub user_data_dir: Option<PathBuf>,
    pub window_size: (u32, u32),
    pub launch_timeout: Duration,
    pub page_timeout: Duration,
    pub base_url: String,
}

/// Chrome 驱动工厂
pub struct ChromeDriverFactory {
    options: ChromeOptions,
}

impl ChromeDriverFactory {
    pub fn new(options: ChromeOptions) -> Self {
        Self { options }
    }

    async fn launch_with(&self, headless: bool, session: Option<&Session>) -> Result<Box<dyn BrowserDriver>, DriverError> {
        let options = self.options.clone();
        let launch_timeout = options.launch_timeout;
        let launching = tokio::task::spawn_blocking(move || {
            let launch = LaunchOptions::default_builder()
                .headless(headless)
                .window_size(Some(options.window_size))
                .user_data_dir(options.user_data_dir.clone())
                .idle_browser_timeout(Duration::from_secs(24 * 3600))
                .build()
                .map_err(|e| DriverError::Launch(e.to_string()))?;
            let browser = Browser::new(launch).map_err(|e| DriverError::Launch(e.to_string()))?;
            let tab = browser.new_tab().map_err(|e| DriverError::Launch(e.to_string()))?;
            tab.set_default_timeout(options.page_timeout);
            Ok::<_, DriverError>((browser, tab))
        });
        let (browser, tab) = tokio::time::timeout(launch_timeout, launching)
            .await
            .map_err(|_| DriverError::Launch(format!("no browser after {:?}", launch_timeout)))?
            .map_err(|e| DriverError::Launch(format!("launch task join: {}", e)))??;

        tracing::info!(headless, "Chrome context launched");
        let mut driver = ChromeDriver {
            _browser: Arc::new(browser),
            tab,
            base_url: self.options.base_url.clone(),
            page_timeout: self.options.page_timeout,
            ready: Arc::new(AtomicBool::new(true)),
            baseline: None,
        };
        if let Some(session) = session {
            driver.install_session(session).await?;
        }
        Ok(Box::new(driver))
    }
}

#[async_trait]
impl DriverFactory for ChromeDriverFactory {
    async fn launch(&self, session: Option<&Session>) -> Result<Box<dyn BrowserDriver>, DriverError> {
        self.launch_with(self.options.headless, session).await
    }

    async fn launch_interactive(&self) -> Result<Box<dyn BrowserDriver>, DriverError> {
        self.launch_with(self.options.headless_setup, None).await
    }

    fn supports_independent_contexts(&self) -> bool {
        self.options.user_data_dir.is_none()
    }

    fn name(&self) -> &'static str {
        "chrome"
    }
}

/// 单个 Chrome 上下文
pub struct ChromeDriver {
    _browser: Arc<Browser>,
    tab: Arc<Tab>,
    base_url: String,
    page_timeout: Duration,
    ready: Arc<AtomicBool>,
    /// 提交前最后一条回复的文本，用于识别新回复
    baseline: Option<String>,
}

impl ChromeDriver {
    /// 在阻塞线程上操作页面；连接断开时标记上下文不可用
    async fn with_tab<T, F>(&self, op: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, DriverError> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let ready = Arc::clone(&self.ready);
        let result = tokio::task::spawn_blocking(move || op(&tab))
            .await
            .map_err(|e| DriverError::ContextLost(format!("page task join: {}", e)))?;
        if matches!(result, Err(DriverError::ContextLost(_))) {
            ready.store(false, Ordering::SeqCst);
        }
        result
    }
}

fn is_login_url(url: &str) -> bool {
    let url = url.to_lowercase();
    url.contains("/login") || url.contains("/signin")
}

fn find_first(tab: &Tab, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .find(|selector| tab.find_element(selector).is_ok())
        .map(|selector| selector.to_string())
}

fn last_reply_text(tab: &Tab) -> Option<String> {
    REPLY_SELECTORS.iter().find_map(|selector| {
        let element = tab.find_element(selector).ok()?;
        let text = element.get_inner_text().ok()?;
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    })
}

fn local_storage_js(items: &[Value]) -> String {
    let mut js = String::from("(function(){");
    for item in items {
        let (Some(name), Some(value)) = (
            item.get("name").and_then(Value::as_str),
            item.get("value").and_then(Value::as_str),
        ) else {
            continue;
        };
        js.push_str(&format!(
            "localStorage.setItem({}, {});",
            Value::String(name.to_string()),
            Value::String(value.to_string())
        ));
    }
    js.push_str("return true;})()");
    js
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open(&mut self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        tracing::info!(url = %url, "Navigating");
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| DriverError::Navigation(e.to_string()))?
                .wait_until_navigated()
                .map_err(|e| DriverError::Navigation(e.to_string()))?;
            let current = tab.get_url();
            if is_login_url(&current) || find_first(tab, LOGIN_FORM_SELECTORS).is_some() {
                return Err(DriverError::AuthenticationRejected(format!(
                    "landed on login page {}",
                    current
                )));
            }
            Ok(())
        })
        .await
    }

    async fn submit(&mut self, message: &str) -> Result<(), DriverError> {
        let message = message.to_string();
        let page_timeout = self.page_timeout;
        let baseline = self
            .with_tab(move |tab| {
                let deadline = Instant::now() + page_timeout;
                let selector = loop {
                    if let Some(selector) = find_first(tab, INPUT_SELECTORS) {
                        break selector;
                    }
                    if Instant::now() >= deadline {
                        return Err(DriverError::ElementNotFound("message input".to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(500));
                };
                tracing::debug!(selector = %selector, "Message input found");

                let baseline = last_reply_text(tab);
                let input = tab
                    .find_element(&selector)
                    .map_err(|e| DriverError::ElementNotFound(e.to_string()))?;
                input
                    .click()
                    .map_err(|e| DriverError::Other(format!("focus input: {}", e)))?;
                input
                    .type_into(&message)
                    .map_err(|e| DriverError::Other(format!("type message: {}", e)))?;

                match find_first(tab, SEND_SELECTORS) {
                    Some(send) => {
                        tab.find_element(&send)
                            .and_then(|button| button.click().map(|_| ()))
                            .map_err(|e| DriverError::Other(format!("click send: {}", e)))?;
                    }
                    None => {
                        tab.press_key("Enter")
                            .map_err(|e| DriverError::Other(format!("press Enter: {}", e)))?;
                    }
                }
                Ok(baseline)
            })
            .await?;
        self.baseline = baseline;
        Ok(())
    }

    async fn wait_for_reply(&mut self, timeout: Duration) -> Result<String, DriverError> {
        let baseline = self.baseline.take();
        // 任务超时或取消时本 future 被丢弃，guard 置位让阻塞线程停止轮询
        let (_guard, abandoned) = AbandonOnDrop::new();
        let ready = Arc::clone(&self.ready);
        self.with_tab(move |tab| {
            let text = poll_reply(
                baseline.as_deref(),
                timeout,
                REPLY_POLL_INTERVAL,
                || abandoned.load(Ordering::SeqCst) || !ready.load(Ordering::SeqCst),
                || last_reply_text(tab),
            )?;
            tracing::info!(length = text.len(), "AI reply captured");
            Ok(text)
        })
        .await
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn current_url(&self) -> Option<String> {
        self.with_tab(|tab| Ok(tab.get_url())).await.ok()
    }

    async fn install_session(&mut self, session: &Session) -> Result<(), DriverError> {
        let cookies: Vec<CookieParam> = session
            .state
            .cookies
            .iter()
            .filter_map(|cookie| match serde_json::from_value::<CookieParam>(cookie.clone()) {
                Ok(param) => Some(param),
                Err(e) => {
                    tracing::warn!("Skipping malformed cookie: {}", e);
                    None
                }
            })
            .collect();
        let origins = session.state.origins.clone();
        let base_url = self.base_url.clone();
        let count = cookies.len();

        self.with_tab(move |tab| {
            if !cookies.is_empty() {
                tab.set_cookies(cookies)
                    .map_err(|e| DriverError::Other(format!("set cookies: {}", e)))?;
            }
            for origin in &origins {
                let Some(url) = origin.get("origin").and_then(Value::as_str) else {
                    continue;
                };
                let Some(items) = origin.get("localStorage").and_then(Value::as_array) else {
                    continue;
                };
                if !url.starts_with(base_url.trim_end_matches('/')) && !base_url.starts_with(url) {
                    continue;
                }
                tab.navigate_to(url)
                    .and_then(|tab| tab.wait_until_navigated())
                    .map_err(|e| DriverError::Navigation(e.to_string()))?;
                tab.evaluate(&local_storage_js(items), false)
                    .map_err(|e| DriverError::Other(format!("restore localStorage: {}", e)))?;
            }
            Ok(())
        })
        .await?;
        tracing::debug!(cookies = count, "Session installed into Chrome context");
        Ok(())
    }

    async fn capture_session(&self) -> Result<StorageState, DriverError> {
        self.with_tab(|tab| {
            let cookies = tab
                .get_cookies()
                .map_err(|e| DriverError::Other(format!("get cookies: {}", e)))?
                .into_iter()
                .filter_map(|cookie| serde_json::to_value(cookie).ok())
                .collect();

            let origin = tab.get_url();
            let origin = origin
                .split('/')
                .take(3)
                .collect::<Vec<_>>()
                .join("/");
            let storage = tab
                .evaluate("JSON.stringify(Object.entries(localStorage))", false)
                .ok()
                .and_then(|remote| remote.value)
                .and_then(|value| value.as_str().map(str::to_string))
                .and_then(|raw| serde_json::from_str::<Vec<(String, String)>>(&raw).ok())
                .unwrap_or_default();
            let origins = if storage.is_empty() {
                Vec::new()
            } else {
                let entries: Vec<Value> = storage
                    .into_iter()
                    .map(|(name, value)| json!({"name": name, "value": value}))
                    .collect();
                vec![json!({"origin": origin, "localStorage": entries})]
            };
            Ok(StorageState { cookies, origins })
        })
        .await
    }

    async fn close(&mut self) {
        if !self.ready.swap(false, Ordering::SeqCst) {
            return;
        }
        let tab = Arc::clone(&self.tab);
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = tab.close(true) {
                tracing::debug!("Tab close failed: {}", e);
            }
        })
        .await;
    }
}
