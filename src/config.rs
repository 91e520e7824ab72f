//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BRIDGE__*` 覆盖（双下划线表示嵌套，如 `BRIDGE__BROWSER__HEADLESS=false`）。
//! 会话注入相关的 `MANUS_*` 变量不属于配置文件，由会话层直接读取。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub browser: BrowserSection,
    pub platform: PlatformSection,
    pub session: SessionSection,
    pub tasks: TasksSection,
    pub log: LogSection,
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// 每个客户端 IP 每分钟可发送的消息数，0 表示不限
    pub rate_limit_per_minute: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            rate_limit_per_minute: 10,
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// [browser] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub headless: bool,
    /// 人工登录时是否无界面
    pub headless_setup: bool,
    /// 使用持久化 profile 目录（无法并行，上下文池固定为 1）
    pub use_persistent_context: bool,
    pub user_data_dir: PathBuf,
    pub browser_timeout_ms: u64,
    pub page_timeout_ms: u64,
    pub max_contexts: usize,
    pub window_width: u32,
    pub window_height: u32,
    /// 启动时预热一个上下文
    pub warm_up: bool,
    pub launch_retry_delay_ms: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            headless_setup: false,
            use_persistent_context: false,
            user_data_dir: PathBuf::from("browser_data"),
            browser_timeout_ms: 30_000,
            page_timeout_ms: 15_000,
            max_contexts: 1,
            window_width: 1440,
            window_height: 900,
            warm_up: true,
            launch_retry_delay_ms: 1_000,
        }
    }
}

/// [platform] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    pub name: String,
    pub base_url: String,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            name: "manus".to_string(),
            base_url: "https://www.manus.im".to_string(),
        }
    }
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 会话文件；为空时仅保存在内存中
    pub path: Option<PathBuf>,
    pub validity_days: i64,
    pub login_timeout_minutes: u64,
    pub login_markers: Vec<String>,
    pub allow_env_injection: bool,
    pub credentials_api_url: String,
    pub credentials_api_token: String,
    pub credentials_api_timeout_secs: u64,
    pub credentials_user: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("session_state.json")),
            validity_days: 30,
            login_timeout_minutes: 10,
            login_markers: vec!["chat".into(), "dashboard".into(), "app".into()],
            allow_env_injection: true,
            credentials_api_url: String::new(),
            credentials_api_token: String::new(),
            credentials_api_timeout_secs: 30,
            credentials_user: String::new(),
        }
    }
}

impl SessionSection {
    pub fn validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.validity_days.max(1))
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_minutes.max(1) * 60)
    }
}

/// [tasks] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    pub default_timeout_secs: u64,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_message_chars: usize,
    /// 已结束任务的保留时长
    pub retention_hours: u64,
    pub cleanup_interval_secs: u64,
    /// /send-message-quick 等待对话 URL 出现的上限
    pub quick_url_wait_secs: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            min_timeout_secs: 10,
            max_timeout_secs: 300,
            max_message_chars: 10_000,
            retention_hours: 24,
            cleanup_interval_secs: 3600,
            quick_url_wait_secs: 8,
        }
    }
}

/// [log] 段：pretty / json
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BRIDGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BRIDGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BRIDGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
