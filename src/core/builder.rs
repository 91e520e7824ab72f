//! 组件构建器：统一的服务初始化逻辑
//!
//! 按配置装配注册表、会话管理、浏览器上下文池、执行器与登录流程，API 层与测试共用同一套装配。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{ContextPool, DriverFactory};
use crate::config::AppConfig;
use crate::session::{
    create_session_store, CredentialsClient, CredentialsConfig, EnvSessionProvider, LoginConfig,
    LoginFlow, SessionManager, SessionStore,
};
use crate::task::{ExecutorConfig, TaskExecutor, TaskLimits, TaskRegistry};

/// 服务构建器
pub struct BridgeBuilder {
    config: AppConfig,
    factory: Option<Arc<dyn DriverFactory>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl BridgeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            factory: None,
            store: None,
        }
    }

    /// 指定驱动工厂（测试中使用脚本化驱动）
    pub fn with_driver_factory(mut self, factory: Arc<dyn DriverFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// 指定会话存储
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按配置构建驱动工厂：启用 `browser` feature 时为 Chrome，否则为占位工厂
    pub fn build_driver_factory(&self) -> Arc<dyn DriverFactory> {
        #[cfg(feature = "browser")]
        {
            let browser = &self.config.browser;
            let user_data_dir = browser
                .use_persistent_context
                .then(|| browser.user_data_dir.clone());
            Arc::new(crate::browser::chrome::ChromeDriverFactory::new(
                crate::browser::chrome::ChromeOptions {
                    headless: browser.headless,
                    headless_setup: browser.headless_setup,
                    user_data_dir,
                    window_size: (browser.window_width, browser.window_height),
                    launch_timeout: Duration::from_millis(browser.browser_timeout_ms),
                    page_timeout: Duration::from_millis(browser.page_timeout_ms),
                    base_url: self.config.platform.base_url.clone(),
                },
            ))
        }
        #[cfg(not(feature = "browser"))]
        {
            tracing::warn!("Built without the `browser` feature, browser automation is unavailable");
            Arc::new(crate::browser::DisabledFactory)
        }
    }

    /// 会话管理：文件/内存存储 + 凭据 API + 环境变量注入（按此优先级）
    pub fn build_sessions(&self) -> Arc<SessionManager> {
        let cfg = &self.config.session;
        let validity = cfg.validity();
        let store = self
            .store
            .clone()
            .unwrap_or_else(|| create_session_store(cfg.path.as_deref(), validity));

        let mut manager = SessionManager::new(store, validity);
        let credentials = CredentialsClient::new(CredentialsConfig {
            api_url: cfg.credentials_api_url.clone(),
            api_token: cfg.credentials_api_token.clone(),
            timeout_secs: cfg.credentials_api_timeout_secs,
            platform: self.config.platform.name.clone(),
            user: cfg.credentials_user.clone(),
            base_url: self.config.platform.base_url.clone(),
            validity,
        });
        if credentials.is_configured() {
            tracing::info!("Credentials API session source enabled");
            manager = manager.with_provider(Arc::new(credentials));
        }
        if cfg.allow_env_injection {
            manager = manager.with_provider(Arc::new(EnvSessionProvider::from_env(
                &self.config.platform.base_url,
                validity,
            )));
        }
        Arc::new(manager)
    }

    pub fn build_registry(&self) -> Arc<TaskRegistry> {
        let tasks = &self.config.tasks;
        Arc::new(TaskRegistry::new(TaskLimits {
            supported_platforms: vec![self.config.platform.name.clone()],
            max_message_chars: tasks.max_message_chars,
            min_timeout_secs: tasks.min_timeout_secs,
            max_timeout_secs: tasks.max_timeout_secs,
        }))
    }

    /// 构建完整组件
    pub fn build(&self) -> BridgeComponents {
        let factory = self
            .factory
            .clone()
            .unwrap_or_else(|| self.build_driver_factory());
        let sessions = self.build_sessions();
        let registry = self.build_registry();
        let pool = Arc::new(ContextPool::new(
            Arc::clone(&factory),
            self.config.browser.max_contexts,
        ));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&sessions),
            ExecutorConfig {
                base_url: self.config.platform.base_url.clone(),
                launch_retry_delay: Duration::from_millis(self.config.browser.launch_retry_delay_ms),
            },
        ));
        let login = Arc::new(LoginFlow::new(
            factory,
            Arc::clone(&sessions),
            LoginConfig {
                base_url: self.config.platform.base_url.clone(),
                markers: self.config.session.login_markers.clone(),
                ..LoginConfig::default()
            },
        ));

        BridgeComponents {
            registry,
            executor,
            pool,
            sessions,
            login,
            config: self.config.clone(),
        }
    }
}

/// 预构建的服务组件，API 层各处理器共享
#[derive(Clone)]
pub struct BridgeComponents {
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<TaskExecutor>,
    pub pool: Arc<ContextPool>,
    pub sessions: Arc<SessionManager>,
    pub login: Arc<LoginFlow>,
    pub config: AppConfig,
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_bridge_builder(config_path: Option<PathBuf>) -> BridgeBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    BridgeBuilder::new(config)
}
