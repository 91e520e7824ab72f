//! 会话层：登录会话模型、持久化存储、注入来源与生命周期管理

pub mod credentials;
pub mod env;
pub mod login;
pub mod manager;
pub mod store;
pub mod types;

use async_trait::async_trait;

pub use credentials::{CredentialsClient, CredentialsConfig};
pub use env::EnvSessionProvider;
pub use login::{LoginConfig, LoginFlow, LoginStart};
pub use manager::SessionManager;
pub use store::{create_session_store, FileSessionStore, MemorySessionStore, SessionError, SessionStore};
pub use types::{Session, SessionReport, SessionSource, SessionState, StorageState};

/// 只读的会话来源（环境变量注入、外部凭据 API）
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// 获取会话；来源不可用时返回 None，不视为错误
    async fn fetch(&self) -> Option<Session>;

    fn name(&self) -> &'static str;
}
