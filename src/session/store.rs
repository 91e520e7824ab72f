//! 会话存储抽象层
//!
//! 定义统一的会话持久化接口（load / save / invalidate），支持文件与内存两种实现。
//! 损坏或无法读取的数据一律视为「没有会话」，绝不作为启动失败处理。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::types::{Session, SessionSource, StorageState};

/// 会话存储错误
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Credentials API error: {0}")]
    Credentials(String),
}

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取已持久化的会话；不存在或无法解析时返回 None
    async fn load(&self) -> Option<Session>;

    /// 覆盖写入会话
    async fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// 清除会话，下一个任务将需要重新登录
    async fn invalidate(&self) -> Result<(), SessionError>;

    /// 是否已过期
    fn is_expired(&self, session: &Session) -> bool {
        session.is_expired()
    }

    /// 存储位置描述（用于日志）
    fn describe(&self) -> String;
}

/// 文件中的会话记录；元数据缺失时（浏览器直接导出的 storage state）按文件修改时间推算
#[derive(Deserialize)]
struct SessionRecord {
    #[serde(flatten)]
    state: StorageState,
    #[serde(default)]
    source: Option<SessionSource>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// JSON 文件会话存储，写入为原子操作（临时文件 + rename）
pub struct FileSessionStore {
    path: PathBuf,
    validity: Duration,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl AsRef<Path>, validity: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            validity,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session_state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn modified_at(&self) -> Option<DateTime<Utc>> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.tmp_path();
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Option<Session> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read session file {:?}: {}", self.path, e);
                return None;
            }
        };
        let record: SessionRecord = match serde_json::from_str(&data) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Ignoring unparseable session file {:?}: {}", self.path, e);
                return None;
            }
        };
        if record.state.is_empty() {
            return None;
        }

        let created_at = match record.created_at {
            Some(ts) => ts,
            None => self.modified_at().await.unwrap_or_else(Utc::now),
        };
        Some(Session {
            state: record.state,
            source: record.source.unwrap_or(SessionSource::InteractiveLogin),
            created_at,
            expires_at: record.expires_at.unwrap_or(created_at + self.validity),
        })
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let json = serde_json::to_vec_pretty(session)?;
        let _guard = self.write_lock.lock().await;
        let result = self.write_atomic(&json).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(self.tmp_path()).await;
        }
        result?;
        tracing::info!(
            path = ?self.path,
            source = session.source.as_str(),
            cookies = session.state.cookies.len(),
            "Session saved"
        );
        Ok(())
    }

    async fn invalidate(&self) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// 内存会话存储（测试与不需要跨重启保留时使用）
#[derive(Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn invalidate(&self) -> Result<(), SessionError> {
        *self.session.write().await = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// 创建会话存储：提供路径时使用文件存储，否则使用内存存储
pub fn create_session_store(path: Option<&Path>, validity: Duration) -> Arc<dyn SessionStore> {
    match path {
        Some(path) => {
            tracing::info!("Using file session store: {:?}", path);
            Arc::new(FileSessionStore::new(path, validity))
        }
        None => {
            tracing::info!("Using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_session() -> Session {
        Session::new(
            StorageState {
                cookies: vec![json!({"name": "session_token", "value": "abc", "domain": ".manus.im"})],
                origins: vec![],
            },
            SessionSource::InteractiveLogin,
            Duration::days(30),
        )
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("session_state.json"), Duration::days(30));
        assert!(store.load().await.is_none());

        let session = sample_session();
        store.save(&session).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.state, session.state);
        assert_eq!(loaded.expires_at, session.expires_at);
        assert!(!store.tmp_path().exists());

        store.invalidate().await.unwrap();
        assert!(store.load().await.is_none());
        // 重复清除不报错
        store.invalidate().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_state.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileSessionStore::new(&path, Duration::days(30));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_plain_storage_state_uses_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_state.json");
        std::fs::write(
            &path,
            r#"{"cookies":[{"name":"session_id","value":"x"}],"origins":[]}"#,
        )
        .unwrap();
        let store = FileSessionStore::new(&path, Duration::days(30));
        let session = store.load().await.unwrap();
        assert_eq!(session.source, SessionSource::InteractiveLogin);
        assert_eq!(session.expires_at - session.created_at, Duration::days(30));
        assert!(!store.is_expired(&session));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_state.json");
        let store = FileSessionStore::new(&path, Duration::days(30));
        let session = sample_session();
        store.save(&session).await.unwrap();

        // 临时文件位置被目录占用，写入失败
        std::fs::create_dir(store.tmp_path()).unwrap();
        let mut replacement = sample_session();
        replacement.state.cookies.clear();
        assert!(store.save(&replacement).await.is_err());

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.state, session.state);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        assert!(store.load().await.is_none());
        store.save(&sample_session()).await.unwrap();
        assert!(store.load().await.is_some());
        store.invalidate().await.unwrap();
        assert!(store.load().await.is_none());
    }
}
