//! 浏览器上下文池
//!
//! 池容量即并发执行上限：信号量许可数 = `max_contexts`，驱动不支持独立上下文时固定为 1，
//! 此时它就是单槽准入闸门，排队的任务在拿到许可前保持 pending。
//! 中断过或报告 `!is_ready()` 的上下文会被关闭丢弃，不再回到池中。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{BrowserDriver, DriverError, DriverFactory};
use crate::core::BridgeError;
use crate::session::{Session, SessionSource, StorageState};

/// 上下文所安装会话的内容：来源与认证载荷都相同才复用
///
/// 注入的会话每次获取都会重新生成时间戳，因此不能按创建时间区分。
#[derive(Debug, Clone, PartialEq)]
struct SessionStamp {
    source: SessionSource,
    state: StorageState,
}

fn stamp_of(session: Option<&Session>) -> Option<SessionStamp> {
    session.map(|s| SessionStamp {
        source: s.source,
        state: s.state.clone(),
    })
}

struct PooledContext {
    driver: Box<dyn BrowserDriver>,
    /// 会话更换后旧上下文不再复用
    stamp: Option<SessionStamp>,
}

type IdleList = Arc<Mutex<Vec<PooledContext>>>;

/// 上下文池
pub struct ContextPool {
    factory: Arc<dyn DriverFactory>,
    gate: Arc<Semaphore>,
    capacity: usize,
    idle: IdleList,
    ready: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl ContextPool {
    pub fn new(factory: Arc<dyn DriverFactory>, max_contexts: usize) -> Self {
        let capacity = if factory.supports_independent_contexts() {
            max_contexts.max(1)
        } else {
            if max_contexts > 1 {
                tracing::warn!(
                    driver = factory.name(),
                    requested = max_contexts,
                    "Driver does not support independent contexts, limiting pool to 1"
                );
            }
            1
        };
        tracing::info!(driver = factory.name(), capacity, "Browser context pool created");
        Self {
            factory,
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
            idle: Arc::new(Mutex::new(Vec::new())),
            ready: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn factory(&self) -> &Arc<dyn DriverFactory> {
        &self.factory
    }

    /// 最近一次启动是否成功（健康检查用）
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    /// 当前空闲上下文数
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// 等待准入许可，返回持有许可的租约
    pub async fn admit(&self) -> Result<ContextLease, BridgeError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::Unavailable("browser pool is shut down".to_string()))?;
        Ok(ContextLease {
            _permit: permit,
            factory: Arc::clone(&self.factory),
            idle: Arc::clone(&self.idle),
            ready: Arc::clone(&self.ready),
            closed: Arc::clone(&self.closed),
            current: None,
            broken: false,
        })
    }

    /// 启动时预热一个上下文；失败只记录，服务以 degraded 状态运行
    pub async fn warm_up(&self, session: Option<&Session>) {
        match self.factory.launch(session).await {
            Ok(driver) => {
                self.ready.store(true, Ordering::SeqCst);
                if let Ok(mut idle) = self.idle.lock() {
                    idle.push(PooledContext {
                        driver,
                        stamp: stamp_of(session),
                    });
                }
                tracing::info!(driver = self.factory.name(), "Browser context warmed up");
            }
            Err(e) => {
                self.ready.store(false, Ordering::SeqCst);
                tracing::warn!(error = %e, "Browser warm-up failed, running degraded");
            }
        }
    }

    /// 关闭池：不再发放许可，关闭所有空闲上下文
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.gate.close();
        let drained: Vec<PooledContext> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for mut ctx in drained {
            ctx.driver.close().await;
        }
        tracing::info!(closed = count, "Browser context pool closed");
    }
}

/// 准入租约：持有一个许可，以及本次任务使用的上下文
pub struct ContextLease {
    _permit: OwnedSemaphorePermit,
    factory: Arc<dyn DriverFactory>,
    idle: IdleList,
    ready: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    current: Option<PooledContext>,
    broken: bool,
}

impl ContextLease {
    /// 确保持有可用上下文：优先复用会话一致的空闲上下文，否则启动新的
    pub async fn ensure_context(&mut self, session: Option<&Session>) -> Result<(), DriverError> {
        let stamp = stamp_of(session);
        if self
            .current
            .as_ref()
            .map_or(false, |ctx| ctx.stamp == stamp && ctx.driver.is_ready())
        {
            return Ok(());
        }
        if let Some(mut stale) = self.current.take() {
            stale.driver.close().await;
        }

        let (reusable, stale) = self.take_idle(stamp.clone());
        for mut ctx in stale {
            tracing::debug!("Closing idle browser context");
            ctx.driver.close().await;
        }
        if let Some(ctx) = reusable {
            tracing::debug!("Reusing idle browser context");
            self.current = Some(ctx);
            return Ok(());
        }

        match self.factory.launch(session).await {
            Ok(driver) => {
                self.ready.store(true, Ordering::SeqCst);
                self.current = Some(PooledContext { driver, stamp });
                Ok(())
            }
            Err(e) => {
                self.ready.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// 取出一个可复用的空闲上下文，同时取出所有已失效的
    fn take_idle(&self, stamp: Option<SessionStamp>) -> (Option<PooledContext>, Vec<PooledContext>) {
        let Ok(mut idle) = self.idle.lock() else {
            return (None, Vec::new());
        };
        let (keep, stale): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|ctx| ctx.stamp == stamp && ctx.driver.is_ready());
        let mut keep = keep.into_iter();
        let reusable = keep.next();
        idle.extend(keep);
        (reusable, stale)
    }

    pub fn driver_mut(&mut self) -> Option<&mut (dyn BrowserDriver + 'static)> {
        self.current.as_mut().map(|ctx| ctx.driver.as_mut())
    }

    /// 本次交互被中断或出现不可恢复错误，结束时丢弃上下文
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// 结束租约：健康的上下文回到池中，其余关闭；随后释放许可
    pub async fn finish(mut self) {
        let Some(mut ctx) = self.current.take() else {
            return;
        };
        let reusable = !self.broken && !self.closed.load(Ordering::SeqCst) && ctx.driver.is_ready();
        if reusable {
            if let Ok(mut idle) = self.idle.lock() {
                idle.push(ctx);
                return;
            }
        }
        tracing::debug!(broken = self.broken, "Discarding browser context");
        ctx.driver.close().await;
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        // 未经 finish 的租约（任务被取消或 panic）：上下文状态未知，后台关闭
        if let Some(mut ctx) = self.current.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    ctx.driver.close().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{StubBehavior, StubDriverFactory};
    use crate::session::{SessionSource, StorageState};
    use std::time::Duration;

    fn stub() -> Arc<StubDriverFactory> {
        Arc::new(StubDriverFactory::new(StubBehavior::echo()))
    }

    #[tokio::test]
    async fn test_single_slot_without_independent_contexts() {
        let factory = stub();
        let pool = ContextPool::new(factory, 4);
        assert_eq!(pool.capacity(), 1);

        let first = pool.admit().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), pool.admit()).await;
        assert!(second.is_err());
        first.finish().await;
        assert!(pool.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_independent_contexts_capacity() {
        let factory = Arc::new(StubDriverFactory::new(StubBehavior::echo()).independent_contexts());
        let pool = ContextPool::new(factory, 3);
        assert_eq!(pool.capacity(), 3);
    }

    #[tokio::test]
    async fn test_reuse_and_discard() {
        let factory = stub();
        let pool = ContextPool::new(factory.clone(), 1);

        let mut lease = pool.admit().await.unwrap();
        lease.ensure_context(None).await.unwrap();
        lease.finish().await;
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.is_ready());

        let mut lease = pool.admit().await.unwrap();
        lease.ensure_context(None).await.unwrap();
        assert_eq!(factory.launch_count(), 1);
        lease.mark_broken();
        lease.finish().await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(factory.close_count(), 1);
    }

    #[tokio::test]
    async fn test_new_session_replaces_idle_context() {
        let factory = stub();
        let pool = ContextPool::new(factory.clone(), 1);
        pool.warm_up(None).await;
        assert_eq!(pool.idle_count(), 1);

        let session = Session::new(
            StorageState::default(),
            SessionSource::InteractiveLogin,
            chrono::Duration::days(30),
        );
        let mut lease = pool.admit().await.unwrap();
        lease.ensure_context(Some(&session)).await.unwrap();
        assert_eq!(factory.launch_count(), 2);
        assert_eq!(factory.close_count(), 1);
        lease.finish().await;
    }

    #[tokio::test]
    async fn test_same_session_content_reuses_context() {
        let factory = stub();
        let pool = ContextPool::new(factory.clone(), 1);
        let state = StorageState {
            cookies: vec![serde_json::json!({"name": "session_token", "value": "abc"})],
            origins: vec![],
        };

        // 每次注入都是新的 Session 值，但内容不变
        for _ in 0..3 {
            let session = Session::new(state.clone(), SessionSource::Environment, chrono::Duration::days(30));
            let mut lease = pool.admit().await.unwrap();
            lease.ensure_context(Some(&session)).await.unwrap();
            lease.finish().await;
        }
        assert_eq!(factory.launch_count(), 1);
        assert_eq!(factory.close_count(), 0);

        // 同样的载荷换了来源也算不同会话
        let session = Session::new(state, SessionSource::CredentialsApi, chrono::Duration::days(30));
        let mut lease = pool.admit().await.unwrap();
        lease.ensure_context(Some(&session)).await.unwrap();
        lease.finish().await;
        assert_eq!(factory.launch_count(), 2);
        assert_eq!(factory.close_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_admission() {
        let pool = ContextPool::new(stub(), 1);
        pool.warm_up(None).await;
        pool.close().await;
        assert!(!pool.is_ready());
        assert!(matches!(pool.admit().await, Err(BridgeError::Unavailable(_))));
    }
}
