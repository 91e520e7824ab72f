//! 任务执行器
//!
//! 一次执行：准入闸门 → running → 获取浏览器上下文（复用或启动，附带会话）→ 打开会话页面 →
//! 提交消息 → 等待回复（可选）→ 记录结果。
//!
//! - 超时只覆盖准入之后的浏览器交互；到时丢弃交互 future，任务记为 TimeoutError，上下文关闭不回池。
//! - 仅浏览器启动失败会自动重试一次；页面层面的失败不重试。
//! - 浏览器相关错误全部落到任务的 failed 终态，不会抛给轮询方。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::TaskRegistry;
use super::types::{Task, TaskError, TaskId, TaskInput, TaskResult, TaskStatus, Transition};
use crate::browser::{BrowserDriver, ContextLease, ContextPool, DriverError};
use crate::core::BridgeError;
use crate::session::{Session, SessionManager};

/// 执行器参数
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 平台首页（没有会话 URL 时打开）
    pub base_url: String,
    /// 浏览器启动失败后重试前的等待
    pub launch_retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.manus.im".to_string(),
            launch_retry_delay: Duration::from_millis(500),
        }
    }
}

/// 任务执行器
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    pool: Arc<ContextPool>,
    sessions: Arc<SessionManager>,
    config: ExecutorConfig,
    /// 正在执行（含排队等待准入）的任务及其取消令牌
    inflight: Mutex<HashMap<TaskId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        pool: Arc<ContextPool>,
        sessions: Arc<SessionManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            sessions,
            config,
            inflight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    /// 登记取消令牌；同一任务已在执行器中时返回 None
    fn register(&self, task_id: &str) -> Option<CancellationToken> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if inflight.contains_key(task_id) {
            return None;
        }
        let token = self.shutdown.child_token();
        inflight.insert(task_id.to_string(), token.clone());
        Some(token)
    }

    fn unregister(&self, task_id: &str) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inflight.remove(task_id);
    }

    /// 执行任务直到终态，返回最终任务记录
    ///
    /// 执行本身在独立的 tokio 任务中进行：调用方放弃等待（例如 HTTP 客户端断开）
    /// 时任务照常推进到终态，不会停留在 running。
    pub async fn run(self: &Arc<Self>, task_id: &str) -> Result<Task, BridgeError> {
        self.spawn(task_id.to_string())
            .await
            .unwrap_or_else(|e| Err(BridgeError::Internal(format!("task execution aborted: {}", e))))
    }

    /// 在后台执行任务；取消令牌在返回前登记，随后的 cancel 一定能找到它
    pub fn spawn(self: &Arc<Self>, task_id: TaskId) -> JoinHandle<Result<Task, BridgeError>> {
        let Some(token) = self.register(&task_id) else {
            return tokio::spawn(async move {
                Err(BridgeError::Validation(format!("task {} is already scheduled", task_id)))
            });
        };
        let registration = Registration {
            executor: Arc::clone(self),
            task_id: task_id.clone(),
        };
        tokio::spawn(async move {
            let outcome = registration.executor.execute(&task_id, &token).await;
            if let Err(e) = &outcome {
                tracing::error!(task_id = %task_id, error = %e, "Background task execution failed");
            }
            drop(registration);
            outcome
        })
    }

    /// 取消任务：已结束的任务不能取消
    pub async fn cancel(&self, task_id: &str) -> Result<(), BridgeError> {
        let task = self.registry.get(task_id).await?;
        if task.is_finished() {
            return Err(BridgeError::Validation(format!(
                "task {} already {}",
                task_id, task.status
            )));
        }

        let token = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(task_id)
            .cloned();
        match token {
            Some(token) => {
                tracing::info!(task_id = %task_id, status = %task.status, "Cancelling task");
                token.cancel();
                Ok(())
            }
            // 未交给执行器的 pending 任务，直接记为取消
            None if task.status == TaskStatus::Pending => {
                self.fail_pending(task_id, &BridgeError::Cancelled("cancelled by request".to_string()))
                    .await
                    .map(|_| ())
            }
            None => Err(BridgeError::Validation(format!(
                "task {} is not cancellable",
                task_id
            ))),
        }
    }

    /// 在执行中的任务数（含排队等待准入的）
    pub fn running_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// 取消所有执行中的任务，并在期限内等待它们落到终态
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while self.running_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let left = self.running_count();
        if left > 0 {
            tracing::warn!(left, "Tasks still running at shutdown");
        }
    }

    async fn execute(&self, task_id: &str, token: &CancellationToken) -> Result<Task, BridgeError> {
        let task = self.registry.get(task_id).await?;
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Running => {
                return Err(BridgeError::Validation(format!(
                    "task {} is already running",
                    task_id
                )))
            }
            TaskStatus::Completed | TaskStatus::Failed => return Ok(task),
        }

        // 排队等待准入期间任务保持 pending
        let admitted = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return self
                    .fail_pending(task_id, &BridgeError::Cancelled("cancelled before start".to_string()))
                    .await;
            }
            lease = self.pool.admit() => lease,
        };
        let mut lease = match admitted {
            Ok(lease) => lease,
            Err(e) => return self.fail_pending(task_id, &e).await,
        };

        let started = self.registry.update(task_id, Transition::Start).await?;
        let input = started.input;
        tracing::info!(
            task_id = %task_id,
            timeout_seconds = input.timeout_seconds,
            wait_for_response = input.wait_for_response,
            "Task started"
        );

        let limit = Duration::from_secs(input.timeout_seconds);
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(BridgeError::Cancelled("cancelled while running".to_string())),
            res = tokio::time::timeout(limit, self.interact(task_id, &input, &mut lease, limit)) => {
                res.unwrap_or(Err(BridgeError::Timeout(input.timeout_seconds)))
            }
        };

        if matches!(outcome, Err(BridgeError::Timeout(_)) | Err(BridgeError::Cancelled(_))) {
            lease.mark_broken();
        }

        if let Err(BridgeError::Authentication(reason)) = &outcome {
            if let Err(e) = self.sessions.invalidate(reason).await {
                tracing::error!(task_id = %task_id, error = %e, "Failed to invalidate session");
            }
        }

        let transition = match outcome {
            Ok(result) => {
                tracing::info!(
                    task_id = %task_id,
                    conversation_url = ?result.conversation_url,
                    reply_length = result.ai_response.as_ref().map_or(0, String::len),
                    "Task completed"
                );
                Transition::Complete(result)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, kind = e.kind().as_str(), "Task failed");
                Transition::Fail(TaskError::from(&e))
            }
        };
        // 终态写入后才释放许可，排队任务的开始时间不早于本任务的结束时间
        let finished = self.registry.update(task_id, transition).await;
        lease.finish().await;
        finished
    }

    /// pending 任务直接失败（经过 running 以保持状态单向前进）
    async fn fail_pending(&self, task_id: &str, error: &BridgeError) -> Result<Task, BridgeError> {
        tracing::info!(task_id = %task_id, error = %error, "Failing task before start");
        self.registry.update(task_id, Transition::Start).await?;
        self.registry
            .update(task_id, Transition::Fail(TaskError::from(error)))
            .await
    }

    async fn interact(
        &self,
        task_id: &str,
        input: &TaskInput,
        lease: &mut ContextLease,
        limit: Duration,
    ) -> Result<TaskResult, BridgeError> {
        let started = Instant::now();
        let session = self.sessions.current_for_task().await?;
        self.prepare_context(lease, session.as_ref()).await?;

        let target = input
            .conversation_target()
            .unwrap_or(&self.config.base_url)
            .to_string();
        let driver = lease
            .driver_mut()
            .ok_or_else(|| BridgeError::Internal("no browser context after launch".to_string()))?;
        let outcome = self.converse(task_id, driver, input, &target, limit, started).await;

        if let Err(e) = &outcome {
            if e.poisons_context() || !driver_ready(lease) {
                lease.mark_broken();
            }
        }
        outcome.map_err(BridgeError::from)
    }

    async fn converse(
        &self,
        task_id: &str,
        driver: &mut dyn BrowserDriver,
        input: &TaskInput,
        target: &str,
        limit: Duration,
        started: Instant,
    ) -> Result<TaskResult, DriverError> {
        driver.open(target).await?;
        driver.submit(&input.message).await?;

        // 消息发出后对话 URL 即可确定，先公布给轮询方，不必等回复
        if let Some(url) = driver.current_url().await {
            if let Err(e) = self.registry.record_conversation_url(task_id, &url).await {
                tracing::debug!(task_id = %task_id, error = %e, "Conversation URL not recorded");
            }
        }

        let ai_response = if input.wait_for_response {
            let remaining = limit.saturating_sub(started.elapsed());
            Some(driver.wait_for_reply(remaining).await?)
        } else {
            None
        };

        Ok(TaskResult {
            message_sent: input.message.clone(),
            ai_response,
            conversation_url: driver.current_url().await,
        })
    }

    /// 获取上下文；启动失败重试一次，仍失败则记为 Unavailable
    async fn prepare_context(
        &self,
        lease: &mut ContextLease,
        session: Option<&Session>,
    ) -> Result<(), BridgeError> {
        match lease.ensure_context(session).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Browser launch failed, retrying once");
                tokio::time::sleep(self.config.launch_retry_delay).await;
                lease.ensure_context(session).await.map_err(|e| {
                    BridgeError::Unavailable(format!("browser launch failed after retry: {}", e))
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// 执行器中的一次登记；无论执行正常结束还是被中止，离开时都注销取消令牌
struct Registration {
    executor: Arc<TaskExecutor>,
    task_id: TaskId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.executor.unregister(&self.task_id);
    }
}

fn driver_ready(lease: &mut ContextLease) -> bool {
    lease.driver_mut().map_or(false, |driver| driver.is_ready())
}
