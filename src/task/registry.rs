//! 任务注册表
//!
//! 任务存在性与状态的唯一来源。所有修改在同一把写锁内完成「读-校验-写」，
//! 因此并发完成的执行器也无法让状态倒退；修改对随后的读取立即可见。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::types::{Task, TaskId, TaskInput, TaskStatus, Transition};
use crate::core::BridgeError;

/// 创建任务时的输入约束
#[derive(Debug, Clone)]
pub struct TaskLimits {
    pub supported_platforms: Vec<String>,
    pub max_message_chars: usize,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            supported_platforms: vec!["manus".to_string()],
            max_message_chars: 10_000,
            min_timeout_secs: 10,
            max_timeout_secs: 300,
        }
    }
}

impl TaskLimits {
    pub fn validate(&self, input: &TaskInput) -> Result<(), BridgeError> {
        if input.message.trim().is_empty() {
            return Err(BridgeError::Validation("message must not be empty".to_string()));
        }
        let chars = input.message.chars().count();
        if chars > self.max_message_chars {
            return Err(BridgeError::Validation(format!(
                "message too long: {} chars (max {})",
                chars, self.max_message_chars
            )));
        }
        if !self
            .supported_platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case(input.platform.trim()))
        {
            return Err(BridgeError::Validation(format!(
                "unsupported platform: {}",
                input.platform
            )));
        }
        if input.timeout_seconds < self.min_timeout_secs.max(1)
            || input.timeout_seconds > self.max_timeout_secs
        {
            return Err(BridgeError::Validation(format!(
                "timeout_seconds must be between {} and {}",
                self.min_timeout_secs.max(1),
                self.max_timeout_secs
            )));
        }
        Ok(())
    }
}

/// 各状态任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<TaskId, Task>,
    /// 插入顺序
    order: Vec<TaskId>,
}

/// 任务注册表（可注入，测试中每个用例独立实例化）
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    limits: TaskLimits,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(TaskLimits::default())
    }
}

impl TaskRegistry {
    pub fn new(limits: TaskLimits) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            limits,
        }
    }

    pub fn limits(&self) -> &TaskLimits {
        &self.limits
    }

    /// 创建 pending 任务
    pub async fn create(&self, input: TaskInput) -> Result<TaskId, BridgeError> {
        self.limits.validate(&input)?;

        let mut inner = self.inner.write().await;
        let mut id = new_task_id();
        while inner.tasks.contains_key(&id) {
            id = new_task_id();
        }
        let task = Task::new(id.clone(), input);
        tracing::info!(
            task_id = %id,
            platform = %task.input.platform,
            message_length = task.input.message.len(),
            "Task created"
        );
        inner.tasks.insert(id.clone(), task);
        inner.order.push(id.clone());
        Ok(id)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, BridgeError> {
        self.inner
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(task_id.to_string()))
    }

    /// 原子地应用一次状态迁移，返回迁移后的任务
    pub async fn update(&self, task_id: &str, transition: Transition) -> Result<Task, BridgeError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BridgeError::NotFound(task_id.to_string()))?;

        if task.status != transition.allowed_from() {
            let err = BridgeError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: transition.target(),
            };
            tracing::error!(task_id = %task_id, error = %err, "Rejected task transition (defect)");
            return Err(err);
        }

        let now = Utc::now();
        task.status = transition.target();
        task.updated_at = now;
        match transition {
            Transition::Start => {
                task.started_at = Some(now);
            }
            Transition::Complete(result) => {
                if let Some(url) = &result.conversation_url {
                    task.conversation_url = Some(url.clone());
                }
                task.result = Some(result);
                task.finished_at = Some(now);
            }
            Transition::Fail(error) => {
                task.error = Some(error);
                task.finished_at = Some(now);
            }
        }
        tracing::debug!(task_id = %task_id, status = %task.status, "Task transitioned");
        Ok(task.clone())
    }

    /// 记录执行中任务的对话 URL，状态不变；其他状态下拒绝
    pub async fn record_conversation_url(&self, task_id: &str, url: &str) -> Result<Task, BridgeError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BridgeError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Err(BridgeError::Validation(format!(
                "task {} is {}, conversation url can only be recorded while running",
                task_id, task.status
            )));
        }
        task.conversation_url = Some(url.to_string());
        task.updated_at = Utc::now();
        tracing::debug!(task_id = %task_id, conversation_url = %url, "Conversation URL recorded");
        Ok(task.clone())
    }

    /// 列出任务：最新创建的在前，可按状态过滤；在快照上惰性产出
    pub async fn list(
        &self,
        filter: Option<TaskStatus>,
        limit: usize,
    ) -> impl Iterator<Item = Task> {
        let snapshot: Vec<Task> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|id| inner.tasks.get(id).cloned())
                .collect()
        };
        snapshot
            .into_iter()
            .rev()
            .filter(move |task| filter.map_or(true, |status| task.status == status))
            .take(limit)
    }

    pub async fn counts(&self) -> TaskCounts {
        let inner = self.inner.read().await;
        let mut counts = TaskCounts::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// 清理超过保留期的已结束任务，返回清理数量
    pub async fn cleanup_finished(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - max_age;

        let mut inner = self.inner.write().await;
        let old_ids: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.is_finished() && t.updated_at < cutoff)
            .map(|t| t.id.clone())
            .collect();

        for id in &old_ids {
            inner.tasks.remove(id);
            tracing::info!(task_id = %id, "Removed expired task");
        }
        if !old_ids.is_empty() {
            inner.order.retain(|id| !old_ids.contains(id));
        }
        old_ids.len()
    }

    /// 后台定期清理，直到 token 被取消
    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        retention: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.cleanup_finished(retention).await;
                        if removed > 0 {
                            tracing::info!("Task retention sweep removed {} tasks", removed);
                        }
                    }
                }
            }
        })
    }
}

fn new_task_id() -> TaskId {
    format!("task_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::task::{TaskError, TaskResult};

    fn result(reply: &str) -> TaskResult {
        TaskResult {
            message_sent: "ping".into(),
            ai_response: Some(reply.into()),
            conversation_url: None,
        }
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let registry = TaskRegistry::default();

        let err = registry.create(TaskInput::new("   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry
            .create(TaskInput::new("hi").with_platform("chatgpt"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported platform"));

        let err = registry
            .create(TaskInput::new("hi").with_timeout(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let long = "x".repeat(10_001);
        assert!(registry.create(TaskInput::new(long)).await.is_err());
        assert_eq!(registry.counts().await.total(), 0);
    }

    #[tokio::test]
    async fn test_forward_only_transitions() {
        let registry = TaskRegistry::default();
        let id = registry.create(TaskInput::new("ping")).await.unwrap();

        // pending 不能直接进入终态
        let err = registry.update(&id, Transition::Complete(result("pong"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);

        let running = registry.update(&id, Transition::Start).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.result.is_none() && running.error.is_none());
        assert!(running.updated_at >= running.created_at);

        let done = registry.update(&id, Transition::Complete(result("pong"))).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.updated_at >= running.updated_at);
        assert!(done.error.is_none());
        assert!(done.execution_time_seconds().is_some());

        for transition in [
            Transition::Start,
            Transition::Complete(result("again")),
            Transition::Fail(TaskError {
                kind: ErrorKind::Driver,
                message: "late".into(),
            }),
        ] {
            let err = registry.update(&id, transition).await.unwrap_err();
            assert!(matches!(err, BridgeError::InvalidTransition { .. }));
        }

        let task = registry.get(&id).await.unwrap();
        assert_eq!(task.result, Some(result("pong")));
    }

    #[tokio::test]
    async fn test_get_unknown_and_idempotent() {
        let registry = TaskRegistry::default();
        assert!(matches!(
            registry.get("task_missing").await,
            Err(BridgeError::NotFound(_))
        ));

        let id = registry.create(TaskInput::new("ping")).await.unwrap();
        let first = registry.get(&id).await.unwrap();
        let second = registry.get(&id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_list_order_filter_and_limit() {
        let registry = TaskRegistry::default();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(registry.create(TaskInput::new(format!("m{}", i))).await.unwrap());
        }
        registry.update(&ids[1], Transition::Start).await.unwrap();

        let listed: Vec<TaskId> = registry.list(None, 50).await.map(|t| t.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let running: Vec<TaskId> = registry
            .list(Some(TaskStatus::Running), 50)
            .await
            .map(|t| t.id)
            .collect();
        assert_eq!(running, vec![ids[1].clone()]);

        assert_eq!(registry.list(None, 2).await.count(), 2);
    }

    #[tokio::test]
    async fn test_ids_unique() {
        let registry = TaskRegistry::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = registry.create(TaskInput::new("ping")).await.unwrap();
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_finished() {
        let registry = TaskRegistry::default();
        let done = registry.create(TaskInput::new("a")).await.unwrap();
        let pending = registry.create(TaskInput::new("b")).await.unwrap();
        registry.update(&done, Transition::Start).await.unwrap();
        registry
            .update(
                &done,
                Transition::Fail(TaskError {
                    kind: ErrorKind::Driver,
                    message: "boom".into(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(registry.cleanup_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.cleanup_finished(Duration::ZERO).await, 1);
        assert!(registry.get(&done).await.is_err());
        assert!(registry.get(&pending).await.is_ok());
        assert_eq!(registry.list(None, 10).await.count(), 1);
    }

    #[tokio::test]
    async fn test_ids_not_reissued_after_cleanup() {
        let registry = TaskRegistry::default();
        let mut retired = std::collections::HashSet::new();
        for _ in 0..20 {
            let id = registry.create(TaskInput::new("ping")).await.unwrap();
            registry.update(&id, Transition::Start).await.unwrap();
            registry.update(&id, Transition::Complete(result("pong"))).await.unwrap();
            retired.insert(id);
        }
        assert_eq!(registry.cleanup_finished(Duration::ZERO).await, 20);

        for _ in 0..100 {
            let id = registry.create(TaskInput::new("ping")).await.unwrap();
            assert!(!retired.contains(&id));
        }
    }

    #[tokio::test]
    async fn test_conversation_url_only_while_running() {
        let registry = TaskRegistry::default();
        let id = registry.create(TaskInput::new("ping")).await.unwrap();
        assert!(registry.get(&id).await.unwrap().conversation_url.is_none());

        let err = registry
            .record_conversation_url(&id, "https://www.manus.im/app/early")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        registry.update(&id, Transition::Start).await.unwrap();
        let task = registry
            .record_conversation_url(&id, "https://www.manus.im/app/abc")
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.conversation_url.as_deref(), Some("https://www.manus.im/app/abc"));
        assert!(task.result.is_none());

        // 无 URL 的结果不会抹掉已记录的 URL
        let done = registry.update(&id, Transition::Complete(result("pong"))).await.unwrap();
        assert_eq!(done.conversation_url.as_deref(), Some("https://www.manus.im/app/abc"));
        assert!(registry.record_conversation_url(&id, "https://x").await.is_err());

        let given = registry
            .create(TaskInput::new("hi").with_conversation(" https://www.manus.im/app/given "))
            .await
            .unwrap();
        let task = registry.get(&given).await.unwrap();
        assert_eq!(task.conversation_url.as_deref(), Some("https://www.manus.im/app/given"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_keep_order() {
        let registry = Arc::new(TaskRegistry::default());
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.create(TaskInput::new(format!("m{}", i))).await })
            })
            .collect();
        let mut created = std::collections::HashSet::new();
        for handle in handles {
            assert!(created.insert(handle.await.unwrap().unwrap()));
        }

        let listed: Vec<Task> = registry.list(None, 100).await.collect();
        assert_eq!(listed.len(), 64);
        let listed_ids: std::collections::HashSet<TaskId> = listed.iter().map(|t| t.id.clone()).collect();
        assert_eq!(listed_ids, created);
        // 最新创建的在前
        for pair in listed.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
        assert_eq!(registry.counts().await.pending, 64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_terminal_updates_single_winner() {
        let registry = Arc::new(TaskRegistry::default());
        for _ in 0..20 {
            let id = registry.create(TaskInput::new("ping")).await.unwrap();
            registry.update(&id, Transition::Start).await.unwrap();

            let complete = {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move { registry.update(&id, Transition::Complete(result("pong"))).await })
            };
            let fail = {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                tokio::spawn(async move {
                    registry
                        .update(
                            &id,
                            Transition::Fail(TaskError {
                                kind: ErrorKind::Timeout,
                                message: "late".into(),
                            }),
                        )
                        .await
                })
            };
            let complete = complete.await.unwrap();
            let fail = fail.await.unwrap();
            assert!(complete.is_ok() != fail.is_ok(), "exactly one terminal update must win");

            let loser = if complete.is_ok() { &fail } else { &complete };
            assert!(matches!(loser, Err(BridgeError::InvalidTransition { .. })));

            let task = registry.get(&id).await.unwrap();
            if complete.is_ok() {
                assert_eq!(task.status, TaskStatus::Completed);
                assert!(task.result.is_some() && task.error.is_none());
            } else {
                assert_eq!(task.status, TaskStatus::Failed);
                assert!(task.error.is_some() && task.result.is_none());
            }
        }
    }
}
