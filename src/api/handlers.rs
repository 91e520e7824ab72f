//! 路由处理器

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::core::ErrorKind;
use crate::session::{LoginStart, SessionReport};
use crate::task::{Task, TaskInput, TaskStatus};

const DEFAULT_LIST_LIMIT: usize = 50;
const QUICK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 提交消息的请求体；省略的字段取配置中的默认值
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub conversation_url: Option<String>,
    #[serde(default)]
    pub wait_for_response: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl MessageRequest {
    fn into_input(self, state: &AppState) -> TaskInput {
        let config = &state.components.config;
        TaskInput {
            message: self.message,
            platform: self.platform.unwrap_or_else(|| config.platform.name.clone()),
            conversation_url: self.conversation_url,
            wait_for_response: self.wait_for_response.unwrap_or(true),
            timeout_seconds: self
                .timeout_seconds
                .unwrap_or(config.tasks.default_timeout_secs),
        }
    }
}

/// 消息提交结果（异步提交时只有前四个字段有值）
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message_sent: String,
    pub conversation_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,
}

/// 快速提交的结果：对话 URL 确定后立即返回，回复仍在后台等待
#[derive(Debug, Serialize)]
pub struct QuickResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message_sent: String,
    pub conversation_url: Option<String>,
    pub quick_response: bool,
    pub wait_for_ai_response: bool,
}

/// 任务记录加上常用的便捷字段（`conversation_url` 来自任务本身）
#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub ai_response: Option<String>,
    pub execution_time_seconds: Option<f64>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let ai_response = task.result.as_ref().and_then(|r| r.ai_response.clone());
        let execution_time_seconds = task.execution_time_seconds();
        Self {
            task,
            ai_response,
            execution_time_seconds,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub status_filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskList {
    pub tasks: Vec<TaskView>,
    pub total: usize,
    pub running_tasks: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub browser_ready: bool,
    pub uptime_seconds: f64,
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::new(ErrorKind::Validation, rejection.body_text()))
}

/// GET /：服务信息
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
    }))
}

/// POST /send-message：创建任务并在后台执行，立即返回任务 ID
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let input = parse_body(body)?.into_input(&state);
    tracing::info!(
        platform = %input.platform,
        message_length = input.message.chars().count(),
        "Message submission received"
    );

    let message_sent = input.message.clone();
    let conversation_url = input.conversation_target().map(str::to_string);
    let task_id = state.components.registry.create(input).await?;
    state.components.executor.spawn(task_id.clone());
    tracing::info!(task_id = %task_id, "Task created and scheduled");

    Ok(Json(MessageResponse {
        task_id,
        status: TaskStatus::Pending,
        message_sent,
        conversation_url,
        ai_response: None,
        execution_time_seconds: None,
    }))
}

/// POST /send-message-sync：创建任务并等待其结束；失败的任务映射为一个 HTTP 错误
pub async fn send_message_sync(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let input = parse_body(body)?.into_input(&state);
    let task_id = state.components.registry.create(input).await?;
    tracing::info!(task_id = %task_id, "Running task synchronously");

    let task = state.components.executor.run(&task_id).await?;
    if let Some(error) = &task.error {
        return Err(ApiError::new(error.kind, error.message.clone()));
    }

    let execution_time_seconds = task.execution_time_seconds();
    let result = task.result.unwrap_or_default();
    Ok(Json(MessageResponse {
        task_id: task.id,
        status: task.status,
        message_sent: task.input.message,
        conversation_url: result.conversation_url,
        ai_response: result.ai_response,
        execution_time_seconds,
    }))
}

/// POST /send-message-quick：后台执行，等到对话 URL 确定、任务结束或等待上限即返回
///
/// 请求里带了会话 URL 时无需等待，直接以 pending 返回。
pub async fn send_message_quick(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<QuickResponse>, ApiError> {
    let input = parse_body(body)?.into_input(&state);
    let wait_for_ai_response = input.wait_for_response;
    let registry = &state.components.registry;
    let task_id = registry.create(input).await?;
    state.components.executor.spawn(task_id.clone());

    let wait = Duration::from_secs(state.components.config.tasks.quick_url_wait_secs);
    let deadline = Instant::now() + wait;
    let mut task = registry.get(&task_id).await?;
    while task.conversation_url.is_none() && !task.is_finished() && Instant::now() < deadline {
        tokio::time::sleep(QUICK_POLL_INTERVAL).await;
        task = registry.get(&task_id).await?;
    }
    if let Some(error) = &task.error {
        return Err(ApiError::new(error.kind, error.message.clone()));
    }
    if task.conversation_url.is_none() {
        tracing::warn!(task_id = %task_id, wait_secs = wait.as_secs(), "Conversation URL not ready in time");
    }

    Ok(Json(QuickResponse {
        task_id: task.id,
        status: task.status,
        message_sent: task.input.message,
        conversation_url: task.conversation_url,
        quick_response: true,
        wait_for_ai_response,
    }))
}

/// GET /task/:task_id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let task = state.components.registry.get(&task_id).await?;
    Ok(Json(task.into()))
}

/// DELETE /task/:task_id：取消等待中或执行中的任务
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.components.executor.cancel(&task_id).await?;
    Ok(Json(json!({
        "task_id": task_id,
        "message": "cancellation requested",
    })))
}

/// GET /tasks?limit=&status_filter=
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskList>, ApiError> {
    let filter = query
        .status_filter
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    let tasks: Vec<TaskView> = state
        .components
        .registry
        .list(filter, limit)
        .await
        .map(TaskView::from)
        .collect();
    Ok(Json(TaskList {
        total: tasks.len(),
        running_tasks: state.components.executor.running_count(),
        tasks,
    }))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let browser_ready = state.components.pool.is_ready();
    Json(HealthResponse {
        status: if browser_ready { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        browser_ready,
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
    })
}

/// POST /setup-login：打开登录浏览器，后台等待用户完成登录
pub async fn setup_login(State(state): State<Arc<AppState>>) -> Result<Json<LoginStart>, ApiError> {
    let timeout = state.components.config.session.login_timeout();
    let started = state.components.login.start(timeout).await?;
    Ok(Json(started))
}

/// GET /session-status
pub async fn session_status(State(state): State<Arc<AppState>>) -> Json<SessionReport> {
    Json(state.components.sessions.status().await)
}

/// POST /force-save-session：不等登录检测，立即保存登录浏览器中的会话
pub async fn force_save_session(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let session = state.components.login.force_save().await?;
    Ok(Json(json!({
        "message": "session saved",
        "source": session.source.as_str(),
        "cookies": session.state.cookies.len(),
        "created_at": session.created_at,
        "expires_at": session.expires_at,
    })))
}
