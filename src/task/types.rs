//! 任务数据模型
//!
//! 一个任务 = 一次「提交消息并获取回复」的请求，按 `pending → running → completed | failed`
//! 单向推进。结果与错误只能在终态设置，且二者互斥。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{BridgeError, ErrorKind};

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待执行（含排队等待浏览器上下文）
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(BridgeError::Validation(format!("unknown task status: {}", other))),
        }
    }
}

fn default_platform() -> String {
    "manus".to_string()
}

fn default_wait_for_response() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    60
}

/// 任务输入：消息、目标平台、可选的已有会话 URL、是否等待回复、超时
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub message: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// 已有对话的 URL；为空时新开对话
    #[serde(default)]
    pub conversation_url: Option<String>,
    #[serde(default = "default_wait_for_response")]
    pub wait_for_response: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl TaskInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            platform: default_platform(),
            conversation_url: None,
            wait_for_response: default_wait_for_response(),
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn with_conversation(mut self, url: impl Into<String>) -> Self {
        self.conversation_url = Some(url.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn without_waiting(mut self) -> Self {
        self.wait_for_response = false;
        self
    }

    /// 去掉空白后的会话 URL
    pub fn conversation_target(&self) -> Option<&str> {
        self.conversation_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// 成功结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub message_sent: String,
    /// 不等待回复时为空
    pub ai_response: Option<String>,
    pub conversation_url: Option<String>,
}

/// 失败详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BridgeError> for TaskError {
    fn from(err: &BridgeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// 任务记录（仅由 TaskRegistry 持有与修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub input: TaskInput,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    /// 对话 URL：来自输入，或消息发出后由执行器记录，无需等到终态
    pub conversation_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, input: TaskInput) -> Self {
        let now = Utc::now();
        let conversation_url = input.conversation_target().map(str::to_string);
        Self {
            id,
            status: TaskStatus::Pending,
            input,
            result: None,
            error: None,
            conversation_url,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 执行耗时（秒），未结束时为空
    pub fn execution_time_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            }
            _ => None,
        }
    }
}

/// 状态迁移请求，结果/错误随迁移一起原子写入
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(TaskResult),
    Fail(TaskError),
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Start => TaskStatus::Running,
            Transition::Complete(_) => TaskStatus::Completed,
            Transition::Fail(_) => TaskStatus::Failed,
        }
    }

    /// 允许的来源状态
    pub fn allowed_from(&self) -> TaskStatus {
        match self {
            Transition::Start => TaskStatus::Pending,
            Transition::Complete(_) | Transition::Fail(_) => TaskStatus::Running,
        }
    }
}
