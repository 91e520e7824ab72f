//! 桥接服务错误类型
//!
//! 与任务状态机配合：客户端错误（Validation / NotFound）直接返回给 API 调用方；
//! 浏览器相关错误（Timeout / Authentication / Driver / Unavailable / Cancelled）由执行器
//! 捕获并记录为任务的 `failed` 终态。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::TaskStatus;

/// 服务运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// 状态机违规，属于程序缺陷，正常调用方不应见到
    #[error("Invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Driver error: {0}")]
    Driver(String),

    /// 浏览器在重试后仍无法启动
    #[error("Browser unavailable: {0}")]
    Unavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// 记录在任务上的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidTransition,
    Timeout,
    Authentication,
    Driver,
    Unavailable,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::InvalidTransition => "invalid_transition_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Driver => "driver_error",
            ErrorKind::Unavailable => "unavailable_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Validation(_) => ErrorKind::Validation,
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            BridgeError::Timeout(_) => ErrorKind::Timeout,
            BridgeError::Authentication(_) => ErrorKind::Authentication,
            BridgeError::Driver(_) => ErrorKind::Driver,
            BridgeError::Unavailable(_) => ErrorKind::Unavailable,
            BridgeError::Cancelled(_) => ErrorKind::Cancelled,
            BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 是否为客户端输入导致的错误（直接返回 4xx，不进入任务记录）
    pub fn is_client_error(&self) -> bool {
        matches!(self, BridgeError::Validation(_) | BridgeError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(BridgeError::Timeout(1).kind(), ErrorKind::Timeout);
        assert_eq!(
            BridgeError::Authentication("expired".into()).kind().as_str(),
            "authentication_error"
        );
        assert!(BridgeError::NotFound("x".into()).is_client_error());
        assert!(!BridgeError::Driver("boom".into()).is_client_error());
    }

    #[test]
    fn test_display() {
        let err = BridgeError::InvalidTransition {
            task_id: "task_1".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for task task_1: Completed -> Running"
        );
    }
}
