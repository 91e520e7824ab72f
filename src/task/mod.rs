//! 任务层：任务模型、注册表（状态机）与执行器

pub mod executor;
pub mod registry;
pub mod types;

pub use executor::{ExecutorConfig, TaskExecutor};
pub use registry::{TaskCounts, TaskLimits, TaskRegistry};
pub use types::{Task, TaskError, TaskId, TaskInput, TaskResult, TaskStatus, Transition};
