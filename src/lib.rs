//! Manus 网页自动化桥接服务
//!
//! 通过浏览器驱动向 Manus 提交消息、抓取回复，并以 HTTP API 暴露。
//!
//! 模块划分：
//! - **api**: axum 路由、处理器、限流与服务启动
//! - **browser**: 浏览器驱动抽象、上下文池、Chrome 实现（`browser` feature）与脚本化驱动
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、组件装配、优雅关闭
//! - **observability**: tracing 初始化
//! - **session**: 登录会话的存储、来源、生命周期与人工登录流程
//! - **task**: 任务状态机、注册表与执行器

pub mod api;
pub mod browser;
pub mod config;
pub mod core;
pub mod observability;
pub mod session;
pub mod task;

pub use crate::core::{BridgeBuilder, BridgeComponents, BridgeError};
