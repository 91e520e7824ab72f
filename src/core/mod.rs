//! 核心层：错误类型、组件装配、优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{create_bridge_builder, BridgeBuilder, BridgeComponents};
pub use error::{BridgeError, ErrorKind};
pub use shutdown::{
    BrowserCleanup, ExecutorCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
