//! 工具层：显式注册表、带超时的执行器、Agent 委派工具

pub mod delegate;
pub mod executor;
pub mod registry;

pub use delegate::DelegateTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
