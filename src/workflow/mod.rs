//! 工作流：顺序步骤引擎、会话与运行记录

pub mod builder;
pub mod engine;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::{InputFn, OutputFn, WorkflowEngine, WorkflowStep};
pub use types::*;
