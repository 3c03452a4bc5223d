//! Hive - Rust 多智能体编排核心
//!
//! 模块划分：
//! - **agent**: Agent 抽象与基于模型的 LlmAgent（模型 ↔ 工具循环）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **conversation**: 多 Agent 会话状态机、选择策略、持久化与审计
//! - **core**: 错误类型、执行守卫、资源生命周期、会话监管
//! - **llm**: 模型客户端抽象与 Mock 实现
//! - **memory**: 带归属约束的共享变量与对话历史
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、带超时的执行器、Agent 委派工具
//! - **workflow**: 顺序步骤工作流、会话与运行记录（token 用量汇总）

pub mod agent;
pub mod config;
pub mod conversation;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use agent::{Agent, AgentReply, LlmAgent, TurnAction};
pub use conversation::{ConversationOrchestrator, ConversationParticipant, TurnOutcome};
pub use core::{ExecutionContext, ExecutionGuard, OrchestrationError, ResourceLifecycleManager};
pub use memory::SharedVariableStore;
pub use workflow::{WorkflowBuilder, WorkflowEngine};
