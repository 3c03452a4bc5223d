//! 编排错误类型
//!
//! 与编排器的失败语义配合：单轮内的错误在编排器边界被捕获并转为兜底回复；
//! 资源释放与持久化错误只记录日志，不向上抛出。

use thiserror::Error;

use crate::llm::LlmError;

/// 执行守卫的三类上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// 模型调用次数
    ModelCalls,
    /// 递归深度（Agent 调用 Agent）
    RecursionDepth,
    /// 子执行次数（嵌套工作流）
    SubExecutions,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitKind::ModelCalls => "model calls",
            LimitKind::RecursionDepth => "recursion depth",
            LimitKind::SubExecutions => "sub-executions",
        };
        f.write_str(s)
    }
}

/// 编排核心可能出现的错误
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// 配置输入不合法（调用方错误，不重试）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 非归属 Agent 尝试写变量
    #[error("Agent '{actor}' cannot write variable '{variable}' owned by '{owner}'")]
    Ownership {
        variable: String,
        owner: String,
        actor: String,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// 非法交接目标；编排器停留在当前 Agent
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// 守卫触发，对当前执行是致命的，不得自动重试
    #[error("Execution '{execution_id}' exceeded {limit} limit ({max})")]
    LimitExceeded {
        limit: LimitKind,
        max: usize,
        execution_id: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Resource manager already closed")]
    AlreadyClosed,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error(transparent)]
    Model(#[from] LlmError),
}

impl OrchestrationError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// 是否为对当前执行致命的错误（守卫触发或取消）
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LimitExceeded { .. } | Self::Cancelled)
    }
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
