//! 模型调用抽象
//!
//! 编排核心只依赖这一契约：invoke(messages, tools?, config) -> {content, tool_calls, usage}。
//! 具体的提供方（OpenAI 兼容、本地模型等）在宿主进程中实现。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::types::{ChatMessage, ModelConfig, ModelResponse, ToolSpec};

/// 模型传输层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network timeout")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 模型客户端 trait
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// 一次模型调用
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        config: &ModelConfig,
    ) -> Result<ModelResponse, LlmError>;

    /// 客户端名称（用于日志）
    fn name(&self) -> &str {
        "model"
    }
}
