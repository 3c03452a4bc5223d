//! LLM 层：模型调用契约与 Mock 实现

pub mod mock;
pub mod traits;
pub mod types;

pub use mock::{MockModelClient, RecordedRequest};
pub use traits::{LlmError, ModelClient};
pub use types::{ChatMessage, ModelConfig, ModelResponse, Role, TokenUsage, ToolCall, ToolSpec};
