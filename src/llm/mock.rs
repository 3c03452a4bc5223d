//! Mock 模型客户端（用于测试，无需 API）
//!
//! 按顺序回放预置的响应；脚本耗尽后回显最后一条 User 消息。记录每次收到的请求，便于断言。

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::llm::traits::{LlmError, ModelClient};
use crate::llm::types::{ChatMessage, ModelConfig, ModelResponse, Role, ToolSpec};

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// Mock 客户端：脚本化响应 + 回显兜底
#[derive(Debug, Default)]
pub struct MockModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, LlmError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一组响应，按顺序返回
    pub fn with_responses(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        let client = Self::new();
        for r in responses {
            client.push_response(r);
        }
        client
    }

    pub fn push_response(&self, response: ModelResponse) {
        self.script.lock().push_back(Ok(response));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
        _config: &ModelConfig,
    ) -> Result<ModelResponse, LlmError> {
        self.requests.lock().push(RecordedRequest {
            messages: messages.to_vec(),
            tool_names: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.name.clone())
                .collect(),
        });

        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(ModelResponse::text(format!("Echo from Mock: {}", last_user)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
