//! 对话历史：多 Agent 会话的消息流
//!
//! 只追加；上下文构建只取最近 N 条（history_window），完整历史随会话状态持久化。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Agent,
    System,
    /// Agent 之间的交接
    Handoff,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 发送者；用户消息为 "user"
    pub agent_name: String,
    pub content: String,
    pub timestamp: i64,
    pub message_type: MessageType,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(
        agent_name: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            message_type,
            metadata: HashMap::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content, MessageType::User)
    }

    pub fn agent(agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(agent_name, content, MessageType::Agent)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content, MessageType::System)
    }

    pub fn handoff(from: &str, to: &str, reason: &str) -> Self {
        let content = if reason.is_empty() {
            format!("{from} handed the conversation to {to}")
        } else {
            format!("{from} handed the conversation to {to}: {reason}")
        };
        Self::new(from, content, MessageType::Handoff)
            .with_metadata("from_agent", Value::from(from))
            .with_metadata("to_agent", Value::from(to))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 追加式对话历史
#[derive(Clone, Debug, Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近 n 条（时间正序）
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn count_by_type(&self, message_type: MessageType) -> usize {
        self.messages
            .iter()
            .filter(|m| m.message_type == message_type)
            .count()
    }

    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
