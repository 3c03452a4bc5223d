//! 会话参与者：Agent 及其在会话中的元数据

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::Agent;

/// 参与会话的 Agent
#[derive(Clone)]
pub struct ConversationParticipant {
    pub name: String,
    pub agent: Arc<dyn Agent>,
    /// 擅长领域关键词（KeywordSelector 使用）
    pub expertise: Vec<String>,
    pub active: bool,
    /// 选择时的优先级，越大越优先
    pub priority: i32,
    pub last_activity: Option<i64>,
    pub message_count: usize,
}

impl ConversationParticipant {
    /// 名称取自 agent.name()
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            name: agent.name().to_string(),
            agent,
            expertise: Vec::new(),
            active: true,
            priority: 0,
            last_activity: None,
            message_count: 0,
        }
    }

    pub fn with_expertise<I, S>(mut self, expertise: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expertise = expertise.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub(crate) fn record_turn(&mut self) {
        self.message_count += 1;
        self.last_activity = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            name: self.name.clone(),
            description: self.agent.description().to_string(),
            expertise: self.expertise.clone(),
            active: self.active,
            priority: self.priority,
            last_activity: self.last_activity,
            message_count: self.message_count,
        }
    }
}

impl std::fmt::Debug for ConversationParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationParticipant")
            .field("name", &self.name)
            .field("expertise", &self.expertise)
            .field("active", &self.active)
            .field("priority", &self.priority)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// 参与者的只读视图（不含 Agent 句柄）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub name: String,
    pub description: String,
    pub expertise: Vec<String>,
    pub active: bool,
    pub priority: i32,
    pub last_activity: Option<i64>,
    pub message_count: usize,
}
