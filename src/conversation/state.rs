//! 会话状态：可序列化快照、生命周期状态与状态机阶段

use serde::{Deserialize, Serialize};

use crate::memory::{Message, Progress, Variable};

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConversationStatus {
    #[default]
    Active,
    Completed,
    Paused,
    Abandoned,
    Error,
    Archived,
}

impl ConversationStatus {
    /// 终态：不再接受新消息与交接
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversationStatus::Completed | ConversationStatus::Archived | ConversationStatus::Abandoned
        )
    }
}

/// 编排状态机阶段（由当前状态推导，不单独存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationPhase {
    NoActiveAgent,
    AgentActive,
    /// 已请求交接，下一轮开始时生效
    TransitionPending,
    Completed,
}

impl ConversationPhase {
    pub fn derive(
        status: ConversationStatus,
        current_agent: Option<&str>,
        pending_agent: Option<&str>,
    ) -> Self {
        if status.is_terminal() {
            ConversationPhase::Completed
        } else if pending_agent.is_some() {
            ConversationPhase::TransitionPending
        } else if current_agent.is_some() {
            ConversationPhase::AgentActive
        } else {
            ConversationPhase::NoActiveAgent
        }
    }
}

/// 会话快照（持久化 / 恢复的单位）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    pub user_id: String,
    pub variables: Vec<Variable>,
    pub message_history: Vec<Message>,
    pub current_agent: Option<String>,
    #[serde(default)]
    pub pending_agent: Option<String>,
    pub available_agents: Vec<String>,
    pub progress: Progress,
    pub status: ConversationStatus,
    #[serde(default)]
    pub completion_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            variables: Vec::new(),
            message_history: Vec::new(),
            current_agent: None,
            pending_agent: None,
            available_agents: Vec::new(),
            progress: Progress::default(),
            status: ConversationStatus::Active,
            completion_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> ConversationPhase {
        ConversationPhase::derive(
            self.status,
            self.current_agent.as_deref(),
            self.pending_agent.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_derivation() {
        let mut state = ConversationState::new("s", "u");
        assert_eq!(state.phase(), ConversationPhase::NoActiveAgent);
        state.current_agent = Some("Sales".into());
        assert_eq!(state.phase(), ConversationPhase::AgentActive);
        state.pending_agent = Some("Support".into());
        assert_eq!(state.phase(), ConversationPhase::TransitionPending);
        state.status = ConversationStatus::Abandoned;
        assert_eq!(state.phase(), ConversationPhase::Completed);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ConversationStatus::Completed.is_terminal());
        assert!(ConversationStatus::Archived.is_terminal());
        assert!(ConversationStatus::Abandoned.is_terminal());
        assert!(!ConversationStatus::Paused.is_terminal());
        assert!(!ConversationStatus::Error.is_terminal());
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = ConversationState::new("s1", "u1");
        state.current_agent = Some("Sales".into());
        state.message_history.push(Message::user("hi"));
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
