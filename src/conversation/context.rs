//! 每轮交给 Agent 的上下文
//!
//! 只包含本轮 Agent 需要看到的内容：自己负责的变量、还缺的变量、其他 Agent 已采集的变量、
//! 最近若干条消息、可交接的同伴名单。渲染成一段纯文本 prompt。

use std::fmt::Write as _;

use serde_json::Value;

use crate::conversation::participant::ParticipantInfo;
use crate::memory::{ConversationHistory, Message, MessageType, Progress, SharedVariableStore, Variable};

#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_name: String,
    pub user_message: String,
    pub owned_variables: Vec<Variable>,
    pub missing_variables: Vec<Variable>,
    pub filled_by_others: Vec<Variable>,
    pub recent_messages: Vec<Message>,
    /// 其他活跃参与者
    pub peers: Vec<ParticipantInfo>,
    pub progress: Progress,
}

impl AgentContext {
    pub fn build(
        agent_name: &str,
        user_message: &str,
        store: &SharedVariableStore,
        history: &ConversationHistory,
        roster: &[ParticipantInfo],
        history_window: usize,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            user_message: user_message.to_string(),
            owned_variables: store.owned_by(agent_name),
            missing_variables: store.missing_for(agent_name),
            filled_by_others: store.filled_by_others(agent_name),
            recent_messages: history.recent(history_window).to_vec(),
            peers: roster
                .iter()
                .filter(|p| p.active && p.name != agent_name)
                .cloned()
                .collect(),
            progress: store.progress(),
        }
    }

    pub fn render_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "You are acting as {} in a multi-agent conversation.", self.agent_name);

        if !self.owned_variables.is_empty() {
            let _ = writeln!(out, "\n## Variables you own");
            for v in &self.owned_variables {
                let _ = writeln!(out, "- {}", describe(v));
            }
        }

        if !self.missing_variables.is_empty() {
            let _ = writeln!(out, "\n## Still needed from the user");
            for v in &self.missing_variables {
                let required = if v.required { " (required)" } else { "" };
                let _ = writeln!(out, "- {}{}: {}", v.name, required, v.description);
            }
        }

        if !self.filled_by_others.is_empty() {
            let _ = writeln!(out, "\n## Already collected by other agents");
            for v in &self.filled_by_others {
                let _ = writeln!(out, "- {}", describe(v));
            }
        }

        let _ = writeln!(
            out,
            "\nProgress: {}/{} variables, {}/{} required.",
            self.progress.filled, self.progress.total, self.progress.required_filled, self.progress.required
        );

        if !self.peers.is_empty() {
            let _ = writeln!(out, "\n## Agents you can hand over to");
            for p in &self.peers {
                if p.expertise.is_empty() {
                    let _ = writeln!(out, "- {}", p.name);
                } else {
                    let _ = writeln!(out, "- {} ({})", p.name, p.expertise.join(", "));
                }
            }
        }

        // 最后一条是本轮用户消息，单独列出
        let earlier = match self.recent_messages.split_last() {
            Some((last, rest)) if last.message_type == MessageType::User && last.content == self.user_message => rest,
            _ => &self.recent_messages[..],
        };
        if !earlier.is_empty() {
            let _ = writeln!(out, "\n## Recent conversation");
            for m in earlier {
                let _ = writeln!(out, "[{}] {}", speaker(m), m.content);
            }
        }

        let _ = write!(out, "\n## User message\n{}", self.user_message);
        out
    }
}

fn describe(v: &Variable) -> String {
    match &v.current_value {
        Some(value) => format!("{} = {}", v.name, display_value(value)),
        None => format!("{}: {} (not collected)", v.name, v.description),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn speaker(m: &Message) -> &str {
    match m.message_type {
        MessageType::User => "user",
        MessageType::System => "system",
        MessageType::Agent | MessageType::Handoff => &m.agent_name,
    }
}
