//! 记忆层：共享变量（跨 Agent 的结构化槽位）与对话历史

pub mod conversation;
pub mod variables;

pub use conversation::{ConversationHistory, Message, MessageType};
pub use variables::{Change, Progress, SharedVariableStore, Variable, ANY_OWNER};
