//! 多 Agent 会话：参与者、选择策略、上下文构建、状态机编排与持久化

pub mod context;
pub mod orchestrator;
pub mod participant;
pub mod persistence;
pub mod selector;
pub mod state;

pub use context::AgentContext;
pub use orchestrator::{ConversationOrchestrator, OrchestratorOptions, RejectedAction, TurnOutcome};
pub use participant::{ConversationParticipant, ParticipantInfo};
pub use persistence::{AuditEntry, AuditKind, InMemoryPersistence, JsonFilePersistence, PersistenceAdapter};
pub use selector::{AgentSelector, KeywordSelector, RoundRobinSelector, SelectionInput, StickySelector};
pub use state::{ConversationPhase, ConversationState, ConversationStatus};
