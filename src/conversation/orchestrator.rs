//! 多 Agent 会话编排器
//!
//! 状态机：NoActiveAgent → AgentActive ⇄ TransitionPending → Completed（终态）。
//! 每轮（process_message）的流程：
//! 1. 终态拒绝
//! 2. 选择器以“挂起目标或当前 Agent”为基准决定本轮 Agent
//! 3. 追加用户消息，构建 AgentContext 并渲染 prompt
//! 4. 运行一次工作流（每个参与者一个步骤，只有被选中的步骤有输入）
//! 5. 失败：记录系统消息并返回兜底回复，当前 Agent、挂起交接与变量均不变
//! 6. 成功：挂起的交接生效，改选则记录交接；追加回复，按顺序提交 TurnAction
//! 7. 尽力持久化快照
//!
//! 轮次由工作流引擎外层的 tokio Mutex 串行化；parking_lot 锁只用于短临界区，不跨 await。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::agent::{AgentReply, TurnAction};
use crate::config::AppConfig;
use crate::conversation::context::AgentContext;
use crate::conversation::participant::{ConversationParticipant, ParticipantInfo};
use crate::conversation::persistence::{AuditEntry, AuditKind, PersistenceAdapter};
use crate::conversation::selector::{AgentSelector, SelectionInput, StickySelector};
use crate::conversation::state::{ConversationPhase, ConversationState, ConversationStatus};
use crate::core::{
    ExecutionContext, GuardLimits, OrchestrationError, ReleaseReport, Resource,
    ResourceLifecycleManager, Result, SessionSupervisor,
};
use crate::llm::TokenUsage;
use crate::memory::{ConversationHistory, Message, Progress, SharedVariableStore};
use crate::workflow::{WorkflowEngine, WorkflowRun, WorkflowSession};

/// 编排器运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub history_window: usize,
    pub apology_message: String,
    pub guard: GuardLimits,
    pub release_timeout: Duration,
    /// 过期会话清理阈值
    pub session_max_age: Duration,
    pub preserve_completed: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            history_window: config.conversation.history_window,
            apology_message: config.conversation.apology_message.clone(),
            guard: config.guard.limits(),
            release_timeout: config.resources.release_timeout(),
            session_max_age: config.persistence.max_age(),
            preserve_completed: config.persistence.preserve_completed,
        }
    }
}

/// 被拒绝的动作及原因
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedAction {
    pub action: TurnAction,
    pub error: String,
}

/// 一轮对话的结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// 本轮执行的 Agent
    pub agent: String,
    /// 回复内容；失败时为兜底回复
    pub content: String,
    pub failed: bool,
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub run_id: Option<String>,
    pub applied_actions: Vec<TurnAction>,
    pub rejected_actions: Vec<RejectedAction>,
    /// 下一轮将接手的 Agent（已请求交接时）
    pub next_agent: Option<String>,
    pub phase: ConversationPhase,
    pub status: ConversationStatus,
    pub progress: Progress,
}

/// 每轮在工作流步骤间传递的上下文
#[derive(Debug, Default)]
struct TurnContext {
    selected: Option<String>,
    prompt: String,
    reply: Option<AgentReply>,
}

#[derive(Debug, Clone)]
struct SessionInfo {
    session_id: String,
    user_id: String,
    entry_agent: Option<String>,
    current_agent: Option<String>,
    pending_agent: Option<String>,
    status: ConversationStatus,
    completion_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn new_session_id() -> String {
    format!("conv_{}", uuid::Uuid::new_v4())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ConversationOrchestrator {
    session: Mutex<SessionInfo>,
    participants: RwLock<Vec<ConversationParticipant>>,
    variables: SharedVariableStore,
    history: Mutex<ConversationHistory>,
    /// 同时作为轮次锁
    engine: tokio::sync::Mutex<WorkflowEngine<TurnContext>>,
    selector: Box<dyn AgentSelector>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    supervisor: Arc<SessionSupervisor>,
    resources: ResourceLifecycleManager,
    options: OrchestratorOptions,
}

impl ConversationOrchestrator {
    pub fn new(user_id: impl Into<String>, options: OrchestratorOptions) -> Self {
        let user_id = user_id.into();
        let supervisor = Arc::new(SessionSupervisor::new());
        let resources = ResourceLifecycleManager::with_timeout("conversation", options.release_timeout);
        if let Err(e) = resources.add_immediate(supervisor.clone()) {
            tracing::warn!("Failed to register session supervisor: {}", e);
        }
        let now = now_ms();
        Self {
            session: Mutex::new(SessionInfo {
                session_id: new_session_id(),
                user_id: user_id.clone(),
                entry_agent: None,
                current_agent: None,
                pending_agent: None,
                status: ConversationStatus::Active,
                completion_reason: None,
                created_at: now,
                updated_at: now,
            }),
            participants: RwLock::new(Vec::new()),
            variables: SharedVariableStore::new(),
            history: Mutex::new(ConversationHistory::new()),
            engine: tokio::sync::Mutex::new(WorkflowEngine::new("conversation", user_id)),
            selector: Box::new(StickySelector),
            persistence: None,
            supervisor,
            resources,
            options,
        }
    }

    /// 按配置构建（含持久化后端）
    pub fn from_config(config: &AppConfig, user_id: impl Into<String>) -> anyhow::Result<Self> {
        let mut orchestrator = Self::new(user_id, OrchestratorOptions::from_config(config));
        if let Some(adapter) = config.persistence.build_adapter()? {
            orchestrator = orchestrator.with_persistence(adapter);
        }
        Ok(orchestrator)
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session.get_mut().session_id = session_id.into();
        self
    }

    pub fn with_selector(mut self, selector: impl AgentSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn with_persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }

    // ---- 注册与配置 ----

    /// 注册参与者；首个注册者成为入口与当前 Agent
    pub fn register_agent(&mut self, mut participant: ConversationParticipant) -> Result<()> {
        let name = participant.name.trim().to_string();
        if name.is_empty() {
            return Err(OrchestrationError::Validation(
                "agent name must not be blank".to_string(),
            ));
        }
        let participants = self.participants.get_mut();
        if participants.iter().any(|p| p.name == name) {
            return Err(OrchestrationError::Validation(format!(
                "agent '{name}' is already registered"
            )));
        }

        participant.name = name.clone();
        let agent = participant.agent.clone();
        participants.push(participant);

        let step_owner = name.clone();
        self.engine.get_mut().register_step(
            name.clone(),
            agent,
            move |turn: &TurnContext| {
                (turn.selected.as_deref() == Some(step_owner.as_str())).then(|| turn.prompt.clone())
            },
            |turn: &mut TurnContext, reply: &AgentReply| turn.reply = Some(reply.clone()),
        );

        let session = self.session.get_mut();
        if session.current_agent.is_none() {
            session.current_agent = Some(name.clone());
        }
        if session.entry_agent.is_none() {
            session.entry_agent = Some(name.clone());
        }
        tracing::info!(agent = %name, "Agent registered");
        Ok(())
    }

    /// 指定入口 Agent 并立即设为当前 Agent
    pub fn set_entry_agent(&self, name: &str) -> Result<()> {
        if self.find_participant(name).is_none() {
            return Err(OrchestrationError::not_found("Agent", name));
        }
        let mut s = self.session.lock();
        if s.status.is_terminal() {
            return Err(OrchestrationError::InvalidTransition(
                "conversation is completed".to_string(),
            ));
        }
        s.entry_agent = Some(name.to_string());
        s.current_agent = Some(name.to_string());
        s.pending_agent = None;
        Ok(())
    }

    /// 声明共享变量
    pub fn configure_variable(
        &self,
        name: &str,
        owner: &str,
        description: &str,
        required: bool,
        default_value: Option<Value>,
    ) -> Result<()> {
        self.variables
            .configure(name, owner, description, required, default_value)
    }

    pub fn variables(&self) -> &SharedVariableStore {
        &self.variables
    }

    /// 登记由会话负责释放的资源（连接等）
    pub fn add_resource(&self, resource: Arc<dyn Resource>) -> Result<()> {
        self.resources.add(resource)
    }

    pub fn set_participant_active(&self, name: &str, active: bool) -> Result<()> {
        let mut participants = self.participants.write();
        let participant = participants
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| OrchestrationError::not_found("Agent", name))?;
        participant.active = active;
        tracing::info!(agent = %name, active, "Participant activity changed");
        Ok(())
    }

    // ---- 查询 ----

    pub fn session_id(&self) -> String {
        self.session.lock().session_id.clone()
    }

    pub fn user_id(&self) -> String {
        self.session.lock().user_id.clone()
    }

    pub fn current_agent(&self) -> Option<String> {
        self.session.lock().current_agent.clone()
    }

    pub fn pending_agent(&self) -> Option<String> {
        self.session.lock().pending_agent.clone()
    }

    pub fn status(&self) -> ConversationStatus {
        self.session.lock().status
    }

    pub fn phase(&self) -> ConversationPhase {
        let s = self.session.lock();
        ConversationPhase::derive(s.status, s.current_agent.as_deref(), s.pending_agent.as_deref())
    }

    pub fn progress(&self) -> Progress {
        self.variables.progress()
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().messages().to_vec()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants.read().iter().map(|p| p.info()).collect()
    }

    fn find_participant(&self, name: &str) -> Option<ParticipantInfo> {
        self.participants
            .read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.info())
    }

    pub fn snapshot(&self) -> ConversationState {
        let s = self.session.lock().clone();
        ConversationState {
            session_id: s.session_id,
            user_id: s.user_id,
            variables: self.variables.all(),
            message_history: self.history(),
            current_agent: s.current_agent,
            pending_agent: s.pending_agent,
            available_agents: self.participants.read().iter().map(|p| p.name.clone()).collect(),
            progress: self.variables.progress(),
            status: s.status,
            completion_reason: s.completion_reason,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }

    /// 当前工作流会话（含每轮的 Run 与累计 token 用量）
    pub async fn workflow_session(&self) -> WorkflowSession {
        self.engine.lock().await.session().clone()
    }

    /// 审计记录；未配置持久化时为空
    pub async fn audit_trail(&self, variable: Option<&str>) -> Result<Vec<AuditEntry>> {
        match &self.persistence {
            Some(adapter) => adapter.get_audit(&self.session_id(), variable).await,
            None => Ok(Vec::new()),
        }
    }

    // ---- 轮次 ----

    /// 处理一条用户消息
    ///
    /// 终态、无参与者、空消息与已关闭返回错误；Agent 执行中的错误不会返回 Err，
    /// 而是记录后以 `failed = true` 的兜底回复返回。
    pub async fn process_message(&self, user_message: &str) -> Result<TurnOutcome> {
        if self.resources.is_closed() {
            return Err(OrchestrationError::AlreadyClosed);
        }
        let mut engine = self.engine.lock().await;

        if self.status().is_terminal() {
            return Err(OrchestrationError::InvalidTransition(
                "conversation is completed".to_string(),
            ));
        }
        let roster = self.participants();
        if roster.is_empty() {
            return Err(OrchestrationError::not_found("Agent", "any participant"));
        }
        if user_message.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "user message must not be blank".to_string(),
            ));
        }

        self.resume_if_idle();

        // 挂起的交接与选择器改选都只在本轮成功后提交
        let pending = self.pending_agent();
        let effective = pending.clone().or_else(|| self.current_agent());
        let selected = self
            .selector
            .select(&SelectionInput {
                current: effective.as_deref(),
                participants: &roster,
                user_message,
            })
            .ok_or_else(|| OrchestrationError::not_found("Agent", "active participant"))?;

        self.history.lock().push(Message::user(user_message));
        let prompt = {
            let history = self.history.lock();
            AgentContext::build(
                &selected,
                user_message,
                &self.variables,
                &history,
                &roster,
                self.options.history_window,
            )
            .render_prompt()
        };
        self.variables.set_current_actor(&selected);

        let exec = ExecutionContext::with_cancel(self.options.guard, self.supervisor.begin_turn());
        tracing::info!(
            session_id = %self.session_id(),
            agent = %selected,
            execution_id = %exec.execution_id(),
            "Processing turn"
        );
        let mut turn = TurnContext {
            selected: Some(selected.clone()),
            prompt,
            reply: None,
        };
        let result = engine.execute(&mut turn, &exec).await;
        self.supervisor.end_turn();

        let outcome = match result {
            Ok(run) => match turn.reply.take() {
                Some(reply) => {
                    self.commit_selection(pending.as_deref(), effective.as_deref(), &selected)
                        .await;
                    self.commit_turn(&selected, &run, reply).await
                }
                None => self.fail_turn(
                    &selected,
                    Some(run.run_id.clone()),
                    OrchestrationError::Agent(format!("agent '{selected}' produced no reply")),
                ),
            },
            Err(e) => {
                let run_id = engine.session().last_run().map(|r| r.run_id.clone());
                self.fail_turn(&selected, run_id, e)
            }
        };
        self.variables.clear_current_actor();
        self.persist().await;
        drop(engine);
        Ok(outcome)
    }

    /// 取消正在进行的轮次；返回是否有轮次被取消。之后的轮次不受影响
    pub fn cancel_current_turn(&self) -> bool {
        let cancelled = self.supervisor.cancel_turn();
        if cancelled {
            tracing::info!(session_id = %self.session_id(), "Current turn cancelled");
        }
        cancelled
    }

    /// Paused / Error 状态下收到新消息时恢复为 Active
    fn resume_if_idle(&self) {
        let mut s = self.session.lock();
        if matches!(s.status, ConversationStatus::Paused | ConversationStatus::Error) {
            tracing::info!(session_id = %s.session_id, from = ?s.status, "Conversation resumed");
            s.status = ConversationStatus::Active;
        }
    }

    /// 本轮成功：挂起的交接生效，选择器改选的 Agent 成为当前 Agent
    async fn commit_selection(&self, pending: Option<&str>, effective: Option<&str>, selected: &str) {
        if let Some(next) = pending {
            let mut s = self.session.lock();
            tracing::info!(
                session_id = %s.session_id,
                from = ?s.current_agent,
                to = %next,
                "Pending transition applied"
            );
            s.current_agent = Some(next.to_string());
            if s.pending_agent.as_deref() == Some(next) {
                s.pending_agent = None;
            }
        }
        match effective {
            Some(from) if from != selected => {
                let reason = format!("selected by {} selector", self.selector.name());
                self.handoff(from, selected, &reason).await;
            }
            Some(_) => {}
            None => self.session.lock().current_agent = Some(selected.to_string()),
        }
    }

    async fn commit_turn(&self, agent: &str, run: &WorkflowRun, reply: AgentReply) -> TurnOutcome {
        self.history.lock().push(
            Message::agent(agent, reply.content.clone())
                .with_metadata("run_id", Value::from(run.run_id.clone()))
                .with_metadata("tokens", Value::from(reply.usage.total())),
        );
        if let Some(p) = self.participants.write().iter_mut().find(|p| p.name == agent) {
            p.record_turn();
        }

        let mut applied = Vec::new();
        let mut rejected = Vec::new();
        for action in reply.actions {
            match self.apply_action(&action).await {
                Ok(()) => applied.push(action),
                Err(e) => {
                    tracing::warn!(
                        agent = %agent,
                        action = action.kind(),
                        "Action rejected: {}",
                        e
                    );
                    rejected.push(RejectedAction {
                        action,
                        error: e.to_string(),
                    });
                }
            }
        }
        self.touch();

        self.finish_outcome(TurnOutcome {
            agent: agent.to_string(),
            content: reply.content,
            failed: false,
            error: None,
            usage: reply.usage,
            run_id: Some(run.run_id.clone()),
            applied_actions: applied,
            rejected_actions: rejected,
            next_agent: None,
            phase: ConversationPhase::NoActiveAgent,
            status: ConversationStatus::Active,
            progress: Progress::default(),
        })
    }

    async fn apply_action(&self, action: &TurnAction) -> Result<()> {
        match action {
            TurnAction::SetVariable {
                name,
                value,
                confidence,
            } => {
                let change = self.variables.write(name, value.clone(), *confidence)?;
                self.save_audit(AuditEntry::variable_changed(self.session_id(), name, &change))
                    .await;
                Ok(())
            }
            TurnAction::TransitionTo { agent, reason } => self.transition_to(agent, reason).await,
            TurnAction::Complete { reason } => self.complete_conversation(reason).await,
        }
    }

    fn fail_turn(&self, agent: &str, run_id: Option<String>, error: OrchestrationError) -> TurnOutcome {
        tracing::error!(
            session_id = %self.session_id(),
            agent = %agent,
            fatal = error.is_fatal(),
            "Turn failed: {}",
            error
        );
        let apology = self.options.apology_message.clone();
        self.history.lock().push(
            Message::system(apology.clone())
                .with_metadata("error", Value::from(error.to_string()))
                .with_metadata("agent", Value::from(agent)),
        );
        self.touch();

        self.finish_outcome(TurnOutcome {
            agent: agent.to_string(),
            content: apology,
            failed: true,
            error: Some(error.to_string()),
            usage: TokenUsage::default(),
            run_id,
            applied_actions: Vec::new(),
            rejected_actions: Vec::new(),
            next_agent: None,
            phase: ConversationPhase::NoActiveAgent,
            status: ConversationStatus::Active,
            progress: Progress::default(),
        })
    }

    fn finish_outcome(&self, mut outcome: TurnOutcome) -> TurnOutcome {
        let s = self.session.lock();
        outcome.next_agent = s.pending_agent.clone();
        outcome.status = s.status;
        outcome.phase =
            ConversationPhase::derive(s.status, s.current_agent.as_deref(), s.pending_agent.as_deref());
        drop(s);
        outcome.progress = self.variables.progress();
        outcome
    }

    // ---- 状态转换 ----

    /// 请求交接给 target，下一轮开始时生效
    ///
    /// 未注册返回 NotFound；目标即当前 Agent、目标未激活、会话已结束返回 InvalidTransition。
    pub async fn transition_to(&self, target: &str, reason: &str) -> Result<()> {
        let info = self
            .find_participant(target)
            .ok_or_else(|| OrchestrationError::not_found("Agent", target))?;
        let from = {
            let mut s = self.session.lock();
            if s.status.is_terminal() {
                return Err(OrchestrationError::InvalidTransition(
                    "conversation is completed".to_string(),
                ));
            }
            if s.current_agent.as_deref() == Some(target) {
                return Err(OrchestrationError::InvalidTransition(format!(
                    "'{target}' is already the active agent"
                )));
            }
            if !info.active {
                return Err(OrchestrationError::InvalidTransition(format!(
                    "agent '{target}' is not active"
                )));
            }
            s.pending_agent = Some(target.to_string());
            s.updated_at = now_ms();
            s.current_agent.clone().unwrap_or_default()
        };
        self.record_transition(&from, target, reason).await;
        self.persist().await;
        Ok(())
    }

    /// 立即交接（选择器改选）
    async fn handoff(&self, from: &str, to: &str, reason: &str) {
        {
            let mut s = self.session.lock();
            s.current_agent = Some(to.to_string());
            s.pending_agent = None;
            s.updated_at = now_ms();
        }
        self.record_transition(from, to, reason).await;
    }

    async fn record_transition(&self, from: &str, to: &str, reason: &str) {
        let message_count = {
            let mut history = self.history.lock();
            history.push(Message::handoff(from, to, reason));
            history.len()
        };
        let session_id = self.session_id();
        tracing::info!(session_id = %session_id, from = %from, to = %to, reason = %reason, "Agent transition");
        let entry = AuditEntry::new(
            session_id,
            from,
            AuditKind::Transition {
                from_agent: (!from.is_empty()).then(|| from.to_string()),
                to_agent: to.to_string(),
                reason: reason.to_string(),
                progress: self.variables.progress(),
                message_count,
            },
        );
        self.save_audit(entry).await;
    }

    /// 结束会话（终态）
    pub async fn complete_conversation(&self, reason: &str) -> Result<()> {
        let (session_id, by) = {
            let mut s = self.session.lock();
            if s.status.is_terminal() {
                return Err(OrchestrationError::InvalidTransition(
                    "conversation is already completed".to_string(),
                ));
            }
            s.status = ConversationStatus::Completed;
            s.pending_agent = None;
            s.completion_reason = Some(reason.to_string());
            s.updated_at = now_ms();
            (
                s.session_id.clone(),
                s.current_agent.clone().unwrap_or_else(|| "system".to_string()),
            )
        };

        let text = if reason.is_empty() {
            "Conversation completed".to_string()
        } else {
            format!("Conversation completed: {reason}")
        };
        self.history.lock().push(Message::system(text));
        tracing::info!(session_id = %session_id, by = %by, reason = %reason, "Conversation completed");

        self.save_audit(AuditEntry::new(
            session_id.clone(),
            by,
            AuditKind::Completed {
                reason: reason.to_string(),
            },
        ))
        .await;
        self.persist().await;
        if let Some(adapter) = &self.persistence {
            let reason = (!reason.is_empty()).then_some(reason);
            if let Err(e) = adapter.mark_complete(&session_id, reason).await {
                tracing::warn!(session_id = %session_id, "mark_complete failed: {}", e);
            }
        }
        Ok(())
    }

    /// 手动设置状态；终态只能再转为 Archived
    pub async fn set_status(&self, status: ConversationStatus) -> Result<()> {
        {
            let mut s = self.session.lock();
            if s.status.is_terminal() && status != s.status && status != ConversationStatus::Archived {
                return Err(OrchestrationError::InvalidTransition(format!(
                    "cannot move a {:?} conversation to {:?}",
                    s.status, status
                )));
            }
            if status.is_terminal() {
                s.pending_agent = None;
            }
            tracing::info!(session_id = %s.session_id, from = ?s.status, to = ?status, "Conversation status changed");
            s.status = status;
            s.updated_at = now_ms();
        }
        self.persist().await;
        Ok(())
    }

    // ---- 恢复 / 重置 / 关闭 ----

    /// 用快照替换会话状态；快照中的当前 / 待交接 Agent 必须已注册
    pub async fn restore(&self, state: ConversationState) -> Result<()> {
        let _turn = self.engine.lock().await;
        for name in [state.current_agent.as_deref(), state.pending_agent.as_deref()]
            .into_iter()
            .flatten()
        {
            if self.find_participant(name).is_none() {
                return Err(OrchestrationError::not_found("Agent", name));
            }
        }

        let message_count = state.message_history.len();
        self.variables.replace_all(state.variables);
        self.history.lock().replace(state.message_history);
        let mut s = self.session.lock();
        s.session_id = state.session_id;
        s.user_id = state.user_id;
        s.current_agent = state.current_agent;
        s.pending_agent = state.pending_agent;
        s.status = state.status;
        s.completion_reason = state.completion_reason;
        s.created_at = state.created_at;
        s.updated_at = state.updated_at;
        tracing::info!(session_id = %s.session_id, messages = message_count, "Conversation restored");
        Ok(())
    }

    /// 从持久化加载并恢复；返回是否找到
    pub async fn load_from_persistence(&self, session_id: &str) -> Result<bool> {
        let Some(adapter) = &self.persistence else {
            return Ok(false);
        };
        match adapter.load_conversation_state(session_id).await? {
            Some(state) => {
                self.restore(state).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 开始新会话：新的工作流会话，变量值与历史清空，回到入口 Agent；返回新 session_id
    pub async fn reset_session(&self) -> String {
        let mut engine = self.engine.lock().await;
        engine.create_new_session();
        self.variables.reset_values();
        self.variables.clear_current_actor();
        self.history.lock().clear();

        let session_id = new_session_id();
        let now = now_ms();
        let mut s = self.session.lock();
        s.session_id = session_id.clone();
        s.current_agent = s.entry_agent.clone();
        s.pending_agent = None;
        s.status = ConversationStatus::Active;
        s.completion_reason = None;
        s.created_at = now;
        s.updated_at = now;
        tracing::info!(session_id = %session_id, "Conversation session reset");
        session_id
    }

    /// 释放会话资源（逆序）；之后的 process_message 返回 AlreadyClosed
    pub async fn shutdown(&self) -> ReleaseReport {
        let report = self.resources.release_all().await;
        tracing::info!(
            session_id = %self.session_id(),
            released = report.outcomes.len(),
            clean = report.is_clean(),
            "Conversation shut down"
        );
        report
    }

    /// 按配置的阈值清理持久化中过期的会话；未配置持久化时返回 0
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let Some(adapter) = &self.persistence else {
            return Ok(0);
        };
        let removed = adapter
            .cleanup_expired(self.options.session_max_age, self.options.preserve_completed)
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Expired conversations cleaned up");
        }
        Ok(removed)
    }

    // ---- 尽力而为的持久化 ----

    fn touch(&self) {
        self.session.lock().updated_at = now_ms();
    }

    async fn persist(&self) {
        let Some(adapter) = &self.persistence else {
            return;
        };
        let state = self.snapshot();
        if let Err(e) = adapter.save_conversation_state(&state).await {
            tracing::warn!(session_id = %state.session_id, "Failed to persist conversation: {}", e);
        }
    }

    async fn save_audit(&self, entry: AuditEntry) {
        let Some(adapter) = &self.persistence else {
            return;
        };
        if let Err(e) = adapter.save_audit(&entry).await {
            tracing::warn!(session_id = %entry.session_id, "Failed to save audit entry: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::conversation::persistence::InMemoryPersistence;
    use crate::conversation::selector::KeywordSelector;
    use crate::core::LimitKind;
    use async_trait::async_trait;
    use serde_json::json;

    /// 按脚本依次返回回复的 Agent
    struct Scripted {
        name: String,
        replies: Mutex<Vec<Result<AgentReply>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(name: &str, replies: Vec<Result<AgentReply>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                name: name.into(),
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, prompt: &str, _ctx: &ExecutionContext) -> Result<AgentReply> {
            self.prompts.lock().push(prompt.to_string());
            self.replies
                .lock()
                .pop()
                .unwrap_or_else(|| Ok(AgentReply::text(format!("{} here", self.name))))
        }
    }

    fn orchestrator(agents: &[Arc<Scripted>]) -> ConversationOrchestrator {
        let mut orch = ConversationOrchestrator::new("u1", OrchestratorOptions::default())
            .with_persistence(Arc::new(InMemoryPersistence::new()));
        for agent in agents {
            orch.register_agent(ConversationParticipant::new(agent.clone()))
                .unwrap();
        }
        orch
    }

    #[tokio::test]
    async fn test_first_registered_agent_is_current() {
        let orch = orchestrator(&[Scripted::new("Sales", vec![]), Scripted::new("Support", vec![])]);
        assert_eq!(orch.current_agent().as_deref(), Some("Sales"));
        assert_eq!(orch.phase(), ConversationPhase::AgentActive);
        orch.set_entry_agent("Support").unwrap();
        assert_eq!(orch.current_agent().as_deref(), Some("Support"));
        assert!(orch.set_entry_agent("Nobody").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut orch = orchestrator(&[Scripted::new("Sales", vec![])]);
        let err = orch
            .register_agent(ConversationParticipant::new(Scripted::new("Sales", vec![])))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
        assert_eq!(orch.participants().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_roster_is_not_found() {
        let orch = ConversationOrchestrator::new("u1", OrchestratorOptions::default());
        assert_eq!(orch.phase(), ConversationPhase::NoActiveAgent);
        assert!(matches!(
            orch.process_message("hello").await,
            Err(OrchestrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_turn_applies_actions_and_pending_transition() {
        let sales = Scripted::new(
            "Sales",
            vec![Ok(AgentReply::text("Thanks, passing you on.")
                .with_action(TurnAction::SetVariable {
                    name: "email".into(),
                    value: json!("a@b.com"),
                    confidence: 0.9,
                })
                .with_action(TurnAction::TransitionTo {
                    agent: "Support".into(),
                    reason: "technical question".into(),
                })
                .with_usage(TokenUsage::new(12, 3)))],
        );
        let support = Scripted::new("Support", vec![Ok(AgentReply::text("Let's fix it."))]);
        let orch = orchestrator(&[sales.clone(), support.clone()]);
        orch.configure_variable("email", "Sales", "Customer email", true, None)
            .unwrap();

        let outcome = orch.process_message("my email is a@b.com").await.unwrap();
        assert!(!outcome.failed);
        assert_eq!(outcome.agent, "Sales");
        assert_eq!(outcome.applied_actions.len(), 2);
        assert_eq!(outcome.next_agent.as_deref(), Some("Support"));
        assert_eq!(outcome.phase, ConversationPhase::TransitionPending);
        assert!(outcome.progress.is_complete);
        assert_eq!(orch.variables().read("email").unwrap(), Some(json!("a@b.com")));
        assert_eq!(orch.current_agent().as_deref(), Some("Sales"));

        let second = orch.process_message("the app crashes").await.unwrap();
        assert_eq!(second.agent, "Support");
        assert_eq!(orch.current_agent().as_deref(), Some("Support"));
        assert!(support.prompts.lock()[0].contains("email = a@b.com"));

        let audit = orch.audit_trail(Some("email")).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].modified_by, "Sales");

        let session = orch.workflow_session().await;
        assert_eq!(session.run_count(), 2);
        assert_eq!(session.aggregate_token_usage, TokenUsage::new(12, 3));
        let skipped: Vec<_> = session.runs[0].skipped_steps().map(|s| s.name.clone()).collect();
        assert_eq!(skipped, vec!["Support"]);
    }

    #[tokio::test]
    async fn test_ownership_violation_is_rejected_but_turn_succeeds() {
        let support = Scripted::new(
            "Support",
            vec![Ok(AgentReply::text("noted").with_action(TurnAction::SetVariable {
                name: "email".into(),
                value: json!("x@y.z"),
                confidence: 1.0,
            }))],
        );
        let orch = orchestrator(&[support, Scripted::new("Sales", vec![])]);
        orch.configure_variable("email", "Sales", "Customer email", true, None)
            .unwrap();

        let outcome = orch.process_message("hi").await.unwrap();
        assert!(!outcome.failed);
        assert_eq!(outcome.rejected_actions.len(), 1);
        assert!(outcome.rejected_actions[0].error.contains("owned by"));
        assert_eq!(orch.variables().read("email").unwrap(), None);
        assert!(orch.audit_trail(Some("email")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_turn_returns_apology_without_side_effects() {
        let flaky = Scripted::new(
            "Sales",
            vec![Err(OrchestrationError::LimitExceeded {
                limit: LimitKind::ModelCalls,
                max: 1,
                execution_id: "x".into(),
            })],
        );
        let orch = orchestrator(&[flaky]);
        let outcome = orch.process_message("hello").await.unwrap();
        assert!(outcome.failed);
        assert_eq!(outcome.content, OrchestratorOptions::default().apology_message);
        assert!(outcome.error.unwrap().contains("model calls"));

        let history = orch.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].message_type, crate::memory::MessageType::System);
        assert!(history[1].metadata.contains_key("error"));
        assert_eq!(orch.participants()[0].message_count, 0);

        let next = orch.process_message("again").await.unwrap();
        assert!(!next.failed);
        assert_eq!(orch.participants()[0].message_count, 1);
    }

    #[tokio::test]
    async fn test_transition_rules() {
        let orch = orchestrator(&[Scripted::new("Sales", vec![]), Scripted::new("Support", vec![])]);
        assert!(matches!(
            orch.transition_to("Billing", "x").await,
            Err(OrchestrationError::NotFound { .. })
        ));
        assert!(matches!(
            orch.transition_to("Sales", "x").await,
            Err(OrchestrationError::InvalidTransition(_))
        ));
        orch.set_participant_active("Support", false).unwrap();
        assert!(matches!(
            orch.transition_to("Support", "x").await,
            Err(OrchestrationError::InvalidTransition(_))
        ));
        orch.set_participant_active("Support", true).unwrap();
        orch.transition_to("Support", "x").await.unwrap();
        assert_eq!(orch.phase(), ConversationPhase::TransitionPending);
        let handoffs = orch
            .history()
            .iter()
            .filter(|m| m.message_type == crate::memory::MessageType::Handoff)
            .count();
        assert_eq!(handoffs, 1);

        orch.complete_conversation("done").await.unwrap();
        assert_eq!(orch.phase(), ConversationPhase::Completed);
        assert!(orch.pending_agent().is_none());
        assert!(matches!(
            orch.transition_to("Support", "x").await,
            Err(OrchestrationError::InvalidTransition(_))
        ));
        assert!(matches!(
            orch.process_message("still there?").await,
            Err(OrchestrationError::InvalidTransition(_))
        ));
        assert!(orch.complete_conversation("again").await.is_err());
    }

    #[tokio::test]
    async fn test_keyword_selector_hands_off_immediately() {
        let sales = Scripted::new("Sales", vec![]);
        let support = Scripted::new("Support", vec![]);
        let mut orch = ConversationOrchestrator::new("u1", OrchestratorOptions::default())
            .with_selector(KeywordSelector::new().unwrap());
        orch.register_agent(ConversationParticipant::new(sales).with_expertise(["pricing"]))
            .unwrap();
        orch.register_agent(ConversationParticipant::new(support.clone()).with_expertise(["crash"]))
            .unwrap();

        let outcome = orch.process_message("the app keeps going crash").await.unwrap();
        assert_eq!(outcome.agent, "Support");
        let handoffs = orch
            .history()
            .iter()
            .filter(|m| m.message_type == crate::memory::MessageType::Handoff)
            .count();
        assert_eq!(handoffs, 1);
    }

    fn kinds(orch: &ConversationOrchestrator) -> Vec<crate::memory::MessageType> {
        orch.history().iter().map(|m| m.message_type).collect()
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_agent_after_keyword_selection() {
        use crate::memory::MessageType as M;

        let sales = Scripted::new("Sales", vec![]);
        let support = Scripted::new("Support", vec![Err(OrchestrationError::Agent("boom".into()))]);
        let mut orch = ConversationOrchestrator::new("u1", OrchestratorOptions::default())
            .with_selector(KeywordSelector::new().unwrap())
            .with_persistence(Arc::new(InMemoryPersistence::new()));
        orch.register_agent(ConversationParticipant::new(sales).with_expertise(["pricing"]))
            .unwrap();
        orch.register_agent(ConversationParticipant::new(support).with_expertise(["crash"]))
            .unwrap();

        let outcome = orch.process_message("app crash").await.unwrap();
        assert!(outcome.failed);
        assert_eq!(outcome.agent, "Support");
        assert_eq!(orch.current_agent().as_deref(), Some("Sales"));
        assert_eq!(kinds(&orch), vec![M::User, M::System]);
        assert!(orch.audit_trail(None).await.unwrap().is_empty());

        let retry = orch.process_message("app crash").await.unwrap();
        assert!(!retry.failed);
        assert_eq!(orch.current_agent().as_deref(), Some("Support"));
        assert_eq!(
            kinds(&orch),
            vec![M::User, M::System, M::User, M::Handoff, M::Agent]
        );
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_pending_transition() {
        let sales = Scripted::new("Sales", vec![]);
        let support = Scripted::new("Support", vec![Err(OrchestrationError::Agent("down".into()))]);
        let orch = orchestrator(&[sales, support]);
        orch.transition_to("Support", "billing question").await.unwrap();

        let outcome = orch.process_message("hi").await.unwrap();
        assert!(outcome.failed);
        assert_eq!(outcome.agent, "Support");
        assert_eq!(outcome.next_agent.as_deref(), Some("Support"));
        assert_eq!(orch.current_agent().as_deref(), Some("Sales"));
        assert_eq!(orch.phase(), ConversationPhase::TransitionPending);

        let next = orch.process_message("hi again").await.unwrap();
        assert!(!next.failed);
        assert_eq!(orch.current_agent().as_deref(), Some("Support"));
        assert_eq!(orch.pending_agent(), None);
    }

    #[tokio::test]
    async fn test_snapshot_restore_and_reset() {
        let orch = orchestrator(&[Scripted::new("Sales", vec![]), Scripted::new("Support", vec![])]);
        orch.configure_variable("notes", "any", "", false, None).unwrap();
        orch.process_message("hi").await.unwrap();
        orch.transition_to("Support", "because").await.unwrap();
        let snapshot = orch.snapshot();
        let old_id = snapshot.session_id.clone();

        let new_id = orch.reset_session().await;
        assert_ne!(new_id, old_id);
        assert!(orch.history().is_empty());
        assert_eq!(orch.current_agent().as_deref(), Some("Sales"));
        assert_eq!(orch.workflow_session().await.run_count(), 0);

        assert!(orch.load_from_persistence(&old_id).await.unwrap());
        assert_eq!(orch.session_id(), old_id);
        assert_eq!(orch.history().len(), snapshot.message_history.len());
        assert_eq!(orch.pending_agent().as_deref(), Some("Support"));
        assert!(!orch.load_from_persistence("conv_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_status_rules() {
        let orch = orchestrator(&[Scripted::new("Sales", vec![])]);
        orch.set_status(ConversationStatus::Paused).await.unwrap();
        orch.process_message("back").await.unwrap();
        assert_eq!(orch.status(), ConversationStatus::Active);

        orch.set_status(ConversationStatus::Abandoned).await.unwrap();
        assert!(orch.set_status(ConversationStatus::Active).await.is_err());
        orch.set_status(ConversationStatus::Archived).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_conversation() {
        let orch = orchestrator(&[Scripted::new("Sales", vec![])]);
        let report = orch.shutdown().await;
        assert_eq!(report.order(), vec!["session-supervisor"]);
        assert!(matches!(
            orch.process_message("hi").await,
            Err(OrchestrationError::AlreadyClosed)
        ));
        assert!(orch.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_sessions_keeps_live_one() {
        let adapter = Arc::new(InMemoryPersistence::new());
        let mut stale = ConversationState::new("conv_stale", "u1");
        stale.updated_at -= 30 * 24 * 3600 * 1000;
        adapter.save_conversation_state(&stale).await.unwrap();

        let mut orch = ConversationOrchestrator::new("u1", OrchestratorOptions::default())
            .with_persistence(adapter.clone());
        orch.register_agent(ConversationParticipant::new(Scripted::new("Sales", vec![])))
            .unwrap();
        orch.process_message("hi").await.unwrap();

        assert_eq!(orch.cleanup_expired_sessions().await.unwrap(), 1);
        assert_eq!(adapter.session_count(), 1);
        assert!(adapter
            .load_conversation_state(&orch.session_id())
            .await
            .unwrap()
            .is_some());
    }
}
