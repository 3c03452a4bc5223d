//! Agent 运行时
//!
//! Agent 是编排的最小执行单元：接收一段 prompt 与显式的 ExecutionContext，返回回复、
//! 本轮请求的副作用（TurnAction）与 token 用量。LlmAgent 在模型与工具之间循环，
//! 每次模型调用都记到守卫上；控制工具（set_variable / transition_to / complete_conversation）
//! 不在这里执行，而是转为 TurnAction 交给编排器在本轮成功后统一提交。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ExecutionContext, OrchestrationError, Result};
use crate::llm::{ChatMessage, ModelClient, ModelConfig, TokenUsage, ToolCall, ToolSpec};
use crate::tools::ToolExecutor;

pub const SET_VARIABLE_TOOL: &str = "set_variable";
pub const TRANSITION_TOOL: &str = "transition_to";
pub const COMPLETE_TOOL: &str = "complete_conversation";

/// Agent 请求的副作用，由编排器在本轮成功后按顺序提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TurnAction {
    SetVariable {
        name: String,
        value: Value,
        confidence: f64,
    },
    TransitionTo {
        agent: String,
        reason: String,
    },
    Complete {
        reason: String,
    },
}

impl TurnAction {
    /// 将控制工具调用解析为动作；非控制工具返回 None
    pub fn from_tool_call(call: &ToolCall) -> Option<std::result::Result<Self, String>> {
        let args = &call.arguments;
        let str_arg = |key: &str| args.get(key).and_then(|v| v.as_str()).map(String::from);
        let parsed = match call.name.as_str() {
            SET_VARIABLE_TOOL => match (str_arg("name"), args.get("value")) {
                (Some(name), Some(value)) => Ok(TurnAction::SetVariable {
                    name,
                    value: value.clone(),
                    confidence: args
                        .get("confidence")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(1.0),
                }),
                _ => Err("set_variable requires 'name' and 'value'".to_string()),
            },
            TRANSITION_TOOL => match str_arg("agent") {
                Some(agent) => Ok(TurnAction::TransitionTo {
                    agent,
                    reason: str_arg("reason").unwrap_or_default(),
                }),
                None => Err("transition_to requires 'agent'".to_string()),
            },
            COMPLETE_TOOL => Ok(TurnAction::Complete {
                reason: str_arg("reason").unwrap_or_default(),
            }),
            _ => return None,
        };
        Some(parsed)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TurnAction::SetVariable { .. } => SET_VARIABLE_TOOL,
            TurnAction::TransitionTo { .. } => TRANSITION_TOOL,
            TurnAction::Complete { .. } => COMPLETE_TOOL,
        }
    }

    /// 回给模型的工具结果：动作只是排队，本轮成功后才由编排器校验并提交
    pub fn acknowledgement(&self) -> String {
        match self {
            TurnAction::SetVariable { name, .. } => format!(
                "queued: '{name}' is written after this turn, only if you own it or it is unowned"
            ),
            TurnAction::TransitionTo { agent, .. } => format!(
                "queued: transition to '{agent}' is applied after this turn if the route is allowed"
            ),
            TurnAction::Complete { .. } => {
                "queued: conversation is marked complete after this turn".to_string()
            }
        }
    }
}

/// 控制工具的描述（发给模型）
pub fn control_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: SET_VARIABLE_TOOL.to_string(),
            description: "Record a value for a shared conversation variable you own.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "value": {},
                    "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                },
                "required": ["name", "value"]
            }),
        },
        ToolSpec {
            name: TRANSITION_TOOL.to_string(),
            description: "Hand the conversation over to another agent from the roster.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "agent": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["agent"]
            }),
        },
        ToolSpec {
            name: COMPLETE_TOOL.to_string(),
            description: "Finish the conversation.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "reason": {"type": "string"} },
                "required": []
            }),
        },
    ]
}

/// Agent 一次运行的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentReply {
    pub content: String,
    pub actions: Vec<TurnAction>,
    pub usage: TokenUsage,
}

impl AgentReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: TurnAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Agent trait：名称 + 异步运行
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, prompt: &str, ctx: &ExecutionContext) -> Result<AgentReply>;
}

/// 包装一次模型调用的 Agent：模型 ↔ 工具循环，直到模型不再请求工具
pub struct LlmAgent {
    name: String,
    description: String,
    system_prompt: String,
    model: Arc<dyn ModelClient>,
    config: ModelConfig,
    tools: Option<Arc<ToolExecutor>>,
    control_tools: bool,
}

impl LlmAgent {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelClient>) -> Self {
        let name = name.into();
        Self {
            system_prompt: format!("You are {name}, a helpful assistant."),
            description: String::new(),
            name,
            model,
            config: ModelConfig::default(),
            tools: None,
            control_tools: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// 不向模型暴露控制工具（纯工作流步骤）
    pub fn without_control_tools(mut self) -> Self {
        self.control_tools = false;
        self
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = if self.control_tools {
            control_tool_specs()
        } else {
            Vec::new()
        };
        if let Some(tools) = &self.tools {
            specs.extend(tools.specs());
        }
        specs
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        reply: &mut AgentReply,
        ctx: &ExecutionContext,
    ) -> Result<String> {
        if self.control_tools {
            if let Some(parsed) = TurnAction::from_tool_call(call) {
                return Ok(match parsed {
                    Ok(action) => {
                        let ack = action.acknowledgement();
                        reply.actions.push(action);
                        ack
                    }
                    Err(msg) => format!("error: {msg}"),
                });
            }
        }
        let Some(tools) = &self.tools else {
            return Ok(format!("error: unknown tool '{}'", call.name));
        };
        match tools.execute(&call.name, call.arguments.clone(), ctx).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::debug!(agent = %self.name, tool = %call.name, "Tool call failed: {}", e);
                Ok(format!("error: {e}"))
            }
        }
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, prompt: &str, ctx: &ExecutionContext) -> Result<AgentReply> {
        let specs = self.tool_specs();
        let tools = (!specs.is_empty()).then_some(specs.as_slice());
        let mut messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(prompt),
        ];
        let mut reply = AgentReply::default();

        loop {
            ctx.check_cancelled()?;
            ctx.guard.record_call()?;

            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                r = self.model.invoke(&messages, tools, &self.config) => r?,
            };
            reply.usage += response.usage;

            if response.tool_calls.is_empty() {
                reply.content = response.content;
                return Ok(reply);
            }

            messages.push(ChatMessage::assistant_with_calls(
                response.content,
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let output = self.dispatch(call, &mut reply, ctx).await?;
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }
    }
}
