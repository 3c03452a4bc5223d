//! 工作流构建器
//!
//! 提供流畅的 API 来构建工作流引擎

use std::sync::Arc;

use crate::agent::{Agent, AgentReply};
use crate::core::{OrchestrationError, Result};
use crate::workflow::engine::{WorkflowEngine, WorkflowStep};

/// 工作流构建器
pub struct WorkflowBuilder<C> {
    name: String,
    description: Option<String>,
    user_id: String,
    session_id: Option<String>,
    steps: Vec<WorkflowStep<C>>,
}

impl<C: Send> WorkflowBuilder<C> {
    /// 创建新的工作流构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            user_id: String::new(),
            session_id: None,
            steps: Vec::new(),
        }
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 设置用户ID
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// 指定首个会话的ID（默认随机生成）
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 添加步骤
    pub fn step<I, O>(
        mut self,
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        input: I,
        output: O,
    ) -> Self
    where
        I: Fn(&C) -> Option<String> + Send + Sync + 'static,
        O: Fn(&mut C, &AgentReply) + Send + Sync + 'static,
    {
        self.steps
            .push(WorkflowStep::new(name, agent, Box::new(input), Box::new(output)));
        self
    }

    /// 构建工作流引擎
    pub fn build(self) -> Result<WorkflowEngine<C>> {
        if self.name.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "workflow name is required".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(OrchestrationError::Validation(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        Ok(WorkflowEngine::from_parts(
            self.name,
            self.description,
            self.steps,
            self.user_id,
            self.session_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionContext;
    use async_trait::async_trait;

    struct Upper;

    #[async_trait]
    impl Agent for Upper {
        fn name(&self) -> &str {
            "Upper"
        }

        async fn run(&self, prompt: &str, _ctx: &ExecutionContext) -> Result<AgentReply> {
            Ok(AgentReply::text(prompt.to_uppercase()))
        }
    }

    #[test]
    fn test_build_simple_workflow() {
        let engine = WorkflowBuilder::<String>::new("Test Workflow")
            .description("A test workflow")
            .user_id("user1")
            .session_id("sess-fixed")
            .step(
                "shout",
                Arc::new(Upper),
                |c: &String| Some(c.clone()),
                |c: &mut String, r: &AgentReply| *c = r.content.clone(),
            )
            .build()
            .expect("Failed to build workflow");

        assert_eq!(engine.name(), "Test Workflow");
        assert_eq!(engine.description(), Some("A test workflow"));
        assert_eq!(engine.step_count(), 1);
        assert_eq!(engine.session().session_id, "sess-fixed");
        assert_eq!(engine.session().user_id, "user1");
        assert!(engine.id().starts_with("wf_"));
    }

    #[test]
    fn test_build_without_steps_fails() {
        let result = WorkflowBuilder::<String>::new("Test").build();
        assert!(matches!(result, Err(OrchestrationError::Validation(_))));
    }
}
