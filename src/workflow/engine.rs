//! 工作流引擎
//!
//! 按注册顺序依次执行步骤。每个步骤绑定一个 Agent、一个输入提取函数与一个输出应用函数：
//! 输入为空则跳过该步骤（输出函数不会被调用），否则运行 Agent 并把回复应用到上下文 C。
//! 每次 execute 打开一个 Run，结束后追加到当前 Session。

use std::sync::Arc;

use serde_json::Value;

use crate::agent::{Agent, AgentReply};
use crate::core::{ExecutionContext, OrchestrationError, Result};
use crate::workflow::types::*;

/// 从上下文提取本步骤输入；None 或空白表示跳过
pub type InputFn<C> = Box<dyn Fn(&C) -> Option<String> + Send + Sync>;

/// 把 Agent 回复应用到上下文
pub type OutputFn<C> = Box<dyn Fn(&mut C, &AgentReply) + Send + Sync>;

/// 工作流中的一个步骤
pub struct WorkflowStep<C> {
    pub name: String,
    pub agent: Arc<dyn Agent>,
    input: InputFn<C>,
    output: OutputFn<C>,
}

impl<C> WorkflowStep<C> {
    pub fn new(
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        input: InputFn<C>,
        output: OutputFn<C>,
    ) -> Self {
        Self {
            name: name.into(),
            agent,
            input,
            output,
        }
    }

    fn prompt(&self, context: &C) -> Option<String> {
        (self.input)(context).filter(|p| !p.trim().is_empty())
    }
}

/// 顺序步骤工作流引擎
pub struct WorkflowEngine<C> {
    id: WorkflowId,
    name: String,
    description: Option<String>,
    steps: Vec<WorkflowStep<C>>,
    session: WorkflowSession,
}

impl<C: Send> WorkflowEngine<C> {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>) -> Self {
        let id = format!("wf_{}", uuid::Uuid::new_v4());
        let session = WorkflowSession::new(id.clone(), user_id);
        Self {
            id,
            name: name.into(),
            description: None,
            steps: Vec::new(),
            session,
        }
    }

    pub(crate) fn from_parts(
        name: String,
        description: Option<String>,
        steps: Vec<WorkflowStep<C>>,
        user_id: String,
        session_id: Option<String>,
    ) -> Self {
        let id = format!("wf_{}", uuid::Uuid::new_v4());
        let session = match session_id {
            Some(sid) => WorkflowSession::with_id(sid, id.clone(), user_id),
            None => WorkflowSession::new(id.clone(), user_id),
        };
        Self {
            id,
            name,
            description,
            steps,
            session,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// 追加一个步骤（执行顺序即注册顺序）
    pub fn register_step<I, O>(
        &mut self,
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        input: I,
        output: O,
    ) where
        I: Fn(&C) -> Option<String> + Send + Sync + 'static,
        O: Fn(&mut C, &AgentReply) + Send + Sync + 'static,
    {
        self.steps
            .push(WorkflowStep::new(name, agent, Box::new(input), Box::new(output)));
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn session(&self) -> &WorkflowSession {
        &self.session
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.session.set_state(key, value);
    }

    pub fn state(&self, key: &str) -> Option<&Value> {
        self.session.state(key)
    }

    /// 保留步骤与配置，开始新会话；返回新 session_id
    pub fn create_new_session(&mut self) -> String {
        let user_id = self.session.user_id.clone();
        self.session = WorkflowSession::new(self.id.clone(), user_id);
        tracing::info!(
            workflow = %self.name,
            session_id = %self.session.session_id,
            "New workflow session created"
        );
        self.session.session_id.clone()
    }

    /// 执行一次完整步骤序列
    ///
    /// 成功返回已完成的 Run；步骤失败时 Run 记为 Failed 并返回该错误；
    /// 取消时 Run 记为 Cancelled、不应用未完成步骤的输出，返回 `Cancelled`。
    /// 无论结果如何，结束的 Run 都会追加到会话中。
    pub async fn execute(&mut self, context: &mut C, ctx: &ExecutionContext) -> Result<WorkflowRun> {
        let mut run = WorkflowRun::start(&self.session.session_id);
        tracing::info!(
            workflow = %self.name,
            run_id = %run.run_id,
            execution_id = %ctx.execution_id(),
            steps = self.steps.len(),
            "Workflow run started"
        );

        let outcome = Self::run_steps(&self.steps, context, ctx, &mut run).await;
        let result = match outcome {
            Ok(last_output) => {
                run.complete(last_output)?;
                tracing::info!(
                    workflow = %self.name,
                    run_id = %run.run_id,
                    tokens = run.total_token_usage.total(),
                    "Workflow run completed"
                );
                Ok(run.clone())
            }
            Err(OrchestrationError::Cancelled) => {
                run.cancel()?;
                tracing::warn!(workflow = %self.name, run_id = %run.run_id, "Workflow run cancelled");
                Err(OrchestrationError::Cancelled)
            }
            Err(e) => {
                run.fail(e.to_string())?;
                tracing::warn!(
                    workflow = %self.name,
                    run_id = %run.run_id,
                    "Workflow run failed: {}",
                    e
                );
                Err(e)
            }
        };
        self.session.record_run(run)?;
        result
    }

    /// 作为父执行的子执行运行：在父守卫上登记一次子执行（受上限约束）
    pub async fn execute_nested(
        &mut self,
        context: &mut C,
        parent: &ExecutionContext,
    ) -> Result<WorkflowRun> {
        let child = parent.child()?;
        self.execute(context, &child).await
    }

    async fn run_steps(
        steps: &[WorkflowStep<C>],
        context: &mut C,
        ctx: &ExecutionContext,
        run: &mut WorkflowRun,
    ) -> Result<Option<String>> {
        let mut last_output = None;
        for (index, step) in steps.iter().enumerate() {
            ctx.check_cancelled()?;

            let Some(prompt) = step.prompt(context) else {
                tracing::debug!(step = %step.name, "Step skipped, no input");
                run.record_step(index, &step.name, StepState::Skipped)?;
                continue;
            };
            if run.input.is_none() {
                run.input = Some(prompt.clone());
            }

            tracing::debug!(step = %step.name, agent = %step.agent.name(), "Executing step");
            let reply = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
                r = step.agent.run(&prompt, ctx) => r?,
            };

            run.add_step_token_usage(index, reply.usage)?;
            (step.output)(context, &reply);
            run.record_step(index, &step.name, StepState::Completed)?;
            last_output = Some(reply.content);
        }
        Ok(last_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GuardLimits, LimitKind};
    use crate::llm::TokenUsage;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        name: String,
        usage: TokenUsage,
    }

    #[async_trait]
    impl Agent for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, prompt: &str, _ctx: &ExecutionContext) -> Result<AgentReply> {
            Ok(AgentReply::text(format!("{}:{}", self.name, prompt)).with_usage(self.usage))
        }
    }

    struct Failing;

    #[async_trait]
    impl Agent for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        async fn run(&self, _prompt: &str, _ctx: &ExecutionContext) -> Result<AgentReply> {
            Err(OrchestrationError::Agent("model unavailable".into()))
        }
    }

    /// 永远不返回，直到被取消
    struct Hanging;

    #[async_trait]
    impl Agent for Hanging {
        fn name(&self) -> &str {
            "Hanging"
        }

        async fn run(&self, _prompt: &str, _ctx: &ExecutionContext) -> Result<AgentReply> {
            std::future::pending::<()>().await;
            Ok(AgentReply::default())
        }
    }

    fn fixed(name: &str, input: u64, output: u64) -> Arc<dyn Agent> {
        Arc::new(Fixed {
            name: name.into(),
            usage: TokenUsage::new(input, output),
        })
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(GuardLimits::default())
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_feed_context() {
        let mut engine: WorkflowEngine<Vec<String>> = WorkflowEngine::new("pipeline", "u1");
        engine.register_step(
            "draft",
            fixed("Writer", 1, 1),
            |_: &Vec<String>| Some("topic".to_string()),
            |c: &mut Vec<String>, r: &AgentReply| c.push(r.content.clone()),
        );
        engine.register_step(
            "review",
            fixed("Editor", 1, 1),
            |c: &Vec<String>| c.last().cloned(),
            |c: &mut Vec<String>, r: &AgentReply| c.push(r.content.clone()),
        );

        let mut context = Vec::new();
        let run = engine.execute(&mut context, &ctx()).await.unwrap();
        assert_eq!(context, vec!["Writer:topic", "Editor:Writer:topic"]);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.input.as_deref(), Some("topic"));
        assert_eq!(run.result.as_deref(), Some("Editor:Writer:topic"));
        assert_eq!(engine.step_names(), vec!["draft", "review"]);
    }

    #[tokio::test]
    async fn test_failed_step_marks_run_failed() {
        let mut engine: WorkflowEngine<u32> = WorkflowEngine::new("fragile", "u1");
        engine.register_step("a", fixed("A", 5, 5), |_: &u32| Some("go".into()), |c: &mut u32, _: &AgentReply| *c += 1);
        engine.register_step("b", Arc::new(Failing), |_: &u32| Some("go".into()), |c: &mut u32, _: &AgentReply| *c += 10);
        engine.register_step("c", fixed("C", 5, 5), |_: &u32| Some("go".into()), |c: &mut u32, _: &AgentReply| *c += 100);

        let mut counter = 0;
        let err = engine.execute(&mut counter, &ctx()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Agent(_)));
        assert_eq!(counter, 1);

        let run = engine.session().last_run().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.as_deref().unwrap().contains("model unavailable"));
        assert_eq!(engine.session().aggregate_token_usage, TokenUsage::new(5, 5));
    }

    #[tokio::test]
    async fn test_cancellation_marks_run_cancelled_without_output() {
        let mut engine: WorkflowEngine<u32> = WorkflowEngine::new("slow", "u1");
        engine.register_step("hang", Arc::new(Hanging), |_: &u32| Some("wait".into()), |c: &mut u32, _: &AgentReply| *c += 1);

        let cancel = CancellationToken::new();
        let exec = ExecutionContext::with_cancel(GuardLimits::default(), cancel.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut counter = 0;
        let err = engine.execute(&mut counter, &exec).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled));
        assert_eq!(counter, 0);
        assert_eq!(engine.session().last_run().unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_nested_execution_counts_against_parent() {
        let mut engine: WorkflowEngine<()> = WorkflowEngine::new("inner", "u1");
        engine.register_step("only", fixed("A", 0, 0), |_: &()| Some("x".into()), |_: &mut (), _: &AgentReply| {});

        let parent = ExecutionContext::new(GuardLimits {
            max_sub_executions: 2,
            ..GuardLimits::default()
        });
        engine.execute_nested(&mut (), &parent).await.unwrap();
        engine.execute_nested(&mut (), &parent).await.unwrap();
        let err = engine.execute_nested(&mut (), &parent).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::LimitExceeded {
                limit: LimitKind::SubExecutions,
                ..
            }
        ));
        assert_eq!(engine.session().run_count(), 2);
    }

    #[tokio::test]
    async fn test_new_session_keeps_steps() {
        let mut engine: WorkflowEngine<()> = WorkflowEngine::new("chat", "u1");
        engine.register_step("only", fixed("A", 2, 3), |_: &()| Some("x".into()), |_: &mut (), _: &AgentReply| {});
        engine.set_state("lang", Value::from("en"));
        engine.execute(&mut (), &ctx()).await.unwrap();
        let first = engine.session().session_id.clone();

        let second = engine.create_new_session();
        assert_ne!(first, second);
        assert_eq!(engine.session().run_count(), 0);
        assert!(engine.state("lang").is_none());
        assert!(engine.session().aggregate_token_usage.is_zero());
        assert_eq!(engine.step_count(), 1);

        engine.execute(&mut (), &ctx()).await.unwrap();
        assert_eq!(engine.session().aggregate_token_usage, TokenUsage::new(2, 3));
    }
}
