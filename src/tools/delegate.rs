//! 委派工具：把一个 Agent 包装成工具，供另一个 Agent 调用
//!
//! 每次委派进入一层递归（共享同一 ExecutionContext 的守卫），Agent 自调用或互相调用时
//! 由递归深度上限终止；守卫触发的错误原样向上传播。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::Agent;
use crate::core::{ExecutionContext, OrchestrationError};
use crate::tools::Tool;

pub struct DelegateTool {
    name: String,
    description: String,
    agent: Arc<dyn Agent>,
}

impl DelegateTool {
    /// 工具名为 `ask_<agent>`
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        let description = if agent.description().is_empty() {
            format!("Ask the {} agent and return its answer.", agent.name())
        } else {
            agent.description().to_string()
        };
        Self {
            name: format!("ask_{}", agent.name().to_lowercase()),
            description,
            agent,
        }
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "prompt": {"type": "string"} },
            "required": ["prompt"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestrationError> {
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestrationError::Tool("missing 'prompt'".to_string()))?;

        let scope = ctx.guard.descend()?;
        tracing::debug!(
            agent = %self.agent.name(),
            depth = scope.depth(),
            "Delegating to agent"
        );
        let reply = self.agent.run(prompt, ctx).await?;
        drop(scope);
        Ok(reply.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentReply;
    use crate::core::{GuardLimits, LimitKind};
    use std::sync::OnceLock;

    /// 总是再次委派给自己的 Agent
    struct SelfReferential {
        me: OnceLock<Arc<DelegateTool>>,
    }

    #[async_trait]
    impl Agent for SelfReferential {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn run(
            &self,
            prompt: &str,
            ctx: &ExecutionContext,
        ) -> crate::core::Result<AgentReply> {
            let me = self.me.get().expect("tool wired");
            let inner = me
                .execute(serde_json::json!({ "prompt": prompt }), ctx)
                .await?;
            Ok(AgentReply::text(inner))
        }
    }

    #[tokio::test]
    async fn test_self_recursion_is_bounded() {
        let agent = Arc::new(SelfReferential {
            me: OnceLock::new(),
        });
        let tool = Arc::new(DelegateTool::new(agent.clone()));
        assert!(agent.me.set(tool.clone()).is_ok());

        let ctx = ExecutionContext::new(GuardLimits {
            max_recursion_depth: 3,
            ..GuardLimits::default()
        });
        let err = tool
            .execute(serde_json::json!({"prompt": "loop"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::LimitExceeded {
                limit: LimitKind::RecursionDepth,
                max: 3,
                ..
            }
        ));
        assert_eq!(ctx.guard.depth(), 0);
    }

    struct Fixed;

    #[async_trait]
    impl Agent for Fixed {
        fn name(&self) -> &str {
            "Pricing"
        }

        async fn run(&self, _prompt: &str, ctx: &ExecutionContext) -> crate::core::Result<AgentReply> {
            Ok(AgentReply::text(format!("depth={}", ctx.guard.depth())))
        }
    }

    #[tokio::test]
    async fn test_delegation_returns_content() {
        let tool = DelegateTool::new(Arc::new(Fixed));
        assert_eq!(tool.name(), "ask_pricing");
        let ctx = ExecutionContext::new(GuardLimits::default());
        let out = tool
            .execute(serde_json::json!({"prompt": "price?"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, "depth=1");
        assert_eq!(ctx.guard.depth(), 0);
    }
}
