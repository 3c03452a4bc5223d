//! 工具执行器
//!
//! 持有 ToolRegistry 与统一超时，execute(tool_name, args, ctx) 在超时内调用 registry.execute，
//! 超时转为 OrchestrationError::Tool，工具自身的错误原样返回（守卫触发需向上传播）；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::config::ToolsSection;
use crate::core::{ExecutionContext, OrchestrationError};
use crate::llm::ToolSpec;
use crate::tools::ToolRegistry;

/// 工具执行器：对每次调用施加超时，并响应取消
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 超时取自 [tools] 配置段
    pub fn from_config(registry: ToolRegistry, config: &ToolsSection) -> Self {
        Self::new(registry, config.tool_timeout_secs)
    }

    /// 执行指定工具；输出 JSON 审计日志
    pub async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestrationError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            r = timeout(self.timeout, self.registry.execute(tool_name, args, ctx)) => r,
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "execution_id": ctx.execution_id(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestrationError::Tool(format!(
                "{tool_name}: timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
