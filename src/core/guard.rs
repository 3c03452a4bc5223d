//! 执行守卫：单次逻辑执行内的调用次数、递归深度、子执行次数上限
//!
//! 不是进程级单例：每次执行创建自己的 ExecutionGuard，经 ExecutionContext 显式向下传递
//! （Agent::run / Tool::execute / WorkflowEngine::execute）。计数器为原子量，
//! 同一执行内的嵌套调用可共享同一个守卫。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::error::{LimitKind, OrchestrationError, Result};

/// 三个独立上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardLimits {
    pub max_calls: usize,
    pub max_recursion_depth: usize,
    pub max_sub_executions: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_calls: 50,
            max_recursion_depth: 4,
            max_sub_executions: 16,
        }
    }
}

/// 单次执行的守卫
#[derive(Debug)]
pub struct ExecutionGuard {
    execution_id: String,
    limits: GuardLimits,
    calls: AtomicUsize,
    depth: AtomicUsize,
    sub_executions: AtomicUsize,
}

impl ExecutionGuard {
    pub fn new(execution_id: impl Into<String>, limits: GuardLimits) -> Self {
        Self {
            execution_id: execution_id.into(),
            limits,
            calls: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            sub_executions: AtomicUsize::new(0),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn limits(&self) -> GuardLimits {
        self.limits
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn sub_executions(&self) -> usize {
        self.sub_executions.load(Ordering::SeqCst)
    }

    /// 记录一次模型调用；第 max_calls+1 次失败
    pub fn record_call(&self) -> Result<usize> {
        self.bump(&self.calls, self.limits.max_calls, LimitKind::ModelCalls)
    }

    /// 进入一层递归，返回新深度
    pub fn enter_recursion(&self) -> Result<usize> {
        self.bump(
            &self.depth,
            self.limits.max_recursion_depth,
            LimitKind::RecursionDepth,
        )
    }

    /// 退出一层递归；深度为 0 时保持 0
    pub fn exit_recursion(&self) -> usize {
        match self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn record_sub_execution(&self) -> Result<usize> {
        self.bump(
            &self.sub_executions,
            self.limits.max_sub_executions,
            LimitKind::SubExecutions,
        )
    }

    /// 进入递归并返回作用域，作用域 drop 时自动退出
    pub fn descend(self: &Arc<Self>) -> Result<RecursionScope> {
        self.enter_recursion()?;
        Ok(RecursionScope {
            guard: Arc::clone(self),
        })
    }

    // 先检查后递增：超限时计数不变
    fn bump(&self, counter: &AtomicUsize, max: usize, limit: LimitKind) -> Result<usize> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                if c < max {
                    Some(c + 1)
                } else {
                    None
                }
            })
            .map(|prev| prev + 1)
            .map_err(|_| {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    limit = %limit,
                    max,
                    "Execution guard tripped"
                );
                OrchestrationError::LimitExceeded {
                    limit,
                    max,
                    execution_id: self.execution_id.clone(),
                }
            })
    }
}

/// 递归作用域：drop 时退出一层
#[derive(Debug)]
pub struct RecursionScope {
    guard: Arc<ExecutionGuard>,
}

impl RecursionScope {
    pub fn depth(&self) -> usize {
        self.guard.depth()
    }
}

impl Drop for RecursionScope {
    fn drop(&mut self) {
        self.guard.exit_recursion();
    }
}

/// 显式传递的执行上下文：守卫 + 取消信号
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub guard: Arc<ExecutionGuard>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// 新的根执行（随机 id）
    pub fn new(limits: GuardLimits) -> Self {
        Self::with_cancel(limits, CancellationToken::new())
    }

    pub fn with_cancel(limits: GuardLimits, cancel: CancellationToken) -> Self {
        let id = format!("exec_{}", uuid::Uuid::new_v4());
        Self {
            guard: Arc::new(ExecutionGuard::new(id, limits)),
            cancel,
        }
    }

    pub fn execution_id(&self) -> &str {
        self.guard.execution_id()
    }

    /// 子执行：在共享守卫上记一次子执行，取消令牌为子令牌
    pub fn child(&self) -> Result<Self> {
        self.guard.record_sub_execution()?;
        Ok(Self {
            guard: Arc::clone(&self.guard),
            cancel: self.cancel.child_token(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(OrchestrationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
