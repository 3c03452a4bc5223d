//! 工作流类型定义
//!
//! Run：一次 execute 的完整步骤序列（只能结束一次，结束后不可变）；
//! Session：跨多次 Run 的持久容器，持有共享状态与累计 token 用量。

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestrationError, Result};
use crate::llm::TokenUsage;

pub type WorkflowId = String;
pub type RunId = String;

/// Run 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// 单个步骤在一次 Run 中的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// 已执行，输出已应用
    Completed,
    /// 跳过（输入为空）
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub state: StepState,
}

/// 一次工作流执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub session_id: String,
    /// 第一个实际执行的步骤收到的输入
    pub input: Option<String>,
    /// 最后一个实际执行的步骤的输出
    pub result: Option<String>,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub per_step_token_usage: BTreeMap<usize, TokenUsage>,
    pub total_token_usage: TokenUsage,
    pub steps: Vec<StepRecord>,
    pub error_message: Option<String>,
}

impl WorkflowRun {
    pub fn start(session_id: impl Into<String>) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            input: None,
            result: None,
            status: RunStatus::Running,
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: None,
            per_step_token_usage: BTreeMap::new(),
            total_token_usage: TokenUsage::default(),
            steps: Vec::new(),
            error_message: None,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(OrchestrationError::Validation(format!(
                "run {} is already {:?}",
                self.run_id, self.status
            )));
        }
        Ok(())
    }

    /// 记录某步骤的 token 用量（同一步骤多次上报时累加），同时计入 Run 总量
    pub fn add_step_token_usage(&mut self, step_index: usize, usage: TokenUsage) -> Result<()> {
        self.ensure_running()?;
        *self.per_step_token_usage.entry(step_index).or_default() += usage;
        self.total_token_usage += usage;
        Ok(())
    }

    pub fn record_step(&mut self, index: usize, name: &str, state: StepState) -> Result<()> {
        self.ensure_running()?;
        self.steps.push(StepRecord {
            index,
            name: name.to_string(),
            state,
        });
        Ok(())
    }

    fn finalize(&mut self, status: RunStatus) -> Result<()> {
        self.ensure_running()?;
        self.status = status;
        self.end_time = Some(chrono::Utc::now().timestamp_millis());
        Ok(())
    }

    pub fn complete(&mut self, result: Option<String>) -> Result<()> {
        self.finalize(RunStatus::Completed)?;
        self.result = result;
        Ok(())
    }

    pub fn fail(&mut self, error_message: impl Into<String>) -> Result<()> {
        self.finalize(RunStatus::Failed)?;
        self.error_message = Some(error_message.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.finalize(RunStatus::Cancelled)
    }

    /// 结束时间 - 开始时间（毫秒）；未结束时为 None
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn skipped_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.state == StepState::Skipped)
    }
}

/// 工作流会话：跨多次 Run 保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_id: WorkflowId,
    pub user_id: String,
    pub state_map: HashMap<String, Value>,
    pub runs: Vec<WorkflowRun>,
    pub created_at: i64,
    pub updated_at: i64,
    pub aggregate_token_usage: TokenUsage,
}

impl WorkflowSession {
    pub fn new(workflow_id: impl Into<WorkflowId>, user_id: impl Into<String>) -> Self {
        Self::with_id(
            format!("sess_{}", uuid::Uuid::new_v4()),
            workflow_id,
            user_id,
        )
    }

    pub fn with_id(
        session_id: impl Into<String>,
        workflow_id: impl Into<WorkflowId>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            state_map: HashMap::new(),
            runs: Vec::new(),
            created_at: now,
            updated_at: now,
            aggregate_token_usage: TokenUsage::default(),
        }
    }

    /// 追加已结束的 Run，并把其用量计入会话累计
    pub fn record_run(&mut self, run: WorkflowRun) -> Result<()> {
        if !run.status.is_terminal() {
            return Err(OrchestrationError::Validation(format!(
                "run {} has not been finalized",
                run.run_id
            )));
        }
        self.aggregate_token_usage += run.total_token_usage;
        self.runs.push(run);
        self.touch();
        Ok(())
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state_map.insert(key.into(), value);
        self.touch();
    }

    pub fn state(&self, key: &str) -> Option<&Value> {
        self.state_map.get(key)
    }

    pub fn last_run(&self) -> Option<&WorkflowRun> {
        self.runs.last()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
