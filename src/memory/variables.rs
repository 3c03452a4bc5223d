//! 共享变量存储：带归属约束与变更审计的命名槽位
//!
//! 每个变量声明一个 owner（具体 Agent 名或通配 "any"）。所有写入走同一条路径：
//! 校验当前写入者 → 追加 Change → 置 collected。读取不受限制。
//! 当前写入者（ambient actor）属于本存储实例（一个会话一个存储），不是线程全局状态。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestrationError, Result};

/// 通配 owner：任何 Agent 都可写
pub const ANY_OWNER: &str = "any";

/// 默认的变更来源
pub const SOURCE_AGENT: &str = "agent";

/// 一次变更记录（只追加，不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub updated_by: String,
    pub updated_at: i64,
    pub confidence: f64,
    pub source: String,
}

/// 共享变量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub owner_id: String,
    pub description: String,
    pub required: bool,
    pub default_value: Option<Value>,
    pub current_value: Option<Value>,
    /// 与 history 非空等价
    pub collected: bool,
    pub confidence: f64,
    pub captured_by: Option<String>,
    pub captured_at: Option<i64>,
    pub history: Vec<Change>,
}

impl Variable {
    fn declare(
        name: String,
        owner_id: String,
        description: String,
        required: bool,
        default_value: Option<Value>,
    ) -> Self {
        Self {
            name,
            owner_id,
            description,
            required,
            default_value,
            current_value: None,
            collected: false,
            confidence: 0.0,
            captured_by: None,
            captured_at: None,
            history: Vec::new(),
        }
    }

    /// actor 是否有权写入
    pub fn writable_by(&self, actor: &str) -> bool {
        self.owner_id == ANY_OWNER || self.owner_id == actor
    }

    /// 已采集值，否则默认值
    pub fn effective_value(&self) -> Option<&Value> {
        self.current_value.as_ref().or(self.default_value.as_ref())
    }

    fn reset_value(&mut self) {
        self.current_value = None;
        self.collected = false;
        self.confidence = 0.0;
        self.captured_by = None;
        self.captured_at = None;
        self.history.clear();
    }
}

/// 采集进度（派生值，按需计算）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub filled: usize,
    pub required: usize,
    pub required_filled: usize,
    /// 0-100
    pub completion_pct: f64,
    /// 0-100
    pub required_completion_pct: f64,
    pub is_complete: bool,
}

impl Progress {
    pub fn compute<'a>(variables: impl IntoIterator<Item = &'a Variable>) -> Self {
        let (mut total, mut filled, mut required, mut required_filled) = (0, 0, 0, 0);
        for v in variables {
            total += 1;
            if v.collected {
                filled += 1;
            }
            if v.required {
                required += 1;
                if v.collected {
                    required_filled += 1;
                }
            }
        }
        Self {
            total,
            filled,
            required,
            required_filled,
            completion_pct: pct(filled, total),
            required_completion_pct: pct(required_filled, required),
            is_complete: required_filled == required,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::compute(std::iter::empty())
    }
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        100.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// 带归属约束的共享变量存储（按声明顺序保存）
#[derive(Debug, Default)]
pub struct SharedVariableStore {
    variables: RwLock<Vec<Variable>>,
    current_actor: Mutex<Option<String>>,
}

impl SharedVariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明（或覆盖）一个变量；覆盖会清空已采集的值与历史
    pub fn configure(
        &self,
        name: &str,
        owner: &str,
        description: &str,
        required: bool,
        default_value: Option<Value>,
    ) -> Result<()> {
        let name = name.trim();
        let owner = owner.trim();
        if name.is_empty() {
            return Err(OrchestrationError::Validation(
                "variable name must not be blank".to_string(),
            ));
        }
        if owner.is_empty() {
            return Err(OrchestrationError::Validation(format!(
                "owner of variable '{name}' must not be blank"
            )));
        }

        let declared = Variable::declare(
            name.to_string(),
            owner.to_string(),
            description.to_string(),
            required,
            default_value,
        );
        let mut vars = self.variables.write();
        match vars.iter_mut().find(|v| v.name == name) {
            Some(existing) => *existing = declared,
            None => vars.push(declared),
        }
        Ok(())
    }

    /// 设置当前写入者（作用于本存储实例）
    pub fn set_current_actor(&self, agent_name: &str) {
        *self.current_actor.lock() = Some(agent_name.to_string());
    }

    pub fn clear_current_actor(&self) {
        *self.current_actor.lock() = None;
    }

    pub fn current_actor(&self) -> Option<String> {
        self.current_actor.lock().clone()
    }

    /// 以当前写入者身份写入
    pub fn write(&self, name: &str, value: Value, confidence: f64) -> Result<Change> {
        let actor = self.current_actor().unwrap_or_default();
        self.write_as(&actor, name, value, confidence, SOURCE_AGENT)
    }

    /// 唯一的写入路径：校验归属 → 追加 Change → 置 collected；失败时不做任何修改
    pub fn write_as(
        &self,
        actor: &str,
        name: &str,
        value: Value,
        confidence: f64,
        source: &str,
    ) -> Result<Change> {
        let mut vars = self.variables.write();
        let var = vars
            .iter_mut()
            .find(|v| v.name == name)
            .ok_or_else(|| OrchestrationError::not_found("Variable", name))?;

        if !var.writable_by(actor) {
            return Err(OrchestrationError::Ownership {
                variable: name.to_string(),
                owner: var.owner_id.clone(),
                actor: actor.to_string(),
            });
        }

        let confidence = clamp_confidence(confidence);
        let now = chrono::Utc::now().timestamp_millis();
        let change = Change {
            old_value: var.current_value.clone(),
            new_value: value.clone(),
            updated_by: actor.to_string(),
            updated_at: now,
            confidence,
            source: source.to_string(),
        };
        var.history.push(change.clone());
        var.current_value = Some(value);
        var.collected = true;
        var.confidence = confidence;
        var.captured_by = Some(actor.to_string());
        var.captured_at = Some(now);
        Ok(change)
    }

    /// 读取：未声明返回 NotFound，已声明未采集返回 Ok(None)
    pub fn read(&self, name: &str) -> Result<Option<Value>> {
        let vars = self.variables.read();
        let var = vars
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| OrchestrationError::not_found("Variable", name))?;
        Ok(var.current_value.clone())
    }

    /// 已采集值，否则默认值
    pub fn value_or_default(&self, name: &str) -> Result<Option<Value>> {
        let vars = self.variables.read();
        let var = vars
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| OrchestrationError::not_found("Variable", name))?;
        Ok(var.effective_value().cloned())
    }

    pub fn get(&self, name: &str) -> Option<Variable> {
        self.variables.read().iter().find(|v| v.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.read().iter().any(|v| v.name == name)
    }

    pub fn history(&self, name: &str) -> Result<Vec<Change>> {
        self.get(name)
            .map(|v| v.history)
            .ok_or_else(|| OrchestrationError::not_found("Variable", name))
    }

    pub fn all(&self) -> Vec<Variable> {
        self.variables.read().clone()
    }

    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filter(&self, pred: impl Fn(&Variable) -> bool) -> Vec<Variable> {
        self.variables
            .read()
            .iter()
            .filter(|v| pred(v))
            .cloned()
            .collect()
    }

    /// agent 可写且尚未采集的变量
    pub fn missing_for(&self, agent_name: &str) -> Vec<Variable> {
        self.filter(|v| !v.collected && v.writable_by(agent_name))
    }

    /// 明确归属于 agent 的变量（不含 "any"）
    pub fn owned_by(&self, agent_name: &str) -> Vec<Variable> {
        self.filter(|v| v.owner_id == agent_name)
    }

    pub fn filled(&self) -> Vec<Variable> {
        self.filter(|v| v.collected)
    }

    /// 其他 Agent 已采集的变量
    pub fn filled_by_others(&self, agent_name: &str) -> Vec<Variable> {
        self.filter(|v| v.collected && v.captured_by.as_deref() != Some(agent_name))
    }

    pub fn progress(&self) -> Progress {
        Progress::compute(self.variables.read().iter())
    }

    /// 保留声明，清空所有值与历史
    pub fn reset_values(&self) {
        for v in self.variables.write().iter_mut() {
            v.reset_value();
        }
    }

    pub fn clear(&self) {
        self.variables.write().clear();
    }

    /// 整体替换（会话恢复）；collected 以 history 为准
    pub fn replace_all(&self, variables: Vec<Variable>) {
        let variables = variables
            .into_iter()
            .map(|mut v| {
                v.collected = !v.history.is_empty();
                v
            })
            .collect();
        *self.variables.write() = variables;
    }
}
