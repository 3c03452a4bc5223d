//! 会话持久化与审计
//!
//! PersistenceAdapter 抽象会话快照与审计记录的存取；编排器对它的调用都是尽力而为
//! （失败只记日志，不影响内存中的会话）。提供两个实现：
//! - InMemoryPersistence：进程内 HashMap
//! - JsonFilePersistence：每个会话一个 `<session>.json` 与一个 `<session>.audit.json`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::state::{ConversationState, ConversationStatus};
use crate::core::{OrchestrationError, Result};
use crate::memory::{Change, Progress};

/// 审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub session_id: String,
    pub modified_at: i64,
    pub modified_by: String,
    pub kind: AuditKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditKind {
    VariableChanged {
        variable_name: String,
        old_value: Option<Value>,
        new_value: Value,
        confidence: f64,
        source: String,
    },
    Transition {
        from_agent: Option<String>,
        to_agent: String,
        reason: String,
        progress: Progress,
        message_count: usize,
    },
    Completed {
        reason: String,
    },
}

impl AuditEntry {
    pub fn new(session_id: impl Into<String>, modified_by: impl Into<String>, kind: AuditKind) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            modified_at: chrono::Utc::now().timestamp_millis(),
            modified_by: modified_by.into(),
            kind,
        }
    }

    /// 由变量的一次 Change 生成
    pub fn variable_changed(session_id: impl Into<String>, variable_name: &str, change: &Change) -> Self {
        let mut entry = Self::new(
            session_id,
            change.updated_by.clone(),
            AuditKind::VariableChanged {
                variable_name: variable_name.to_string(),
                old_value: change.old_value.clone(),
                new_value: change.new_value.clone(),
                confidence: change.confidence,
                source: change.source.clone(),
            },
        );
        entry.modified_at = change.updated_at;
        entry
    }

    pub fn variable_name(&self) -> Option<&str> {
        match &self.kind {
            AuditKind::VariableChanged { variable_name, .. } => Some(variable_name),
            _ => None,
        }
    }
}

fn filter_audit(entries: &[AuditEntry], variable: Option<&str>) -> Vec<AuditEntry> {
    let mut out: Vec<AuditEntry> = entries
        .iter()
        .filter(|e| variable.map_or(true, |name| e.variable_name() == Some(name)))
        .cloned()
        .collect();
    out.sort_by_key(|e| e.modified_at);
    out
}

fn is_expired(state: &ConversationState, now: i64, max_age: Duration, preserve_completed: bool) -> bool {
    if preserve_completed
        && matches!(state.status, ConversationStatus::Completed | ConversationStatus::Archived)
    {
        return false;
    }
    // 在 u128 上比较；updated_at 晚于 now 视为刚更新
    let age_ms = u128::try_from(now.saturating_sub(state.updated_at)).unwrap_or(0);
    age_ms > max_age.as_millis()
}

/// 持久化适配器
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn load_conversation_state(&self, session_id: &str) -> Result<Option<ConversationState>>;

    async fn save_conversation_state(&self, state: &ConversationState) -> Result<()>;

    async fn save_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// 按 modified_at 排序；variable 为 Some 时只返回该变量的变更
    async fn get_audit(&self, session_id: &str, variable: Option<&str>) -> Result<Vec<AuditEntry>>;

    async fn mark_complete(&self, session_id: &str, reason: Option<&str>) -> Result<()>;

    /// 删除超过 max_age 未更新的会话（连同审计记录），返回删除数量
    ///
    /// preserve_completed 为 true 时保留 Completed 与 Archived 会话；Abandoned 照常清理。
    async fn cleanup_expired(&self, max_age: Duration, preserve_completed: bool) -> Result<usize>;
}

/// 进程内持久化
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    states: Mutex<HashMap<String, ConversationState>>,
    audit: Mutex<HashMap<String, Vec<AuditEntry>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.states.lock().len()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn load_conversation_state(&self, session_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.states.lock().get(session_id).cloned())
    }

    async fn save_conversation_state(&self, state: &ConversationState) -> Result<()> {
        self.states
            .lock()
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn save_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.audit
            .lock()
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn get_audit(&self, session_id: &str, variable: Option<&str>) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.lock();
        Ok(audit
            .get(session_id)
            .map(|entries| filter_audit(entries, variable))
            .unwrap_or_default())
    }

    async fn mark_complete(&self, session_id: &str, reason: Option<&str>) -> Result<()> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(session_id)
            .ok_or_else(|| OrchestrationError::not_found("Session", session_id))?;
        state.status = ConversationStatus::Completed;
        if let Some(reason) = reason {
            state.completion_reason = Some(reason.to_string());
        }
        state.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }

    async fn cleanup_expired(&self, max_age: Duration, preserve_completed: bool) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut states = self.states.lock();
        let expired: Vec<String> = states
            .values()
            .filter(|s| is_expired(s, now, max_age, preserve_completed))
            .map(|s| s.session_id.clone())
            .collect();
        let mut audit = self.audit.lock();
        for id in &expired {
            states.remove(id);
            audit.remove(id);
        }
        Ok(expired.len())
    }
}

const STATE_SUFFIX: &str = ".json";
const AUDIT_SUFFIX: &str = ".audit.json";

/// JSON 文件持久化（tokio::fs）
#[derive(Debug)]
pub struct JsonFilePersistence {
    dir: PathBuf,
    /// 审计文件是读-改-写，串行化同一进程内的写入
    write_lock: tokio::sync::Mutex<()>,
}

fn io_err(action: &str, path: &Path, e: impl std::fmt::Display) -> OrchestrationError {
    OrchestrationError::Persistence(format!("{action} {}: {e}", path.display()))
}

impl JsonFilePersistence {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// session_id 用作文件名，只允许字母数字与 `-` `_`
    fn file_path(&self, session_id: &str, suffix: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(OrchestrationError::Validation(format!(
                "session id '{session_id}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{session_id}{suffix}")))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| io_err("parse", path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("read", path, e)),
        }
    }

    /// 先写临时文件再 rename
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create", parent, e))?;
        }
        let data = serde_json::to_string_pretty(value).map_err(|e| io_err("serialize", path, e))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_err("write", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_err("rename", path, e))
    }

    async fn remove_if_exists(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", path, e)),
        }
    }
}

#[async_trait]
impl PersistenceAdapter for JsonFilePersistence {
    async fn load_conversation_state(&self, session_id: &str) -> Result<Option<ConversationState>> {
        let path = self.file_path(session_id, STATE_SUFFIX)?;
        Self::read_json(&path).await
    }

    async fn save_conversation_state(&self, state: &ConversationState) -> Result<()> {
        let path = self.file_path(&state.session_id, STATE_SUFFIX)?;
        let _guard = self.write_lock.lock().await;
        Self::write_json(&path, state).await
    }

    async fn save_audit(&self, entry: &AuditEntry) -> Result<()> {
        let path = self.file_path(&entry.session_id, AUDIT_SUFFIX)?;
        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<AuditEntry> = Self::read_json(&path).await?.unwrap_or_default();
        entries.push(entry.clone());
        Self::write_json(&path, &entries).await
    }

    async fn get_audit(&self, session_id: &str, variable: Option<&str>) -> Result<Vec<AuditEntry>> {
        let path = self.file_path(session_id, AUDIT_SUFFIX)?;
        let entries: Vec<AuditEntry> = Self::read_json(&path).await?.unwrap_or_default();
        Ok(filter_audit(&entries, variable))
    }

    async fn mark_complete(&self, session_id: &str, reason: Option<&str>) -> Result<()> {
        let path = self.file_path(session_id, STATE_SUFFIX)?;
        let _guard = self.write_lock.lock().await;
        let mut state: ConversationState = Self::read_json(&path)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("Session", session_id))?;
        state.status = ConversationStatus::Completed;
        if let Some(reason) = reason {
            state.completion_reason = Some(reason.to_string());
        }
        state.updated_at = chrono::Utc::now().timestamp_millis();
        Self::write_json(&path, &state).await
    }

    async fn cleanup_expired(&self, max_age: Duration, preserve_completed: bool) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err("list", &self.dir, e)),
        };

        let now = chrono::Utc::now().timestamp_millis();
        let mut removed = 0;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| io_err("list", &self.dir, e))?
        {
            let path = item.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(STATE_SUFFIX) || file_name.ends_with(AUDIT_SUFFIX) {
                continue;
            }
            let state: ConversationState = match Self::read_json(&path).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable session file: {}", e);
                    continue;
                }
            };
            if !is_expired(&state, now, max_age, preserve_completed) {
                continue;
            }
            Self::remove_if_exists(&path).await?;
            Self::remove_if_exists(&self.file_path(&state.session_id, AUDIT_SUFFIX)?).await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "Expired conversations removed");
        }
        Ok(removed)
    }
}
