//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__GUARD__MAX_CALLS=10`）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::conversation::persistence::{InMemoryPersistence, JsonFilePersistence, PersistenceAdapter};
use crate::core::GuardLimits;
use crate::llm::ModelConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub guard: GuardSection,
    pub resources: ResourcesSection,
    pub conversation: ConversationSection,
    pub persistence: PersistenceSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [guard] 段：单次执行的调用 / 递归 / 子执行上限
#[derive(Debug, Clone, Deserialize)]
pub struct GuardSection {
    #[serde(default = "default_max_calls")]
    pub max_calls: usize,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    #[serde(default = "default_max_sub_executions")]
    pub max_sub_executions: usize,
}

fn default_max_calls() -> usize {
    50
}

fn default_max_recursion_depth() -> usize {
    4
}

fn default_max_sub_executions() -> usize {
    16
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            max_recursion_depth: default_max_recursion_depth(),
            max_sub_executions: default_max_sub_executions(),
        }
    }
}

impl GuardSection {
    pub fn limits(&self) -> GuardLimits {
        GuardLimits {
            max_calls: self.max_calls,
            max_recursion_depth: self.max_recursion_depth,
            max_sub_executions: self.max_sub_executions,
        }
    }
}

/// [resources] 段：同步释放路径的等待上限
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesSection {
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
}

fn default_release_timeout_ms() -> u64 {
    5000
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            release_timeout_ms: default_release_timeout_ms(),
        }
    }
}

impl ResourcesSection {
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

/// [conversation] 段：上下文窗口与失败兜底回复
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSection {
    /// 构建 Agent 上下文时带入的最近消息条数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_apology_message")]
    pub apology_message: String,
}

fn default_history_window() -> usize {
    20
}

fn default_apology_message() -> String {
    "Sorry, something went wrong while handling your message. Please try again.".to_string()
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            apology_message: default_apology_message(),
        }
    }
}

/// 持久化后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Json,
    None,
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default)]
    pub backend: PersistenceBackend,
    /// json 后端的存储目录
    #[serde(default = "default_persistence_dir")]
    pub directory: PathBuf,
    /// 过期清理阈值（秒）
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// 清理时保留已完成的会话
    #[serde(default = "default_preserve_completed")]
    pub preserve_completed: bool,
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from("data/conversations")
}

fn default_max_age_secs() -> u64 {
    7 * 24 * 3600
}

fn default_preserve_completed() -> bool {
    true
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            directory: default_persistence_dir(),
            max_age_secs: default_max_age_secs(),
            preserve_completed: default_preserve_completed(),
        }
    }
}

impl PersistenceSection {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// 按 backend 构建持久化适配器；none 返回 None
    pub fn build_adapter(&self) -> anyhow::Result<Option<Arc<dyn PersistenceAdapter>>> {
        let adapter: Option<Arc<dyn PersistenceAdapter>> = match self.backend {
            PersistenceBackend::Memory => Some(Arc::new(InMemoryPersistence::new())),
            PersistenceBackend::Json => {
                std::fs::create_dir_all(&self.directory)?;
                Some(Arc::new(JsonFilePersistence::new(&self.directory)))
            }
            PersistenceBackend::None => None,
        };
        Ok(adapter)
    }
}

/// [llm] 段：模型参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_model() -> String {
    "mock".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmSection {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
