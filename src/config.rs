//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__CORRUPTION_THRESHOLD=3`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::boost::BoostSettings;
use crate::core::task_scheduler::{ValidationCadence, WorkflowMode};
use crate::llm::openai::{DEFAULT_LM_STUDIO_URL, DEFAULT_OPENROUTER_URL};
use crate::llm::ProviderConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    /// 每个提交者槽位一个模型配置（1..=10）
    pub submitters: Vec<SubmitterSection>,
    pub validator: Option<ProviderConfig>,
    pub compiler: CompilerSection,
    /// 启动时的 Boost 设置
    pub boost: Option<BoostSettings>,
    pub providers: ProvidersSection,
    pub persistence: PersistenceSection,
}

/// [engine] 段：模式、节奏与各类阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 所有角色共享的用户目标
    pub goal: String,
    pub mode: WorkflowMode,
    pub cadence: ValidationCadence,
    pub corruption_threshold: u32,
    pub rejection_backoff_threshold: u32,
    /// 每累计多少次接受触发一次清理审查
    pub cleanup_interval: u64,
    pub lookahead: usize,
    pub call_timeout_secs: u64,
    pub event_capacity: usize,
    /// 两轮之间的间隔（毫秒）
    pub round_pause_ms: u64,
    pub recent_rejection_memory: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            goal: String::new(),
            mode: WorkflowMode::Aggregator,
            cadence: ValidationCadence::Batched,
            corruption_threshold: 5,
            rejection_backoff_threshold: 5,
            cleanup_interval: 7,
            lookahead: 20,
            call_timeout_secs: 600,
            event_capacity: 500,
            round_pause_ms: 1000,
            recent_rejection_memory: 5,
        }
    }
}

/// [[submitters]]：槽位 id 缺省时按出现顺序编号
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitterSection {
    pub id: Option<u32>,
    #[serde(flatten)]
    pub provider: ProviderConfig,
}

/// [compiler] 段：High-Param 未配置时沿用 High-Context
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CompilerSection {
    pub high_context: Option<ProviderConfig>,
    pub high_param: Option<ProviderConfig>,
}

/// [providers] 段：端点地址；OpenRouter API Key 从 OPENROUTER_API_KEY 读取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub lm_studio_base_url: String,
    pub openrouter_base_url: String,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            lm_studio_base_url: DEFAULT_LM_STUDIO_URL.to_string(),
            openrouter_base_url: DEFAULT_OPENROUTER_URL.to_string(),
        }
    }
}

/// [persistence] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub data_dir: PathBuf,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl AppConfig {
    /// 提交者槽位（补全缺省 id）
    pub fn submitter_slots(&self) -> Vec<(u32, ProviderConfig)> {
        self.submitters
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.unwrap_or(i as u32 + 1), s.provider.clone()))
            .collect()
    }

    /// 结构校验：模式所需的角色都已配置、槽位 id 合法且不重复
    pub fn validate(&self) -> Result<(), String> {
        if self.validator.is_none() {
            return Err("[validator] is required".to_string());
        }
        match self.engine.mode {
            WorkflowMode::Aggregator => {
                let slots = self.submitter_slots();
                if slots.is_empty() || slots.len() > 10 {
                    return Err(format!("aggregator mode needs 1..=10 submitters, got {}", slots.len()));
                }
                let mut ids: Vec<u32> = slots.iter().map(|(id, _)| *id).collect();
                ids.sort_unstable();
                ids.dedup();
                if ids.len() != slots.len() || ids.iter().any(|id| !(1..=10).contains(id)) {
                    return Err("submitter ids must be unique and within 1..=10".to_string());
                }
            }
            WorkflowMode::Compiler => {
                if self.compiler.high_context.is_none() {
                    return Err("compiler mode needs [compiler.high_context]".to_string());
                }
            }
        }
        if self.engine.corruption_threshold == 0 {
            return Err("engine.corruption_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

/// 从默认路径或指定路径加载配置，环境变量 HIVE__* 可覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_paths = ["config/default.toml", "../config/default.toml", "default.toml"];
    for p in default_paths {
        if std::path::Path::new(p).exists() {
            builder = builder.add_source(config::File::with_name(p).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let cfg = builder.build()?;
    cfg.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.corruption_threshold, 5);
        assert_eq!(cfg.engine.cleanup_interval, 7);
        assert_eq!(cfg.engine.cadence, ValidationCadence::Batched);
        assert_eq!(cfg.persistence.data_dir, PathBuf::from("data"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_aggregator_file() {
        let file = write_toml(
            r#"
[engine]
goal = "Collect facts about Rust lifetimes"
corruption_threshold = 3

[[submitters]]
provider = "lm_studio"
model_id = "qwen"

[[submitters]]
provider = "openrouter"
model_id = "anthropic/claude"
fallback_model_id = "qwen"

[validator]
provider = "lm_studio"
model_id = "judge"
"#,
        );
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.corruption_threshold, 3);
        assert_eq!(cfg.engine.goal, "Collect facts about Rust lifetimes");
        let slots = cfg.submitter_slots();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].0, 2);
        assert_eq!(slots[1].1.fallback_model_id.as_deref(), Some("qwen"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_compiler_requires_high_context() {
        let mut cfg = AppConfig {
            validator: Some(ProviderConfig::local("judge")),
            ..AppConfig::default()
        };
        cfg.engine.mode = WorkflowMode::Compiler;
        assert!(cfg.validate().is_err());
        cfg.compiler.high_context = Some(ProviderConfig::local("hc"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_submitter_ids_rejected() {
        let cfg = AppConfig {
            submitters: vec![
                SubmitterSection {
                    id: Some(1),
                    provider: ProviderConfig::local("a"),
                },
                SubmitterSection {
                    id: Some(1),
                    provider: ProviderConfig::local("b"),
                },
            ],
            validator: Some(ProviderConfig::local("judge")),
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
