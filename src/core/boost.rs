//! Boost 配置与三种 Boost 方式
//!
//! 1. 单任务开关（用户显式指定 task id），优先级最高
//! 2. boost_next_count：接下来 N 个实际派发的任务
//! 3. 类别（如 `agg_sub1`、`comp_val`）：该类别下的全部任务
//!
//! 计数只在任务真正派发时扣减，预测时不扣减。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::events::{EngineEvent, EventBus};
use crate::core::task_scheduler::WorkflowMode;
use crate::llm::{ProviderConfig, ProviderKind};

fn default_enabled() -> bool {
    true
}

fn default_boost_provider() -> ProviderKind {
    ProviderKind::OpenRouter
}

fn default_boost_context() -> u32 {
    131_072
}

fn default_boost_output() -> u32 {
    25_000
}

/// Boost 目标模型设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub model_id: String,
    #[serde(default = "default_boost_provider")]
    pub provider: ProviderKind,
    #[serde(default)]
    pub host_provider: Option<String>,
    #[serde(default = "default_boost_context")]
    pub context_window: u32,
    #[serde(default = "default_boost_output")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub fallback_model_id: Option<String>,
}

impl BoostSettings {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            enabled: true,
            model_id: model_id.into(),
            provider: default_boost_provider(),
            host_provider: None,
            context_window: default_boost_context(),
            max_output_tokens: default_boost_output(),
            fallback_model_id: None,
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider,
            model_id: self.model_id.clone(),
            host_provider: self.host_provider.clone(),
            fallback_model_id: self.fallback_model_id.clone(),
            context_window: self.context_window,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

/// 任务因何被 Boost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostSource {
    ExplicitToggle,
    NextCount,
    Category,
}

/// Boost 状态（可持久化）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostState {
    pub settings: Option<BoostSettings>,
    pub boost_next_count: u32,
    pub boosted_categories: BTreeSet<String>,
    pub boosted_task_ids: BTreeSet<String>,
}

impl BoostState {
    pub fn is_enabled(&self) -> bool {
        self.settings.as_ref().is_some_and(|s| s.enabled)
    }

    /// 按优先级判断：显式开关 > 计数（由调用方告知是否仍有余量）> 类别
    pub fn source_for(&self, task_id: &str, category: &str, count_available: bool) -> Option<BoostSource> {
        if !self.is_enabled() {
            return None;
        }
        if self.boosted_task_ids.contains(task_id) {
            Some(BoostSource::ExplicitToggle)
        } else if count_available {
            Some(BoostSource::NextCount)
        } else if self.boosted_categories.contains(category) {
            Some(BoostSource::Category)
        } else {
            None
        }
    }

    pub fn provider_config(&self) -> Option<ProviderConfig> {
        self.settings
            .as_ref()
            .filter(|s| s.enabled)
            .map(BoostSettings::provider_config)
    }
}

/// Boost 状态的唯一写入方；每次变更都发布事件
pub struct BoostManager {
    state: BoostState,
    bus: EventBus,
}

impl BoostManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: BoostState::default(),
            bus,
        }
    }

    pub fn with_state(state: BoostState, bus: EventBus) -> Self {
        Self { state, bus }
    }

    pub fn state(&self) -> &BoostState {
        &self.state
    }

    /// 写入目标模型设置；`enabled = false` 时保留开关与计数，但暂不生效
    pub fn set_config(&mut self, settings: BoostSettings) {
        if settings.enabled {
            tracing::info!(
                model = %settings.model_id,
                provider = settings.provider.as_str(),
                context = settings.context_window,
                max_tokens = settings.max_output_tokens,
                "boost enabled"
            );
            self.bus.publish(EngineEvent::BoostEnabled {
                model_id: settings.model_id.clone(),
                provider: settings.provider.as_str().to_string(),
            });
        } else {
            tracing::info!(model = %settings.model_id, "boost configured but disabled");
            self.bus.publish(EngineEvent::BoostDisabled);
        }
        self.state.settings = Some(settings);
    }

    /// 关闭 Boost，同时清空开关、类别与计数
    pub fn clear(&mut self) {
        if self.state.settings.is_none() {
            return;
        }
        self.state = BoostState::default();
        tracing::info!("boost disabled");
        self.bus.publish(EngineEvent::BoostDisabled);
    }

    pub fn set_next_count(&mut self, count: u32) {
        self.state.boost_next_count = count;
        tracing::info!(count, "boost next count set");
        self.bus.publish(EngineEvent::BoostNextCountUpdated { count });
    }

    pub fn toggle_category(&mut self, category: &str) -> bool {
        let boosted = if self.state.boosted_categories.remove(category) {
            false
        } else {
            self.state.boosted_categories.insert(category.to_string());
            true
        };
        self.bus.publish(EngineEvent::CategoryBoostToggled {
            category: category.to_string(),
            boosted,
        });
        boosted
    }

    pub fn toggle_task(&mut self, task_id: &str) -> bool {
        let boosted = if self.state.boosted_task_ids.remove(task_id) {
            false
        } else {
            self.state.boosted_task_ids.insert(task_id.to_string());
            true
        };
        tracing::debug!(task_id, boosted, "task boost toggled");
        self.bus.publish(EngineEvent::TaskBoostToggled {
            task_id: task_id.to_string(),
            boosted,
        });
        boosted
    }

    /// 只读判断任务是否命中 Boost
    pub fn source_for(&self, task_id: &str, category: &str) -> Option<BoostSource> {
        self.state
            .source_for(task_id, category, self.state.boost_next_count > 0)
    }

    /// 任务确定以 Boost 模型派发后调用：计数扣减 1（不会低于 0）或移除显式开关。
    /// 返回状态是否发生变化（类别方式不变）
    pub fn consume(&mut self, task_id: &str, source: BoostSource) -> bool {
        match source {
            BoostSource::NextCount => {
                self.state.boost_next_count = self.state.boost_next_count.saturating_sub(1);
                let count = self.state.boost_next_count;
                tracing::debug!(task_id, remaining = count, "boost count consumed");
                self.bus.publish(EngineEvent::BoostNextCountUpdated { count });
                true
            }
            // 已执行的任务 id 不会再出现，移除以免集合无限增长
            BoostSource::ExplicitToggle => self.state.boosted_task_ids.remove(task_id),
            BoostSource::Category => false,
        }
    }
}

/// 可 Boost 的任务类别
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoostCategory {
    pub id: String,
    pub label: String,
}

impl BoostCategory {
    fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// 当前模式下可选的 Boost 类别
pub fn available_categories(mode: WorkflowMode, submitter_ids: &[u32]) -> Vec<BoostCategory> {
    match mode {
        WorkflowMode::Aggregator => submitter_ids
            .iter()
            .map(|i| BoostCategory::new(format!("agg_sub{i}"), format!("Sub {i}")))
            .chain(std::iter::once(BoostCategory::new("agg_val", "Validator")))
            .collect(),
        WorkflowMode::Compiler => vec![
            BoostCategory::new("comp_hc", "High-Context"),
            BoostCategory::new("comp_hp", "High-Param"),
            BoostCategory::new("comp_val", "Validator"),
        ],
    }
}
