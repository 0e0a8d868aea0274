//! 引擎构建器：统一的初始化逻辑
//!
//! 由配置组装 Provider 路由、健康监测、恢复引擎与持久化，得到可运行的 SubmissionCoordinator。
//! CLI 与测试共用同一条构建路径；测试通过 with_* 注入脚本化 Agent 与内存存储。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::AppConfig;
use crate::core::boost::BoostManager;
use crate::core::coordinator::{CoordinatorSettings, SubmissionCoordinator};
use crate::core::events::EventBus;
use crate::core::health::ModelHealthMonitor;
use crate::core::recovery::{LmsCliLifecycle, ModelLifecycle, RecoveryEngine};
use crate::core::task_scheduler::WorkflowMode;
use crate::llm::{AgentCall, OpenAiAgent, ProviderRouter, RoleProviders};
use crate::memory::{JsonFileStore, StateStore};

pub struct EngineBuilder {
    config: AppConfig,
    agent: Option<Arc<dyn AgentCall>>,
    store: Option<Arc<dyn StateStore>>,
    lifecycle: Option<Arc<dyn ModelLifecycle>>,
    bus: Option<EventBus>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            agent: None,
            store: None,
            lifecycle: None,
            bus: None,
        }
    }

    /// 指定 Agent 后端；未指定时按配置创建 OpenAI 兼容后端
    pub fn with_agent(mut self, agent: Arc<dyn AgentCall>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// 指定持久化；未指定时使用 data_dir 下的 JSON 文件
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 指定模型生命周期操作；未指定时调用 `lms` 命令行
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn ModelLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按模式组装各角色的默认模型
    pub fn role_providers(config: &AppConfig) -> anyhow::Result<RoleProviders> {
        config.validate().map_err(anyhow::Error::msg).context("Invalid configuration")?;
        let validator = config
            .validator
            .clone()
            .context("[validator] is required")?;
        let providers = match config.engine.mode {
            WorkflowMode::Aggregator => RoleProviders::aggregator(config.submitter_slots(), validator),
            WorkflowMode::Compiler => {
                let high_context = config
                    .compiler
                    .high_context
                    .clone()
                    .context("[compiler.high_context] is required")?;
                RoleProviders::compiler(high_context, config.compiler.high_param.clone(), validator)
            }
        };
        Ok(providers)
    }

    pub fn settings(config: &AppConfig) -> CoordinatorSettings {
        let engine = &config.engine;
        CoordinatorSettings {
            mode: engine.mode,
            cadence: engine.cadence,
            goal: engine.goal.clone(),
            rejection_backoff_threshold: engine.rejection_backoff_threshold,
            cleanup_interval: engine.cleanup_interval,
            lookahead: engine.lookahead,
            recent_rejection_memory: engine.recent_rejection_memory,
        }
    }

    pub fn build(self) -> anyhow::Result<SubmissionCoordinator> {
        let config = self.config;
        let providers = Self::role_providers(&config)?;
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::new(config.engine.event_capacity));

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(
                JsonFileStore::new(&config.persistence.data_dir)
                    .with_context(|| format!("Failed to open data dir {}", config.persistence.data_dir.display()))?,
            ),
        };

        let agent: Arc<dyn AgentCall> = match self.agent {
            Some(agent) => agent,
            None => {
                let key = std::env::var("OPENROUTER_API_KEY").ok();
                if key.is_none() {
                    tracing::warn!("OPENROUTER_API_KEY not set, cloud models will be unavailable");
                }
                Arc::new(OpenAiAgent::new(
                    &config.providers.lm_studio_base_url,
                    &config.providers.openrouter_base_url,
                    key.as_deref(),
                ))
            }
        };
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(LmsCliLifecycle::default()));

        // 已持久化的 Boost 状态优先于配置文件中的初始设置
        let boost = match store.load_boost() {
            Ok(Some(state)) => BoostManager::with_state(state, bus.clone()),
            Ok(None) => {
                let mut boost = BoostManager::new(bus.clone());
                if let Some(settings) = config.boost.clone() {
                    boost.set_config(settings);
                }
                boost
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load boost state");
                BoostManager::new(bus.clone())
            }
        };

        let router = ProviderRouter::new(
            agent,
            providers,
            boost,
            bus.clone(),
            Duration::from_secs(config.engine.call_timeout_secs),
        );
        let health = ModelHealthMonitor::new(config.engine.corruption_threshold, bus.clone());

        let coordinator = SubmissionCoordinator::new(
            Self::settings(&config),
            router,
            health,
            RecoveryEngine::new(lifecycle),
            store,
            bus,
        )?;
        Ok(coordinator)
    }
}
