//! Provider 路由：为任务选择模型（默认 / Boost / fallback），执行调用并分类结果
//!
//! 路由优先级：单任务开关 > boost_next_count > 类别 > 角色默认配置。
//! 调用结果分类：
//! - 成功（且输出可解析）→ 健康记录成功
//! - quota / policy 且配置了 fallback → 发布 provider_fallback，改用 fallback 重试一次，主模型不计失败
//! - 其余失败（含 fallback 也失败）→ 对实际调用的模型记一次失败

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::boost::BoostManager;
use crate::core::error::{AgentCallError, EngineError};
use crate::core::events::{EngineEvent, EventBus};
use crate::core::health::{ModelHealthMonitor, ModelKey};
use crate::core::prompts;
use crate::core::task_scheduler::{Role, Task};
use crate::llm::{AgentCall, AgentRequest, ProviderConfig, TokenUsage};

/// 各角色的默认模型配置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleProviders {
    submitters: BTreeMap<u32, ProviderConfig>,
    high_context: Option<ProviderConfig>,
    high_param: Option<ProviderConfig>,
    validator: Option<ProviderConfig>,
}

impl RoleProviders {
    pub fn aggregator(submitters: Vec<(u32, ProviderConfig)>, validator: ProviderConfig) -> Self {
        Self {
            submitters: submitters.into_iter().collect(),
            validator: Some(validator),
            ..Self::default()
        }
    }

    pub fn compiler(high_context: ProviderConfig, high_param: Option<ProviderConfig>, validator: ProviderConfig) -> Self {
        Self {
            high_context: Some(high_context),
            high_param,
            validator: Some(validator),
            ..Self::default()
        }
    }

    /// High-Param 未配置时沿用 High-Context
    pub fn default_for(&self, role: Role) -> Option<&ProviderConfig> {
        match role {
            Role::Submitter(id) => self.submitters.get(&id),
            Role::HighContext => self.high_context.as_ref(),
            Role::HighParam => self.high_param.as_ref().or(self.high_context.as_ref()),
            Role::Validator => self.validator.as_ref(),
        }
    }

    pub fn submitter_ids(&self) -> Vec<u32> {
        self.submitters.keys().copied().collect()
    }

    pub fn submitters(&self) -> impl Iterator<Item = (u32, &ProviderConfig)> {
        self.submitters.iter().map(|(id, cfg)| (*id, cfg))
    }

    fn all(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.submitters
            .values()
            .chain(self.high_context.iter())
            .chain(self.high_param.iter())
            .chain(self.validator.iter())
    }

    /// 把所有使用 `model` 的角色替换为新配置，返回替换数量
    pub fn replace_model(&mut self, model: &ModelKey, replacement: &ProviderConfig) -> usize {
        let mut replaced = 0;
        let slots = self
            .submitters
            .values_mut()
            .chain(self.high_context.iter_mut())
            .chain(self.high_param.iter_mut())
            .chain(self.validator.iter_mut());
        for slot in slots {
            if &slot.key() == model {
                *slot = replacement.clone();
                replaced += 1;
            }
        }
        replaced
    }
}

/// 一次成功调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    pub usage: TokenUsage,
    /// 实际应答的模型（fallback 时为 fallback 模型）
    pub model: ModelKey,
    pub used_fallback: bool,
}

pub struct ProviderRouter {
    agent: Arc<dyn AgentCall>,
    providers: RoleProviders,
    boost: BoostManager,
    bus: EventBus,
    call_timeout: Duration,
}

impl ProviderRouter {
    pub fn new(
        agent: Arc<dyn AgentCall>,
        providers: RoleProviders,
        boost: BoostManager,
        bus: EventBus,
        call_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            providers,
            boost,
            bus,
            call_timeout,
        }
    }

    pub fn providers(&self) -> &RoleProviders {
        &self.providers
    }

    pub fn providers_mut(&mut self) -> &mut RoleProviders {
        &mut self.providers
    }

    pub fn boost(&self) -> &BoostManager {
        &self.boost
    }

    pub fn boost_mut(&mut self) -> &mut BoostManager {
        &mut self.boost
    }

    /// 使用默认调用超时构建请求
    pub fn request(&self, role: impl Into<String>, system_prompt: impl Into<String>, prompt: impl Into<String>) -> AgentRequest {
        AgentRequest::new(role, system_prompt, prompt).with_timeout(self.call_timeout)
    }

    /// 只读解析（预测用），不扣减计数
    pub fn resolve_provider(&self, task: &Task) -> Option<ProviderConfig> {
        let state = self.boost.state();
        let source = state.source_for(&task.task_id, &task.category, state.boost_next_count > 0);
        match source {
            Some(_) => state.provider_config(),
            None => self.providers.default_for(task.role).cloned(),
        }
    }

    /// 派发时解析并把结果写回任务
    ///
    /// 只有 Boost 模型可用时才扣减计数或移除显式开关；Boost 模型不可用时改用角色默认模型，
    /// Boost 余量原样保留。返回的默认模型仍可能不可用，由调用方决定阻塞或停机。
    pub fn resolve_for_dispatch(
        &mut self,
        task: &mut Task,
        health: &ModelHealthMonitor,
    ) -> Result<ProviderConfig, EngineError> {
        let boosted = self
            .boost
            .source_for(&task.task_id, &task.category)
            .and_then(|source| self.boost.state().provider_config().map(|config| (config, source)));

        if let Some((config, source)) = boosted {
            if health.is_usable(&config.key()) {
                self.boost.consume(&task.task_id, source);
                task.provider = Some(config.key());
                task.using_boost = true;
                task.boost_source = Some(source);
                return Ok(config);
            }
            tracing::warn!(task_id = %task.task_id, model = %config.key(), "boost model unusable, using role default");
            self.bus.publish(EngineEvent::BoostBypassed {
                task_id: task.task_id.clone(),
                model: config.key(),
            });
        }

        let config = self
            .providers
            .default_for(task.role)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no provider configured for {}", task.role)))?;
        task.provider = Some(config.key());
        task.using_boost = false;
        task.boost_source = None;
        Ok(config)
    }

    /// 按 ModelKey 找回完整配置（恢复流程用）
    pub fn config_for_key(&self, model: &ModelKey) -> Option<ProviderConfig> {
        let boost = self.boost.state().provider_config();
        let direct = self.providers.all().cloned().chain(boost.clone());
        let fallbacks = self
            .providers
            .all()
            .filter_map(ProviderConfig::fallback)
            .chain(boost.as_ref().and_then(ProviderConfig::fallback));
        direct.chain(fallbacks).find(|cfg| &cfg.key() == model)
    }

    async fn call_once(&self, request: &AgentRequest, provider: &ProviderConfig) -> Result<crate::llm::AgentResponse, AgentCallError> {
        match tokio::time::timeout(request.timeout, self.agent.call(request, provider)).await {
            Ok(result) => result,
            Err(_) => Err(AgentCallError::Timeout(request.timeout.as_secs())),
        }
    }

    fn record_failure(&self, health: &mut ModelHealthMonitor, task: &Task, model: &ModelKey, error: &AgentCallError) {
        tracing::warn!(task_id = %task.task_id, model = %model, kind = error.kind(), error = %error, "agent call failed");
        self.bus.publish(EngineEvent::AgentCallFailed {
            task_id: task.task_id.clone(),
            model: model.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        health.record_outcome(model, false);
    }

    /// 执行一次角色调用（唯一的挂起点）
    ///
    /// `parse` 作用于应答文本；返回 Err 时按 Malformed 计入健康。
    pub async fn execute<T>(
        &self,
        health: &mut ModelHealthMonitor,
        task: &Task,
        provider: &ProviderConfig,
        request: AgentRequest,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<CallOutcome<T>, AgentCallError> {
        let primary = provider.key();
        self.bus.publish(EngineEvent::TaskDispatched {
            task_id: task.task_id.clone(),
            role: task.role_label.clone(),
            model: primary.clone(),
            using_boost: task.using_boost,
        });
        tracing::debug!(task_id = %task.task_id, model = %primary, boost = task.using_boost, "dispatching task");

        let (response, model, used_fallback) = match self.call_once(&request, provider).await {
            Ok(response) => (response, primary, false),
            Err(error) if error.triggers_fallback() => match provider.fallback() {
                Some(fallback) => {
                    let to = fallback.key();
                    tracing::warn!(task_id = %task.task_id, from = %primary, to = %to, reason = %error, "falling back");
                    self.bus.publish(EngineEvent::ProviderFallback {
                        task_id: task.task_id.clone(),
                        from: primary,
                        to: to.clone(),
                        reason: error.to_string(),
                    });
                    match self.call_once(&request, &fallback).await {
                        Ok(response) => (response, to, true),
                        Err(error) => {
                            self.record_failure(health, task, &to, &error);
                            return Err(error);
                        }
                    }
                }
                None => {
                    self.record_failure(health, task, &primary, &error);
                    return Err(error);
                }
            },
            Err(error) => {
                self.record_failure(health, task, &primary, &error);
                return Err(error);
            }
        };

        match parse(&response.text) {
            Ok(value) => {
                health.record_outcome(&model, true);
                Ok(CallOutcome {
                    value,
                    usage: response.usage,
                    model,
                    used_fallback,
                })
            }
            Err(reason) => {
                let error = AgentCallError::Malformed(reason);
                self.record_failure(health, task, &model, &error);
                Err(error)
            }
        }
    }

    /// 试用调用：要求模型返回固定 JSON，不计入健康
    pub async fn probe(&self, provider: &ProviderConfig) -> Result<(), AgentCallError> {
        let request = AgentRequest::new("Probe", prompts::PROBE_SYSTEM_PROMPT, prompts::PROBE_PROMPT)
            .with_timeout(self.call_timeout.min(Duration::from_secs(120)));
        let response = self.call_once(&request, provider).await?;
        let ok = crate::core::decision::extract_json(&response.text)
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == "ok"))
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(AgentCallError::Malformed("probe response did not match".to_string()))
        }
    }
}
