//! Agent 调用抽象
//!
//! 引擎只把 Agent 当作「请求 → 文本 + token 用量」的不透明函数；
//! 具体后端（LM Studio / OpenRouter / 测试用脚本）实现 AgentCall。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::error::AgentCallError;
use crate::core::health::ModelKey;

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// 本地 LM Studio（OpenAI 兼容端点）
    LmStudio,
    /// 云端 OpenRouter
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LmStudio => "lm_studio",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::OpenRouter)
    }
}

fn default_context_window() -> u32 {
    131_072
}

fn default_max_output_tokens() -> u32 {
    25_000
}

/// 单个角色的模型配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub model_id: String,
    /// OpenRouter 的上游 host provider 覆盖（如 "Anthropic"）
    #[serde(default)]
    pub host_provider: Option<String>,
    /// 云端额度/策略失败时改用的本地模型
    #[serde(default)]
    pub fallback_model_id: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl ProviderConfig {
    pub fn local(model_id: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::LmStudio,
            model_id: model_id.into(),
            host_provider: None,
            fallback_model_id: None,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
        }
    }

    pub fn cloud(model_id: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::OpenRouter,
            ..Self::local(model_id)
        }
    }

    pub fn with_fallback(mut self, model_id: impl Into<String>) -> Self {
        self.fallback_model_id = Some(model_id.into());
        self
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(self.provider.as_str(), self.model_id.clone())
    }

    /// 只有云端配置且配置了 fallback 时才存在 fallback 目标（落到本地 LM Studio）
    pub fn fallback(&self) -> Option<ProviderConfig> {
        if !self.provider.is_cloud() {
            return None;
        }
        self.fallback_model_id.as_ref().map(|model| ProviderConfig {
            provider: ProviderKind::LmStudio,
            model_id: model.clone(),
            host_provider: None,
            fallback_model_id: None,
            context_window: self.context_window,
            max_output_tokens: self.max_output_tokens,
        })
    }
}

/// 发给 Agent 的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    /// 角色标签（如 "Submitter 2"、"Validator"）
    pub role: String,
    pub system_prompt: String,
    pub prompt: String,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(role: impl Into<String>, system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Agent 的原始返回
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// 外部 Agent 调用接口
#[async_trait]
pub trait AgentCall: Send + Sync {
    async fn call(
        &self,
        request: &AgentRequest,
        provider: &ProviderConfig,
    ) -> Result<AgentResponse, AgentCallError>;
}
