//! OpenAI 兼容后端
//!
//! 通过 async_openai 同时连接本地 LM Studio 与云端 OpenRouter（二者都是 OpenAI 兼容端点），
//! 并把 API 错误归类为 AgentCallError。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::error::AgentCallError;
use crate::llm::{AgentCall, AgentRequest, AgentResponse, ProviderConfig, ProviderKind, TokenUsage};

pub const DEFAULT_LM_STUDIO_URL: &str = "http://127.0.0.1:1234/v1";
pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

/// 持有两个 OpenAI 兼容客户端，按 ProviderConfig.provider 选择
pub struct OpenAiAgent {
    lm_studio: Client<OpenAIConfig>,
    openrouter: Option<Client<OpenAIConfig>>,
}

impl OpenAiAgent {
    /// OpenRouter 未提供 API Key 时，云端调用一律返回 Unavailable
    pub fn new(lm_studio_url: &str, openrouter_url: &str, openrouter_key: Option<&str>) -> Self {
        let lm_studio = Client::with_config(
            OpenAIConfig::new()
                .with_api_base(lm_studio_url)
                .with_api_key("lm-studio"),
        );
        let openrouter = openrouter_key.map(|key| {
            Client::with_config(
                OpenAIConfig::new()
                    .with_api_base(openrouter_url)
                    .with_api_key(key),
            )
        });
        Self { lm_studio, openrouter }
    }

    fn client_for(&self, provider: &ProviderConfig) -> Result<&Client<OpenAIConfig>, AgentCallError> {
        match provider.provider {
            ProviderKind::LmStudio => Ok(&self.lm_studio),
            ProviderKind::OpenRouter => self
                .openrouter
                .as_ref()
                .ok_or_else(|| AgentCallError::Unavailable("OPENROUTER_API_KEY is not set".to_string())),
        }
    }

    fn messages(request: &AgentRequest) -> Result<Vec<ChatCompletionRequestMessage>, AgentCallError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_prompt.clone())
            .build()
            .map_err(classify)?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.clone())
            .build()
            .map_err(classify)?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

/// 把 async_openai 错误映射为引擎的错误分类
pub fn classify(err: OpenAIError) -> AgentCallError {
    match err {
        OpenAIError::ApiError(api) => classify_api_message(&api.to_string()),
        OpenAIError::JSONDeserialize(..) => AgentCallError::Malformed(err.to_string()),
        other => AgentCallError::Unavailable(other.to_string()),
    }
}

fn classify_api_message(message: &str) -> AgentCallError {
    let lower = message.to_lowercase();
    let quota = ["quota", "credit", "insufficient", "402", "rate limit", "429"];
    let policy = ["policy", "moderation", "flagged", "403", "content filter"];
    if quota.iter().any(|k| lower.contains(k)) {
        AgentCallError::QuotaExceeded(message.to_string())
    } else if policy.iter().any(|k| lower.contains(k)) {
        AgentCallError::PolicyBlock(message.to_string())
    } else {
        AgentCallError::Unavailable(message.to_string())
    }
}

#[async_trait]
impl AgentCall for OpenAiAgent {
    async fn call(&self, request: &AgentRequest, provider: &ProviderConfig) -> Result<AgentResponse, AgentCallError> {
        let client = self.client_for(provider)?;
        if let Some(host) = &provider.host_provider {
            tracing::debug!(model = %provider.model_id, host = %host, "host provider override requested");
        }
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&provider.model_id)
            .messages(Self::messages(request)?)
            .max_completion_tokens(provider.max_output_tokens)
            .build()
            .map_err(classify)?;

        let response = client.chat().create(chat_request).await.map_err(classify)?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
            })
            .unwrap_or_default();

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AgentCallError::Malformed("empty completion".to_string()));
        }
        Ok(AgentResponse { text, usage })
    }
}
