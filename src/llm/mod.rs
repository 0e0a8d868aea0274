//! LLM 层：Agent 调用抽象、Provider 路由与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::ScriptedAgent;
pub use openai::OpenAiAgent;
pub use router::{CallOutcome, ProviderRouter, RoleProviders};
pub use traits::{AgentCall, AgentRequest, AgentResponse, ProviderConfig, ProviderKind, TokenUsage};
