//! 引擎错误类型
//!
//! AgentCallError 由 ProviderRouter 分类后决定是否计入模型健康；
//! ValidationParseError 只会降级为 decline，不会冒泡到主循环。

use thiserror::Error;

use crate::core::health::ModelKey;

/// 外部 Agent 调用失败的种类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentCallError {
    #[error("Agent call timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed agent output: {0}")]
    Malformed(String),

    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Provider policy block: {0}")]
    PolicyBlock(String),

    /// 连接失败、传输层错误等（按 timeout 同等计入健康）
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl AgentCallError {
    /// quota / policy 类错误触发 fallback 重试，不直接计入健康失败
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_) | Self::PolicyBlock(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::PolicyBlock(_) => "policy_block",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// 验证者输出不符合决策 schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation parse error: {reason}")]
pub struct ValidationParseError {
    pub reason: String,
    /// 原始输出预览（截断）
    pub preview: String,
}

impl ValidationParseError {
    pub fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            preview: raw.chars().take(200).collect(),
        }
    }
}

/// 编排引擎层面的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Recovery failed for model {0}")]
    RecoveryFailed(ModelKey),

    /// 有模型处于恢复中，全局暂停派发
    #[error("Dispatch paused: model {0} is in recovery")]
    RecoveryInProgress(ModelKey),

    #[error("Model {0} is unusable until reconfigured")]
    ModelUnusable(ModelKey),

    #[error("Submission {0} already has a terminal status")]
    AlreadyResolved(uuid::Uuid),

    #[error("Config error: {0}")]
    Config(String),
}
