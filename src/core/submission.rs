//! 提交、提交者与验证者
//!
//! Submission 的状态只允许 pending → 某个终态，终态之后任何修改都返回 `AlreadyResolved`。

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::EngineError;
use crate::llm::ProviderConfig;

/// 提交状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Accepted,
    Rejected,
    Declined,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 一次提交
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub id: Uuid,
    pub submitter_id: u32,
    /// 产生该提交的任务 id
    pub task_id: String,
    pub content: String,
    /// 提交者自己的理由
    pub submitter_reasoning: String,
    status: SubmissionStatus,
    /// 终态理由（验证者理由，或 decline 时提交者的理由）
    reasoning: String,
    /// 拒绝时验证者给出的摘要
    summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Submission {
    pub fn new(
        submitter_id: u32,
        task_id: impl Into<String>,
        content: impl Into<String>,
        submitter_reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter_id,
            task_id: task_id.into(),
            content: content.into(),
            submitter_reasoning: submitter_reasoning.into(),
            status: SubmissionStatus::Pending,
            reasoning: String::new(),
            summary: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == SubmissionStatus::Pending
    }

    fn resolve(&mut self, status: SubmissionStatus, reasoning: String, summary: Option<String>) -> Result<(), EngineError> {
        if self.status.is_terminal() || !status.is_terminal() {
            return Err(EngineError::AlreadyResolved(self.id));
        }
        self.status = status;
        self.reasoning = reasoning;
        self.summary = summary;
        Ok(())
    }

    pub fn accept(&mut self, reasoning: impl Into<String>) -> Result<(), EngineError> {
        self.resolve(SubmissionStatus::Accepted, reasoning.into(), None)
    }

    pub fn reject(&mut self, reasoning: impl Into<String>, summary: impl Into<String>) -> Result<(), EngineError> {
        self.resolve(SubmissionStatus::Rejected, reasoning.into(), Some(summary.into()))
    }

    pub fn decline(&mut self, reasoning: impl Into<String>) -> Result<(), EngineError> {
        self.resolve(SubmissionStatus::Declined, reasoning.into(), None)
    }
}

/// 提交者槽位（仅由协调器修改）
#[derive(Debug, Clone)]
pub struct Submitter {
    pub id: u32,
    pub provider: ProviderConfig,
    pub total_submissions: u64,
    pub total_acceptances: u64,
    pub total_rejections: u64,
    pub total_declines: u64,
    pub consecutive_rejections: u32,
    recent_rejections: VecDeque<String>,
    rejection_memory: usize,
}

impl Submitter {
    pub fn new(id: u32, provider: ProviderConfig, rejection_memory: usize) -> Self {
        Self {
            id,
            provider,
            total_submissions: 0,
            total_acceptances: 0,
            total_rejections: 0,
            total_declines: 0,
            consecutive_rejections: 0,
            recent_rejections: VecDeque::with_capacity(rejection_memory),
            rejection_memory,
        }
    }

    pub fn record_proposal(&mut self) {
        self.total_submissions += 1;
    }

    pub fn record_acceptance(&mut self) {
        self.total_acceptances += 1;
        self.consecutive_rejections = 0;
    }

    /// 记录一次拒绝，返回新的连续拒绝数
    pub fn record_rejection(&mut self, summary: &str) -> u32 {
        self.total_rejections += 1;
        self.consecutive_rejections += 1;
        if self.rejection_memory > 0 {
            if self.recent_rejections.len() == self.rejection_memory {
                self.recent_rejections.pop_front();
            }
            self.recent_rejections.push_back(summary.to_string());
        }
        self.consecutive_rejections
    }

    pub fn record_decline(&mut self) {
        self.total_declines += 1;
    }

    /// 进入退避后清零连续拒绝计数
    pub fn reset_streak(&mut self) {
        self.consecutive_rejections = 0;
    }

    /// 最近的拒绝摘要（从旧到新）
    pub fn recent_rejections(&self) -> impl Iterator<Item = &str> {
        self.recent_rejections.iter().map(String::as_str)
    }
}

/// 全局唯一的验证者；不实现 Clone，由协调器独占持有
#[derive(Debug)]
pub struct Validator {
    pub provider: ProviderConfig,
    pub total_validations: u64,
}

impl Validator {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            provider,
            total_validations: 0,
        }
    }
}
