//! 状态定义：协调器阶段与对外查询用的快照投影
//!
//! 控制循环内部持有完整状态；观察方只拿到 EngineStatus 这类轻量、可序列化的投影。

use serde::{Deserialize, Serialize};

use crate::core::boost::{BoostCategory, BoostState};
use crate::core::health::{ModelHealthRecord, ModelKey, RecoveryStage};
use crate::core::submission::Submitter;
use crate::core::task_scheduler::Task;

/// 协调器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorPhase {
    #[default]
    Idle,
    AwaitingSubmission,
    AwaitingValidation,
    /// 有模型恢复中，全局暂停
    Recovering,
    /// 验证者不可用，等待重新配置
    Halted,
}

/// 累计统计（持久化到 stats.json）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineStats {
    pub total_submissions: u64,
    pub total_acceptances: u64,
    pub total_rejections: u64,
    pub total_declines: u64,
    pub cleanup_reviews_performed: u64,
    pub removals_proposed: u64,
    pub removals_executed: u64,
}

impl EngineStats {
    /// 已裁决（接受 + 拒绝）中的接受比例；尚无裁决时为 0
    pub fn acceptance_rate(&self) -> f64 {
        let decided = self.total_acceptances + self.total_rejections;
        if decided == 0 {
            0.0
        } else {
            self.total_acceptances as f64 / decided as f64
        }
    }
}

/// 单个提交者的指标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitterMetrics {
    pub submitter_id: u32,
    pub model: ModelKey,
    pub total_submissions: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub declined: u64,
    pub consecutive_rejections: u32,
    pub in_backoff: bool,
}

impl SubmitterMetrics {
    pub fn from_submitter(submitter: &Submitter, in_backoff: bool) -> Self {
        Self {
            submitter_id: submitter.id,
            model: submitter.provider.key(),
            total_submissions: submitter.total_submissions,
            accepted: submitter.total_acceptances,
            rejected: submitter.total_rejections,
            declined: submitter.total_declines,
            consecutive_rejections: submitter.consecutive_rejections,
            in_backoff,
        }
    }
}

/// 恢复状态
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub paused: bool,
    pub recovering_model: Option<ModelKey>,
    pub stage: Option<RecoveryStage>,
    pub unusable_models: Vec<ModelKey>,
    pub records: Vec<ModelHealthRecord>,
}

impl RecoveryStatus {
    pub fn from_records(records: Vec<ModelHealthRecord>) -> Self {
        let recovering = records.iter().find(|r| r.in_recovery);
        Self {
            paused: recovering.is_some(),
            recovering_model: recovering.map(|r| r.model.clone()),
            stage: recovering.and_then(|r| r.recovery_stage),
            unusable_models: records.iter().filter(|r| r.unusable).map(|r| r.model.clone()).collect(),
            records,
        }
    }
}

/// 引擎状态快照（通过 watch 通道发布给观察方）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub mode: String,
    pub phase: CoordinatorPhase,
    /// 轮转周期中下一步的下标
    pub rotation_position: usize,
    pub rounds_completed: u64,
    pub stats: EngineStats,
    pub acceptance_rate: f64,
    pub corpus_size: usize,
    pub submitters: Vec<SubmitterMetrics>,
    pub recovery: RecoveryStatus,
    pub boost: BoostState,
    /// 当前模式下可 Boost 的类别
    pub boost_categories: Vec<BoostCategory>,
    pub current_task: Option<Task>,
    pub lookahead: Vec<Task>,
    pub halted_reason: Option<String>,
}
