//! 模型健康监测：连续失败计数、损坏检测与恢复闸门
//!
//! 每个 (provider, model) 组合一条 ModelHealthRecord。连续失败恰好达到
//! `corruption_threshold` 时发出一次 CorruptionDetected，并进入待恢复集合；
//! 任一模型处于恢复中时，整个引擎暂停派发。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventBus};

/// 模型身份：provider 种类 + model id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub provider: String,
    pub model_id: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model_id)
    }
}

/// 恢复阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStage {
    Ejecting,
    Reloading,
    ProbationaryTest,
}

impl RecoveryStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ejecting => "ejecting",
            Self::Reloading => "reloading",
            Self::ProbationaryTest => "probationary-test",
        }
    }
}

/// 单个模型的健康记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealthRecord {
    pub model: ModelKey,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub in_recovery: bool,
    pub recovery_stage: Option<RecoveryStage>,
    /// 恢复失败后置位，直到人工重新配置
    #[serde(default)]
    pub unusable: bool,
}

impl ModelHealthRecord {
    fn new(model: ModelKey) -> Self {
        Self {
            model,
            consecutive_failures: 0,
            recovery_attempts: 0,
            in_recovery: false,
            recovery_stage: None,
            unusable: false,
        }
    }
}

/// record_outcome 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Healthy,
    Degraded { consecutive_failures: u32 },
    /// 本次失败恰好触达阈值
    CorruptionDetected,
}

/// 模型健康监测器（由控制循环独占写）
pub struct ModelHealthMonitor {
    records: BTreeMap<ModelKey, ModelHealthRecord>,
    corruption_threshold: u32,
    /// 已检测到损坏、尚未开始恢复的模型
    pending_recovery: BTreeSet<ModelKey>,
    bus: EventBus,
}

impl ModelHealthMonitor {
    pub fn new(corruption_threshold: u32, bus: EventBus) -> Self {
        Self {
            records: BTreeMap::new(),
            corruption_threshold: corruption_threshold.max(1),
            pending_recovery: BTreeSet::new(),
            bus,
        }
    }

    /// 从持久化记录恢复；进程重启时中断的恢复视为未开始
    pub fn restore(&mut self, records: Vec<ModelHealthRecord>) {
        for mut record in records {
            record.in_recovery = false;
            record.recovery_stage = None;
            self.records.insert(record.model.clone(), record);
        }
    }

    fn entry(&mut self, model: &ModelKey) -> &mut ModelHealthRecord {
        self.records
            .entry(model.clone())
            .or_insert_with(|| ModelHealthRecord::new(model.clone()))
    }

    pub fn record_outcome(&mut self, model: &ModelKey, success: bool) -> HealthTransition {
        let threshold = self.corruption_threshold;
        let record = self.entry(model);
        if success {
            record.consecutive_failures = 0;
            return HealthTransition::Healthy;
        }

        record.consecutive_failures += 1;
        let failures = record.consecutive_failures;
        let eligible = !record.in_recovery && !record.unusable;
        if failures == threshold && eligible {
            tracing::warn!(model = %model, failures, "corruption threshold reached");
            self.pending_recovery.insert(model.clone());
            self.bus.publish(EngineEvent::CorruptionDetected {
                model: model.clone(),
                consecutive_failures: failures,
            });
            return HealthTransition::CorruptionDetected;
        }
        HealthTransition::Degraded {
            consecutive_failures: failures,
        }
    }

    pub fn threshold_reached(&self, model: &ModelKey) -> bool {
        self.records
            .get(model)
            .is_some_and(|r| r.consecutive_failures >= self.corruption_threshold)
    }

    /// 取出待恢复的模型（按 key 排序，确定性）
    pub fn take_pending_recoveries(&mut self) -> Vec<ModelKey> {
        std::mem::take(&mut self.pending_recovery).into_iter().collect()
    }

    pub fn begin_recovery(&mut self, model: &ModelKey) -> Result<(), EngineError> {
        if let Some(other) = self.recovering_model() {
            if &other != model {
                return Err(EngineError::RecoveryInProgress(other));
            }
        }
        let record = self.entry(model);
        record.in_recovery = true;
        record.recovery_stage = Some(RecoveryStage::Ejecting);
        tracing::info!(model = %model, "recovery initiated");
        self.bus.publish(EngineEvent::RecoveryStarted {
            model: model.clone(),
        });
        self.bus.publish(EngineEvent::RecoveryStageChanged {
            model: model.clone(),
            stage: RecoveryStage::Ejecting,
        });
        Ok(())
    }

    pub fn advance_stage(&mut self, model: &ModelKey, stage: RecoveryStage) {
        let record = self.entry(model);
        if !record.in_recovery {
            return;
        }
        record.recovery_stage = Some(stage);
        self.bus.publish(EngineEvent::RecoveryStageChanged {
            model: model.clone(),
            stage,
        });
    }

    pub fn complete_recovery(&mut self, model: &ModelKey, success: bool, reason: &str) {
        let record = self.entry(model);
        record.in_recovery = false;
        record.recovery_stage = None;
        if success {
            record.consecutive_failures = 0;
            record.recovery_attempts += 1;
            let attempts = record.recovery_attempts;
            tracing::info!(model = %model, attempts, "recovery completed");
            self.bus.publish(EngineEvent::RecoveryCompleted {
                model: model.clone(),
                recovery_attempts: attempts,
            });
        } else {
            record.unusable = true;
            tracing::error!(model = %model, reason, "recovery failed, model marked unusable");
            self.bus.publish(EngineEvent::RecoveryFailed {
                model: model.clone(),
                reason: reason.to_string(),
            });
        }
    }

    /// 人工重新配置后清除不可用标记
    pub fn reconfigure(&mut self, model: &ModelKey) {
        if let Some(record) = self.records.get_mut(model) {
            record.unusable = false;
            record.consecutive_failures = 0;
            self.pending_recovery.remove(model);
            self.bus.publish(EngineEvent::ModelReconfigured {
                model: model.clone(),
            });
        }
    }

    pub fn is_usable(&self, model: &ModelKey) -> bool {
        self.records.get(model).map_or(true, |r| !r.unusable)
    }

    /// 是否处于全局暂停（任一模型恢复中）
    pub fn is_paused(&self) -> bool {
        self.records.values().any(|r| r.in_recovery)
    }

    pub fn recovering_model(&self) -> Option<ModelKey> {
        self.records
            .values()
            .find(|r| r.in_recovery)
            .map(|r| r.model.clone())
    }

    pub fn record(&self, model: &ModelKey) -> Option<&ModelHealthRecord> {
        self.records.get(model)
    }

    pub fn records(&self) -> Vec<ModelHealthRecord> {
        self.records.values().cloned().collect()
    }

    pub fn corruption_threshold(&self) -> u32 {
        self.corruption_threshold
    }
}
