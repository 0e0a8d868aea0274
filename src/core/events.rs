//! 引擎事件总线：有界历史 + 实时扇出
//!
//! 每次状态迁移发布一次 EngineEvent；历史保存在固定容量的环形缓冲区（最旧的先淘汰），
//! 订阅者各自持有一个无界通道，按发布顺序收到与自身过滤器匹配的事件。
//! 发布方从不等待订阅者；已关闭的订阅在下一次发布时被清理。

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::cleanup::CleanupReviewResult;
use crate::core::health::{ModelKey, RecoveryStage};
use crate::core::state::CoordinatorPhase;

/// 事件大类，用于粗粒度订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Engine,
    Submission,
    Provider,
    Health,
    Boost,
    Cleanup,
}

/// 引擎事件（可序列化为 JSON 供 WebSocket / SSE 适配层转发）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineStarted { mode: String },
    EngineStopped { reason: String },
    /// 验证者或全部提交者不可用，引擎停止派发
    EngineHalted { model: ModelKey, reason: String },
    PhaseChanged { phase: CoordinatorPhase },
    TaskDispatched {
        task_id: String,
        role: String,
        model: ModelKey,
        using_boost: bool,
    },
    /// 任务所需模型已被标记为不可用，跳过
    TaskBlocked { task_id: String, model: ModelKey },
    SubmissionProposed { submission_id: uuid::Uuid, submitter_id: u32 },
    SubmissionAccepted {
        submission_id: uuid::Uuid,
        submitter_id: u32,
        reasoning: String,
        total_acceptances: u64,
    },
    SubmissionRejected {
        submission_id: uuid::Uuid,
        submitter_id: u32,
        reasoning: String,
        summary: String,
        consecutive_rejections: u32,
    },
    SubmissionDeclined {
        submission_id: uuid::Uuid,
        submitter_id: u32,
        reasoning: String,
    },
    /// 连续被拒超过阈值，下一轮跳过
    SubmitterBackoff { submitter_id: u32, consecutive_rejections: u32 },
    SubmitterSkipped { submitter_id: u32 },
    ValidationParseWarning { task_id: String, reason: String },
    AgentCallFailed {
        task_id: String,
        model: ModelKey,
        kind: String,
        message: String,
    },
    ProviderFallback {
        task_id: String,
        from: ModelKey,
        to: ModelKey,
        reason: String,
    },
    CorruptionDetected { model: ModelKey, consecutive_failures: u32 },
    RecoveryStarted { model: ModelKey },
    RecoveryStageChanged { model: ModelKey, stage: RecoveryStage },
    RecoveryCompleted { model: ModelKey, recovery_attempts: u32 },
    /// 持久告警：需要人工重新配置
    RecoveryFailed { model: ModelKey, reason: String },
    ModelReconfigured { model: ModelKey },
    BoostEnabled { model_id: String, provider: String },
    BoostDisabled,
    BoostNextCountUpdated { count: u32 },
    CategoryBoostToggled { category: String, boosted: bool },
    TaskBoostToggled { task_id: String, boosted: bool },
    /// Boost 模型不可用，本任务改用角色默认模型，Boost 余量不变
    BoostBypassed { task_id: String, model: ModelKey },
    CleanupReviewStarted { review_number: u64, accepted_count: usize },
    CleanupRemovalProposed {
        review_number: u64,
        submission_id: uuid::Uuid,
        reasoning: String,
    },
    CleanupReviewCompleted { result: CleanupReviewResult },
}

impl EngineEvent {
    /// 事件名（与序列化后的 `type` 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EngineStarted { .. } => "engine_started",
            Self::EngineStopped { .. } => "engine_stopped",
            Self::EngineHalted { .. } => "engine_halted",
            Self::PhaseChanged { .. } => "phase_changed",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskBlocked { .. } => "task_blocked",
            Self::SubmissionProposed { .. } => "submission_proposed",
            Self::SubmissionAccepted { .. } => "submission_accepted",
            Self::SubmissionRejected { .. } => "submission_rejected",
            Self::SubmissionDeclined { .. } => "submission_declined",
            Self::SubmitterBackoff { .. } => "submitter_backoff",
            Self::SubmitterSkipped { .. } => "submitter_skipped",
            Self::ValidationParseWarning { .. } => "validation_parse_warning",
            Self::AgentCallFailed { .. } => "agent_call_failed",
            Self::ProviderFallback { .. } => "provider_fallback",
            Self::CorruptionDetected { .. } => "corruption_detected",
            Self::RecoveryStarted { .. } => "recovery_started",
            Self::RecoveryStageChanged { .. } => "recovery_stage_changed",
            Self::RecoveryCompleted { .. } => "recovery_completed",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::ModelReconfigured { .. } => "model_reconfigured",
            Self::BoostEnabled { .. } => "boost_enabled",
            Self::BoostDisabled => "boost_disabled",
            Self::BoostNextCountUpdated { .. } => "boost_next_count_updated",
            Self::CategoryBoostToggled { .. } => "category_boost_toggled",
            Self::TaskBoostToggled { .. } => "task_boost_toggled",
            Self::BoostBypassed { .. } => "boost_bypassed",
            Self::CleanupReviewStarted { .. } => "cleanup_review_started",
            Self::CleanupRemovalProposed { .. } => "cleanup_removal_proposed",
            Self::CleanupReviewCompleted { .. } => "cleanup_review_completed",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            Self::EngineStarted { .. }
            | Self::EngineStopped { .. }
            | Self::EngineHalted { .. }
            | Self::PhaseChanged { .. } => EventCategory::Engine,
            Self::TaskDispatched { .. }
            | Self::TaskBlocked { .. }
            | Self::AgentCallFailed { .. }
            | Self::ProviderFallback { .. } => EventCategory::Provider,
            Self::SubmissionProposed { .. }
            | Self::SubmissionAccepted { .. }
            | Self::SubmissionRejected { .. }
            | Self::SubmissionDeclined { .. }
            | Self::SubmitterBackoff { .. }
            | Self::SubmitterSkipped { .. }
            | Self::ValidationParseWarning { .. } => EventCategory::Submission,
            Self::CorruptionDetected { .. }
            | Self::RecoveryStarted { .. }
            | Self::RecoveryStageChanged { .. }
            | Self::RecoveryCompleted { .. }
            | Self::RecoveryFailed { .. }
            | Self::ModelReconfigured { .. } => EventCategory::Health,
            Self::BoostEnabled { .. }
            | Self::BoostDisabled
            | Self::BoostNextCountUpdated { .. }
            | Self::CategoryBoostToggled { .. }
            | Self::TaskBoostToggled { .. }
            | Self::BoostBypassed { .. } => EventCategory::Boost,
            Self::CleanupReviewStarted { .. }
            | Self::CleanupRemovalProposed { .. }
            | Self::CleanupReviewCompleted { .. } => EventCategory::Cleanup,
        }
    }
}

/// 带序号与时间戳的事件记录
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// 订阅过滤器：按大类或事件名匹配；两者都为空时匹配全部
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    categories: HashSet<EventCategory>,
    kinds: HashSet<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn categories(categories: impl IntoIterator<Item = EventCategory>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
            kinds: HashSet::new(),
        }
    }

    pub fn kinds<S: Into<String>>(kinds: impl IntoIterator<Item = S>) -> Self {
        Self {
            categories: HashSet::new(),
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, event: &EngineEvent) -> bool {
        if self.categories.is_empty() && self.kinds.is_empty() {
            return true;
        }
        self.categories.contains(&event.category()) || self.kinds.contains(event.kind())
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<EventRecord>,
}

struct BusInner {
    history: VecDeque<EventRecord>,
    capacity: usize,
    next_seq: u64,
    subscribers: Vec<Subscriber>,
}

/// 事件总线（Clone 共享同一份内部状态）
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                history: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                next_seq: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 追加到历史并扇出；在同一把锁内完成，保证所有订阅者看到一致的发布顺序
    pub fn publish(&self, event: EngineEvent) -> u64 {
        let mut inner = self.lock();
        let record = EventRecord {
            seq: inner.next_seq,
            timestamp: Utc::now(),
            event,
        };
        inner.next_seq += 1;

        if inner.history.len() == inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record.clone());

        inner.subscribers.retain(|sub| {
            if !sub.filter.matches(&record.event) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(record.clone()).is_ok()
        });

        tracing::debug!(seq = record.seq, kind = record.event.kind(), "event published");
        record.seq
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(Subscriber { filter, tx });
        EventSubscription { rx }
    }

    /// 当前保留的历史（从旧到新）
    pub fn history(&self) -> Vec<EventRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// 最近 n 条历史
    pub fn recent(&self, n: usize) -> Vec<EventRecord> {
        let inner = self.lock();
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(500)
    }
}

/// 单个订阅者的接收端；既可 `recv().await`，也可作为 Stream 使用
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EventRecord>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventRecord> {
        self.rx.try_recv().ok()
    }

    /// 取出当前已到达的全部事件
    pub fn drain(&mut self) -> Vec<EventRecord> {
        let mut out = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            out.push(record);
        }
        out
    }
}

impl Stream for EventSubscription {
    type Item = EventRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn count(n: u32) -> EngineEvent {
        EngineEvent::BoostNextCountUpdated { count: n }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(count(i));
        }
        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].seq, 2);
        assert_eq!(history[2].event, count(4));
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe(EventFilter::all());
        for i in 0..4 {
            bus.publish(count(i));
        }
        let seqs: Vec<u64> = sub.drain().into_iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_filter_by_category_and_kind() {
        let bus = EventBus::new(10);
        let mut boost_only = bus.subscribe(EventFilter::categories([EventCategory::Boost]));
        let mut stopped_only = bus.subscribe(EventFilter::kinds(["engine_stopped"]));

        bus.publish(EngineEvent::BoostDisabled);
        bus.publish(EngineEvent::EngineStopped {
            reason: "user".into(),
        });
        bus.publish(count(1));

        let boost: Vec<_> = boost_only.drain().into_iter().map(|r| r.event.kind()).collect();
        assert_eq!(boost, vec!["boost_disabled", "boost_next_count_updated"]);
        let stopped = stopped_only.drain();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].event.kind(), "engine_stopped");
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new(10);
        let sub = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(count(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe(EventFilter::all());
        bus.publish(count(7));
        let record = sub.next().await.unwrap();
        assert_eq!(record.event, count(7));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(count(3)).unwrap();
        assert_eq!(json["type"], "boost_next_count_updated");
        assert_eq!(json["count"], 3);
    }
}
