//! 清理审查：每累计 K 次接受触发一次，由验证者复查语料并至多移除一条
//!
//! 两阶段：验证者先提议（带编号与理由），再对该条目单独确认；只有确认通过才移除。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::boost::BoostSource;
use crate::core::decision::{parse_cleanup_proposal, parse_removal_confirmation};
use crate::core::error::ValidationParseError;
use crate::core::events::{EngineEvent, EventBus};
use crate::core::health::ModelHealthMonitor;
use crate::core::prompts;
use crate::core::task_scheduler::{Role, RotationState};
use crate::llm::ProviderRouter;
use crate::memory::{Corpus, StateStore};

/// 一次清理审查的结果
///
/// 受影响的条目最多一个，由 `affected_submission_id` 的 Option 类型保证。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReviewResult {
    pub review_number: u64,
    pub accepted_count: usize,
    pub removal_proposed: bool,
    pub removal_executed: bool,
    pub affected_submission_id: Option<Uuid>,
    /// 被提议移除的条目编号
    pub proposed_number: Option<u64>,
    pub reason: Option<String>,
}

impl CleanupReviewResult {
    fn new(review_number: u64, accepted_count: usize) -> Self {
        Self {
            review_number,
            accepted_count,
            removal_proposed: false,
            removal_executed: false,
            affected_submission_id: None,
            proposed_number: None,
            reason: None,
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// 清理审查所需的引擎状态（均由控制循环借出）
pub struct CleanupContext<'a> {
    pub goal: &'a str,
    pub corpus: &'a mut Corpus,
    pub router: &'a mut ProviderRouter,
    pub health: &'a mut ModelHealthMonitor,
    pub rotation: &'a mut RotationState,
    pub store: &'a dyn StateStore,
    pub bus: &'a EventBus,
}

#[derive(Debug)]
pub struct CleanupReviewer {
    interval: u64,
    reviews_performed: u64,
    /// 上一次审查时的接受总数
    last_trigger: u64,
}

impl CleanupReviewer {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            reviews_performed: 0,
            last_trigger: 0,
        }
    }

    /// 从持久化的统计恢复计数
    pub fn restore(&mut self, reviews_performed: u64, total_acceptances: u64) {
        self.reviews_performed = reviews_performed;
        self.last_trigger = total_acceptances - total_acceptances % self.interval;
    }

    pub fn reviews_performed(&self) -> u64 {
        self.reviews_performed
    }

    /// 接受总数跨过 K 的整数倍时触发（批量验证一次可能接受多条）
    pub fn is_due(&self, total_acceptances: u64) -> bool {
        total_acceptances / self.interval > self.last_trigger / self.interval
    }

    pub async fn review(&mut self, total_acceptances: u64, mut ctx: CleanupContext<'_>) -> CleanupReviewResult {
        self.last_trigger = total_acceptances;
        self.reviews_performed += 1;
        let review_number = self.reviews_performed;
        let accepted_count = ctx.corpus.len();

        tracing::info!(review_number, total_acceptances, accepted_count, "starting cleanup review");
        ctx.bus.publish(EngineEvent::CleanupReviewStarted {
            review_number,
            accepted_count,
        });

        let result = self.run(CleanupReviewResult::new(review_number, accepted_count), &mut ctx).await;

        tracing::info!(
            review_number,
            proposed = result.removal_proposed,
            executed = result.removal_executed,
            "cleanup review complete"
        );
        ctx.bus.publish(EngineEvent::CleanupReviewCompleted { result: result.clone() });
        result
    }

    async fn run(&self, mut result: CleanupReviewResult, ctx: &mut CleanupContext<'_>) -> CleanupReviewResult {
        if ctx.corpus.is_empty() {
            return result.with_reason("nothing to review");
        }

        let system = prompts::cleanup_system_prompt();
        let prompt = prompts::cleanup_prompt(ctx.goal, ctx.corpus);
        let Some(proposal) = call_validator(ctx, "Cleanup Review", system, prompt, parse_cleanup_proposal).await else {
            return result.with_reason("cleanup review call failed");
        };
        let Some(number) = proposal.submission_number.filter(|_| proposal.should_remove) else {
            return result.with_reason("no removal needed");
        };

        result.removal_proposed = true;
        result.proposed_number = Some(number);
        let Some(entry) = ctx.corpus.get(number).cloned() else {
            tracing::warn!(number, "cleanup proposed a submission that does not exist");
            return result.with_reason("submission not found");
        };
        ctx.bus.publish(EngineEvent::CleanupRemovalProposed {
            review_number: result.review_number,
            submission_id: entry.submission_id,
            reasoning: proposal.reasoning.chars().take(500).collect(),
        });

        let system = prompts::removal_system_prompt();
        let prompt = prompts::removal_prompt(ctx.goal, number, &entry.content, &proposal.reasoning);
        let confirmed = call_validator(ctx, "Removal Confirmation", system, prompt, parse_removal_confirmation)
            .await
            .unwrap_or(false);
        if !confirmed {
            return result.with_reason("removal not confirmed");
        }

        if let Some((removed, tombstone)) = ctx.corpus.remove(number) {
            if let Err(e) = ctx.store.append_corpus(&tombstone) {
                tracing::warn!(error = %e, "failed to persist corpus removal");
            }
            tracing::info!(number, submission_id = %removed.submission_id, "removed submission from corpus");
            result.removal_executed = true;
            result.affected_submission_id = Some(removed.submission_id);
        }
        result
    }
}

/// 以验证者身份派发一次清理相关调用；调用或解析失败返回 None
async fn call_validator<T>(
    ctx: &mut CleanupContext<'_>,
    phase: &str,
    system: String,
    prompt: String,
    parse: fn(&str) -> Result<T, ValidationParseError>,
) -> Option<T> {
    let mut task = ctx.rotation.issue_task(Role::Validator, phase);
    let provider = match ctx.router.resolve_for_dispatch(&mut task, ctx.health) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!(error = %e, "cannot resolve validator for cleanup");
            return None;
        }
    };
    if matches!(task.boost_source, Some(BoostSource::NextCount | BoostSource::ExplicitToggle)) {
        if let Err(e) = ctx.store.save_boost(ctx.router.boost().state()) {
            tracing::warn!(error = %e, "failed to persist boost state");
        }
    }
    if !ctx.health.is_usable(&provider.key()) {
        ctx.bus.publish(EngineEvent::TaskBlocked {
            task_id: task.task_id.clone(),
            model: provider.key(),
        });
        return None;
    }

    let request = ctx.router.request(phase, system, prompt);
    let outcome = ctx
        .router
        .execute(ctx.health, &task, &provider, request, |s| Ok(s.to_string()))
        .await;
    if let Err(e) = ctx.store.save_health(&ctx.health.records()) {
        tracing::warn!(error = %e, "failed to persist health records");
    }
    let raw = outcome.ok()?.value;
    match parse(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(task_id = %task.task_id, reason = %e.reason, "unparseable cleanup output");
            ctx.bus.publish(EngineEvent::ValidationParseWarning {
                task_id: task.task_id,
                reason: e.reason,
            });
            None
        }
    }
}
