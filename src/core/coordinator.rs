//! 提交协调器：串行执行 提交 → 验证 状态机
//!
//! 一轮（round）从当前轮转位置开始执行提交步，直到处理完一个验证步为止：
//! - Aggregator batched：S1..SN 依次提交，V 一次裁决全部待验证提交
//! - Aggregator interleaved / Compiler：单个提交后立即验证
//!
//! 协调器是语料、计数器与健康记录的唯一写入方。每次外部调用之后，
//! 若有模型触达损坏阈值，立即在同一控制流中执行恢复，恢复期间不会派发任何任务。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::boost::{available_categories, BoostSource};
use crate::core::cleanup::{CleanupContext, CleanupReviewResult, CleanupReviewer};
use crate::core::decision::{parse_decisions, parse_submitter_output, SubmitterOutput, ValidatorDecision};
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventBus};
use crate::core::health::{ModelHealthMonitor, ModelKey};
use crate::core::prompts;
use crate::core::recovery::RecoveryEngine;
use crate::core::state::{CoordinatorPhase, EngineStats, EngineStatus, RecoveryStatus, SubmitterMetrics};
use crate::core::submission::{Submission, Submitter, Validator};
use crate::core::task_scheduler::{Role, RotationState, Step, Task, TaskScheduler, ValidationCadence, WorkflowMode};
use crate::llm::{ProviderConfig, ProviderRouter};
use crate::memory::{Corpus, StateStore};

/// 协调器参数
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub mode: WorkflowMode,
    pub cadence: ValidationCadence,
    /// 用户目标（所有角色共享的上下文）
    pub goal: String,
    pub rejection_backoff_threshold: u32,
    pub cleanup_interval: u64,
    pub lookahead: usize,
    pub recent_rejection_memory: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            mode: WorkflowMode::Aggregator,
            cadence: ValidationCadence::Batched,
            goal: String::new(),
            rejection_backoff_threshold: 5,
            cleanup_interval: 7,
            lookahead: 20,
            recent_rejection_memory: 5,
        }
    }
}

/// 一轮的执行结果
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// 本轮进入终态的提交
    pub submissions: Vec<Submission>,
    /// 本轮实际派发的任务（completed = true）
    pub tasks: Vec<Task>,
    /// 因模型不可用而跳过的任务 id
    pub blocked: Vec<String>,
    /// 调用失败的任务 id
    pub failed: Vec<String>,
    pub cleanup: Option<CleanupReviewResult>,
}

pub struct SubmissionCoordinator {
    settings: CoordinatorSettings,
    phase: CoordinatorPhase,
    rotation: RotationState,
    scheduler: TaskScheduler,
    router: ProviderRouter,
    health: ModelHealthMonitor,
    recovery: RecoveryEngine,
    cleanup: CleanupReviewer,
    submitters: BTreeMap<u32, Submitter>,
    validator: Validator,
    pending: Vec<Submission>,
    corpus: Corpus,
    stats: EngineStats,
    store: Arc<dyn StateStore>,
    bus: EventBus,
    current_task: Option<Task>,
    rounds_completed: u64,
    halted: Option<String>,
}

impl SubmissionCoordinator {
    /// 创建协调器并从存储恢复语料、健康记录、Boost 与统计
    pub fn new(
        settings: CoordinatorSettings,
        router: ProviderRouter,
        mut health: ModelHealthMonitor,
        recovery: RecoveryEngine,
        store: Arc<dyn StateStore>,
        bus: EventBus,
    ) -> Result<Self, EngineError> {
        let providers = router.providers().clone();
        let validator_config = providers
            .default_for(Role::Validator)
            .cloned()
            .ok_or_else(|| EngineError::Config("validator is not configured".to_string()))?;

        let proposers: Vec<(u32, ProviderConfig)> = match settings.mode {
            WorkflowMode::Aggregator => providers.submitters().map(|(id, cfg)| (id, cfg.clone())).collect(),
            WorkflowMode::Compiler => [Role::HighContext, Role::HighParam]
                .into_iter()
                .filter_map(|role| Some((role.submitter_id()?, providers.default_for(role)?.clone())))
                .collect(),
        };
        if proposers.is_empty() {
            return Err(EngineError::Config(format!(
                "no proposers configured for {} mode",
                settings.mode.as_str()
            )));
        }
        let submitters = proposers
            .into_iter()
            .map(|(id, cfg)| (id, Submitter::new(id, cfg, settings.recent_rejection_memory)))
            .collect();

        let submitter_ids = providers.submitter_ids();
        let rotation = RotationState::new(settings.mode, settings.cadence, &submitter_ids);

        let corpus = match store.load_corpus() {
            Ok(records) => Corpus::replay(records),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load corpus, starting empty");
                Corpus::new()
            }
        };
        match store.load_health() {
            Ok(records) => health.restore(records),
            Err(e) => tracing::warn!(error = %e, "failed to load health records"),
        }
        let stats = store.load_stats().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load stats");
            None
        });
        let stats = stats.unwrap_or_default();
        let mut cleanup = CleanupReviewer::new(settings.cleanup_interval);
        cleanup.restore(stats.cleanup_reviews_performed, stats.total_acceptances);

        tracing::info!(
            mode = settings.mode.as_str(),
            corpus = corpus.len(),
            acceptances = stats.total_acceptances,
            "coordinator initialised"
        );

        Ok(Self {
            scheduler: TaskScheduler::new(providers),
            settings,
            phase: CoordinatorPhase::Idle,
            rotation,
            router,
            health,
            recovery,
            cleanup,
            submitters,
            validator: Validator::new(validator_config),
            pending: Vec::new(),
            corpus,
            stats,
            store,
            bus,
            current_task: None,
            rounds_completed: 0,
            halted: None,
        })
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn health(&self) -> &ModelHealthMonitor {
        &self.health
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn submitter(&self, id: u32) -> Option<&Submitter> {
        self.submitters.get(&id)
    }

    pub fn rotation(&self) -> &RotationState {
        &self.rotation
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn mode(&self) -> WorkflowMode {
        self.settings.mode
    }

    fn set_phase(&mut self, phase: CoordinatorPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.bus.publish(EngineEvent::PhaseChanged { phase });
        }
    }

    /// 预测接下来的任务（不修改任何状态）
    pub fn predict(&self) -> Vec<Task> {
        if self.halted.is_some() {
            return Vec::new();
        }
        self.scheduler.predict(
            self.settings.mode,
            &self.rotation,
            self.router.boost().state(),
            self.settings.lookahead,
        )
    }

    pub fn status(&self, running: bool) -> EngineStatus {
        let backoff = &self.rotation.backoff;
        EngineStatus {
            running,
            mode: self.settings.mode.as_str().to_string(),
            phase: self.phase,
            rotation_position: self.rotation.position,
            rounds_completed: self.rounds_completed,
            stats: self.stats.clone(),
            acceptance_rate: self.stats.acceptance_rate(),
            corpus_size: self.corpus.len(),
            submitters: self
                .submitters
                .values()
                .map(|s| SubmitterMetrics::from_submitter(s, backoff.contains(&s.id)))
                .collect(),
            recovery: RecoveryStatus::from_records(self.health.records()),
            boost: self.router.boost().state().clone(),
            boost_categories: available_categories(self.settings.mode, &self.router.providers().submitter_ids()),
            current_task: self.current_task.clone(),
            lookahead: self.predict(),
            halted_reason: self.halted.clone(),
        }
    }

    /// 执行一轮；轮结束时不会留下 pending 提交
    pub async fn run_round(&mut self) -> Result<RoundReport, EngineError> {
        if self.halted.is_some() {
            return Err(EngineError::ModelUnusable(self.validator.provider.key()));
        }
        let mut report = RoundReport::default();
        for _ in 0..self.rotation.cycle_len() {
            let Some(step) = self.rotation.advance() else {
                break;
            };
            match step {
                Step::Propose { role, phase } => self.run_propose(role, phase, &mut report).await?,
                Step::Validate { phase } => {
                    self.run_validate(phase, &mut report).await?;
                    break;
                }
            }
        }

        self.rounds_completed += 1;
        self.check_usable_models();
        if self.halted.is_none() {
            self.set_phase(CoordinatorPhase::Idle);
        }
        tracing::info!(
            round = self.rounds_completed,
            decided = report.submissions.len(),
            acceptances = self.stats.total_acceptances,
            "round complete"
        );
        Ok(report)
    }

    async fn run_propose(&mut self, role: Role, phase: &str, report: &mut RoundReport) -> Result<(), EngineError> {
        let submitter_id = role.submitter_id().unwrap_or(1);
        if let Role::Submitter(id) = role {
            if self.rotation.backoff.remove(&id) {
                tracing::info!(submitter_id = id, "submitter skipped for back-off");
                self.bus.publish(EngineEvent::SubmitterSkipped { submitter_id: id });
                return Ok(());
            }
        }

        self.set_phase(CoordinatorPhase::AwaitingSubmission);
        let mut task = self.rotation.issue_task(role, phase);
        let provider = self.resolve_dispatch(&mut task)?;
        if !self.health.is_usable(&provider.key()) {
            self.block(&task, &provider, report);
            return Ok(());
        }

        let Some(submitter) = self.submitters.get(&submitter_id) else {
            return Err(EngineError::Config(format!("unknown submitter {submitter_id}")));
        };
        let request = self.router.request(
            task.role_label.clone(),
            prompts::submitter_system_prompt(&task.role_label, phase),
            prompts::submitter_prompt(&self.settings.goal, &self.corpus, Some(submitter)),
        );

        self.current_task = Some(task.clone());
        let outcome = self
            .router
            .execute(&mut self.health, &task, &provider, request, parse_submitter_output)
            .await;
        self.finish_task(task.clone(), report);
        self.persist_health();
        self.handle_pending_recoveries().await;

        let output = match outcome {
            Ok(outcome) => outcome.value,
            Err(_) => {
                report.failed.push(task.task_id);
                return Ok(());
            }
        };

        let Some(submitter) = self.submitters.get_mut(&submitter_id) else {
            return Ok(());
        };
        match output {
            SubmitterOutput::Propose { content, reasoning } => {
                let submission = Submission::new(submitter_id, task.task_id, content, reasoning);
                submitter.record_proposal();
                self.stats.total_submissions += 1;
                tracing::debug!(submitter_id, submission_id = %submission.id, "submission proposed");
                self.bus.publish(EngineEvent::SubmissionProposed {
                    submission_id: submission.id,
                    submitter_id,
                });
                self.pending.push(submission);
            }
            SubmitterOutput::Decline { reasoning } => {
                let mut submission = Submission::new(submitter_id, task.task_id, String::new(), reasoning.clone());
                submission.decline(reasoning.clone())?;
                submitter.record_decline();
                self.stats.total_declines += 1;
                self.bus.publish(EngineEvent::SubmissionDeclined {
                    submission_id: submission.id,
                    submitter_id,
                    reasoning,
                });
                report.submissions.push(submission);
                self.persist_stats();
            }
        }
        Ok(())
    }

    async fn run_validate(&mut self, phase: &str, report: &mut RoundReport) -> Result<(), EngineError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.set_phase(CoordinatorPhase::AwaitingValidation);
        let mut task = self.rotation.issue_task(Role::Validator, phase);
        let provider = self.resolve_dispatch(&mut task)?;
        if !self.health.is_usable(&provider.key()) {
            self.block(&task, &provider, report);
            self.resolve_pending(None, "validator unavailable", report)?;
            self.halt(provider.key(), "validator model is unusable until reconfigured");
            return Ok(());
        }

        let request = self.router.request(
            "Validator",
            prompts::validator_system_prompt(phase),
            prompts::validator_prompt(&self.settings.goal, &self.corpus, &self.pending),
        );
        self.current_task = Some(task.clone());
        let outcome = self
            .router
            .execute(&mut self.health, &task, &provider, request, |s| Ok(s.to_string()))
            .await;
        self.validator.total_validations += 1;
        self.finish_task(task.clone(), report);
        self.persist_health();
        self.handle_pending_recoveries().await;

        let expected = self.pending.len();
        let decisions = match outcome {
            Ok(outcome) => match parse_decisions(&outcome.value, expected) {
                Ok(decisions) => Some(decisions),
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, reason = %e.reason, preview = %e.preview, "unparseable validator output");
                    self.bus.publish(EngineEvent::ValidationParseWarning {
                        task_id: task.task_id.clone(),
                        reason: e.reason,
                    });
                    None
                }
            },
            Err(e) => {
                report.failed.push(task.task_id.clone());
                self.bus.publish(EngineEvent::ValidationParseWarning {
                    task_id: task.task_id.clone(),
                    reason: format!("validator call failed: {e}"),
                });
                None
            }
        };
        self.resolve_pending(decisions, "validator output could not be used", report)?;

        if self.cleanup.is_due(self.stats.total_acceptances) {
            report.cleanup = Some(self.run_cleanup().await);
        }
        Ok(())
    }

    /// 按裁决把所有待验证提交推进到终态；没有可用裁决时全部 decline
    fn resolve_pending(
        &mut self,
        decisions: Option<Vec<ValidatorDecision>>,
        fallback_reason: &str,
        report: &mut RoundReport,
    ) -> Result<(), EngineError> {
        let pending = std::mem::take(&mut self.pending);
        let mut decisions = decisions.map(Vec::into_iter);
        for mut submission in pending {
            let submitter_id = submission.submitter_id;
            let decision = decisions.as_mut().and_then(|d| d.next());
            match decision {
                Some(ValidatorDecision::Accept { reasoning }) => {
                    submission.accept(reasoning.clone())?;
                    let record = self.corpus.append(&submission);
                    if let Err(e) = self.store.append_corpus(&record) {
                        tracing::warn!(error = %e, "failed to persist accepted submission");
                    }
                    if let Some(s) = self.submitters.get_mut(&submitter_id) {
                        s.record_acceptance();
                    }
                    self.stats.total_acceptances += 1;
                    tracing::info!(submitter_id, total = self.stats.total_acceptances, "submission accepted");
                    self.bus.publish(EngineEvent::SubmissionAccepted {
                        submission_id: submission.id,
                        submitter_id,
                        reasoning,
                        total_acceptances: self.stats.total_acceptances,
                    });
                }
                Some(ValidatorDecision::Reject { reasoning, summary }) => {
                    submission.reject(reasoning.clone(), summary.clone())?;
                    self.stats.total_rejections += 1;
                    let streak = self
                        .submitters
                        .get_mut(&submitter_id)
                        .map_or(0, |s| s.record_rejection(&summary));
                    self.bus.publish(EngineEvent::SubmissionRejected {
                        submission_id: submission.id,
                        submitter_id,
                        reasoning,
                        summary,
                        consecutive_rejections: streak,
                    });
                    self.apply_backoff(submitter_id, streak);
                }
                None => {
                    submission.decline(fallback_reason)?;
                    if let Some(s) = self.submitters.get_mut(&submitter_id) {
                        s.record_decline();
                    }
                    self.stats.total_declines += 1;
                    self.bus.publish(EngineEvent::SubmissionDeclined {
                        submission_id: submission.id,
                        submitter_id,
                        reasoning: fallback_reason.to_string(),
                    });
                }
            }
            report.submissions.push(submission);
        }
        self.persist_stats();
        Ok(())
    }

    /// 连续拒绝超过阈值：下一次轮到时跳过一次，并清零连续计数
    fn apply_backoff(&mut self, submitter_id: u32, streak: u32) {
        if self.settings.mode != WorkflowMode::Aggregator || streak <= self.settings.rejection_backoff_threshold {
            return;
        }
        if let Some(s) = self.submitters.get_mut(&submitter_id) {
            s.reset_streak();
        }
        self.rotation.backoff.insert(submitter_id);
        tracing::info!(submitter_id, streak, "submitter entering back-off");
        self.bus.publish(EngineEvent::SubmitterBackoff {
            submitter_id,
            consecutive_rejections: streak,
        });
    }

    async fn run_cleanup(&mut self) -> CleanupReviewResult {
        let total_acceptances = self.stats.total_acceptances;
        let ctx = CleanupContext {
            goal: &self.settings.goal,
            corpus: &mut self.corpus,
            router: &mut self.router,
            health: &mut self.health,
            rotation: &mut self.rotation,
            store: self.store.as_ref(),
            bus: &self.bus,
        };
        let result = self.cleanup.review(total_acceptances, ctx).await;

        self.stats.cleanup_reviews_performed = self.cleanup.reviews_performed();
        if result.removal_proposed {
            self.stats.removals_proposed += 1;
        }
        if result.removal_executed {
            self.stats.removals_executed += 1;
        }
        self.persist_stats();
        self.handle_pending_recoveries().await;
        result
    }

    /// 解析派发模型；Boost 计数或显式开关被消耗时立即落盘
    fn resolve_dispatch(&mut self, task: &mut Task) -> Result<ProviderConfig, EngineError> {
        let provider = self.router.resolve_for_dispatch(task, &self.health)?;
        if matches!(task.boost_source, Some(BoostSource::NextCount | BoostSource::ExplicitToggle)) {
            self.persist_boost();
        }
        Ok(provider)
    }

    fn finish_task(&mut self, mut task: Task, report: &mut RoundReport) {
        self.current_task = None;
        task.completed = true;
        task.active = false;
        report.tasks.push(task);
    }

    fn block(&mut self, task: &Task, provider: &ProviderConfig, report: &mut RoundReport) {
        tracing::warn!(task_id = %task.task_id, model = %provider.key(), "task blocked: model unusable");
        self.bus.publish(EngineEvent::TaskBlocked {
            task_id: task.task_id.clone(),
            model: provider.key(),
        });
        report.blocked.push(task.task_id.clone());
    }

    fn halt(&mut self, model: ModelKey, reason: &str) {
        tracing::error!(model = %model, reason, "engine halted");
        self.halted = Some(reason.to_string());
        self.set_phase(CoordinatorPhase::Halted);
        self.bus.publish(EngineEvent::EngineHalted {
            model,
            reason: reason.to_string(),
        });
    }

    /// 验证者不可用，或全部提交者的默认模型都不可用时停机
    fn check_usable_models(&mut self) {
        if self.halted.is_some() {
            return;
        }
        let validator = self.validator.provider.key();
        if !self.health.is_usable(&validator) {
            self.halt(validator, "validator model is unusable until reconfigured");
            return;
        }
        let all_unusable = self
            .submitters
            .values()
            .all(|s| !self.health.is_usable(&s.provider.key()));
        if all_unusable {
            if let Some(model) = self.submitters.values().next().map(|s| s.provider.key()) {
                self.halt(model, "all proposer models are unusable until reconfigured");
            }
        }
    }

    /// 执行所有待恢复模型的恢复流程（期间全局暂停）
    async fn handle_pending_recoveries(&mut self) {
        let models = self.health.take_pending_recoveries();
        if models.is_empty() {
            return;
        }
        let previous = self.phase;
        self.set_phase(CoordinatorPhase::Recovering);
        for model in models {
            if let Err(e) = self.recovery.recover(&model, &self.router, &mut self.health).await {
                tracing::error!(model = %model, error = %e, "model recovery failed");
            }
        }
        self.persist_health();
        self.set_phase(previous);
    }

    fn persist_stats(&self) {
        if let Err(e) = self.store.save_stats(&self.stats) {
            tracing::warn!(error = %e, "failed to persist stats");
        }
    }

    fn persist_health(&self) {
        if let Err(e) = self.store.save_health(&self.health.records()) {
            tracing::warn!(error = %e, "failed to persist health records");
        }
    }

    fn persist_boost(&self) {
        if let Err(e) = self.store.save_boost(self.router.boost().state()) {
            tracing::warn!(error = %e, "failed to persist boost state");
        }
    }

    /// 整体落盘（停止时调用；各项状态在变更时已分别写入）
    pub fn flush(&self) {
        self.persist_health();
        self.persist_boost();
        self.persist_stats();
    }

    pub fn set_boost_next_count(&mut self, count: u32) {
        self.router.boost_mut().set_next_count(count);
        self.persist_boost();
    }

    pub fn toggle_category_boost(&mut self, category: &str) -> bool {
        let boosted = self.router.boost_mut().toggle_category(category);
        self.persist_boost();
        boosted
    }

    pub fn toggle_task_boost(&mut self, task_id: &str) -> bool {
        let boosted = self.router.boost_mut().toggle_task(task_id);
        self.persist_boost();
        boosted
    }

    pub fn set_boost_config(&mut self, settings: crate::core::boost::BoostSettings) {
        self.router.boost_mut().set_config(settings);
        self.persist_boost();
    }

    pub fn clear_boost(&mut self) {
        self.router.boost_mut().clear();
        self.persist_boost();
    }

    /// 人工重新配置模型：清除不可用标记，可选替换为新的配置，并解除停机
    pub fn reconfigure_model(&mut self, model: &ModelKey, replacement: Option<ProviderConfig>) {
        self.health.reconfigure(model);
        if let Some(replacement) = replacement {
            let replaced = self.router.providers_mut().replace_model(model, &replacement);
            for submitter in self.submitters.values_mut() {
                if &submitter.provider.key() == model {
                    submitter.provider = replacement.clone();
                }
            }
            if &self.validator.provider.key() == model {
                self.validator.provider = replacement.clone();
            }
            self.scheduler = TaskScheduler::new(self.router.providers().clone());
            tracing::info!(model = %model, replacement = %replacement.key(), replaced, "model replaced");
        }
        self.persist_health();

        let validator_ok = self.health.is_usable(&self.validator.provider.key());
        let proposer_ok = self
            .submitters
            .values()
            .any(|s| self.health.is_usable(&s.provider.key()));
        if self.halted.is_some() && validator_ok && proposer_ok {
            tracing::info!("engine halt cleared");
            self.halted = None;
            self.set_phase(CoordinatorPhase::Idle);
        }
    }
}
