//! 任务调度：按模式生成确定性的轮转周期，并预测接下来的 N 个任务（含 Boost 叠加）
//!
//! - Aggregator（batched）：S1 → S2 → … → SN → V，循环
//! - Aggregator（interleaved）：S1 → V → S2 → V → …，循环
//! - Compiler：High-Context / High-Param 与 Validator 交替，16 步一个周期
//!
//! 预测是纯函数：只读取 RotationState 与 BoostState，不修改协调器状态。
//! 任务 id 由各类别的序号计数器生成，计数器只在真正派发时递增，
//! 因此预测出的 id 与之后实际派发的 id 一致，单任务 Boost 开关可以精确命中。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::boost::{BoostSource, BoostState};
use crate::core::health::ModelKey;
use crate::llm::RoleProviders;

/// 工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    Aggregator,
    Compiler,
}

impl WorkflowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregator => "aggregator",
            Self::Compiler => "compiler",
        }
    }
}

/// Aggregator 模式下验证的节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCadence {
    /// 所有提交者依次提交后，验证者一次性逐条裁决
    #[default]
    Batched,
    /// 每个提交后立即验证
    Interleaved,
}

/// Agent 角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Role {
    Submitter(u32),
    HighContext,
    HighParam,
    Validator,
}

impl Role {
    /// 提交角色对应的提交者 id；Compiler 模式下 High-Context 为 1，High-Param 为 2
    pub fn submitter_id(&self) -> Option<u32> {
        match self {
            Self::Submitter(id) => Some(*id),
            Self::HighContext => Some(1),
            Self::HighParam => Some(2),
            Self::Validator => None,
        }
    }

    pub fn category(&self, mode: WorkflowMode) -> String {
        match (mode, self) {
            (_, Self::Submitter(id)) => format!("agg_sub{id}"),
            (_, Self::HighContext) => "comp_hc".to_string(),
            (_, Self::HighParam) => "comp_hp".to_string(),
            (WorkflowMode::Aggregator, Self::Validator) => "agg_val".to_string(),
            (WorkflowMode::Compiler, Self::Validator) => "comp_val".to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitter(id) => write!(f, "Submitter {id}"),
            Self::HighContext => write!(f, "High-Context"),
            Self::HighParam => write!(f, "High-Param"),
            Self::Validator => write!(f, "Validator"),
        }
    }
}

/// 周期中的一步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Propose { role: Role, phase: &'static str },
    Validate { phase: &'static str },
}

const COMPILER_CYCLE: [(Role, &str, &str); 8] = [
    (Role::HighContext, "Construction", "Construction Review"),
    (Role::HighContext, "Construction", "Construction Review"),
    (Role::HighContext, "Construction", "Construction Review"),
    (Role::HighContext, "Construction", "Construction Review"),
    (Role::HighContext, "Outline Update", "Outline Review"),
    (Role::HighContext, "Paper Review", "Review Validation"),
    (Role::HighContext, "Paper Review", "Review Validation"),
    (Role::HighParam, "Rigor Enhancement", "Rigor Review"),
];

/// 按模式构造固定周期
pub fn build_cycle(mode: WorkflowMode, cadence: ValidationCadence, submitter_ids: &[u32]) -> Vec<Step> {
    match mode {
        WorkflowMode::Aggregator => {
            let propose = |id: u32| Step::Propose {
                role: Role::Submitter(id),
                phase: "Aggregation",
            };
            let validate = Step::Validate { phase: "Validation" };
            match cadence {
                ValidationCadence::Batched => {
                    if submitter_ids.is_empty() {
                        return Vec::new();
                    }
                    let mut cycle: Vec<Step> = submitter_ids.iter().copied().map(propose).collect();
                    cycle.push(validate);
                    cycle
                }
                ValidationCadence::Interleaved => submitter_ids
                    .iter()
                    .flat_map(|&id| [propose(id), validate])
                    .collect(),
            }
        }
        WorkflowMode::Compiler => COMPILER_CYCLE
            .iter()
            .flat_map(|&(role, phase, review)| {
                [Step::Propose { role, phase }, Step::Validate { phase: review }]
            })
            .collect(),
    }
}

pub fn format_task_id(category: &str, seq: u64) -> String {
    format!("{category}_{seq:03}")
}

/// 一个（预测的或正在执行的）任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub task_id: String,
    pub sequence_number: u64,
    pub role: Role,
    pub role_label: String,
    pub category: String,
    pub mode: String,
    pub provider: Option<ModelKey>,
    pub using_boost: bool,
    pub boost_source: Option<BoostSource>,
    pub completed: bool,
    pub active: bool,
}

/// 协调器的轮转位置（由协调器独占写，调度器只读）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationState {
    pub mode: WorkflowMode,
    pub cycle: Vec<Step>,
    /// 下一步在 cycle 中的下标
    pub position: usize,
    /// 每个类别下一次派发的序号
    pub role_sequences: BTreeMap<String, u64>,
    /// 已派发任务总数（用于显示序号）
    pub dispatched: u64,
    /// 下一次轮到时需要跳过的提交者
    pub backoff: BTreeSet<u32>,
}

impl RotationState {
    pub fn new(mode: WorkflowMode, cadence: ValidationCadence, submitter_ids: &[u32]) -> Self {
        Self {
            mode,
            cycle: build_cycle(mode, cadence, submitter_ids),
            position: 0,
            role_sequences: BTreeMap::new(),
            dispatched: 0,
            backoff: BTreeSet::new(),
        }
    }

    pub fn peek(&self) -> Option<Step> {
        self.cycle.get(self.position).copied()
    }

    /// 取出当前步并前进
    pub fn advance(&mut self) -> Option<Step> {
        let step = self.peek()?;
        self.position = (self.position + 1) % self.cycle.len();
        Some(step)
    }

    /// 下一个该类别任务会拿到的 id
    pub fn next_task_id(&self, category: &str) -> String {
        format_task_id(category, self.role_sequences.get(category).copied().unwrap_or(0))
    }

    /// 为实际派发分配任务：递增该类别序号与全局序号
    pub fn issue_task(&mut self, role: Role, phase: &str) -> Task {
        let category = role.category(self.mode);
        let seq = self.role_sequences.entry(category.clone()).or_insert(0);
        let task_id = format_task_id(&category, *seq);
        *seq += 1;
        self.dispatched += 1;
        Task {
            task_id,
            sequence_number: self.dispatched,
            role,
            role_label: role.to_string(),
            category,
            mode: phase.to_string(),
            provider: None,
            using_boost: false,
            boost_source: None,
            completed: false,
            active: true,
        }
    }

    pub fn cycle_len(&self) -> usize {
        self.cycle.len()
    }
}

/// 任务预测器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    providers: RoleProviders,
}

impl TaskScheduler {
    pub fn new(providers: RoleProviders) -> Self {
        Self { providers }
    }

    /// 预测接下来的 `lookahead` 个任务
    ///
    /// 退避中的提交者跳过一次；一段提交之后若没有待验证内容则不预测验证任务。
    /// Boost 叠加顺序：显式开关 > 剩余计数（按预测顺序依次分配，不扣减真实计数）> 类别。
    pub fn predict(
        &self,
        mode: WorkflowMode,
        rotation: &RotationState,
        boost: &BoostState,
        lookahead: usize,
    ) -> Vec<Task> {
        if rotation.cycle.is_empty() || lookahead == 0 {
            return Vec::new();
        }

        let mut tasks = Vec::with_capacity(lookahead);
        let mut position = rotation.position % rotation.cycle.len();
        let mut sequences = rotation.role_sequences.clone();
        let mut backoff = rotation.backoff.clone();
        let mut sequence_number = rotation.dispatched;
        let mut remaining_count = boost.boost_next_count;
        let mut pending_proposals = 0usize;
        let max_steps = rotation.cycle.len() * (lookahead + 2);

        for _ in 0..max_steps {
            if tasks.len() >= lookahead {
                break;
            }
            let step = rotation.cycle[position];
            position = (position + 1) % rotation.cycle.len();

            let (role, phase) = match step {
                Step::Propose { role, phase } => {
                    if let Role::Submitter(id) = role {
                        if backoff.remove(&id) {
                            continue;
                        }
                    }
                    pending_proposals += 1;
                    (role, phase)
                }
                Step::Validate { phase } => {
                    if pending_proposals == 0 {
                        continue;
                    }
                    pending_proposals = 0;
                    (Role::Validator, phase)
                }
            };

            let category = role.category(mode);
            let seq = sequences.entry(category.clone()).or_insert(0);
            let task_id = format_task_id(&category, *seq);
            *seq += 1;
            sequence_number += 1;

            let boost_source = boost.source_for(&task_id, &category, remaining_count > 0);
            if boost_source == Some(BoostSource::NextCount) {
                remaining_count -= 1;
            }
            let provider = match boost_source {
                Some(_) => boost.provider_config().map(|p| p.key()),
                None => self.providers.default_for(role).map(|p| p.key()),
            };

            tasks.push(Task {
                task_id,
                sequence_number,
                role,
                role_label: role.to_string(),
                category,
                mode: phase.to_string(),
                provider,
                using_boost: boost_source.is_some(),
                boost_source,
                completed: false,
                active: false,
            });
        }

        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::boost::BoostSettings;
    use crate::llm::ProviderConfig;

    fn providers(n: u32) -> RoleProviders {
        RoleProviders::aggregator(
            (1..=n).map(|i| (i, ProviderConfig::local(format!("sub{i}")))).collect(),
            ProviderConfig::local("val"),
        )
    }

    fn labels(tasks: &[Task]) -> Vec<String> {
        tasks.iter().map(|t| t.role_label.clone()).collect()
    }

    fn boost_enabled() -> BoostState {
        BoostState {
            settings: Some(BoostSettings::new("cloud/big")),
            ..BoostState::default()
        }
    }

    #[test]
    fn test_aggregator_batched_cycle_for_any_n() {
        for n in 1..=6u32 {
            let ids: Vec<u32> = (1..=n).collect();
            let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &ids);
            let scheduler = TaskScheduler::new(providers(n));
            let lookahead = (n as usize + 1) * 3;
            let tasks = scheduler.predict(WorkflowMode::Aggregator, &rotation, &BoostState::default(), lookahead);

            let mut expected = Vec::new();
            for _ in 0..3 {
                for i in 1..=n {
                    expected.push(format!("Submitter {i}"));
                }
                expected.push("Validator".to_string());
            }
            assert_eq!(labels(&tasks), expected, "n = {n}");
            assert!(tasks.iter().all(|t| !t.using_boost));
        }
    }

    #[test]
    fn test_task_ids_use_per_category_counters() {
        let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &[1, 2]);
        let tasks = TaskScheduler::new(providers(2)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            6,
        );
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["agg_sub1_000", "agg_sub2_000", "agg_val_000", "agg_sub1_001", "agg_sub2_001", "agg_val_001"]
        );
        let seqs: Vec<_> = tasks.iter().map(|t| t.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_interleaved_cycle() {
        let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Interleaved, &[1, 2]);
        let tasks = TaskScheduler::new(providers(2)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            5,
        );
        assert_eq!(
            labels(&tasks),
            vec!["Submitter 1", "Validator", "Submitter 2", "Validator", "Submitter 1"]
        );
    }

    #[test]
    fn test_compiler_cycle_alternates_with_validator() {
        let rotation = RotationState::new(WorkflowMode::Compiler, ValidationCadence::Batched, &[]);
        let scheduler = TaskScheduler::new(RoleProviders::compiler(
            ProviderConfig::local("hc"),
            None,
            ProviderConfig::local("val"),
        ));
        let tasks = scheduler.predict(WorkflowMode::Compiler, &rotation, &BoostState::default(), 20);
        assert_eq!(tasks.len(), 20);
        for (i, task) in tasks.iter().enumerate() {
            if i % 2 == 1 {
                assert_eq!(task.role, Role::Validator);
                assert_eq!(task.category, "comp_val");
            }
        }
        assert_eq!(tasks[14].role, Role::HighParam);
        assert_eq!(tasks[14].mode, "Rigor Enhancement");
        // High-Param 未配置时沿用 High-Context 的模型
        assert_eq!(tasks[14].provider, Some(ModelKey::new("lm_studio", "hc")));
        assert_eq!(tasks[16].mode, "Construction");
    }

    #[test]
    fn test_prediction_starts_at_rotation_position() {
        let mut rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &[1, 2, 3]);
        rotation.advance();
        let t = rotation.issue_task(Role::Submitter(1), "Aggregation");
        assert_eq!(t.task_id, "agg_sub1_000");
        let tasks = TaskScheduler::new(providers(3)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            4,
        );
        assert_eq!(labels(&tasks), vec!["Submitter 2", "Submitter 3", "Validator", "Submitter 1"]);
        assert_eq!(tasks[3].task_id, "agg_sub1_001");
        assert_eq!(tasks[0].sequence_number, 2);
    }

    #[test]
    fn test_backoff_skips_one_cycle() {
        let mut rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &[1, 2]);
        rotation.backoff.insert(1);
        let tasks = TaskScheduler::new(providers(2)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            5,
        );
        assert_eq!(
            labels(&tasks),
            vec!["Submitter 2", "Validator", "Submitter 1", "Submitter 2", "Validator"]
        );
    }

    #[test]
    fn test_validator_not_predicted_without_proposals() {
        let mut rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Interleaved, &[1, 2]);
        rotation.backoff.insert(1);
        let tasks = TaskScheduler::new(providers(2)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            3,
        );
        assert_eq!(labels(&tasks), vec!["Submitter 2", "Validator", "Submitter 1"]);
    }

    #[test]
    fn test_boost_precedence_toggle_count_category() {
        let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &[1, 2, 3]);
        let mut boost = boost_enabled();
        boost.boost_next_count = 2;
        boost.boosted_task_ids.insert("agg_sub2_000".to_string());
        boost.boosted_categories.insert("agg_val".to_string());

        let tasks = TaskScheduler::new(providers(3)).predict(WorkflowMode::Aggregator, &rotation, &boost, 8);
        let sources: Vec<_> = tasks.iter().map(|t| t.boost_source).collect();
        assert_eq!(
            sources,
            vec![
                Some(BoostSource::NextCount),      // S1
                Some(BoostSource::ExplicitToggle), // S2：显式开关不占用计数
                Some(BoostSource::NextCount),      // S3
                Some(BoostSource::Category),       // V
                None,                              // S1
                None,                              // S2
                None,                              // S3
                Some(BoostSource::Category),       // V
            ]
        );
        assert_eq!(tasks[0].provider, Some(ModelKey::new("openrouter", "cloud/big")));
        assert_eq!(tasks[4].provider, Some(ModelKey::new("lm_studio", "sub1")));
        // 预测不扣减真实计数
        assert_eq!(boost.boost_next_count, 2);
    }

    #[test]
    fn test_explicit_toggle_on_counted_task() {
        let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Interleaved, &[1, 2]);
        let mut boost = boost_enabled();
        boost.boost_next_count = 1;
        boost.boosted_task_ids.insert("agg_sub1_000".to_string());
        let tasks = TaskScheduler::new(providers(2)).predict(WorkflowMode::Aggregator, &rotation, &boost, 3);
        assert_eq!(tasks[0].boost_source, Some(BoostSource::ExplicitToggle));
        assert_eq!(tasks[1].boost_source, Some(BoostSource::NextCount));
        assert_eq!(tasks[2].boost_source, None);
    }

    #[test]
    fn test_idle_rotation_predicts_nothing() {
        let rotation = RotationState::new(WorkflowMode::Aggregator, ValidationCadence::Batched, &[]);
        let tasks = TaskScheduler::new(providers(0)).predict(
            WorkflowMode::Aggregator,
            &rotation,
            &BoostState::default(),
            20,
        );
        assert!(tasks.is_empty());
    }
}
