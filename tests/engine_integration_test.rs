//! 引擎集成测试：用脚本化 Agent 端到端驱动协调器与主控循环

use std::sync::Arc;
use std::time::Duration;

use hive::config::{AppConfig, SubmitterSection};
use hive::core::{
    create_engine, AgentCallError, BoostSettings, Command, CoordinatorPhase, EngineBuilder, EngineOptions,
    EventBus, ModelKey, NoopLifecycle, SubmissionCoordinator, SubmissionStatus, ValidationCadence, WorkflowMode,
};
use hive::llm::{ProviderConfig, ScriptedAgent};
use hive::memory::{InMemoryStore, JsonFileStore, StateStore};

fn config(models: &[&str]) -> AppConfig {
    let mut cfg = AppConfig {
        submitters: models
            .iter()
            .map(|m| SubmitterSection {
                id: None,
                provider: ProviderConfig::local(*m),
            })
            .collect(),
        validator: Some(ProviderConfig::local("judge")),
        ..AppConfig::default()
    };
    cfg.engine.goal = "Collect non-redundant facts".to_string();
    cfg.engine.cleanup_interval = 1000;
    cfg
}

fn build(cfg: AppConfig, agent: Arc<ScriptedAgent>, store: Arc<dyn StateStore>) -> SubmissionCoordinator {
    EngineBuilder::new(cfg)
        .with_agent(agent)
        .with_store(store)
        .with_lifecycle(Arc::new(NoopLifecycle))
        .with_bus(EventBus::new(10_000))
        .build()
        .unwrap()
}

fn kinds(coordinator: &SubmissionCoordinator) -> Vec<&'static str> {
    coordinator
        .bus()
        .history()
        .into_iter()
        .map(|r| r.event.kind())
        .collect()
}

#[tokio::test]
async fn test_corrupted_model_recovers_once() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_failures("modelA", 5, AgentCallError::Timeout(600));
    let mut cfg = config(&["m1", "modelA", "m3"]);
    cfg.engine.corruption_threshold = 5;
    let mut c = build(cfg, agent.clone(), Arc::new(InMemoryStore::new()));
    let model_a = ModelKey::new("lm_studio", "modelA");

    for round in 1..=4 {
        let report = c.run_round().await.unwrap();
        assert_eq!(report.failed, vec![format!("agg_sub2_{:03}", round - 1)]);
        assert_eq!(c.health().record(&model_a).unwrap().consecutive_failures, round);
    }
    assert!(!kinds(&c).contains(&"recovery_started"));

    c.run_round().await.unwrap();
    let history = kinds(&c);
    assert_eq!(history.iter().filter(|k| **k == "corruption_detected").count(), 1);
    assert_eq!(history.iter().filter(|k| **k == "recovery_started").count(), 1);

    // 恢复期间没有任何派发
    let started = history.iter().position(|k| *k == "recovery_started").unwrap();
    let completed = history.iter().position(|k| *k == "recovery_completed").unwrap();
    assert!(started < completed);
    assert!(!history[started..completed].contains(&"task_dispatched"));

    let record = c.health().record(&model_a).unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.recovery_attempts, 1);
    assert!(!record.in_recovery);

    let report = c.run_round().await.unwrap();
    assert!(report.failed.is_empty());
    assert!(report
        .submissions
        .iter()
        .any(|s| s.submitter_id == 2 && s.status() == SubmissionStatus::Accepted));
    assert_eq!(c.health().record(&model_a).unwrap().consecutive_failures, 0);
    assert_eq!(kinds(&c).iter().filter(|k| **k == "recovery_started").count(), 1);
    assert_eq!(c.phase(), CoordinatorPhase::Idle);
}

#[tokio::test]
async fn test_success_resets_failure_count_without_recovery() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_failures("m1", 2, AgentCallError::Malformed("garbage".into()));
    let mut cfg = config(&["m1"]);
    cfg.engine.corruption_threshold = 3;
    let mut c = build(cfg, agent, Arc::new(InMemoryStore::new()));

    for _ in 0..3 {
        c.run_round().await.unwrap();
    }
    let record = c.health().record(&ModelKey::new("lm_studio", "m1")).unwrap();
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.recovery_attempts, 0);
    assert!(!kinds(&c).contains(&"corruption_detected"));
}

#[tokio::test]
async fn test_boost_next_count_covers_exactly_two_tasks() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut cfg = config(&["m1", "m2", "m3"]);
    cfg.engine.cadence = ValidationCadence::Interleaved;
    let mut c = build(cfg, agent.clone(), Arc::new(InMemoryStore::new()));
    c.set_boost_config(BoostSettings::new("big"));
    c.set_boost_next_count(2);

    let predicted = c.predict();
    let flags: Vec<bool> = predicted.iter().take(3).map(|t| t.using_boost).collect();
    assert_eq!(flags, vec![true, true, false]);
    assert_eq!(predicted[2].task_id, "agg_sub2_000");

    let mut dispatched = c.run_round().await.unwrap().tasks;
    dispatched.extend(c.run_round().await.unwrap().tasks);
    let predicted_ids: Vec<&str> = predicted.iter().take(4).map(|t| t.task_id.as_str()).collect();
    let dispatched_ids: Vec<&str> = dispatched.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(predicted_ids, dispatched_ids);

    let models: Vec<String> = agent.calls().into_iter().map(|c| c.model.model_id).collect();
    assert_eq!(models, vec!["big", "big", "m2", "judge"]);
    assert_eq!(c.router().boost().state().boost_next_count, 0);
}

#[tokio::test]
async fn test_explicit_toggle_does_not_consume_count() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut c = build(config(&["m1", "m2"]), agent.clone(), Arc::new(InMemoryStore::new()));
    c.set_boost_config(BoostSettings::new("big"));
    c.toggle_task_boost("agg_sub1_000");
    c.set_boost_next_count(1);

    let report = c.run_round().await.unwrap();
    let sources: Vec<bool> = report.tasks.iter().map(|t| t.using_boost).collect();
    // sub1 由显式开关命中，计数留给 sub2
    assert_eq!(sources, vec![true, true, false]);
    assert_eq!(c.router().boost().state().boost_next_count, 0);
}

#[tokio::test]
async fn test_cleanup_removes_at_most_one_entry() {
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_ok("m1", r#"{"submission": "Rust has ownership", "reasoning": "core concept"}"#);
    agent.push_ok("m2", r#"{"submission": "Rust enforces ownership rules", "reasoning": "detail"}"#);
    agent.push_ok(
        "judge",
        r#"[{"submission_number": 1, "decision": "accept", "reasoning": "ok"},
            {"submission_number": 2, "decision": "accept", "reasoning": "ok"}]"#,
    );
    agent.push_ok(
        "judge",
        r#"{"should_remove": true, "submission_number": 1, "reasoning": "covered by #2"}"#,
    );
    agent.push_ok("judge", r#"{"decision": "accept", "reasoning": "agreed, redundant"}"#);

    let store = Arc::new(InMemoryStore::new());
    let mut cfg = config(&["m1", "m2"]);
    cfg.engine.cleanup_interval = 2;
    let mut c = build(cfg, agent, store.clone());

    let report = c.run_round().await.unwrap();
    let first_id = report.submissions[0].id;
    let cleanup = report.cleanup.unwrap();
    assert!(cleanup.removal_proposed);
    assert!(cleanup.removal_executed);
    assert_eq!(cleanup.affected_submission_id, Some(first_id));

    assert_eq!(c.corpus().len(), 1);
    assert_eq!(c.corpus().entries()[0].number, 2);
    assert_eq!(c.stats().removals_executed, 1);
    assert_eq!(c.stats().cleanup_reviews_performed, 1);
    // 两条接受 + 一条墓碑
    assert_eq!(store.corpus_records().len(), 3);
}

#[tokio::test]
async fn test_terminal_submission_is_immutable() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut c = build(config(&["m1"]), agent, Arc::new(InMemoryStore::new()));
    let report = c.run_round().await.unwrap();

    let mut submission = report.submissions[0].clone();
    assert_eq!(submission.status(), SubmissionStatus::Accepted);
    assert!(submission.reject("changed my mind", "nope").is_err());
    assert!(submission.decline("never mind").is_err());
    assert_eq!(submission.status(), SubmissionStatus::Accepted);
}

#[tokio::test]
async fn test_quota_error_falls_back_without_health_penalty() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_err("cloud/sub", AgentCallError::QuotaExceeded("no credits".into()));
    let mut cfg = config(&[]);
    cfg.submitters = vec![SubmitterSection {
        id: None,
        provider: ProviderConfig::cloud("cloud/sub").with_fallback("local-sub"),
    }];
    let mut c = build(cfg, agent.clone(), Arc::new(InMemoryStore::new()));

    let report = c.run_round().await.unwrap();
    assert_eq!(report.submissions[0].status(), SubmissionStatus::Accepted);
    assert!(c.health().record(&ModelKey::new("openrouter", "cloud/sub")).is_none());
    assert!(kinds(&c).contains(&"provider_fallback"));
    assert_eq!(agent.calls_for("local-sub"), 1);
}

#[tokio::test]
async fn test_failed_fallback_counts_against_fallback_model() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_err("cloud/sub", AgentCallError::PolicyBlock("flagged".into()));
    agent.push_err("local-sub", AgentCallError::Timeout(600));
    let mut cfg = config(&[]);
    cfg.submitters = vec![SubmitterSection {
        id: None,
        provider: ProviderConfig::cloud("cloud/sub").with_fallback("local-sub"),
    }];
    let mut c = build(cfg, agent, Arc::new(InMemoryStore::new()));

    let report = c.run_round().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(c.health().record(&ModelKey::new("openrouter", "cloud/sub")).is_none());
    let fallback = c.health().record(&ModelKey::new("lm_studio", "local-sub")).unwrap();
    assert_eq!(fallback.consecutive_failures, 1);
}

#[tokio::test]
async fn test_stop_takes_effect_at_round_boundary() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_delayed(
        "m1",
        r#"{"submission": "slow fact", "reasoning": "took a while"}"#,
        Duration::from_millis(200),
    );
    let coordinator = build(config(&["m1"]), agent, Arc::new(InMemoryStore::new()));
    let mut handle = create_engine(
        coordinator,
        EngineOptions {
            round_pause: Duration::from_millis(1),
            max_rounds: None,
            autostart: true,
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.send(Command::Stop));
    let status = handle
        .wait_for(|s| !s.running && s.rounds_completed >= 1)
        .await
        .unwrap();
    assert_eq!(status.rounds_completed, 1);
    assert_eq!(status.corpus_size, 1);
    assert!(status.current_task.is_none());
    assert_eq!(status.stats.total_acceptances, 1);

    handle.send(Command::Quit);
    let coordinator = handle.join().await.unwrap();
    assert_eq!(coordinator.corpus().len(), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
        let mut c = build(config(&["m1", "m2"]), Arc::new(ScriptedAgent::cooperative()), store);
        c.set_boost_config(BoostSettings::new("big"));
        c.toggle_category_boost("agg_val");
        c.run_round().await.unwrap();
        c.run_round().await.unwrap();
    }

    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let c = build(config(&["m1", "m2"]), Arc::new(ScriptedAgent::cooperative()), store);
    assert_eq!(c.corpus().len(), 4);
    assert_eq!(c.stats().total_acceptances, 4);
    assert!(c.router().boost().state().boosted_categories.contains("agg_val"));
    assert!(c.health().record(&ModelKey::new("lm_studio", "m1")).is_some());
}

/// 让 Boost 模型 "big" 在一次派发后恢复失败，成为不可用模型
async fn with_unusable_boost_model(agent: &Arc<ScriptedAgent>) -> SubmissionCoordinator {
    agent.push_err("big", AgentCallError::Timeout(600));
    agent.push_err("big", AgentCallError::Malformed("still broken".into()));
    let mut cfg = config(&["m1", "m2"]);
    cfg.engine.corruption_threshold = 1;
    let mut c = build(cfg, agent.clone(), Arc::new(InMemoryStore::new()));
    c.set_boost_config(BoostSettings::new("big"));
    c.set_boost_next_count(1);
    c.run_round().await.unwrap();
    assert!(!c.health().is_usable(&ModelKey::new("openrouter", "big")));
    assert!(!c.is_halted());
    c
}

#[tokio::test]
async fn test_unusable_boost_model_keeps_boost_credit() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut c = with_unusable_boost_model(&agent).await;
    let toggled = c.rotation().next_task_id("agg_val");
    c.toggle_task_boost(&toggled);
    c.set_boost_next_count(3);
    let big_calls = agent.calls_for("big");

    let report = c.run_round().await.unwrap();
    assert!(report.blocked.is_empty());
    assert_eq!(report.tasks.len(), 3);
    assert!(report.tasks.iter().all(|t| !t.using_boost));
    assert_eq!(agent.calls_for("big"), big_calls);

    let state = c.router().boost().state();
    assert_eq!(state.boost_next_count, 3);
    assert!(state.boosted_task_ids.contains(&toggled));
    assert_eq!(kinds(&c).iter().filter(|k| **k == "boost_bypassed").count(), 3);
}

#[tokio::test]
async fn test_boosted_validator_on_unusable_model_uses_default() {
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut c = with_unusable_boost_model(&agent).await;
    c.toggle_category_boost("agg_val");

    let report = c.run_round().await.unwrap();
    assert!(!c.is_halted());
    assert_eq!(c.phase(), CoordinatorPhase::Idle);
    assert!(report
        .submissions
        .iter()
        .all(|s| s.status() == SubmissionStatus::Accepted));
    let validator_task = report.tasks.last().unwrap();
    assert_eq!(validator_task.provider.as_ref().unwrap().model_id, "judge");
    assert!(!kinds(&c).contains(&"engine_halted"));
}

#[tokio::test]
async fn test_health_and_boost_persist_without_flush() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let agent = Arc::new(ScriptedAgent::cooperative());
    agent.push_err("m1", AgentCallError::Timeout(600));
    let mut c = build(config(&["m1", "m2"]), agent, store);

    c.run_round().await.unwrap();
    let reader = JsonFileStore::new(dir.path()).unwrap();
    let m1 = ModelKey::new("lm_studio", "m1");
    let saved = reader.load_health().unwrap();
    let record = saved.iter().find(|r| r.model == m1).unwrap();
    assert_eq!(record.consecutive_failures, 1);

    c.set_boost_config(BoostSettings::new("big"));
    c.set_boost_next_count(1);
    c.run_round().await.unwrap();
    let boost = reader.load_boost().unwrap().unwrap();
    assert_eq!(boost.boost_next_count, 0);
    let saved = reader.load_health().unwrap();
    let record = saved.iter().find(|r| r.model == ModelKey::new("openrouter", "big")).unwrap();
    assert_eq!(record.consecutive_failures, 0);
}

#[tokio::test]
async fn test_compiler_mode_cycle() {
    let mut cfg = config(&[]);
    cfg.engine.mode = WorkflowMode::Compiler;
    cfg.compiler.high_context = Some(ProviderConfig::local("hc"));
    let agent = Arc::new(ScriptedAgent::cooperative());
    let mut c = build(cfg, agent.clone(), Arc::new(InMemoryStore::new()));

    let predicted = c.predict();
    let ids: Vec<&str> = predicted.iter().take(16).map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids[0], "comp_hc_000");
    assert_eq!(ids[1], "comp_val_000");
    assert_eq!(ids[14], "comp_hp_000");
    assert_eq!(ids[15], "comp_val_007");
    assert_eq!(predicted[14].role_label, "High-Param");
    assert_eq!(predicted[14].provider.as_ref().unwrap().model_id, "hc");

    let report = c.run_round().await.unwrap();
    assert_eq!(report.tasks.len(), 2);
    assert_eq!(report.submissions[0].status(), SubmissionStatus::Accepted);
    assert_eq!(agent.calls()[0].role, "High-Context");
}
