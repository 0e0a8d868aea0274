//! Hive - 多 Agent 提交/验证流水线编排引擎
//!
//! 入口：初始化日志、加载配置、构建协调器并运行主控循环（Ctrl+C / SIGTERM 时在安全边界停止）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hive::config::{load_config, AppConfig};
use hive::core::events::EventFilter;
use hive::core::shutdown::{run_with_graceful_shutdown, EngineStopCleanup, ShutdownCoordinator, ShutdownManager};
use hive::core::NoopLifecycle;
use hive::llm::ScriptedAgent;
use hive::memory::InMemoryStore;
use hive::{create_engine, EngineBuilder, EngineOptions};

#[derive(Parser)]
#[command(name = "hive", version, about = "Multi-agent submit/validate orchestration engine")]
struct Cli {
    /// 配置文件路径（缺省读取 config/default.toml）
    #[arg(short, long, global = true, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// 使用脚本化 Agent 与内存存储离线运行
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// 运行引擎直到 Ctrl+C 或达到轮数上限
    Run {
        #[arg(short, long)]
        rounds: Option<u64>,
        /// 以 JSON 行输出全部引擎事件到 stdout
        #[arg(long)]
        events: bool,
    },
    /// 以 JSON 输出接下来的任务预测
    Predict,
}

fn builder(cfg: AppConfig, mock: bool) -> EngineBuilder {
    let builder = EngineBuilder::new(cfg);
    if mock {
        builder
            .with_agent(Arc::new(ScriptedAgent::cooperative()))
            .with_store(Arc::new(InMemoryStore::new()))
            .with_lifecycle(Arc::new(NoopLifecycle))
    } else {
        builder
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Cmd::Predict => {
            let coordinator = builder(cfg, cli.mock).build().context("Failed to build engine")?;
            let tasks = coordinator.predict();
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Cmd::Run { rounds, events } => {
            let options = EngineOptions {
                round_pause: Duration::from_millis(cfg.engine.round_pause_ms),
                max_rounds: rounds,
                autostart: true,
            };
            let cleanup_timeout = cfg.engine.call_timeout_secs + 5;
            let coordinator = builder(cfg, cli.mock).build().context("Failed to build engine")?;
            let handle = create_engine(coordinator, options);

            if events {
                let mut sub = handle.subscribe(EventFilter::all());
                tokio::spawn(async move {
                    while let Some(record) = sub.recv().await {
                        match serde_json::to_string(&record) {
                            Ok(line) => println!("{line}"),
                            Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
                        }
                    }
                });
            }

            let shutdown = Arc::new(ShutdownManager::new());
            let mut cleanup = ShutdownCoordinator::new().with_timeout(cleanup_timeout);
            cleanup.register(EngineStopCleanup::new(&handle));

            let app = async move {
                match handle.join().await {
                    Ok(coordinator) => {
                        let stats = coordinator.stats();
                        tracing::info!(
                            acceptances = stats.total_acceptances,
                            rejections = stats.total_rejections,
                            declines = stats.total_declines,
                            corpus = coordinator.corpus().len(),
                            "engine exited"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "engine task failed"),
                }
            };
            run_with_graceful_shutdown(shutdown, app, || async move { cleanup.run_cleanup().await }).await;
        }
    }

    Ok(())
}
