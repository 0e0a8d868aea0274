//! 引擎编排器：主控循环
//!
//! 建立 cmd / status 两个通道，并在后台任务中独占 SubmissionCoordinator：
//! 两轮之间消费命令（Start/Stop/Boost/Reconfigure/Quit），运行中则连续执行轮次，
//! 每轮结束后刷新状态快照。命令只在轮与轮之间生效，因此 Stop 不会打断进行中的调用，
//! 也不会留下未裁决的提交。

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::boost::BoostSettings;
use crate::core::coordinator::SubmissionCoordinator;
use crate::core::events::{EngineEvent, EventBus, EventFilter, EventSubscription};
use crate::core::health::ModelKey;
use crate::core::state::EngineStatus;
use crate::llm::ProviderConfig;

/// 从外部（CLI / 适配层）发往引擎的命令
#[derive(Debug, Clone)]
pub enum Command {
    Start,
    /// 在下一个安全边界停止派发
    Stop,
    SetBoostNextCount(u32),
    ToggleCategoryBoost(String),
    ToggleTaskBoost(String),
    SetBoostConfig(BoostSettings),
    ClearBoost,
    /// 清除模型的不可用标记，可选替换为新配置
    ReconfigureModel {
        model: ModelKey,
        replacement: Option<ProviderConfig>,
    },
    /// 停止并退出主控循环
    Quit,
}

/// 主控循环参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub round_pause: Duration,
    /// 达到轮数后自动停止并退出
    pub max_rounds: Option<u64>,
    /// 创建后立即开始运行
    pub autostart: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            round_pause: Duration::from_millis(1000),
            max_rounds: None,
            autostart: false,
        }
    }
}

/// 引擎句柄：命令发送端 + 状态快照 + 事件总线
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<EngineStatus>,
    bus: EventBus,
    task: JoinHandle<SubmissionCoordinator>,
}

impl EngineHandle {
    /// 主控循环已退出时返回 false
    pub fn send(&self, cmd: Command) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.cmd_tx.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<EngineStatus> {
        self.status_rx.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        self.bus.subscribe(filter)
    }

    /// 等待状态满足条件
    pub async fn wait_for(&mut self, predicate: impl Fn(&EngineStatus) -> bool) -> Option<EngineStatus> {
        let status = self.status_rx.wait_for(|s| predicate(s)).await.ok()?;
        Some(status.clone())
    }

    /// 等待主控循环退出，取回协调器（用于落盘或检查最终状态）
    pub async fn join(self) -> anyhow::Result<SubmissionCoordinator> {
        Ok(self.task.await?)
    }
}

enum Flow {
    Continue,
    Quit,
}

struct ControlLoop {
    coordinator: SubmissionCoordinator,
    status_tx: watch::Sender<EngineStatus>,
    options: EngineOptions,
    running: bool,
    rounds: u64,
}

impl ControlLoop {
    fn publish_status(&self) {
        let _ = self.status_tx.send(self.coordinator.status(self.running));
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        tracing::info!(mode = self.coordinator.mode().as_str(), "engine started");
        self.coordinator.bus().publish(EngineEvent::EngineStarted {
            mode: self.coordinator.mode().as_str().to_string(),
        });
    }

    fn stop(&mut self, reason: &str) {
        if !self.running {
            return;
        }
        self.running = false;
        self.coordinator.flush();
        tracing::info!(reason, rounds = self.rounds, "engine stopped");
        self.coordinator.bus().publish(EngineEvent::EngineStopped {
            reason: reason.to_string(),
        });
    }

    fn apply(&mut self, cmd: Command) -> Flow {
        tracing::debug!(?cmd, "command received");
        match cmd {
            Command::Start => self.start(),
            Command::Stop => self.stop("stop requested"),
            Command::SetBoostNextCount(count) => self.coordinator.set_boost_next_count(count),
            Command::ToggleCategoryBoost(category) => {
                self.coordinator.toggle_category_boost(&category);
            }
            Command::ToggleTaskBoost(task_id) => {
                self.coordinator.toggle_task_boost(&task_id);
            }
            Command::SetBoostConfig(settings) => self.coordinator.set_boost_config(settings),
            Command::ClearBoost => self.coordinator.clear_boost(),
            Command::ReconfigureModel { model, replacement } => {
                self.coordinator.reconfigure_model(&model, replacement)
            }
            Command::Quit => {
                self.stop("quit");
                return Flow::Quit;
            }
        }
        self.publish_status();
        Flow::Continue
    }

    async fn run_one_round(&mut self) {
        match self.coordinator.run_round().await {
            Ok(_) => self.rounds += 1,
            Err(e) => tracing::warn!(error = %e, "round aborted"),
        }
        self.publish_status();
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) -> SubmissionCoordinator {
        if self.options.autostart {
            self.start();
        }
        self.publish_status();

        loop {
            // 轮与轮之间：先消费所有已到达的命令
            while let Ok(cmd) = cmd_rx.try_recv() {
                if let Flow::Quit = self.apply(cmd) {
                    return self.coordinator;
                }
            }

            if !self.running || self.coordinator.is_halted() {
                match cmd_rx.recv().await {
                    Some(cmd) => {
                        if let Flow::Quit = self.apply(cmd) {
                            return self.coordinator;
                        }
                    }
                    None => break,
                }
                continue;
            }

            self.run_one_round().await;

            if self.options.max_rounds.is_some_and(|max| self.rounds >= max) {
                self.stop("round limit reached");
                self.publish_status();
                return self.coordinator;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.round_pause) => {}
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Flow::Quit = self.apply(cmd) {
                            return self.coordinator;
                        }
                    }
                    None => break,
                },
            }
        }

        // 所有发送端已关闭
        self.stop("command channel closed");
        self.coordinator
    }
}

/// 创建引擎主控循环：返回句柄；后台任务独占协调器直到 Quit / 达到轮数上限 / 发送端全部关闭
pub fn create_engine(coordinator: SubmissionCoordinator, options: EngineOptions) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (status_tx, status_rx) = watch::channel(coordinator.status(false));
    let bus = coordinator.bus().clone();

    let control = ControlLoop {
        coordinator,
        status_tx,
        options,
        running: false,
        rounds: 0,
    };
    let task = tokio::spawn(control.run(cmd_rx));

    EngineHandle {
        cmd_tx,
        status_rx,
        bus,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{AppConfig, SubmitterSection};
    use crate::core::builder::EngineBuilder;
    use crate::llm::ScriptedAgent;
    use crate::memory::InMemoryStore;

    fn coordinator() -> SubmissionCoordinator {
        let cfg = AppConfig {
            submitters: vec![SubmitterSection {
                id: None,
                provider: ProviderConfig::local("m1"),
            }],
            validator: Some(ProviderConfig::local("judge")),
            ..AppConfig::default()
        };
        EngineBuilder::new(cfg)
            .with_agent(Arc::new(ScriptedAgent::cooperative()))
            .with_store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap()
    }

    fn fast(max_rounds: Option<u64>, autostart: bool) -> EngineOptions {
        EngineOptions {
            round_pause: Duration::from_millis(1),
            max_rounds,
            autostart,
        }
    }

    #[tokio::test]
    async fn test_runs_until_round_limit() {
        let handle = create_engine(coordinator(), fast(Some(3), true));
        let coordinator = handle.join().await.unwrap();
        assert_eq!(coordinator.stats().total_acceptances, 3);
        assert_eq!(coordinator.corpus().len(), 3);
    }

    #[tokio::test]
    async fn test_idle_until_started() {
        let mut handle = create_engine(coordinator(), fast(Some(1), false));
        assert!(!handle.status().running);
        assert!(handle.send(Command::SetBoostConfig(BoostSettings::new("big"))));
        assert!(handle.send(Command::SetBoostNextCount(1)));
        assert!(handle.send(Command::Start));
        let status = handle.wait_for(|s| s.rounds_completed == 1).await;
        assert!(status.is_some());
        let coordinator = handle.join().await.unwrap();
        assert_eq!(coordinator.router().boost().state().boost_next_count, 0);
    }

    #[tokio::test]
    async fn test_quit_stops_at_boundary() {
        let handle = create_engine(coordinator(), fast(None, true));
        let mut sub = handle.subscribe(EventFilter::kinds(["engine_stopped"]));
        handle.send(Command::Quit);
        let coordinator = handle.join().await.unwrap();
        assert!(coordinator.status(false).current_task.is_none());
        assert_eq!(sub.recv().await.unwrap().event.kind(), "engine_stopped");
    }
}
