//! 优雅关闭处理
//!
//! 提供统一的关闭信号监听和清理逻辑，确保：
//! - 引擎在下一个安全边界停止（不打断进行中的调用，不留下未裁决的提交）
//! - 健康记录、Boost 与统计在退出前落盘

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::{Command, EngineHandle};
use crate::core::state::EngineStatus;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.is_shutdown() {
            tracing::info!(?reason, "shutdown requested");
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping at next safe boundary...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping at next safe boundary...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：管理多个清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 等待每个清理任务完成的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    /// 设置清理超时时间；引擎停止需要等待进行中的调用，应不小于单次调用超时
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 依次执行所有清理任务
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 引擎停止：发送 Quit，并等待主控循环退出（状态通道关闭）
pub struct EngineStopCleanup {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<EngineStatus>,
}

impl EngineStopCleanup {
    pub fn new(handle: &EngineHandle) -> Self {
        Self {
            cmd_tx: handle.command_sender(),
            status_rx: handle.status_receiver(),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for EngineStopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        // 主控循环已退出时发送失败，无需处理
        let _ = self.cmd_tx.send(Command::Quit);
        let mut status_rx = self.status_rx.clone();
        while status_rx.changed().await.is_ok() {}
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Engine"
    }
}

/// 运行主应用直到完成或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Engine finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_is_shared_across_clones() {
        let manager = ShutdownManager::new();
        let clone = manager.clone();
        assert!(!manager.is_shutdown());
        clone.shutdown(ShutdownReason::Signal);
        assert!(manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(clone.is_shutdown());
    }

    struct MockCleanup {
        called: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let mut coordinator = ShutdownCoordinator::new();

        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        coordinator.register(MockCleanup { called: called.clone() });

        coordinator.run_cleanup().await;
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_engine_stop_cleanup_waits_for_loop_exit() {
        use crate::config::{AppConfig, SubmitterSection};
        use crate::core::builder::EngineBuilder;
        use crate::core::orchestrator::{create_engine, EngineOptions};
        use crate::llm::{ProviderConfig, ScriptedAgent};
        use crate::memory::InMemoryStore;

        let cfg = AppConfig {
            submitters: vec![SubmitterSection {
                id: None,
                provider: ProviderConfig::local("m1"),
            }],
            validator: Some(ProviderConfig::local("judge")),
            ..AppConfig::default()
        };
        let coordinator = EngineBuilder::new(cfg)
            .with_agent(Arc::new(ScriptedAgent::cooperative()))
            .with_store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        let handle = create_engine(
            coordinator,
            EngineOptions {
                round_pause: std::time::Duration::from_millis(1),
                max_rounds: None,
                autostart: true,
            },
        );

        EngineStopCleanup::new(&handle).cleanup().await.unwrap();
        assert!(!handle.send(Command::Start));
        let coordinator = handle.join().await.unwrap();
        assert!(coordinator.status(false).current_task.is_none());
    }
}
