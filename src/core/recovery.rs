//! 模型恢复引擎：ejecting → reloading → probationary-test
//!
//! 在检测到损坏的那次调用之后由控制循环同步执行；执行期间不会派发任何其它任务。
//! 任一阶段失败都会把模型标记为不可用（不重试），直到人工重新配置。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::core::error::EngineError;
use crate::core::health::{ModelHealthMonitor, ModelKey, RecoveryStage};
use crate::llm::{ProviderConfig, ProviderRouter};

/// 模型生命周期操作（卸载 / 重新加载）
#[async_trait]
pub trait ModelLifecycle: Send + Sync {
    async fn eject(&self, provider: &ProviderConfig) -> anyhow::Result<()>;
    async fn reload(&self, provider: &ProviderConfig) -> anyhow::Result<()>;
}

/// 不做任何操作（云端模型或测试）
#[derive(Debug, Default)]
pub struct NoopLifecycle;

#[async_trait]
impl ModelLifecycle for NoopLifecycle {
    async fn eject(&self, _provider: &ProviderConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reload(&self, _provider: &ProviderConfig) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 通过 LM Studio 的 `lms` 命令行卸载与加载本地模型；云端模型跳过
#[derive(Debug)]
pub struct LmsCliLifecycle {
    timeout: Duration,
}

impl Default for LmsCliLifecycle {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }
}

impl LmsCliLifecycle {
    async fn run(&self, args: &[String]) -> anyhow::Result<()> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("lms").args(args).output(),
        )
        .await
        .with_context(|| format!("lms {} timed out", args.join(" ")))?
        .context("failed to run lms (is LM Studio CLI on PATH?)")?;
        if !output.status.success() {
            anyhow::bail!(
                "lms {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ModelLifecycle for LmsCliLifecycle {
    async fn eject(&self, provider: &ProviderConfig) -> anyhow::Result<()> {
        if provider.provider.is_cloud() {
            return Ok(());
        }
        self.run(&["unload".to_string(), provider.model_id.clone()]).await
    }

    async fn reload(&self, provider: &ProviderConfig) -> anyhow::Result<()> {
        if provider.provider.is_cloud() {
            return Ok(());
        }
        self.run(&[
            "load".to_string(),
            provider.model_id.clone(),
            "--context-length".to_string(),
            provider.context_window.to_string(),
        ])
        .await
    }
}

pub struct RecoveryEngine {
    lifecycle: Arc<dyn ModelLifecycle>,
}

impl RecoveryEngine {
    pub fn new(lifecycle: Arc<dyn ModelLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// 对单个模型执行完整恢复流程
    pub async fn recover(
        &self,
        model: &ModelKey,
        router: &ProviderRouter,
        health: &mut ModelHealthMonitor,
    ) -> Result<(), EngineError> {
        health.begin_recovery(model)?;

        let result = self.run_stages(model, router, health).await;
        match &result {
            Ok(()) => health.complete_recovery(model, true, "probationary test passed"),
            Err(reason) => health.complete_recovery(model, false, reason),
        }
        result.map_err(|_| EngineError::RecoveryFailed(model.clone()))
    }

    async fn run_stages(
        &self,
        model: &ModelKey,
        router: &ProviderRouter,
        health: &mut ModelHealthMonitor,
    ) -> Result<(), String> {
        let config = router
            .config_for_key(model)
            .ok_or_else(|| format!("no provider config found for {model}"))?;

        self.lifecycle
            .eject(&config)
            .await
            .map_err(|e| format!("eject failed: {e:#}"))?;

        health.advance_stage(model, RecoveryStage::Reloading);
        self.lifecycle
            .reload(&config)
            .await
            .map_err(|e| format!("reload failed: {e:#}"))?;

        health.advance_stage(model, RecoveryStage::ProbationaryTest);
        router
            .probe(&config)
            .await
            .map_err(|e| format!("probationary test failed: {e}"))
    }
}
