//! Hive - 多 Agent 提交/验证流水线编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 轮转调度、提交协调、模型健康与恢复、Boost、清理审查、事件总线、主控循环
//! - **llm**: Agent 调用抽象、Provider 路由与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 已接受语料与状态持久化
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{create_engine, Command, EngineBuilder, EngineHandle, EngineOptions, SubmissionCoordinator};
