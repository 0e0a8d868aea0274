//! 核心编排层：轮转调度、提交/验证协调、模型健康与恢复、Boost 路由、清理审查、事件与主控循环

pub mod boost;
pub mod builder;
pub mod cleanup;
pub mod coordinator;
pub mod decision;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod prompts;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod submission;
pub mod task_scheduler;

pub use boost::{available_categories, BoostCategory, BoostManager, BoostSettings, BoostSource, BoostState};
pub use builder::EngineBuilder;
pub use cleanup::{CleanupReviewResult, CleanupReviewer};
pub use coordinator::{CoordinatorSettings, RoundReport, SubmissionCoordinator};
pub use error::{AgentCallError, EngineError, ValidationParseError};
pub use events::{EngineEvent, EventBus, EventCategory, EventFilter, EventRecord, EventSubscription};
pub use health::{ModelHealthMonitor, ModelHealthRecord, ModelKey, RecoveryStage};
pub use orchestrator::{create_engine, Command, EngineHandle, EngineOptions};
pub use recovery::{LmsCliLifecycle, ModelLifecycle, NoopLifecycle, RecoveryEngine};
pub use shutdown::{EngineStopCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{CoordinatorPhase, EngineStats, EngineStatus, RecoveryStatus, SubmitterMetrics};
pub use submission::{Submission, SubmissionStatus, Submitter, Validator};
pub use task_scheduler::{Role, RotationState, Task, TaskScheduler, ValidationCadence, WorkflowMode};
