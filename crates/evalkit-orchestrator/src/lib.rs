//! # evalkit-orchestrator
//!
//! Eval orchestration engine for evalkit.
//!
//! This crate provides:
//! - A bounded worker pool running build and test commands as isolated child processes
//! - The [`Gateway`] seam and a local implementation backed by an agent runner
//! - The repair loop state machine that re-attempts failed builds and tests
//! - Serving built apps for runtime checks
//! - The eval driver tying the stages together

mod file_system;
mod gateway;
mod local_gateway;
mod pipeline;
mod pool;
mod repair;
mod serve;
mod worker;

pub use file_system::write_response_files;
pub use gateway::{Gateway, ServeBody};
pub use local_gateway::LocalGateway;
pub use pipeline::{
    eval_directory_name, generate_code_and_assess, request_context, run_evals,
    unique_directory_names, EvalOutcome, EvalRunResult, EvalSettings,
};
pub use pool::{PoolError, WorkerPool};
pub use repair::{
    merge_repair_files, run_repair_loop, transition, RepairAction, RepairEvent, RepairLoopOutcome,
    RepairPolicy, RepairRun, RepairStage, RepairState, StageResult,
};
pub use serve::{
    find_local_url, probe_body, probe_url, serve_app, ServeOptions, DEFAULT_SERVE_STARTUP_TIMEOUT,
};
pub use worker::{
    classify_build_error, cleanup_build_message, JobExecutor, ProcessJobExecutor, WorkerKind,
    WorkerPayload, WorkerReply, WorkerRequest,
};
