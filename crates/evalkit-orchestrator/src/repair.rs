//! Repair loop
//!
//! Control flow lives in the pure [`transition`] function; [`run_repair_loop`]
//! performs the side effects it asks for (repair requests, file writes, stage
//! re-runs) and feeds the results back in as events.
//!
//! State machine:
//! - `Attempting` (first stage run) / `Rebuilding` (re-run after a repair)
//!   end in `Succeeded`, or move to `Repairing` while budget and policy allow
//! - `Repairing` waits for the repair response
//! - Terminal: `Succeeded`, `Failed` (retry vetoed), `Exhausted`, `Aborted`
//!   (repair request rejected), `NotScheduled` (no worker for a re-run),
//!   `Cancelled`

use evalkit_agent::LlmGenerateFilesContext;
use evalkit_core::{
    Attempt, BuildResult, EnvironmentConfig, EvalError, EvalId, FileSet, LlmContextFile,
    LlmResponse, ProgressLogger, ProgressType, ResponseFile, Result, RootPromptDefinition, Stage,
    TestExecutionResult,
};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::file_system::write_response_files;
use crate::gateway::Gateway;
use crate::pool::WorkerPool;

/// Stages that can be repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    Build,
    Test,
}

impl RepairStage {
    pub fn as_stage(&self) -> Stage {
        match self {
            RepairStage::Build => Stage::Build,
            RepairStage::Test => Stage::Test,
        }
    }
}

/// Budget and retry veto for one loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPolicy {
    pub max_repairs: usize,
    /// `false` when the gateway vetoes retries (agent repairs on its own)
    pub retry_allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairState {
    /// First run of the stage
    Attempting,
    /// Waiting for repair number `repair`
    Repairing { repair: usize, error: String },
    /// Re-running the stage after repair number `repair`
    Rebuilding { repair: usize },
    Succeeded { repairs: usize },
    /// Retries were vetoed
    Failed { repairs: usize, error: String },
    /// Budget used up, the last failure is kept
    Exhausted { repairs: usize, error: String },
    /// The repair request itself failed
    Aborted { repairs: usize, reason: String },
    /// A re-run never got a worker; no repair is requested for it
    NotScheduled { repairs: usize, reason: String },
    Cancelled { repairs: usize },
}

impl RepairState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            RepairState::Attempting | RepairState::Repairing { .. } | RepairState::Rebuilding { .. }
        )
    }

    fn repairs(&self) -> usize {
        match self {
            RepairState::Attempting => 0,
            RepairState::Repairing { repair, .. } => repair.saturating_sub(1),
            RepairState::Rebuilding { repair } => *repair,
            RepairState::Succeeded { repairs }
            | RepairState::Failed { repairs, .. }
            | RepairState::Exhausted { repairs, .. }
            | RepairState::Aborted { repairs, .. }
            | RepairState::NotScheduled { repairs, .. }
            | RepairState::Cancelled { repairs } => *repairs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairEvent {
    StagePassed,
    StageFailed { error: String },
    StageNotScheduled { reason: String },
    RepairReceived,
    RepairRejected { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    LogActivity { message: String },
    RequestRepair { repair: usize, error: String },
    RerunStage { repair: usize },
}

/// Pure transition function of the repair loop.
///
/// Invalid transitions end in `Failed`; this never panics.
pub fn transition(
    policy: &RepairPolicy,
    state: RepairState,
    event: RepairEvent,
) -> (RepairState, Vec<RepairAction>) {
    match (state, event) {
        (state @ (RepairState::Attempting | RepairState::Rebuilding { .. }), RepairEvent::StagePassed) => {
            let repairs = state.repairs();
            (
                RepairState::Succeeded { repairs },
                vec![RepairAction::LogActivity {
                    message: format!("Stage passed after {} repair(s)", repairs),
                }],
            )
        }

        (
            state @ (RepairState::Attempting | RepairState::Rebuilding { .. }),
            RepairEvent::StageFailed { error },
        ) => {
            let repairs = state.repairs();
            if !policy.retry_allowed {
                (
                    RepairState::Failed { repairs, error },
                    vec![RepairAction::LogActivity {
                        message: "Stage failed, retries are disabled".to_string(),
                    }],
                )
            } else if repairs >= policy.max_repairs {
                (
                    RepairState::Exhausted { repairs, error },
                    vec![RepairAction::LogActivity {
                        message: format!("Stage failed, repair budget of {} used up", policy.max_repairs),
                    }],
                )
            } else {
                let repair = repairs + 1;
                (
                    RepairState::Repairing {
                        repair,
                        error: error.clone(),
                    },
                    vec![
                        RepairAction::LogActivity {
                            message: format!("Requesting repair attempt #{}", repair),
                        },
                        RepairAction::RequestRepair { repair, error },
                    ],
                )
            }
        }

        (
            state @ (RepairState::Attempting | RepairState::Rebuilding { .. }),
            RepairEvent::StageNotScheduled { reason },
        ) => {
            let repairs = state.repairs();
            (
                RepairState::NotScheduled {
                    repairs,
                    reason: reason.clone(),
                },
                vec![RepairAction::LogActivity {
                    message: format!("Stage was never scheduled: {}", reason),
                }],
            )
        }

        (RepairState::Repairing { repair, .. }, RepairEvent::RepairReceived) => (
            RepairState::Rebuilding { repair },
            vec![RepairAction::RerunStage { repair }],
        ),

        (RepairState::Repairing { repair, .. }, RepairEvent::RepairRejected { reason }) => (
            RepairState::Aborted {
                repairs: repair - 1,
                reason: reason.clone(),
            },
            vec![RepairAction::LogActivity {
                message: format!("Repair request #{} failed: {}", repair, reason),
            }],
        ),

        (
            state @ (RepairState::Attempting
            | RepairState::Repairing { .. }
            | RepairState::Rebuilding { .. }),
            RepairEvent::Cancelled,
        ) => (
            RepairState::Cancelled {
                repairs: state.repairs(),
            },
            vec![RepairAction::LogActivity {
                message: "Repair loop cancelled".to_string(),
            }],
        ),

        (state, event) => (
            RepairState::Failed {
                repairs: state.repairs(),
                error: format!(
                    "Invalid repair transition: {:?} cannot handle event {:?}",
                    state, event
                ),
            },
            vec![],
        ),
    }
}

/// Merge a repair response onto a copy of the previous file set.
///
/// Matching paths are overwritten in place, new paths appended, untouched
/// files kept. `previous` is left as it was.
pub fn merge_repair_files(previous: &FileSet, repair_output: &[ResponseFile]) -> FileSet {
    let mut merged = previous.clone();
    for file in repair_output {
        merged.upsert(file.clone());
    }
    merged
}

/// Result of one stage run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Build(BuildResult),
    Test(TestExecutionResult),
}

impl StageResult {
    pub fn passed(&self) -> bool {
        match self {
            StageResult::Build(build) => build.is_success(),
            StageResult::Test(test) => test.passed,
        }
    }

    /// Message handed to the repair request
    pub fn error_message(&self) -> String {
        match self {
            StageResult::Build(build) => build.message.clone(),
            StageResult::Test(test) => format!("Tests failed with the following output:\n{}", test.output),
        }
    }

    fn event(&self) -> RepairEvent {
        if self.passed() {
            RepairEvent::StagePassed
        } else {
            RepairEvent::StageFailed {
                error: self.error_message(),
            }
        }
    }
}

/// Everything a repair loop needs from its eval
pub struct RepairRun<'a> {
    pub gateway: &'a dyn Gateway,
    pub id: &'a EvalId,
    pub env: &'a EnvironmentConfig,
    pub prompt: &'a RootPromptDefinition,
    pub dir: &'a Path,
    pub pool: &'a WorkerPool,
    pub model: &'a str,
    pub request_ctx: &'a LlmGenerateFilesContext,
    pub context_files: &'a [LlmContextFile],
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressLogger,
}

/// What a finished loop leaves behind
#[derive(Debug, Clone)]
pub struct RepairLoopOutcome {
    /// Terminal state
    pub state: RepairState,
    /// Attempts recorded by this loop, in order
    pub attempts: Vec<Attempt>,
    pub last_result: StageResult,
    /// Authoritative file set after the loop
    pub files: FileSet,
}

impl RepairLoopOutcome {
    pub fn repairs(&self) -> usize {
        self.state.repairs()
    }
}

/// Repair a failed stage until it passes, the budget runs out, the gateway
/// vetoes retries or the eval is cancelled.
///
/// `initial` is the result of the stage run that preceded the loop and
/// `next_attempt` the index the first repair attempt gets.
pub async fn run_repair_loop(
    run: &RepairRun<'_>,
    stage: RepairStage,
    policy: RepairPolicy,
    initial: StageResult,
    files: FileSet,
    next_attempt: usize,
) -> Result<RepairLoopOutcome> {
    let mut files = files;
    let mut last_result = initial;
    let mut attempts = Vec::new();

    let (mut state, mut actions) = transition(&policy, RepairState::Attempting, last_result.event());

    while !state.is_terminal() {
        let mut next_event = None;
        for action in actions {
            match action {
                RepairAction::LogActivity { message } => info!("[{}] {}", run.prompt.name, message),
                RepairAction::RequestRepair { repair, error } => {
                    if run.cancel.is_cancelled() {
                        next_event = Some(RepairEvent::Cancelled);
                        break;
                    }
                    run.progress.log(
                        run.prompt,
                        ProgressType::Codegen,
                        &format!("Repairing {} (attempt #{})", stage.as_stage(), repair),
                        None,
                    );
                    let Some(response) = request_repair(run, &error, &files).await? else {
                        next_event = Some(RepairEvent::Cancelled);
                        break;
                    };
                    if !response.success {
                        run.progress.log(
                            run.prompt,
                            ProgressType::Error,
                            &format!("AI failed to generate a response for repair attempt #{}", repair),
                            None,
                        );
                        next_event = Some(RepairEvent::RepairRejected {
                            reason: response.errors.join("\n"),
                        });
                        break;
                    }

                    let merged = merge_repair_files(&files, &response.output_files);
                    write_response_files(run.dir, &merged).await?;
                    files = merged;
                    open_attempt(&mut attempts, &response, next_attempt + repair - 1, &files);
                    next_event = Some(RepairEvent::RepairReceived);
                }
                RepairAction::RerunStage { repair } => {
                    let index = next_attempt + repair - 1;
                    let (result, event) = rerun_stage(run, stage).await?;
                    finish_attempt(&mut attempts, index, &result);
                    last_result = result;
                    next_event = Some(event);
                }
            }
        }

        let Some(event) = next_event else {
            return Err(EvalError::Internal(format!(
                "Repair loop stalled in state {:?}",
                state
            )));
        };
        (state, actions) = transition(&policy, state, event);
    }

    for action in actions {
        if let RepairAction::LogActivity { message } = action {
            info!("[{}] {}", run.prompt.name, message);
        }
    }

    if let RepairState::Aborted { reason, .. } = &state {
        return Err(EvalError::RepairRequest(reason.clone()));
    }

    Ok(RepairLoopOutcome {
        state,
        attempts,
        last_result,
        files,
    })
}

/// `Ok(None)` when the request was cancelled
async fn request_repair(
    run: &RepairRun<'_>,
    error: &str,
    files: &FileSet,
) -> Result<Option<LlmResponse>> {
    match run
        .gateway
        .repair_code(
            run.id,
            run.request_ctx,
            run.model,
            error,
            files,
            run.context_files,
            run.cancel,
        )
        .await
    {
        Ok(response) => Ok(Some(response)),
        Err(e) if e.is_cancelled() => Ok(None),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("[{}] Repair request errored: {}", run.prompt.name, e);
            Ok(Some(LlmResponse::failed(e.to_string())))
        }
    }
}

/// Open a new attempt for the repaired file set; the stage result is filled in
/// by [`finish_attempt`].
fn open_attempt(attempts: &mut Vec<Attempt>, response: &LlmResponse, index: usize, files: &FileSet) {
    attempts.push(Attempt {
        attempt: index,
        output_files: files.clone(),
        build_result: BuildResult::error("Stage did not run", None),
        test_result: None,
        serve_testing_result: None,
        usage: response.usage,
        reasoning: response.reasoning.clone(),
    });
}

fn finish_attempt(attempts: &mut [Attempt], index: usize, result: &StageResult) {
    let Some(attempt) = attempts.iter_mut().rev().find(|a| a.attempt == index) else {
        return;
    };
    match result {
        StageResult::Build(build) => attempt.build_result = build.clone(),
        StageResult::Test(test) => {
            // Tests only run against a successful build
            attempt.build_result = BuildResult::success("");
            attempt.test_result = Some(test.clone());
        }
    }
}

/// Re-run `stage` and turn its outcome into the next loop event.
///
/// Cancelled and unscheduled runs come back as a failed placeholder result so
/// the attempt still gets recorded.
async fn rerun_stage(run: &RepairRun<'_>, stage: RepairStage) -> Result<(StageResult, RepairEvent)> {
    let rerun = match stage {
        RepairStage::Build => run
            .gateway
            .try_build(run.id, run.env, run.dir, run.prompt, run.pool, run.cancel, run.progress)
            .await
            .map(StageResult::Build),
        RepairStage::Test => match run
            .gateway
            .try_test(run.id, run.env, run.dir, run.prompt, run.pool, run.cancel, run.progress)
            .await
        {
            Ok(Some(test)) => Ok(StageResult::Test(test)),
            Ok(None) => Err(EvalError::Internal(
                "Test command disappeared during the test repair loop".to_string(),
            )),
            Err(e) => Err(e),
        },
    };

    match rerun {
        Ok(result) => {
            let event = result.event();
            Ok((result, event))
        }
        Err(e) if e.is_cancelled() => Ok((
            placeholder(
                stage,
                match stage {
                    RepairStage::Build => "Build was cancelled",
                    RepairStage::Test => "Tests were cancelled",
                },
            ),
            RepairEvent::Cancelled,
        )),
        Err(e) if e.is_not_scheduled() => {
            let reason = e.to_string();
            Ok((placeholder(stage, &reason), RepairEvent::StageNotScheduled { reason }))
        }
        Err(e) => Err(e),
    }
}

fn placeholder(stage: RepairStage, message: &str) -> StageResult {
    match stage {
        RepairStage::Build => StageResult::Build(BuildResult::error(message, None)),
        RepairStage::Test => StageResult::Test(TestExecutionResult {
            passed: false,
            output: message.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: RepairPolicy = RepairPolicy {
        max_repairs: 2,
        retry_allowed: true,
    };

    fn failed(msg: &str) -> RepairEvent {
        RepairEvent::StageFailed {
            error: msg.to_string(),
        }
    }

    #[test]
    fn test_pass_on_first_try() {
        let (state, actions) = transition(&POLICY, RepairState::Attempting, RepairEvent::StagePassed);
        assert_eq!(state, RepairState::Succeeded { repairs: 0 });
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_repair_then_pass() {
        let (state, actions) = transition(&POLICY, RepairState::Attempting, failed("TS2304"));
        assert_eq!(
            state,
            RepairState::Repairing {
                repair: 1,
                error: "TS2304".to_string()
            }
        );
        assert!(matches!(
            actions[1],
            RepairAction::RequestRepair { repair: 1, .. }
        ));

        let (state, actions) = transition(&POLICY, state, RepairEvent::RepairReceived);
        assert_eq!(state, RepairState::Rebuilding { repair: 1 });
        assert_eq!(actions, vec![RepairAction::RerunStage { repair: 1 }]);

        let (state, _) = transition(&POLICY, state, RepairEvent::StagePassed);
        assert_eq!(state, RepairState::Succeeded { repairs: 1 });
    }

    #[test]
    fn test_budget_exhaustion_keeps_last_error() {
        let (state, _) = transition(&POLICY, RepairState::Rebuilding { repair: 2 }, failed("still broken"));
        assert_eq!(
            state,
            RepairState::Exhausted {
                repairs: 2,
                error: "still broken".to_string()
            }
        );
    }

    #[test]
    fn test_zero_budget_never_repairs() {
        let policy = RepairPolicy {
            max_repairs: 0,
            retry_allowed: true,
        };
        let (state, actions) = transition(&policy, RepairState::Attempting, failed("boom"));
        assert!(matches!(state, RepairState::Exhausted { repairs: 0, .. }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, RepairAction::RequestRepair { .. })));
    }

    #[test]
    fn test_veto_fails_without_repair() {
        let policy = RepairPolicy {
            max_repairs: 5,
            retry_allowed: false,
        };
        let (state, _) = transition(&policy, RepairState::Attempting, failed("boom"));
        assert!(matches!(state, RepairState::Failed { repairs: 0, .. }));
    }

    #[test]
    fn test_rejected_repair_aborts() {
        let state = RepairState::Repairing {
            repair: 1,
            error: "boom".to_string(),
        };
        let (state, _) = transition(
            &POLICY,
            state,
            RepairEvent::RepairRejected {
                reason: "quota".to_string(),
            },
        );
        assert_eq!(
            state,
            RepairState::Aborted {
                repairs: 0,
                reason: "quota".to_string()
            }
        );
    }

    #[test]
    fn test_cancel_from_rebuilding_keeps_count() {
        let (state, _) = transition(&POLICY, RepairState::Rebuilding { repair: 1 }, RepairEvent::Cancelled);
        assert_eq!(state, RepairState::Cancelled { repairs: 1 });
    }

    #[test]
    fn test_unscheduled_rerun_ends_without_repair() {
        let rebuilding = RepairState::Rebuilding { repair: 1 };
        let (state, actions) = transition(
            &POLICY,
            rebuilding,
            RepairEvent::StageNotScheduled {
                reason: "no worker".to_string(),
            },
        );
        assert_eq!(
            state,
            RepairState::NotScheduled {
                repairs: 1,
                reason: "no worker".to_string(),
            }
        );
        assert!(state.is_terminal());
        assert!(!actions
            .iter()
            .any(|a| matches!(a, RepairAction::RequestRepair { .. })));
    }

    #[test]
    fn test_invalid_transition_fails() {
        let (state, actions) = transition(
            &POLICY,
            RepairState::Succeeded { repairs: 0 },
            RepairEvent::RepairReceived,
        );
        assert!(matches!(state, RepairState::Failed { .. }));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_merge_overwrites_appends_and_keeps() {
        let previous = FileSet::from_files([
            ResponseFile::new("a.ts", "a1"),
            ResponseFile::new("b.ts", "b1"),
        ]);
        let merged = merge_repair_files(
            &previous,
            &[ResponseFile::new("b.ts", "b2"), ResponseFile::new("c.ts", "c1")],
        );

        let paths: Vec<_> = merged.iter().map(|f| f.file_path.as_str()).collect();
        assert_eq!(paths, vec!["a.ts", "b.ts", "c.ts"]);
        assert_eq!(merged.get("b.ts").unwrap().code, "b2");
        assert_eq!(merged.get("a.ts").unwrap().code, "a1");
        // Previous attempt untouched
        assert_eq!(previous.get("b.ts").unwrap().code, "b1");
        assert_eq!(previous.len(), 2);
    }
}
