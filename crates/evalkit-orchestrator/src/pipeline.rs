//! Eval driver
//!
//! [`generate_code_and_assess`] takes one prompt through
//! generate → build (→ repair) → test (→ repair) → serve and returns an
//! [`EvalOutcome`]. Stage failures end up in the outcome; only fatal errors
//! (configuration, missing tools, rejected repairs) come back as `Err`.
//! [`run_evals`] drives many prompts concurrently against one gateway.

use evalkit_agent::LlmGenerateFilesContext;
use evalkit_core::fail_open::fail_open;
use evalkit_core::{
    Attempt, BuildResult, EnvironmentConfig, EvalId, FileSet, LlmContextFile,
    ProgressLogger, ProgressType, Result, RootPromptDefinition, ServeTestingResult, Stage,
    TestExecutionResult, Usage, POSSIBLE_PACKAGE_MANAGERS,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::file_system::write_response_files;
use crate::gateway::Gateway;
use crate::pool::WorkerPool;
use crate::repair::{run_repair_loop, RepairPolicy, RepairRun, RepairStage, RepairState, StageResult};
use crate::serve::probe_body;

/// Settings shared by every eval of a run
#[derive(Debug, Clone)]
pub struct EvalSettings {
    pub env: EnvironmentConfig,
    pub model: String,
    /// Files handed to the model as extra context
    pub context_files: Vec<LlmContextFile>,
}

/// Final state of one eval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub prompt: RootPromptDefinition,
    pub model: String,
    /// Every generate/repair pass, in order
    pub attempts: Vec<Attempt>,
    /// Number of build repairs that were requested
    pub repair_attempts: usize,
    pub test_repair_attempts: usize,
    pub build_result: BuildResult,
    /// `None` when no tests ran
    pub test_result: Option<TestExecutionResult>,
    /// `None` when the app was not served
    pub serve_testing_result: Option<ServeTestingResult>,
    pub usage: Usage,
    pub cancelled: bool,
    /// Stage whose job never got a worker; that stage did not run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_scheduled: Option<Stage>,
}

impl EvalOutcome {
    fn new(prompt: &RootPromptDefinition, model: &str, build_result: BuildResult) -> Self {
        Self {
            prompt: prompt.clone(),
            model: model.to_string(),
            attempts: Vec::new(),
            repair_attempts: 0,
            test_repair_attempts: 0,
            build_result,
            test_result: None,
            serve_testing_result: None,
            usage: Usage::default(),
            cancelled: false,
            not_scheduled: None,
        }
    }

    /// Files of the latest attempt
    pub fn final_files(&self) -> Option<&FileSet> {
        self.attempts.last().map(|a| &a.output_files)
    }
}

/// Context handed to the runner for `prompt` in `dir`
pub fn request_context(
    env: &EnvironmentConfig,
    prompt: &RootPromptDefinition,
    dir: &Path,
) -> LlmGenerateFilesContext {
    let system_instructions = [env.system_instructions.as_str(), prompt.system_instructions.as_str()]
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    LlmGenerateFilesContext {
        directory: dir.to_path_buf(),
        system_instructions,
        executable_prompt: prompt.prompt.clone(),
        build_command: Some(env.build_command.clone()),
        package_manager: Some(env.package_manager.clone()).filter(|p| !p.is_empty()),
        possible_package_managers: POSSIBLE_PACKAGE_MANAGERS.iter().map(|p| p.to_string()).collect(),
    }
}

/// Run one prompt through every stage.
///
/// `finalize_eval` is always called once the eval has an id, whatever the
/// outcome.
#[instrument(skip_all, fields(app = %prompt.name, model = %settings.model))]
pub async fn generate_code_and_assess(
    gateway: Arc<dyn Gateway>,
    pool: &WorkerPool,
    settings: &EvalSettings,
    prompt: &RootPromptDefinition,
    dir: &Path,
    progress: &dyn ProgressLogger,
    cancel: &CancellationToken,
) -> Result<EvalOutcome> {
    let id = gateway
        .initialize_eval()
        .await
        .map_err(|e| e.in_stage(&prompt.name, Stage::Generate))?;

    let result = drive(gateway.as_ref(), &id, pool, settings, prompt, dir, progress, cancel).await;

    fail_open("eval finalization", || gateway.finalize_eval(&id)).await;
    progress.eval_finished(prompt);
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    gateway: &dyn Gateway,
    id: &EvalId,
    pool: &WorkerPool,
    settings: &EvalSettings,
    prompt: &RootPromptDefinition,
    dir: &Path,
    progress: &dyn ProgressLogger,
    cancel: &CancellationToken,
) -> Result<EvalOutcome> {
    let env = &settings.env;
    let ctx = request_context(env, prompt, dir);

    progress.log(prompt, ProgressType::Codegen, "Generating code", None);
    let response = gateway
        .generate_initial_files(id, &ctx, &settings.model, &settings.context_files, cancel)
        .await
        .map_err(|e| e.in_stage(&prompt.name, Stage::Generate))?;

    if !response.success {
        let details = response.errors.join("\n");
        progress.log(prompt, ProgressType::Error, "Failed to generate code", Some(&details));
        let mut outcome = EvalOutcome::new(
            prompt,
            &settings.model,
            BuildResult::error(format!("Failed to generate code:\n{}", details), None),
        );
        outcome.usage = response.usage;
        return Ok(outcome);
    }

    let files = FileSet::from_files(response.output_files.iter().cloned());
    write_response_files(dir, &files)
        .await
        .map_err(|e| e.in_stage(&prompt.name, Stage::Generate))?;
    info!("[{}] Generated {} file(s)", prompt.name, files.len());

    progress.log(prompt, ProgressType::Build, "Building the app", None);
    let mut cancelled = false;
    let mut not_scheduled = false;
    let initial_build = match gateway.try_build(id, env, dir, prompt, pool, cancel, progress).await {
        Ok(build) => build,
        Err(e) if e.is_cancelled() => {
            cancelled = true;
            BuildResult::error("Build was cancelled", None)
        }
        Err(e) if e.is_not_scheduled() => {
            not_scheduled = true;
            BuildResult::error(e.to_string(), None)
        }
        Err(e) => return Err(e.in_stage(&prompt.name, Stage::Build)),
    };

    let mut attempts = vec![Attempt {
        attempt: 0,
        output_files: files.clone(),
        build_result: initial_build.clone(),
        test_result: None,
        serve_testing_result: None,
        usage: response.usage,
        reasoning: response.reasoning,
    }];
    let mut outcome = EvalOutcome::new(prompt, &settings.model, initial_build.clone());

    if cancelled || not_scheduled {
        warn!("[{}] Build did not run: {}", prompt.name, initial_build.message);
        outcome.attempts = attempts;
        outcome.cancelled = cancelled;
        outcome.not_scheduled = not_scheduled.then_some(Stage::Build);
        return Ok(finish(outcome));
    }

    let run = RepairRun {
        gateway,
        id,
        env,
        prompt,
        dir,
        pool,
        model: &settings.model,
        request_ctx: &ctx,
        context_files: &settings.context_files,
        cancel,
        progress,
    };

    let build_loop = run_repair_loop(
        &run,
        RepairStage::Build,
        RepairPolicy {
            max_repairs: env.max_build_repair_attempts,
            retry_allowed: gateway.should_retry_failed_builds(id),
        },
        StageResult::Build(initial_build),
        files,
        attempts.len(),
    )
    .await
    .map_err(|e| e.in_stage(&prompt.name, Stage::Repair))?;

    outcome.repair_attempts = build_loop.repairs();
    outcome.cancelled = matches!(build_loop.state, RepairState::Cancelled { .. });
    if matches!(build_loop.state, RepairState::NotScheduled { .. }) {
        outcome.not_scheduled = Some(Stage::Build);
    }
    attempts.extend(build_loop.attempts);
    if let StageResult::Build(build) = &build_loop.last_result {
        outcome.build_result = build.clone();
    }
    let mut files = build_loop.files;

    if outcome.cancelled || !outcome.build_result.is_success() {
        if !outcome.cancelled && outcome.not_scheduled.is_none() {
            progress.log(prompt, ProgressType::Error, "Build failed", Some(&outcome.build_result.message));
        }
        outcome.attempts = attempts;
        return Ok(finish(outcome));
    }

    progress.log(prompt, ProgressType::Test, "Running tests", None);
    match gateway.try_test(id, env, dir, prompt, pool, cancel, progress).await {
        Ok(None) => {}
        Ok(Some(initial_test)) => {
            if let Some(last) = attempts.last_mut() {
                last.test_result = Some(initial_test.clone());
            }
            let test_loop = run_repair_loop(
                &run,
                RepairStage::Test,
                RepairPolicy {
                    max_repairs: env.max_test_repair_attempts,
                    retry_allowed: gateway.should_retry_failed_test_execution(id),
                },
                StageResult::Test(initial_test),
                files,
                attempts.len(),
            )
            .await
            .map_err(|e| e.in_stage(&prompt.name, Stage::Repair))?;

            outcome.test_repair_attempts = test_loop.repairs();
            outcome.cancelled = matches!(test_loop.state, RepairState::Cancelled { .. });
            if matches!(test_loop.state, RepairState::NotScheduled { .. }) {
                outcome.not_scheduled = Some(Stage::Test);
            }
            attempts.extend(test_loop.attempts);
            if let StageResult::Test(test) = test_loop.last_result {
                if !test.passed && !outcome.cancelled && outcome.not_scheduled.is_none() {
                    progress.log(prompt, ProgressType::Error, "Tests failed", Some(&test.output));
                }
                outcome.test_result = Some(test);
            }
            files = test_loop.files;
        }
        Err(e) if e.is_cancelled() => outcome.cancelled = true,
        Err(e) if e.is_not_scheduled() => {
            warn!("[{}] Tests did not run: {}", prompt.name, e);
            outcome.not_scheduled = Some(Stage::Test);
        }
        Err(e) => return Err(e.in_stage(&prompt.name, Stage::Test)),
    }
    info!("[{}] Final file set has {} file(s)", prompt.name, files.len());

    if !outcome.cancelled && env.serve_command.is_some() {
        progress.log(prompt, ProgressType::ServeTesting, "Serving the app", None);
        match gateway.serve_build(id, env, dir, prompt, progress, cancel, probe_body()).await {
            Ok(serve) => outcome.serve_testing_result = Some(serve),
            Err(e) if e.is_cancelled() => outcome.cancelled = true,
            Err(e) if e.is_fatal() => return Err(e.in_stage(&prompt.name, Stage::Serve)),
            Err(e) => {
                warn!("[{}] Serving failed: {}", prompt.name, e);
                outcome.serve_testing_result = Some(ServeTestingResult {
                    runtime_errors: Some(e.to_string()),
                    ..Default::default()
                });
            }
        }
        if let Some(last) = attempts.last_mut() {
            last.serve_testing_result = outcome.serve_testing_result.clone();
        }
    }

    outcome.attempts = attempts;
    if !outcome.cancelled {
        progress.log(prompt, ProgressType::Eval, "Eval finished", None);
    }
    Ok(finish(outcome))
}

fn finish(mut outcome: EvalOutcome) -> EvalOutcome {
    outcome.usage = outcome
        .attempts
        .iter()
        .fold(Usage::default(), |total, attempt| total + attempt.usage);
    outcome
}

/// Directory name for a prompt: anything outside `[A-Za-z0-9_-]` becomes `-`
pub fn eval_directory_name(prompt: &RootPromptDefinition) -> String {
    let name: String = prompt
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    if name.is_empty() {
        "eval".to_string()
    } else {
        name
    }
}

/// Directory names for a whole run, one per prompt and all distinct.
///
/// The first prompt keeps its sanitized name; later prompts whose name is
/// already taken get `-2`, `-3`, ... appended.
pub fn unique_directory_names(prompts: &[RootPromptDefinition]) -> Vec<String> {
    let mut taken = HashSet::new();
    prompts
        .iter()
        .map(|prompt| {
            let base = eval_directory_name(prompt);
            let mut name = base.clone();
            let mut suffix = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}-{}", base, suffix);
                suffix += 1;
            }
            name
        })
        .collect()
}

/// Give an eval an empty directory, removing what an earlier run left there
async fn prepare_eval_directory(dir: &Path) -> Result<()> {
    if tokio::fs::try_exists(dir).await? {
        debug!("Clearing previous output in {}", dir.display());
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Result of one prompt in a run
#[derive(Debug)]
pub struct EvalRunResult {
    pub prompt: RootPromptDefinition,
    pub directory: PathBuf,
    pub outcome: Result<EvalOutcome>,
}

/// Run every prompt, at most `max_concurrent_evals` at a time.
///
/// Each eval gets its own empty directory under `workdir` and a child of
/// `cancel`.
/// Results come back in completion order.
#[allow(clippy::too_many_arguments)]
pub async fn run_evals(
    gateway: Arc<dyn Gateway>,
    pool: &WorkerPool,
    settings: &EvalSettings,
    prompts: Vec<RootPromptDefinition>,
    workdir: &Path,
    max_concurrent_evals: usize,
    progress: &dyn ProgressLogger,
    cancel: &CancellationToken,
) -> Vec<EvalRunResult> {
    progress.initialize(prompts.len());

    let names = unique_directory_names(&prompts);
    let results = stream::iter(prompts.into_iter().zip(names))
        .map(|(prompt, name)| {
            let gateway = Arc::clone(&gateway);
            let directory = workdir.join(name);
            let eval_cancel = cancel.child_token();
            async move {
                let outcome = match prepare_eval_directory(&directory).await {
                    Ok(()) => {
                        generate_code_and_assess(
                            gateway,
                            pool,
                            settings,
                            &prompt,
                            &directory,
                            progress,
                            &eval_cancel,
                        )
                        .await
                    }
                    Err(e) => Err(e.in_stage(&prompt.name, Stage::Generate)),
                };
                if let Err(e) = &outcome {
                    warn!("[{}] Eval failed: {}", prompt.name, e);
                }
                EvalRunResult {
                    prompt,
                    directory,
                    outcome,
                }
            }
        })
        .buffer_unordered(max_concurrent_evals.max(1))
        .collect::<Vec<_>>()
        .await;

    progress.finalize();
    results
}
