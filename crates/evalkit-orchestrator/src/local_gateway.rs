//! Gateway running everything on this machine
//!
//! Code generation goes to an [`LlmRunner`]; builds and tests go through the
//! worker pool as child processes; serving uses [`serve_app`].

use async_trait::async_trait;
use evalkit_agent::{LlmGenerateFilesContext, LlmGenerateFilesRequestOptions, LlmRunner};
use evalkit_core::{
    BuildErrorType, BuildResult, EnvironmentConfig, EvalError, EvalId, FileSet, LlmContextFile,
    LlmResponse, ProgressLogger, ProgressType, Result, RootPromptDefinition, ServeTestingResult,
    TestExecutionResult,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::{Gateway, ServeBody};
use crate::pool::{PoolError, WorkerPool};
use crate::serve::{serve_app, ServeOptions};
use crate::worker::{WorkerPayload, WorkerRequest};

pub struct LocalGateway {
    llm: Arc<dyn LlmRunner>,
}

impl LocalGateway {
    pub fn new(llm: Arc<dyn LlmRunner>) -> Self {
        Self { llm }
    }

    pub fn runner(&self) -> &Arc<dyn LlmRunner> {
        &self.llm
    }

    async fn generate(
        &self,
        ctx: &LlmGenerateFilesContext,
        model: &str,
        context_files: &[LlmContextFile],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let options = LlmGenerateFilesRequestOptions {
            context: ctx.clone(),
            model: model.to_string(),
            context_files: context_files.to_vec(),
        };

        match self.llm.generate_files(&options, cancel).await {
            Ok(response) => Ok(LlmResponse {
                success: true,
                output_files: response.files,
                usage: response.usage,
                reasoning: response.reasoning,
                errors: Vec::new(),
            }),
            Err(e) if e.is_fatal() || e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("{} failed to generate files: {}", self.llm.display_name(), e);
                Ok(LlmResponse::failed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    async fn initialize_eval(&self) -> Result<EvalId> {
        Ok(EvalId::next())
    }

    async fn generate_initial_files(
        &self,
        _id: &EvalId,
        ctx: &LlmGenerateFilesContext,
        model: &str,
        context_files: &[LlmContextFile],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        self.generate(ctx, model, context_files, cancel).await
    }

    async fn repair_code(
        &self,
        _id: &EvalId,
        ctx: &LlmGenerateFilesContext,
        model: &str,
        error_message: &str,
        _current_files: &FileSet,
        context_files: &[LlmContextFile],
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        // The agent sees the current files on disk; it only needs the error
        let mut repair_ctx = ctx.clone();
        repair_ctx.executable_prompt = format!(
            "{}\n\nThe project currently fails with the following error. Fix it:\n\n{}",
            ctx.executable_prompt, error_message
        );
        self.generate(&repair_ctx, model, context_files, cancel).await
    }

    async fn try_build(
        &self,
        _id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        pool: &WorkerPool,
        cancel: &CancellationToken,
        progress: &dyn ProgressLogger,
    ) -> Result<BuildResult> {
        let request = WorkerRequest::build(dir, &prompt.name, &env.build_command);

        match pool.submit(request, cancel).await {
            Ok(reply) => match reply.payload {
                WorkerPayload::Build(result) => Ok(result),
                WorkerPayload::Test(_) => Err(EvalError::Internal(
                    "Build worker answered with a test result".to_string(),
                )),
            },
            Err(PoolError::Cancelled) => Err(EvalError::Cancelled(format!("build of {}", prompt.name))),
            Err(e @ PoolError::AdmissionTimeout(_)) => {
                progress.log(prompt, ProgressType::Error, "Build was never scheduled", Some(&e.to_string()));
                Err(e.into())
            }
            Err(e @ PoolError::Job(_)) => Ok(BuildResult::error(e.to_string(), Some(BuildErrorType::Other))),
        }
    }

    async fn try_test(
        &self,
        _id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        pool: &WorkerPool,
        cancel: &CancellationToken,
        progress: &dyn ProgressLogger,
    ) -> Result<Option<TestExecutionResult>> {
        let Some(command) = env.test_command.as_deref().filter(|c| !c.trim().is_empty()) else {
            debug!("No test command for {}", prompt.name);
            return Ok(None);
        };

        let request = WorkerRequest::test(dir, &prompt.name, command, env.limits.test_timeout());
        match pool.submit(request, cancel).await {
            Ok(reply) => match reply.payload {
                WorkerPayload::Test(result) => Ok(Some(result)),
                WorkerPayload::Build(_) => Err(EvalError::Internal(
                    "Test worker answered with a build result".to_string(),
                )),
            },
            Err(PoolError::Cancelled) => Err(EvalError::Cancelled(format!("tests of {}", prompt.name))),
            Err(e @ PoolError::AdmissionTimeout(_)) => {
                progress.log(prompt, ProgressType::Error, "Tests were never scheduled", Some(&e.to_string()));
                Err(e.into())
            }
            Err(e) => {
                progress.log(prompt, ProgressType::Error, "Error when executing tests", Some(&e.to_string()));
                Ok(Some(TestExecutionResult {
                    passed: false,
                    output: e.to_string(),
                }))
            }
        }
    }

    async fn serve_build(
        &self,
        _id: &EvalId,
        env: &EnvironmentConfig,
        dir: &Path,
        prompt: &RootPromptDefinition,
        progress: &dyn ProgressLogger,
        cancel: &CancellationToken,
        body: ServeBody,
    ) -> Result<ServeTestingResult> {
        let command = env
            .serve_command
            .as_deref()
            .ok_or_else(|| EvalError::Config(format!("{} has no serve command", env.display_name)))?;
        let options = ServeOptions {
            kill_grace: env.limits.kill_grace(),
            ..ServeOptions::default()
        };
        serve_app(command, dir, prompt, progress, cancel, options, body).await
    }

    fn should_retry_failed_builds(&self, _id: &EvalId) -> bool {
        !self.llm.has_built_in_repair_loop()
    }

    fn should_retry_failed_test_execution(&self, _id: &EvalId) -> bool {
        !self.llm.has_built_in_repair_loop()
    }

    async fn finalize_eval(&self, _id: &EvalId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalkit_agent::LlmGenerateFilesResponse;
    use evalkit_core::{NoopProgressLogger, ResponseFile, Usage};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeRunner {
        built_in_repair: bool,
        fail_with: Option<fn() -> EvalError>,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(built_in_repair: bool) -> Self {
            Self {
                built_in_repair,
                fail_with: None,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmRunner for FakeRunner {
        fn id(&self) -> &str {
            "fake"
        }

        fn display_name(&self) -> &str {
            "Fake"
        }

        fn has_built_in_repair_loop(&self) -> bool {
            self.built_in_repair
        }

        fn supported_models(&self) -> Vec<String> {
            vec!["fake-model".to_string()]
        }

        async fn generate_files(
            &self,
            options: &LlmGenerateFilesRequestOptions,
            _cancel: &CancellationToken,
        ) -> Result<LlmGenerateFilesResponse> {
            self.prompts
                .lock()
                .unwrap()
                .push(options.context.executable_prompt.clone());
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(LlmGenerateFilesResponse {
                files: vec![ResponseFile::new("src/app.ts", "app")],
                reasoning: "done".to_string(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }

        async fn generate_text(&self, _model: &str, _prompt: &str) -> Result<String> {
            Err(EvalError::Unsupported("text".to_string()))
        }

        async fn generate_constrained(
            &self,
            _model: &str,
            _prompt: &str,
            _schema: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Err(EvalError::Unsupported("constrained".to_string()))
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ctx() -> LlmGenerateFilesContext {
        LlmGenerateFilesContext {
            executable_prompt: "Build a todo app".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_eval_ids_are_unique() {
        let gateway = LocalGateway::new(Arc::new(FakeRunner::new(false)));
        let a = gateway.initialize_eval().await.unwrap();
        let b = gateway.initialize_eval().await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_retry_policy_follows_runner() {
        let id = EvalId::next();
        let agent = LocalGateway::new(Arc::new(FakeRunner::new(true)));
        assert!(!agent.should_retry_failed_builds(&id));
        assert!(!agent.should_retry_failed_test_execution(&id));

        let plain = LocalGateway::new(Arc::new(FakeRunner::new(false)));
        assert!(plain.should_retry_failed_builds(&id));
        assert!(plain.should_retry_failed_test_execution(&id));
    }

    #[tokio::test]
    async fn test_repair_prompt_carries_error() {
        let runner = Arc::new(FakeRunner::new(false));
        let gateway = LocalGateway::new(runner.clone());
        let response = gateway
            .repair_code(
                &EvalId::next(),
                &ctx(),
                "fake-model",
                "error TS2304: Cannot find name 'signal'",
                &FileSet::new(),
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.usage.input_tokens, 10);
        let prompts = runner.prompts.lock().unwrap();
        assert!(prompts[0].starts_with("Build a todo app"));
        assert!(prompts[0].contains("TS2304"));
    }

    #[tokio::test]
    async fn test_runner_errors_become_failed_responses() {
        let mut runner = FakeRunner::new(false);
        runner.fail_with = Some(|| EvalError::Agent("agent crashed".to_string()));
        let gateway = LocalGateway::new(Arc::new(runner));

        let response = gateway
            .generate_initial_files(&EvalId::next(), &ctx(), "fake-model", &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response.errors[0].contains("agent crashed"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_fatal() {
        let mut runner = FakeRunner::new(false);
        runner.fail_with = Some(|| EvalError::ToolUnavailable("Codex is not installed".to_string()));
        let gateway = LocalGateway::new(Arc::new(runner));

        let err = gateway
            .generate_initial_files(&EvalId::next(), &ctx(), "fake-model", &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_no_test_command_means_no_tests() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalGateway::new(Arc::new(FakeRunner::new(false)));
        let pool = WorkerPool::new(1, Duration::from_secs(5));
        let env = EnvironmentConfig::default();

        let result = gateway
            .try_test(
                &EvalId::next(),
                &env,
                dir.path(),
                &RootPromptDefinition::new("todo", "todo"),
                &pool,
                &CancellationToken::new(),
                &NoopProgressLogger,
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_runs_through_pool() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = LocalGateway::new(Arc::new(FakeRunner::new(false)));
        let pool = WorkerPool::new(1, Duration::from_secs(5));
        let env = EnvironmentConfig {
            build_command: "echo built".to_string(),
            ..Default::default()
        };

        let result = gateway
            .try_build(
                &EvalId::next(),
                &env,
                dir.path(),
                &RootPromptDefinition::new("todo", "todo"),
                &pool,
                &CancellationToken::new(),
                &NoopProgressLogger,
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.message, "built");
    }

    /// Holds its worker until the job is cancelled
    struct StallingExecutor;

    #[async_trait]
    impl crate::worker::JobExecutor for StallingExecutor {
        async fn run(
            &self,
            _request: WorkerRequest,
            cancel: CancellationToken,
        ) -> Result<crate::worker::WorkerReply> {
            cancel.cancelled().await;
            Err(EvalError::Cancelled("stalled job stopped".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscheduled_jobs_are_not_failures() {
        let gateway = Arc::new(LocalGateway::new(Arc::new(FakeRunner::new(false))));
        let pool = WorkerPool::with_executor(1, Duration::from_millis(300), Arc::new(StallingExecutor));
        let env = EnvironmentConfig {
            build_command: "npm run build".to_string(),
            test_command: Some("npm test".to_string()),
            ..Default::default()
        };
        let prompt = RootPromptDefinition::new("todo", "todo");
        let cancel = CancellationToken::new();

        let busy = {
            let (gateway, pool, env, prompt, cancel) =
                (gateway.clone(), pool.clone(), env.clone(), prompt.clone(), cancel.clone());
            tokio::spawn(async move {
                gateway
                    .try_build(&EvalId::next(), &env, Path::new("/tmp"), &prompt, &pool, &cancel, &NoopProgressLogger)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.in_flight(), 1);

        let err = gateway
            .try_build(&EvalId::next(), &env, Path::new("/tmp"), &prompt, &pool, &cancel, &NoopProgressLogger)
            .await
            .unwrap_err();
        assert!(err.is_not_scheduled());
        assert!(!err.is_fatal());

        let err = gateway
            .try_test(&EvalId::next(), &env, Path::new("/tmp"), &prompt, &pool, &cancel, &NoopProgressLogger)
            .await
            .unwrap_err();
        assert!(err.is_not_scheduled());

        cancel.cancel();
        assert!(busy.await.unwrap().unwrap_err().is_cancelled());
    }
}
