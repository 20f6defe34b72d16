//! evalkit CLI - evaluate code-generation agents
//!
//! Usage:
//!   evalkit run --env <toml> --prompts <path> --runner <name> --model <m>
//!   evalkit stats <results.json>    Recompute statistics of a saved run
//!   evalkit runners                 List runners and their models

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evalkit_agent::{runner_by_name, runner_with_limits, LlmRunner, RUNNER_NAMES};
use evalkit_core::{EnvironmentConfig, RootPromptDefinition, TracingProgressLogger};
use evalkit_orchestrator::{run_evals, EvalSettings, LocalGateway, WorkerPool};
use evalkit_ratings::{assess, built_in_rules, is_positive_score, AggregatedRunStats, RunReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "evalkit")]
#[command(author, version, about = "Evaluate code-generation agents")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, build, test and score an app for every prompt
    Run {
        /// Environment file (TOML)
        #[arg(long, value_name = "FILE")]
        env: PathBuf,

        /// Prompt file, or a directory of prompt files
        #[arg(long, value_name = "PATH")]
        prompts: PathBuf,

        /// Agent runner to use
        #[arg(long, default_value = "claude-code")]
        runner: String,

        /// Model passed to the runner
        #[arg(short, long)]
        model: String,

        /// Directory the apps are generated in, one subdirectory per prompt
        #[arg(long, default_value = ".evalkit/workdir")]
        workdir: PathBuf,

        /// Write the full results as JSON
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Maximum number of prompts evaluated at once
        #[arg(long, default_value = "4")]
        max_concurrent_evals: usize,
    },

    /// Recompute statistics of a saved run
    Stats {
        /// Results file written by `evalkit run --output`
        results: PathBuf,
    },

    /// List available runners and their models
    Runners,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            env,
            prompts,
            runner,
            model,
            workdir,
            output,
            max_concurrent_evals,
        } => {
            cmd_run(
                env,
                prompts,
                runner,
                model,
                workdir,
                output,
                max_concurrent_evals,
            )
            .await
        }
        Commands::Stats { results } => cmd_stats(results).await,
        Commands::Runners => cmd_runners(),
    }
}

async fn cmd_run(
    env_path: PathBuf,
    prompts_path: PathBuf,
    runner_name: String,
    model: String,
    workdir: PathBuf,
    output: Option<PathBuf>,
    max_concurrent_evals: usize,
) -> Result<()> {
    let env = EnvironmentConfig::load(&env_path)
        .with_context(|| format!("Failed to load environment {:?}", env_path))?;
    let prompts = load_prompts(&prompts_path).await?;
    if prompts.is_empty() {
        bail!("No prompts found in {:?}", prompts_path);
    }

    let runner = runner_with_limits(&runner_name, &env.limits)?;
    if !runner.supported_models().iter().any(|m| *m == model) {
        warn!(
            "{} does not list '{}' among its models: {}",
            runner.display_name(),
            model,
            runner.supported_models().join(", ")
        );
    }

    tokio::fs::create_dir_all(&workdir)
        .await
        .with_context(|| format!("Failed to create work directory {:?}", workdir))?;
    let workdir = tokio::fs::canonicalize(&workdir).await?;

    info!(
        "Evaluating {} prompt(s) with {} ({}) in {:?}",
        prompts.len(),
        runner.display_name(),
        model,
        workdir
    );

    // Ctrl-C cancels every eval of the run
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling evals");
            ctrl_c.cancel();
        }
    });

    let pool = WorkerPool::new(env.limits.worker_concurrency, env.limits.admission_timeout());
    let gateway = Arc::new(LocalGateway::new(Arc::clone(&runner)));
    let settings = EvalSettings {
        env,
        model: model.clone(),
        context_files: Vec::new(),
    };
    let progress = TracingProgressLogger::new();

    let results = run_evals(
        gateway,
        &pool,
        &settings,
        prompts,
        &workdir,
        max_concurrent_evals,
        &progress,
        &cancel,
    )
    .await;

    if let Err(e) = runner.dispose().await {
        warn!("Failed to dispose runner: {}", e);
    }

    let rules = built_in_rules();
    let mut assessments = Vec::new();
    let mut failures = 0;
    for result in results {
        match result.outcome {
            Ok(outcome) => assessments.push(assess(outcome, &rules)),
            Err(e) => {
                failures += 1;
                println!("{}: {}", result.prompt.name, e);
            }
        }
    }

    let report = RunReport::new(&settings.env.display_name, runner.id(), &model, assessments)?;
    print_stats(&report.stats);
    if failures > 0 {
        println!("\n{} eval(s) aborted with an error", failures);
    }

    if let Some(path) = output {
        report
            .save(&path)
            .await
            .with_context(|| format!("Failed to write results to {:?}", path))?;
        println!("\nResults written to {:?}", path);
    }

    if cancel.is_cancelled() {
        bail!("Run was cancelled");
    }
    Ok(())
}

async fn cmd_stats(path: PathBuf) -> Result<()> {
    let report = RunReport::load(&path)
        .await
        .with_context(|| format!("Failed to read results {:?}", path))?;
    let stats = report.recompute_stats()?;

    println!(
        "{} / {} ({}) - {}",
        report.environment,
        report.runner,
        report.model,
        report.created_at.format("%Y-%m-%d %H:%M")
    );
    print_stats(&stats);
    Ok(())
}

fn cmd_runners() -> Result<()> {
    for name in RUNNER_NAMES {
        let runner: Arc<dyn LlmRunner> = runner_by_name(name)?;
        println!("{} ({})", runner.id(), runner.display_name());
        for model in runner.supported_models() {
            println!("  - {}", model);
        }
    }
    Ok(())
}

/// A prompt file, or every file of a directory sorted by name
async fn load_prompts(path: &Path) -> Result<Vec<RootPromptDefinition>> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Prompt path {:?} does not exist", path))?;

    let mut files = Vec::new();
    if metadata.is_dir() {
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }

    files
        .iter()
        .map(|file| {
            RootPromptDefinition::from_file(file)
                .with_context(|| format!("Failed to read prompt {:?}", file))
        })
        .collect()
}

fn print_stats(stats: &AggregatedRunStats) {
    let builds = &stats.builds;
    println!("\nBuilds");
    println!("======");
    println!("Initial success:      {}", builds.successful_initial_builds);
    println!("Success after repair: {}", builds.successful_builds_after_repair);
    println!("Failed:               {}", builds.failed_builds);
    if builds.not_scheduled_builds > 0 {
        println!("Never scheduled:      {}", builds.not_scheduled_builds);
    }
    if let Some(distribution) = &builds.error_distribution {
        for (error_type, count) in distribution {
            println!("  {}: {}", error_type, count);
        }
    }

    let tests = &stats.tests;
    println!("\nTests");
    println!("=====");
    println!("Initial success:      {}", tests.successful_initial_tests);
    println!("Success after repair: {}", tests.successful_tests_after_repair);
    println!("Failed:               {}", tests.failed_tests);
    println!("Not run:              {}", tests.no_tests_run);
    if tests.not_scheduled_tests > 0 {
        println!("Never scheduled:      {}", tests.not_scheduled_tests);
    }

    if let Some(runtime) = &stats.runtime {
        println!("\nRuntime");
        println!("=======");
        println!("Apps with errors:     {}", runtime.apps_with_errors);
        println!("Apps without errors:  {}", runtime.apps_without_errors);
    }

    if let Some(accessibility) = &stats.accessibility {
        println!("\nAccessibility");
        println!("=============");
        println!("Apps with errors:     {}", accessibility.apps_with_errors);
        println!("Apps without errors:  {}", accessibility.apps_without_errors);
    }

    if let Some(security) = &stats.security {
        println!("\nSecurity");
        println!("========");
        println!("Apps with errors:     {}", security.apps_with_errors);
        println!("Apps without errors:  {}", security.apps_without_errors);
    }

    println!("\nScores");
    println!("======");
    for bucket in &stats.buckets {
        let marker = if is_positive_score(bucket) { "+" } else { "-" };
        println!("{} {:<20} {}", marker, bucket.name_with_labels, bucket.apps_count);
    }
}
