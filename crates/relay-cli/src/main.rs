use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_agent::{ClaudeRuntime, ShellRuntime};
use relay_core::coordinator::{summary_line, RunCoordinator, RunOptions};
use relay_core::events::{EventSink, PipelineEvent};
use relay_core::loops::LoopController;
use relay_core::pr::GhCli;
use relay_core::runtime::RuntimeMap;
use relay_core::state::{StateStore, DATA_DIR};
use relay_core::types::{RunStatus, TriggerKind};

#[derive(Parser)]
#[command(name = "relay", about = "Agent pipeline orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a pipeline definition.
    Run {
        /// Path to the pipeline YAML file.
        config: PathBuf,
        /// Plan and record the run without executing stages.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        verbose: bool,
        /// Cap loop iterations regardless of the config.
        #[arg(long)]
        max_loop_iterations: Option<u32>,
        /// Default agent runtime for stages without an override.
        #[arg(long, default_value = "claude")]
        runtime: String,
    },
    /// Inspect persisted runs.
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Git-hook entry point: run every pipeline declared for a trigger.
    Trigger {
        /// One of: pre-commit, post-commit, pre-push, post-merge.
        kind: String,
    },
    /// Load a pipeline definition and report problems.
    Validate {
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List persisted runs, most recent last.
    List {
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// Print one run's full state as JSON.
    Show { run_id: String },
}

/// Prints lifecycle events as they happen; the CLI's stand-in for a UI.
struct CliSink;

impl EventSink for CliSink {
    fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::StageStarted { stage_name, .. } => {
                println!("  > {stage_name} started");
            }
            PipelineEvent::StageCompleted { stage_name, .. } => {
                println!("  + {stage_name} completed");
            }
            PipelineEvent::StageFailed { stage_name, .. } => {
                println!("  ! {stage_name} failed");
            }
            PipelineEvent::PrCreated { pr_url, .. } => {
                println!("  + pull request {pr_url}");
            }
            _ => {}
        }
    }
}

fn build_runtimes() -> RuntimeMap {
    let mut runtimes: RuntimeMap = HashMap::new();
    runtimes.insert("claude".to_string(), Arc::new(ClaudeRuntime::new("claude")));
    runtimes.insert("shell".to_string(), Arc::new(ShellRuntime::new()));
    runtimes
}

fn repo_root() -> Result<PathBuf> {
    std::env::current_dir().context("resolve current directory")
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_cli=info,relay_core=info,relay_agent=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let root = repo_root()?;

    match cli.command {
        Command::Run {
            config,
            dry_run,
            verbose,
            max_loop_iterations,
            runtime,
        } => {
            let pipeline = relay_core::config::load_pipeline_config(&config)?;
            let state = execute(
                &root,
                &pipeline,
                &runtime,
                dry_run,
                verbose,
                max_loop_iterations,
            )
            .await?;
            println!("{}", summary_line(&state));
            if matches!(state.status, RunStatus::Failed | RunStatus::Aborted) {
                std::process::exit(1);
            }
        }
        Command::Runs { command } => {
            let store = StateStore::new(&root);
            match command {
                RunsCommand::List { pipeline } => {
                    for state in store.list(pipeline.as_deref())? {
                        println!("{}", summary_line(&state));
                    }
                }
                RunsCommand::Show { run_id } => match store.load(&run_id)? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => {
                        eprintln!("no run {run_id}");
                        std::process::exit(1);
                    }
                },
            }
        }
        Command::Trigger { kind } => {
            let trigger = parse_trigger(&kind)?;
            let dir = root.join(DATA_DIR).join("pipelines");
            let mut matched = 0usize;
            let mut failed = false;
            for path in pipeline_files(&dir)? {
                let pipeline = match relay_core::config::load_pipeline_config(&path) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping {}: {e:#}", path.display());
                        continue;
                    }
                };
                if pipeline.trigger != trigger {
                    continue;
                }
                matched += 1;
                info!("trigger {kind}: running pipeline '{}'", pipeline.name);
                let state = execute(&root, &pipeline, "claude", false, false, None).await?;
                println!("{}", summary_line(&state));
                failed |= matches!(state.status, RunStatus::Failed | RunStatus::Aborted);
            }
            if matched == 0 {
                info!("trigger {kind}: no pipelines declared");
            }
            if failed {
                std::process::exit(1);
            }
        }
        Command::Validate { config } => {
            let pipeline = relay_core::config::load_pipeline_config(&config)?;
            let plan = relay_core::planner::plan(&pipeline)?;
            println!(
                "pipeline '{}' is valid: {} stages in {} layers",
                pipeline.name,
                plan.stage_count(),
                plan.layers.len()
            );
            for (i, layer) in plan.layers.iter().enumerate() {
                let names: Vec<&str> = layer.stages.iter().map(|s| s.name.as_str()).collect();
                println!("  layer {}: {}", i + 1, names.join(", "));
            }
            for (name, runtime) in build_runtimes() {
                let validation = runtime.validate().await;
                if validation.ok {
                    let caps = runtime.capabilities();
                    println!(
                        "  runtime {name}: ok (streaming={}, token-tracking={})",
                        caps.supports_streaming, caps.supports_token_tracking
                    );
                } else {
                    println!("  runtime {name}: unavailable ({})", validation.errors.join("; "));
                }
            }
        }
    }

    Ok(())
}

async fn execute(
    root: &std::path::Path,
    pipeline: &relay_core::types::PipelineConfig,
    default_runtime: &str,
    dry_run: bool,
    verbose: bool,
    max_loop_iterations: Option<u32>,
) -> Result<relay_core::types::PipelineState> {
    let coordinator = RunCoordinator::new(
        root,
        build_runtimes(),
        default_runtime,
        Arc::new(GhCli::new(root)),
    );

    let abort = CancellationToken::new();
    let ctrl_c = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, aborting run...");
            ctrl_c.cancel();
        }
    });

    // Verbose mode tails every agent's output live.
    let token_stream = if verbose {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            while let Some((stage, line)) = rx.recv().await {
                println!("[{stage}] {line}");
            }
        });
        Some(tx)
    } else {
        None
    };

    let options = RunOptions {
        dry_run,
        verbose,
        max_loop_iterations,
        abort,
        sink: Arc::new(CliSink),
        token_stream,
        ..RunOptions::default()
    };

    LoopController::new(&coordinator).run(pipeline, &options).await
}

fn parse_trigger(kind: &str) -> Result<TriggerKind> {
    Ok(match kind {
        "manual" => TriggerKind::Manual,
        "pre-commit" => TriggerKind::PreCommit,
        "post-commit" => TriggerKind::PostCommit,
        "pre-push" => TriggerKind::PrePush,
        "post-merge" => TriggerKind::PostMerge,
        other => anyhow::bail!("unknown trigger '{other}'"),
    })
}

fn pipeline_files(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
        Ok(entries) => entries,
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yml" || e == "yaml")
        })
        .collect();
    files.sort();
    Ok(files)
}
