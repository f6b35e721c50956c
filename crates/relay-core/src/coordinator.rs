use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::commit::CommitManager;
use crate::config;
use crate::error::{ErrorCategory, RelayError};
use crate::events::{EventSink, NullSink, PipelineEvent, StateObserver};
use crate::executor::{StageExecutor, StageRunContext};
use crate::finalize::{self, FinalizeDeps};
use crate::group;
use crate::planner;
use crate::pr::PrProvider;
use crate::runtime::RuntimeMap;
use crate::state::{RunLogger, StateStore};
use crate::types::{
    FailureStrategy, LoopContext, OnFail, PipelineConfig, PipelineState, RunStatus,
    StageExecution, StageStatus, TriggerInfo,
};
use crate::workspace::WorkspaceManager;

/// Caller-supplied knobs for one run.
#[derive(Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub interactive: bool,
    pub verbose: bool,
    /// Overrides `looping.maxIterations` from the config.
    pub max_loop_iterations: Option<u32>,
    pub abort: CancellationToken,
    pub observer: Option<Arc<dyn StateObserver>>,
    pub sink: Arc<dyn EventSink>,
    /// Live (stage, line) stream for the UI.
    pub token_stream: Option<UnboundedSender<(String, String)>>,
    /// Set by the loop controller; attached to the run state.
    pub loop_context: Option<LoopContext>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            interactive: false,
            verbose: false,
            max_loop_iterations: None,
            abort: CancellationToken::new(),
            observer: None,
            sink: Arc::new(NullSink),
            token_stream: None,
            loop_context: None,
        }
    }
}

/// Drives one pipeline run end-to-end and owns its state.
///
/// The coordinator is the only writer of the `PipelineState`; observers and
/// the event sink receive snapshots. Stage errors never escape `run`; only
/// configuration and workspace preparation failures do.
pub struct RunCoordinator {
    repo_root: PathBuf,
    runtimes: RuntimeMap,
    default_runtime: String,
    store: StateStore,
    workspaces: WorkspaceManager,
    pr: Arc<dyn PrProvider>,
}

impl RunCoordinator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        runtimes: RuntimeMap,
        default_runtime: impl Into<String>,
        pr: Arc<dyn PrProvider>,
    ) -> Self {
        let repo_root = repo_root.into();
        Self {
            store: StateStore::new(&repo_root),
            workspaces: WorkspaceManager::new(&repo_root),
            repo_root,
            runtimes,
            default_runtime: default_runtime.into(),
            pr,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn persist(&self, state: &PipelineState, options: &RunOptions) -> Result<()> {
        self.store.save(state)?;
        if let Some(observer) = &options.observer {
            observer.on_state_change(state);
        }
        Ok(())
    }

    /// Run the pipeline to a terminal status. On return the state is
    /// persisted and terminal.
    pub async fn run(&self, pipeline: &PipelineConfig, options: &RunOptions) -> Result<PipelineState> {
        // Config and graph validation happen before any side effect.
        config::validate(pipeline)?;
        let plan = planner::plan(pipeline)?;

        let run_id = Ulid::new().to_string();
        let git = self.workspaces.git();
        let head = git.current_commit(&self.repo_root).await.ok();
        let trigger = TriggerInfo::now(pipeline.trigger, head);

        let mut state = PipelineState::new(&run_id, pipeline.clone(), trigger);
        state.loop_context = options.loop_context.clone();
        state.status = RunStatus::Running;

        let logger = Arc::new(RunLogger::new(&self.repo_root, &pipeline.name));

        self.store.create(&state)?;
        if let Some(observer) = &options.observer {
            observer.on_state_change(&state);
        }
        options.sink.emit(PipelineEvent::PipelineStarted {
            state: state.clone(),
        });
        logger.log(&format!(
            "run {run_id} started ({} stages in {} layers)",
            plan.stage_count(),
            plan.layers.len()
        ));

        if options.dry_run {
            for name in plan.stage_names() {
                state.stages.push(StageExecution::skipped(name));
            }
            state.status = RunStatus::Completed;
            state.end_time = Some(Utc::now());
            self.persist(&state, options)?;
            logger.log("dry run: planned only, no stages executed");
            options.sink.emit(PipelineEvent::PipelineCompleted {
                state: state.clone(),
                partial: false,
            });
            return Ok(state);
        }

        let workspace = match self.workspaces.prepare(pipeline, &run_id).await {
            Ok(ws) => ws,
            Err(e) => {
                state.status = RunStatus::Failed;
                state.end_time = Some(Utc::now());
                self.persist(&state, options)?;
                logger.log(&format!("workspace preparation failed: {e:#}"));
                options.sink.emit(PipelineEvent::PipelineFailed {
                    state: state.clone(),
                });
                return Err(RelayError::Workspace(format!("{e:#}")).into());
            }
        };
        state.artifacts.initial_commit = Some(workspace.initial_commit.clone());
        state.artifacts.branch = Some(workspace.branch.clone());
        state.artifacts.handover_dir =
            Some(workspace.handover_dir.to_string_lossy().into_owned());
        self.persist(&state, options)?;

        let executor = Arc::new(StageExecutor::new(
            self.runtimes.clone(),
            self.default_runtime.clone(),
            Arc::new(CommitManager::new(git.clone())),
            Arc::clone(&options.sink),
            Arc::clone(&logger),
        ));

        let strategy = pipeline.execution.failure_strategy;
        let loop_instructions = (pipeline.looping.enabled
            && !pipeline.looping.instructions.is_empty())
        .then(|| pipeline.looping.instructions.clone());

        // Stages whose dependents must not run (failed or skipped).
        let mut unrunnable: HashSet<String> = HashSet::new();
        let mut aborted = false;
        let mut stop_gate = false;

        for layer in &plan.layers {
            if options.abort.is_cancelled() {
                aborted = true;
            }
            if aborted || stop_gate {
                for stage in &layer.stages {
                    state.stages.push(StageExecution::skipped(stage.name.clone()));
                }
                continue;
            }

            // Dependents of a failed or skipped stage are skipped, in
            // continue mode as well as stop mode.
            let mut runnable = Vec::new();
            for stage in &layer.stages {
                if stage.depends_on.iter().any(|d| unrunnable.contains(d)) {
                    unrunnable.insert(stage.name.clone());
                    state.stages.push(StageExecution::skipped(stage.name.clone()));
                } else {
                    runnable.push(stage.clone());
                }
            }
            if runnable.is_empty() {
                self.persist(&state, options)?;
                continue;
            }

            let ctx = Arc::new(StageRunContext {
                run_id: run_id.clone(),
                pipeline: pipeline.name.clone(),
                workdir: workspace.path.clone(),
                handover_dir: workspace.handover_dir.clone(),
                auto_commit: pipeline.git.auto_commit,
                commit_template: pipeline.git.commit_prefix.clone(),
                loop_instructions: layer
                    .is_final
                    .then(|| loop_instructions.clone())
                    .flatten(),
                snapshot: state.clone(),
                token_stream: options.token_stream.clone(),
            });

            let result = group::execute_layer(
                Arc::clone(&executor),
                runnable,
                ctx,
                pipeline.execution.mode,
                pipeline.execution.max_parallel,
                options.abort.clone(),
            )
            .await;

            for execution in result.executions {
                if matches!(execution.status, StageStatus::Failed | StageStatus::Skipped) {
                    unrunnable.insert(execution.stage_name.clone());
                }
                if execution.status == StageStatus::Failed {
                    let on_fail = pipeline
                        .stages
                        .iter()
                        .find(|s| s.name == execution.stage_name)
                        .map(|s| s.on_fail)
                        .unwrap_or_default();
                    if on_fail == OnFail::Warn {
                        warn!(
                            stage = %execution.stage_name,
                            "stage failed (onFail=warn): {}",
                            execution
                                .error
                                .as_ref()
                                .map(|e| e.message.as_str())
                                .unwrap_or("unknown error")
                        );
                    }
                    if strategy == FailureStrategy::Stop && on_fail == OnFail::Stop {
                        stop_gate = true;
                    }
                    if execution
                        .error
                        .as_ref()
                        .is_some_and(|e| e.category == ErrorCategory::Aborted)
                    {
                        aborted = true;
                    }
                }
                state.stages.push(execution);
            }

            self.persist(&state, options)?;
            if options.abort.is_cancelled() {
                aborted = true;
            }
        }

        let aborted = aborted || options.abort.is_cancelled();
        state.status = RunStatus::aggregate(&state.stages, strategy, aborted);
        state.end_time = Some(Utc::now());
        self.persist(&state, options)?;

        let deps = FinalizeDeps {
            manager: &self.workspaces,
            pr: self.pr.as_ref(),
            sink: options.sink.as_ref(),
            logger: &logger,
        };
        let finalized = finalize::finalize(&mut state, &workspace, &deps).await;
        self.workspaces.release(&workspace);
        if let Err(e) = finalized {
            logger.log(&format!("finalize failed: {e:#}"));
            warn!("finalize: {e:#}");
            state.status = RunStatus::Failed;
        }
        state.end_time = Some(Utc::now());
        self.persist(&state, options)?;

        logger.log(&summary_line(&state));
        info!("{}", summary_line(&state));

        let terminal = match state.status {
            RunStatus::Completed => PipelineEvent::PipelineCompleted {
                state: state.clone(),
                partial: false,
            },
            RunStatus::Partial => PipelineEvent::PipelineCompleted {
                state: state.clone(),
                partial: true,
            },
            RunStatus::Aborted => PipelineEvent::PipelineAborted {
                state: state.clone(),
            },
            // Failed, plus the unreachable non-terminal statuses.
            _ => PipelineEvent::PipelineFailed {
                state: state.clone(),
            },
        };
        options.sink.emit(terminal);

        Ok(state)
    }
}

/// One-line human summary for logs and the CLI.
pub fn summary_line(state: &PipelineState) -> String {
    let status = match state.status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Partial => "partial",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
    };
    let committed = state.committed_stages().len();
    let mut line = format!(
        "run {} {status} in {:.1}s ({} stages, {} committed)",
        state.run_id,
        state.artifacts.total_duration,
        state.stages.len(),
        committed,
    );
    if let Some(pr) = &state.artifacts.pull_request {
        line.push_str(&format!(", PR {}", pr.url));
    } else if let Some(branch) = &state.artifacts.branch {
        line.push_str(&format!(", branch {branch}"));
    }
    line
}
