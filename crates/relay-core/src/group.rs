use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::ErrorCategory;
use crate::executor::{StageExecutor, StageRunContext};
use crate::types::{ExecutionMode, StageConfig, StageErrorInfo, StageExecution, StageStatus};

/// Outcome of one executed layer.
#[derive(Debug)]
pub struct GroupResult {
    /// Completion order in parallel mode; declaration order in sequential.
    pub executions: Vec<StageExecution>,
    pub all_succeeded: bool,
    pub any_failed: bool,
    /// Seconds.
    pub duration: f64,
}

/// Execute one layer under the configured concurrency mode.
///
/// Failures never propagate as errors: a crashed stage task becomes a
/// failed record. Sibling stages in a parallel layer always run to
/// completion regardless of each other's outcome.
pub async fn execute_layer(
    executor: Arc<StageExecutor>,
    stages: Vec<StageConfig>,
    ctx: Arc<StageRunContext>,
    mode: ExecutionMode,
    max_parallel: Option<usize>,
    cancel: CancellationToken,
) -> GroupResult {
    let started = std::time::Instant::now();

    let executions = match mode {
        ExecutionMode::Parallel => run_parallel(executor, stages, ctx, max_parallel, cancel).await,
        ExecutionMode::Sequential => run_sequential(executor, stages, ctx, cancel).await,
    };

    let any_failed = executions.iter().any(|e| e.status == StageStatus::Failed);
    let all_succeeded = executions.iter().all(|e| e.status == StageStatus::Success);

    GroupResult {
        executions,
        all_succeeded,
        any_failed,
        duration: started.elapsed().as_secs_f64(),
    }
}

async fn run_parallel(
    executor: Arc<StageExecutor>,
    stages: Vec<StageConfig>,
    ctx: Arc<StageRunContext>,
    max_parallel: Option<usize>,
    cancel: CancellationToken,
) -> Vec<StageExecution> {
    let semaphore = max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let expected: Vec<String> = stages.iter().map(|s| s.name.clone()).collect();

    let mut set: JoinSet<StageExecution> = JoinSet::new();
    for stage in stages {
        let executor = Arc::clone(&executor);
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        let semaphore = semaphore.clone();

        set.spawn(async move {
            let _permit = match semaphore {
                Some(s) => s.acquire_owned().await.ok(),
                None => None,
            };
            if cancel.is_cancelled() {
                return StageExecution::skipped(stage.name.clone());
            }
            executor.execute_stage(&stage, &ctx, &cancel).await
        });
    }

    let mut executions = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(execution) => executions.push(execution),
            Err(join_err) => error!("stage task crashed: {join_err}"),
        }
    }

    // A crashed task never returned its record; synthesize failures so no
    // stage silently disappears from the run.
    let returned: HashSet<&str> = executions.iter().map(|e| e.stage_name.as_str()).collect();
    let missing: Vec<String> = expected
        .iter()
        .filter(|n| !returned.contains(n.as_str()))
        .cloned()
        .collect();
    for name in missing {
        executions.push(crashed(name, "task panicked or was aborted"));
    }

    executions
}

async fn run_sequential(
    executor: Arc<StageExecutor>,
    stages: Vec<StageConfig>,
    ctx: Arc<StageRunContext>,
    cancel: CancellationToken,
) -> Vec<StageExecution> {
    let mut executions = Vec::new();
    for stage in stages {
        if cancel.is_cancelled() {
            executions.push(StageExecution::skipped(stage.name));
            continue;
        }
        executions.push(executor.execute_stage(&stage, &ctx, &cancel).await);
    }
    executions
}

fn crashed(name: String, detail: &str) -> StageExecution {
    let now = Utc::now();
    StageExecution {
        stage_name: name,
        status: StageStatus::Failed,
        start_time: now,
        end_time: Some(now),
        duration: 0.0,
        commit_sha: None,
        outputs: Default::default(),
        extracted_data: Default::default(),
        retry_attempt: 0,
        max_retries: 0,
        error: Some(StageErrorInfo::new(
            ErrorCategory::Runtime,
            format!("stage task crashed: {detail}"),
        )),
        token_usage: None,
        log_path: None,
    }
}
