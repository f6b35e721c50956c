use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commit::CommitManager;
use crate::error::ErrorCategory;
use crate::events::{EventSink, PipelineEvent};
use crate::extract::{extract_from_stream, StreamLine};
use crate::prompt::compose_prompt;
use crate::runtime::{ExecuteRequest, RuntimeMap};
use crate::state::RunLogger;
use crate::types::{
    PipelineState, StageConfig, StageErrorInfo, StageExecution, StageStatus, TokenUsage,
};

/// Per-run context shared by every stage the run executes.
pub struct StageRunContext {
    pub run_id: String,
    pub pipeline: String,
    /// The isolated workspace checkout.
    pub workdir: PathBuf,
    pub handover_dir: PathBuf,
    pub auto_commit: bool,
    pub commit_template: String,
    /// Loop-continuation instructions; set only for final-layer stages of a
    /// looping pipeline.
    pub loop_instructions: Option<String>,
    /// State snapshot attached to stage events.
    pub snapshot: PipelineState,
    /// Live line stream for the UI, tagged with the stage name.
    pub token_stream: Option<UnboundedSender<(String, String)>>,
}

/// Executes one stage: prompt composition, subprocess, streaming capture,
/// timeout, retry, post-run commit. Never returns an error for stage-level
/// failures; they land in the returned record.
pub struct StageExecutor {
    runtimes: RuntimeMap,
    default_runtime: String,
    commits: Arc<CommitManager>,
    sink: Arc<dyn EventSink>,
    logger: Arc<RunLogger>,
}

/// Everything one attempt produced.
#[derive(Default)]
struct AttemptData {
    outputs: BTreeMap<String, Value>,
    extracted_data: BTreeMap<String, String>,
    token_usage: Option<TokenUsage>,
    commit_sha: Option<String>,
    error: Option<StageErrorInfo>,
}

impl StageExecutor {
    pub fn new(
        runtimes: RuntimeMap,
        default_runtime: impl Into<String>,
        commits: Arc<CommitManager>,
        sink: Arc<dyn EventSink>,
        logger: Arc<RunLogger>,
    ) -> Self {
        Self {
            runtimes,
            default_runtime: default_runtime.into(),
            commits,
            sink,
            logger,
        }
    }

    /// Run a stage through its retry budget and return the final record.
    pub async fn execute_stage(
        &self,
        stage: &StageConfig,
        ctx: &StageRunContext,
        cancel: &CancellationToken,
    ) -> StageExecution {
        let start_time = Utc::now();
        let started = std::time::Instant::now();
        let max_attempts = stage.retry.max_attempts.max(1);

        self.sink.emit(PipelineEvent::StageStarted {
            state: ctx.snapshot.clone(),
            stage_name: stage.name.clone(),
        });
        self.logger.log(&format!("stage {} started", stage.name));

        let mut attempt: u32 = 0;
        let data = loop {
            let data = self.run_attempt(stage, ctx, attempt, cancel).await;

            let (category, message) = match &data.error {
                None => break data,
                Some(error) => (error.category, error.message.clone()),
            };

            self.logger.log(&format!(
                "stage {} attempt {} failed ({category}): {message}",
                stage.name, attempt
            ));

            let retries_left = attempt + 1 < max_attempts;
            if !retries_left || !category.retryable(stage.retry.retry_timeouts) {
                break data;
            }

            let delay = Duration::from_millis(stage.retry.delay_ms(attempt));
            info!(
                stage = %stage.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying stage after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    break AttemptData {
                        error: Some(StageErrorInfo::new(ErrorCategory::Aborted, "aborted while waiting to retry")),
                        ..data
                    };
                }
            }
            attempt += 1;
        };

        let end_time = Utc::now();
        let status = if data.error.is_none() {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };

        let execution = StageExecution {
            stage_name: stage.name.clone(),
            status,
            start_time,
            end_time: Some(end_time),
            duration: started.elapsed().as_secs_f64(),
            commit_sha: data.commit_sha,
            outputs: data.outputs,
            extracted_data: data.extracted_data,
            retry_attempt: attempt,
            max_retries: max_attempts.saturating_sub(1),
            error: data.error,
            token_usage: data.token_usage,
            log_path: Some(self.raw_log_path(ctx, stage).to_string_lossy().into_owned()),
        };

        match execution.status {
            StageStatus::Success => {
                self.logger.log(&format!(
                    "stage {} completed in {:.1}s",
                    stage.name, execution.duration
                ));
                self.sink.emit(PipelineEvent::StageCompleted {
                    state: ctx.snapshot.clone(),
                    stage_name: stage.name.clone(),
                });
            }
            _ => {
                self.sink.emit(PipelineEvent::StageFailed {
                    state: ctx.snapshot.clone(),
                    stage_name: stage.name.clone(),
                });
            }
        }

        execution
    }

    fn raw_log_path(&self, ctx: &StageRunContext, stage: &StageConfig) -> PathBuf {
        ctx.handover_dir.join(format!("{}-raw.md", stage.name))
    }

    fn output_path(&self, ctx: &StageRunContext, stage: &StageConfig) -> PathBuf {
        ctx.handover_dir.join(format!("{}-output.json", stage.name))
    }

    /// One attempt: spawn the runtime, capture the stream, interpret the
    /// outcome, and commit the workspace when it changed.
    async fn run_attempt(
        &self,
        stage: &StageConfig,
        ctx: &StageRunContext,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptData {
        if cancel.is_cancelled() {
            return AttemptData {
                error: Some(StageErrorInfo::new(ErrorCategory::Aborted, "aborted before start")),
                ..AttemptData::default()
            };
        }

        let runtime_name = stage.runtime.as_deref().unwrap_or(&self.default_runtime);
        let Some(runtime) = self.runtimes.get(runtime_name) else {
            return AttemptData {
                error: Some(StageErrorInfo::new(
                    ErrorCategory::Configuration,
                    format!("unknown runtime '{runtime_name}'"),
                )),
                ..AttemptData::default()
            };
        };

        let prompt = compose_prompt(stage, &ctx.workdir, ctx.loop_instructions.as_deref());

        // Stream collector: transcript for the raw log, protocol lines into
        // the structured maps, everything forwarded to the UI stream.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let stage_name = stage.name.clone();
        let token_stream = ctx.token_stream.clone();
        let collector = tokio::spawn(async move {
            let mut transcript = String::new();
            let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
            let mut extracted: BTreeMap<String, String> = BTreeMap::new();
            while let Some(line) = line_rx.recv().await {
                match extract_from_stream(&line) {
                    StreamLine::Structured(map) => outputs.extend(map),
                    StreamLine::Kv { key, value } => {
                        extracted.insert(key, value);
                    }
                    StreamLine::Text => {}
                }
                if let Some(tx) = &token_stream {
                    let _ = tx.send((stage_name.clone(), line.clone()));
                }
                transcript.push_str(&line);
                transcript.push('\n');
            }
            (transcript, outputs, extracted)
        });

        let request = ExecuteRequest {
            agent_ref: stage.agent_ref.clone(),
            prompt,
            inputs: stage.inputs.clone(),
            handover_dir: ctx.handover_dir.clone(),
            workdir: ctx.workdir.clone(),
            model: stage.model.clone(),
            permission_mode: stage.permission_mode.clone(),
            timeout: Some(Duration::from_secs(stage.timeout_seconds)),
            stream_tx: Some(line_tx),
        };

        let result = runtime.execute(request, cancel.child_token()).await;

        // The runtime dropped its sender; the collector drains and ends.
        let (transcript, outputs, extracted_data) = collector.await.unwrap_or_default();

        self.append_transcript(ctx, stage, attempt, &transcript);

        let mut data = AttemptData {
            outputs,
            extracted_data,
            ..AttemptData::default()
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                data.error = Some(StageErrorInfo::new(
                    ErrorCategory::Runtime,
                    format!("runtime failed: {e:#}"),
                ));
                return data;
            }
        };

        data.token_usage = outcome.token_usage.clone();

        if outcome.aborted {
            data.error = Some(StageErrorInfo::new(ErrorCategory::Aborted, "stage aborted"));
            return data;
        }
        if outcome.timed_out {
            data.error = Some(StageErrorInfo::new(
                ErrorCategory::Timeout,
                format!("stage exceeded {}s", stage.timeout_seconds),
            ));
            return data;
        }
        if outcome.exit_code != 0 {
            let detail = outcome.stderr_tail.trim();
            data.error = Some(StageErrorInfo::new(
                ErrorCategory::Runtime,
                if detail.is_empty() {
                    format!("agent exited with code {}", outcome.exit_code)
                } else {
                    format!("agent exited with code {}: {detail}", outcome.exit_code)
                },
            ));
            return data;
        }

        // Successful attempt: persist outputs and commit any file changes.
        self.write_outputs(ctx, stage, &data.outputs);

        for key in &stage.declared_output_keys {
            if !data.outputs.contains_key(key) {
                warn!(stage = %stage.name, key = %key, "declared output key not reported");
            }
        }

        if ctx.auto_commit {
            match self
                .commits
                .commit_if_dirty(
                    &ctx.workdir,
                    &ctx.commit_template,
                    &stage.name,
                    &ctx.pipeline,
                    &ctx.run_id,
                )
                .await
            {
                Ok(sha) => data.commit_sha = sha,
                Err(e) => {
                    data.error = Some(StageErrorInfo::new(
                        ErrorCategory::Vcs,
                        format!("commit failed: {e:#}"),
                    ));
                }
            }
        }

        data
    }

    fn append_transcript(&self, ctx: &StageRunContext, stage: &StageConfig, attempt: u32, transcript: &str) {
        use std::io::Write;
        let path = self.raw_log_path(ctx, stage);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                writeln!(f, "## attempt {attempt}\n")?;
                f.write_all(transcript.as_bytes())?;
                writeln!(f)
            });
        if let Err(e) = result {
            warn!(stage = %stage.name, "write transcript {}: {e}", path.display());
        }
    }

    fn write_outputs(&self, ctx: &StageRunContext, stage: &StageConfig, outputs: &BTreeMap<String, Value>) {
        let path = self.output_path(ctx, stage);
        match serde_json::to_vec_pretty(outputs) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(stage = %stage.name, "write outputs {}: {e}", path.display());
                }
            }
            Err(e) => warn!(stage = %stage.name, "serialize outputs: {e}"),
        }
    }
}
