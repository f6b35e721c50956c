use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::coordinator::{RunCoordinator, RunOptions};
use crate::types::{LoopContext, LoopTermination, PipelineConfig, PipelineState, RunStatus};

/// Structured output key a final-layer stage reports to end the loop.
pub const STOP_OUTPUT_KEY: &str = "stopLooping";

/// Repeats full runs of a pipeline until a stage signals stop, the
/// iteration limit is reached, or an iteration ends non-completed.
///
/// Each iteration is a complete run with its own workspace setup and
/// finalize; continuity between iterations lives on the pipeline branch.
/// The loop never retries a failed iteration; retries belong to stages.
pub struct LoopController<'a> {
    coordinator: &'a RunCoordinator,
}

impl<'a> LoopController<'a> {
    pub fn new(coordinator: &'a RunCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn run(&self, pipeline: &PipelineConfig, options: &RunOptions) -> Result<PipelineState> {
        if !pipeline.looping.enabled {
            return self.coordinator.run(pipeline, options).await;
        }

        let max_iterations = options
            .max_loop_iterations
            .unwrap_or(pipeline.looping.max_iterations)
            .max(1);

        let mut iteration = 1u32;
        loop {
            let mut iter_options = options.clone();
            iter_options.loop_context = Some(LoopContext {
                iteration,
                max_iterations,
                termination_reason: None,
            });

            let mut state = self.coordinator.run(pipeline, &iter_options).await?;

            let reason = match state.status {
                RunStatus::Aborted => Some(LoopTermination::Aborted),
                // The failed status speaks for itself; no reason recorded.
                RunStatus::Failed => None,
                _ if stop_signalled(&state) => Some(LoopTermination::StoppedByStage),
                // A partial iteration ends the loop (something failed, and
                // the loop never retries failures); like failed, the status
                // speaks for itself.
                RunStatus::Partial => None,
                _ if iteration >= max_iterations => Some(LoopTermination::LimitReached),
                _ => {
                    info!(
                        iteration,
                        max_iterations, "loop iteration completed, continuing"
                    );
                    iteration += 1;
                    continue;
                }
            };

            if let Some(ctx) = state.loop_context.as_mut() {
                ctx.termination_reason = reason;
            }
            self.coordinator.store().save(&state)?;
            return Ok(state);
        }
    }
}

/// Any stage reporting a truthy `stopLooping` output ends the loop. Only
/// final-layer stages receive the continuation instructions, so in practice
/// the signal comes from them.
pub fn stop_signalled(state: &PipelineState) -> bool {
    state
        .stages
        .iter()
        .any(|s| s.outputs.get(STOP_OUTPUT_KEY).is_some_and(truthy))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}
