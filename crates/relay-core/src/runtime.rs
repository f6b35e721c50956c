use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::types::TokenUsage;

/// Result of a runtime self-check.
#[derive(Debug, Clone, Default)]
pub struct RuntimeValidation {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RuntimeValidation {
    pub fn valid() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}

/// What a runtime backend can do; advisory, used for UI and validation.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCapabilities {
    pub supports_streaming: bool,
    pub supports_token_tracking: bool,
    pub supports_structured_output: bool,
    pub available_models: Vec<String>,
    pub permission_modes: Vec<String>,
}

/// One stage execution request handed to a runtime.
pub struct ExecuteRequest {
    /// The stage's opaque agent handle, passed through uninterpreted. The
    /// shell runtime treats it as the command line; CLI-backed runtimes
    /// usually only need the composed prompt.
    pub agent_ref: String,
    /// Fully composed prompt (agent definition + inputs + loop instructions).
    pub prompt: String,
    /// Scalar stage inputs, also made available to the subprocess.
    pub inputs: BTreeMap<String, Value>,
    /// Directory the agent may write artifacts into.
    pub handover_dir: PathBuf,
    /// Working directory (the isolated workspace checkout).
    pub workdir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Wall-clock budget enforced with SIGTERM→SIGKILL escalation.
    pub timeout: Option<Duration>,
    /// Raw stdout lines, one message per line, for log capture and the UI.
    pub stream_tx: Option<UnboundedSender<String>>,
}

/// Runtime-level outcome of one attempt. Stage-level interpretation
/// (retry, error category) happens in the stage executor.
#[derive(Debug, Default)]
pub struct ExecuteOutcome {
    pub exit_code: i32,
    pub stderr_tail: String,
    pub token_usage: Option<TokenUsage>,
    pub timed_out: bool,
    pub aborted: bool,
}

impl ExecuteOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.aborted
    }
}

/// Capability interface for an agent backend. One implementation per
/// supported runtime; the engine only ever sees this trait.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn validate(&self) -> RuntimeValidation;

    fn capabilities(&self) -> RuntimeCapabilities;

    /// Run one stage attempt to completion (or timeout/cancel). Must not
    /// leak the subprocess on any exit path.
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteOutcome>;
}

/// Named runtime registry; stages may override the coordinator default.
pub type RuntimeMap = HashMap<String, Arc<dyn AgentRuntime>>;
