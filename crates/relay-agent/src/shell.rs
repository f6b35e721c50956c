use anyhow::Result;
use async_trait::async_trait;
use relay_core::process::run_streaming;
use relay_core::runtime::{
    AgentRuntime, ExecuteOutcome, ExecuteRequest, RuntimeCapabilities, RuntimeValidation,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the stage's `agentRef` as a shell command line.
///
/// The composed prompt and the stage inputs reach the command through the
/// environment (`RELAY_PROMPT`, `RELAY_HANDOVER_DIR`, `RELAY_INPUT_*`), so
/// any executable that speaks the output line protocol can act as an agent.
/// Also the backend the test suite scripts against.
pub struct ShellRuntime {
    pub shell: String,
}

impl ShellRuntime {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for ShellRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for ShellRuntime {
    async fn validate(&self) -> RuntimeValidation {
        let probe = Command::new(&self.shell)
            .arg("-c")
            .arg("true")
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => RuntimeValidation::valid(),
            Ok(status) => RuntimeValidation::invalid(format!("{} exited with {status}", self.shell)),
            Err(e) => RuntimeValidation::invalid(format!("{} not runnable: {e}", self.shell)),
        }
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: false,
            supports_structured_output: true,
            available_models: Vec::new(),
            permission_modes: Vec::new(),
        }
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&request.agent_ref)
            .current_dir(&request.workdir)
            .env("RELAY_PROMPT", &request.prompt)
            .env("RELAY_HANDOVER_DIR", &request.handover_dir);

        for (key, value) in &request.inputs {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(format!("RELAY_INPUT_{}", env_key(key)), rendered);
        }

        info!(workdir = %request.workdir.display(), "spawning shell agent");

        let outcome = run_streaming(cmd, request.stream_tx.clone(), request.timeout, &cancel).await?;

        Ok(ExecuteOutcome {
            exit_code: outcome.exit_code,
            stderr_tail: outcome.stderr_tail,
            token_usage: None,
            timed_out: outcome.timed_out,
            aborted: outcome.aborted,
        })
    }
}

fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
