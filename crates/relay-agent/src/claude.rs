use anyhow::Result;
use async_trait::async_trait;
use relay_core::process::run_streaming;
use relay_core::runtime::{
    AgentRuntime, ExecuteOutcome, ExecuteRequest, RuntimeCapabilities, RuntimeValidation,
};
use relay_core::types::TokenUsage;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{self, AgentEvent};

const DEFAULT_MAX_TURNS: u32 = 200;

/// Runs Claude Code as a subprocess and adapts its NDJSON stream to the
/// engine's line-oriented protocol.
pub struct ClaudeRuntime {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    /// Model used when the stage does not override one.
    pub default_model: Option<String>,
    pub allowed_tools: String,
    pub max_turns: u32,
}

impl ClaudeRuntime {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            default_model: None,
            allowed_tools: "Read,Glob,Grep,Write,Edit,Bash".to_string(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

#[async_trait]
impl AgentRuntime for ClaudeRuntime {
    async fn validate(&self) -> RuntimeValidation {
        let probe = Command::new(&self.claude_bin)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match probe {
            Ok(status) if status.success() => RuntimeValidation::valid(),
            Ok(status) => RuntimeValidation::invalid(format!(
                "{} --version exited with {status}",
                self.claude_bin
            )),
            Err(e) => RuntimeValidation::invalid(format!("{} not runnable: {e}", self.claude_bin)),
        }
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_streaming: true,
            supports_token_tracking: true,
            supports_structured_output: true,
            available_models: vec![
                "claude-sonnet-4-5".to_string(),
                "claude-opus-4-1".to_string(),
                "claude-haiku-4-5".to_string(),
            ],
            permission_modes: vec![
                "default".to_string(),
                "acceptEdits".to_string(),
                "bypassPermissions".to_string(),
                "plan".to_string(),
            ],
        }
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let mut cmd = Command::new(&self.claude_bin);
        cmd.current_dir(&request.workdir)
            .env("RELAY_HANDOVER_DIR", &request.handover_dir)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--allowedTools")
            .arg(&self.allowed_tools)
            .arg("--max-turns")
            .arg(self.max_turns.to_string());

        if let Some(model) = request.model.as_deref().or(self.default_model.as_deref()) {
            cmd.arg("--model").arg(model);
        }
        if let Some(mode) = &request.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        for (key, value) in &request.inputs {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(format!("RELAY_INPUT_{}", env_key(key)), rendered);
        }

        cmd.arg("--print").arg(&request.prompt);

        info!(
            workdir = %request.workdir.display(),
            model = ?request.model,
            "spawning claude subprocess"
        );

        // The subprocess emits NDJSON; re-emit the assistant's text line by
        // line so the engine's output protocol survives passthrough, and
        // pick token usage off the final result event.
        let (ndjson_tx, mut ndjson_rx) = mpsc::unbounded_channel::<String>();
        let downstream = request.stream_tx.clone();
        let parser = tokio::spawn(async move {
            let mut usage: Option<TokenUsage> = None;
            while let Some(line) = ndjson_rx.recv().await {
                match event::parse_line(&line) {
                    Some(AgentEvent::Assistant(e)) => {
                        if let Some(tx) = &downstream {
                            for block in event::assistant_text_blocks(&e) {
                                for text_line in block.lines() {
                                    let _ = tx.send(text_line.to_string());
                                }
                            }
                        }
                    }
                    Some(AgentEvent::Result(e)) => {
                        usage = Some(event::token_usage_from_result(&e));
                    }
                    Some(_) => {}
                    // Non-JSON output (wrapper scripts, stray prints) is
                    // forwarded untouched.
                    None => {
                        if let Some(tx) = &downstream {
                            let _ = tx.send(line);
                        }
                    }
                }
            }
            usage
        });

        let outcome = run_streaming(cmd, Some(ndjson_tx), request.timeout, &cancel).await?;
        let token_usage = parser.await.unwrap_or(None);

        Ok(ExecuteOutcome {
            exit_code: outcome.exit_code,
            stderr_tail: outcome.stderr_tail,
            token_usage,
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
