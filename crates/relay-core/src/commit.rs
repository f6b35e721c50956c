use std::path::Path;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::git::Git;

/// Render a commit/PR message template. Known variables: {{stage}},
/// {{pipeline}}, {{runId}}, {{branch}}. Unknown variables render empty.
pub fn render_template(
    template: &str,
    stage: &str,
    pipeline: &str,
    run_id: &str,
    branch: &str,
) -> String {
    let mut out = template
        .replace("{{stage}}", stage)
        .replace("{{pipeline}}", pipeline)
        .replace("{{runId}}", run_id)
        .replace("{{branch}}", branch);

    // Drop any leftover {{...}} placeholders.
    while let Some(start) = out.find("{{") {
        match out[start..].find("}}") {
            Some(offset) => out.replace_range(start..start + offset + 2, ""),
            None => break,
        }
    }
    out
}

/// Serializes commits at the workspace level: the workspace directory is
/// single-writer, so parallel stages funnel through one commit at a time.
pub struct CommitManager {
    git: Git,
    lock: Mutex<()>,
}

impl CommitManager {
    pub fn new(git: Git) -> Self {
        Self {
            git,
            lock: Mutex::new(()),
        }
    }

    /// Commit everything the stage changed, or return None on a clean tree.
    ///
    /// Idempotent: a clean worktree always yields None, and a single dirty
    /// snapshot produces exactly one commit.
    pub async fn commit_if_dirty(
        &self,
        workdir: &Path,
        template: &str,
        stage: &str,
        pipeline: &str,
        run_id: &str,
    ) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;

        let message = render_template(template, stage, pipeline, run_id, "");
        let message = if message.trim().is_empty() {
            format!("pipeline: {stage}")
        } else {
            message
        };

        self.git.commit_all(workdir, &message).await
    }
}
