use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::types::PullRequestInfo;

/// Capability interface for the pull-request host.
#[async_trait]
pub trait PrProvider: Send + Sync {
    async fn pr_exists(&self, branch: &str, base: &str) -> Result<bool>;

    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequestInfo>;
}

/// PR provider backed by the `gh` CLI.
pub struct GhCli {
    repo_root: PathBuf,
}

impl GhCli {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<(i32, String, String)> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .with_context(|| format!("spawn gh {}", args.join(" ")))?;
        Ok((
            output.status.code().unwrap_or(1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl PrProvider for GhCli {
    async fn pr_exists(&self, branch: &str, _base: &str) -> Result<bool> {
        let (code, stdout, _) = self
            .gh(&["pr", "view", branch, "--json", "number", "--jq", ".number"])
            .await?;
        Ok(code == 0 && !stdout.trim().is_empty())
    }

    async fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<PullRequestInfo> {
        let mut args = vec![
            "pr", "create", "--base", base, "--head", branch, "--title", title, "--body", body,
        ];
        if draft {
            args.push("--draft");
        }

        let (code, stdout, stderr) = self.gh(&args).await?;
        if code != 0 {
            return Err(anyhow!(
                "gh pr create failed: {}",
                stderr.trim().chars().take(300).collect::<String>()
            ));
        }

        // gh prints the PR URL as the last non-empty stdout line.
        let url = stdout
            .lines()
            .rev()
            .find(|l| l.trim().starts_with("http"))
            .map(|l| l.trim().to_string())
            .ok_or_else(|| anyhow!("gh pr create produced no URL"))?;
        let number = url
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(PullRequestInfo {
            url,
            number,
            branch: branch.to_string(),
        })
    }
}
