use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

use crate::state::DATA_DIR;

/// Outcome of one git invocation.
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper over the git CLI, rooted at one repository.
///
/// Worktree-aware operations take an explicit `dir` so the same instance can
/// drive the primary checkout and any isolated workspace.
#[derive(Clone)]
pub struct Git {
    pub repo_path: PathBuf,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub async fn exec(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn git -C {} {}", dir.display(), args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn exec_ok(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(dir, args).await?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                result.combined_output().trim()
            ));
        }
        Ok(result)
    }

    // ── Commits and status ────────────────────────────────────────────────

    pub async fn current_commit(&self, dir: &Path) -> Result<String> {
        self.rev_parse(dir, "HEAD").await
    }

    pub async fn rev_parse(&self, dir: &Path, refname: &str) -> Result<String> {
        let result = self.exec_ok(dir, &["rev-parse", refname]).await?;
        Ok(result.stdout.trim().to_string())
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        let result = self
            .exec_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Dirty check that ignores the engine's own data directory; handover
    /// files and persisted state never count as workspace changes.
    pub async fn is_dirty(&self, dir: &Path) -> Result<bool> {
        let exclude = format!(":(exclude){DATA_DIR}");
        let result = self
            .exec_ok(dir, &["status", "--porcelain", "--", ".", &exclude])
            .await?;
        Ok(!result.stdout.trim().is_empty())
    }

    /// Stage every change except the engine's own data directory, so
    /// handover files and state never enter stage commits.
    pub async fn stage_all(&self, dir: &Path) -> Result<()> {
        let exclude = format!(":(exclude){DATA_DIR}");
        self.exec_ok(dir, &["add", "-A", "--", ".", &exclude]).await?;
        Ok(())
    }

    pub async fn commit(&self, dir: &Path, message: &str) -> Result<String> {
        self.exec_ok(dir, &["commit", "-m", message]).await?;
        self.current_commit(dir).await
    }

    /// Stage and commit everything; returns the new commit sha, or None when
    /// the tree was clean.
    pub async fn commit_all(&self, dir: &Path, message: &str) -> Result<Option<String>> {
        self.stage_all(dir).await?;
        if !self.is_dirty(dir).await? {
            return Ok(None);
        }
        let commit = self.exec(dir, &["commit", "-m", message]).await?;
        if !commit.success() {
            // Staging raced with an external revert; a clean index here is
            // the "nothing to commit" case, not a failure.
            let output = commit.combined_output();
            if output.contains("nothing to commit") || output.contains("nothing added to commit") {
                return Ok(None);
            }
            return Err(anyhow!(
                "git commit failed in {}: {}",
                dir.display(),
                output.trim()
            ));
        }
        Ok(Some(self.current_commit(dir).await?))
    }

    pub async fn changed_files(&self, dir: &Path, range: &str) -> Result<Vec<String>> {
        let result = self.exec_ok(dir, &["diff", "--name-only", range]).await?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn log_oneline(&self, dir: &Path, range: &str) -> Result<String> {
        let result = self.exec_ok(dir, &["log", "--oneline", range]).await?;
        Ok(result.stdout)
    }

    // ── Branches ──────────────────────────────────────────────────────────

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{name}");
        let result = self
            .exec(&self.repo_path, &["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(result.success())
    }

    pub async fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        self.exec_ok(&self.repo_path, &["branch", name, base]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.exec_ok(&self.repo_path, &["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn checkout(&self, dir: &Path, name: &str) -> Result<()> {
        self.exec_ok(dir, &["checkout", name]).await?;
        Ok(())
    }

    /// Where `branch` is checked out, if anywhere: the primary checkout or
    /// any linked worktree. Parses `git worktree list --porcelain`.
    pub async fn branch_checkout_path(&self, branch: &str) -> Result<Option<PathBuf>> {
        let result = self
            .exec_ok(&self.repo_path, &["worktree", "list", "--porcelain"])
            .await?;

        let wanted = format!("refs/heads/{branch}");
        let mut current: Option<PathBuf> = None;
        for line in result.stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current = Some(PathBuf::from(path.trim()));
            } else if let Some(refname) = line.strip_prefix("branch ") {
                if refname.trim() == wanted {
                    return Ok(current);
                }
            }
        }
        Ok(None)
    }

    // ── Remote ────────────────────────────────────────────────────────────

    pub async fn push(&self, dir: &Path, branch: &str) -> Result<ExecResult> {
        self.exec(dir, &["push", "--set-upstream", "origin", branch])
            .await
    }

    pub async fn fetch_origin(&self) -> Result<()> {
        self.exec_ok(&self.repo_path, &["fetch", "origin"]).await?;
        Ok(())
    }

    // ── Merging ───────────────────────────────────────────────────────────

    /// Merge `branch` into the branch checked out at `dir`: fast-forward if
    /// possible, otherwise a real merge commit. Conflicts surface as errors
    /// with the merge left in place for the caller to handle.
    pub async fn merge(&self, dir: &Path, branch: &str) -> Result<()> {
        let ff = self.exec(dir, &["merge", "--ff-only", branch]).await?;
        if ff.success() {
            return Ok(());
        }
        let message = format!("Merge branch '{branch}'");
        self.exec_ok(dir, &["merge", "--no-ff", "-m", &message, branch])
            .await?;
        Ok(())
    }

    // ── Worktrees ─────────────────────────────────────────────────────────

    /// Create a worktree at `path`. With `base`, a new `branch` is created
    /// from it; without, the existing `branch` is checked out.
    pub async fn worktree_add(&self, path: &Path, branch: &str, base: Option<&str>) -> Result<()> {
        let path_str = path.to_string_lossy();
        let mut args: Vec<&str> = vec!["worktree", "add", path_str.as_ref()];
        if let Some(base) = base {
            args.extend(["-b", branch, base]);
        } else {
            args.push(branch);
        }
        self.exec_ok(&self.repo_path, &args).await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path.to_string_lossy();
        let mut args: Vec<&str> = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_ref());
        self.exec_ok(&self.repo_path, &args).await?;
        Ok(())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.exec_ok(&self.repo_path, &["worktree", "prune"]).await?;
        Ok(())
    }
}
