use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::git::Git;
use crate::state::DATA_DIR;
use crate::types::{BranchStrategy, PipelineConfig};

/// Marker file that claims a workspace for one run. Lives under the data
/// directory so stage commits never pick it up.
const LOCK_FILE: &str = "run.lock";

/// An isolated checkout bound to the pipeline branch for one run.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    pub initial_commit: String,
    /// Where stages write artifacts, inside the workspace checkout.
    pub handover_dir: PathBuf,
}

impl Workspace {
    fn lock_path(&self) -> PathBuf {
        self.path.join(DATA_DIR).join(LOCK_FILE)
    }
}

/// Owns the isolated-checkout directory and the pipeline branch for the
/// lifetime of a run.
pub struct WorkspaceManager {
    repo_root: PathBuf,
    git: Git,
    /// Serializes worktree creation to avoid .git/config lock contention.
    create_lock: Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let git = Git::new(repo_root.clone());
        Self {
            repo_root,
            git,
            create_lock: Mutex::new(()),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Branch name for a run, per the configured strategy.
    pub fn branch_name(config: &PipelineConfig, run_id: &str) -> String {
        match config.git.branch_strategy {
            BranchStrategy::Reusable => format!("pipeline/{}", config.name),
            BranchStrategy::UniquePerRun | BranchStrategy::UniqueAndDelete => {
                format!("pipeline/{}-{}", config.name, run_id)
            }
        }
    }

    /// Filesystem-safe rendition of a branch name.
    pub fn branch_safe(branch: &str) -> String {
        branch.replace('/', "-")
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.repo_root
            .join(DATA_DIR)
            .join("worktrees")
            .join(Self::branch_safe(branch))
    }

    /// Prepare the isolated workspace for a run: resolve the branch, bind a
    /// worktree to it, and record the starting commit.
    pub async fn prepare(&self, config: &PipelineConfig, run_id: &str) -> Result<Workspace> {
        let base = config.git.base_branch.as_str();
        let branch = Self::branch_name(config, run_id);
        let path = self.worktree_path(&branch);

        if !self.git.branch_exists(base).await? {
            return Err(anyhow!("base branch '{base}' does not exist"));
        }

        let _guard = self.create_lock.lock().await;

        if path.exists() {
            let lock = path.join(DATA_DIR).join(LOCK_FILE);
            if lock.exists() {
                let owner = std::fs::read_to_string(&lock).unwrap_or_default();
                return Err(anyhow!(
                    "workspace {} is in use by run {}",
                    path.display(),
                    owner.trim()
                ));
            }

            // Reuse only a workspace still bound to our branch; anything
            // else is stale and gets recreated.
            let bound = self
                .git
                .current_branch(&path)
                .await
                .unwrap_or_default();
            if bound != branch {
                warn!(
                    "workspace {} bound to '{bound}', expected '{branch}', recreating",
                    path.display()
                );
                self.remove_worktree_dir(&path).await;
            }
        }

        if !path.exists() {
            self.git.worktree_prune().await.ok();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }

            let branch_exists = self.git.branch_exists(&branch).await?;
            match config.git.branch_strategy {
                BranchStrategy::Reusable => {
                    if branch_exists {
                        self.git.worktree_add(&path, &branch, None).await?;
                    } else {
                        self.git.worktree_add(&path, &branch, Some(base)).await?;
                    }
                }
                BranchStrategy::UniquePerRun | BranchStrategy::UniqueAndDelete => {
                    if branch_exists {
                        // Leftover from an interrupted run with the same id;
                        // the branch is ours to replace.
                        self.git.delete_branch(&branch).await?;
                    }
                    self.git.worktree_add(&path, &branch, Some(base)).await?;
                }
            }
        }

        let initial_commit = self
            .git
            .current_commit(&path)
            .await
            .context("resolve workspace tip")?;

        let handover_dir = path.join(DATA_DIR).join("outputs").join(run_id);
        tokio::fs::create_dir_all(&handover_dir)
            .await
            .with_context(|| format!("create {}", handover_dir.display()))?;

        let workspace = Workspace {
            path,
            branch,
            initial_commit,
            handover_dir,
        };
        std::fs::write(workspace.lock_path(), run_id)
            .with_context(|| format!("write {}", workspace.lock_path().display()))?;

        info!(
            "prepared workspace {} (branch {}, tip {})",
            workspace.path.display(),
            workspace.branch,
            &workspace.initial_commit[..workspace.initial_commit.len().min(12)]
        );

        Ok(workspace)
    }

    /// Release the in-use claim; called at every disposition path.
    pub fn release(&self, workspace: &Workspace) {
        if let Err(e) = std::fs::remove_file(workspace.lock_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("workspace: remove lock {}: {e}", workspace.lock_path().display());
            }
        }
    }

    /// Remove the workspace checkout and its branch (unique-and-delete).
    pub async fn remove(&self, workspace: &Workspace) -> Result<()> {
        self.remove_worktree_dir(&workspace.path).await;
        if self.git.branch_exists(&workspace.branch).await? {
            self.git.delete_branch(&workspace.branch).await?;
        }
        info!("removed workspace {} and branch {}", workspace.path.display(), workspace.branch);
        Ok(())
    }

    /// Best-effort worktree teardown: unregister, delete, prune.
    async fn remove_worktree_dir(&self, path: &Path) {
        if let Err(e) = self.git.worktree_remove(path, true).await {
            warn!("workspace: worktree remove {}: {e}", path.display());
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path).await.ok();
        }
        self.git.worktree_prune().await.ok();
    }
}
