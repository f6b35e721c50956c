use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::commit::render_template;
use crate::events::{EventSink, PipelineEvent};
use crate::extract::compress_file_list;
use crate::git::Git;
use crate::pr::PrProvider;
use crate::state::{RunLogger, DATA_DIR};
use crate::types::{BranchStrategy, MergeStrategy, PipelineState, RunStatus};
use crate::workspace::{Workspace, WorkspaceManager};

/// Collaborators the finalizer needs.
pub struct FinalizeDeps<'a> {
    pub manager: &'a WorkspaceManager,
    pub pr: &'a dyn PrProvider,
    pub sink: &'a dyn EventSink,
    pub logger: &'a RunLogger,
}

/// Terminal step of a run: record final artifacts, dispatch the merge
/// strategy, copy the handover directory back to the primary checkout, and
/// dispose of the workspace.
///
/// Push and PR errors are recorded in state and never fail the run; a local
/// merge conflict propagates (the caller marks the run failed and the
/// workspace is preserved for the user).
pub async fn finalize(
    state: &mut PipelineState,
    workspace: &Workspace,
    deps: &FinalizeDeps<'_>,
) -> Result<()> {
    let git = deps.manager.git();

    let final_commit = git.current_commit(&workspace.path).await?;
    state.artifacts.final_commit = Some(final_commit.clone());
    state.artifacts.branch = Some(workspace.branch.clone());
    state.artifacts.total_duration = (Utc::now() - state.start_time).num_milliseconds() as f64 / 1000.0;
    state.artifacts.handover_dir = Some(workspace.handover_dir.to_string_lossy().into_owned());

    if state.artifacts.initial_commit.as_deref() != Some(final_commit.as_str()) {
        let initial = state.artifacts.initial_commit.clone().unwrap_or_default();
        let range = format!("{initial}..{final_commit}");
        match git.changed_files(&workspace.path, &range).await {
            Ok(files) => state.artifacts.changed_files = files,
            Err(e) => warn!("finalize: changed files for {range}: {e}"),
        }
    }

    // Aborted runs are left exactly as they stand: no merge, no cleanup,
    // just the handover copied back for inspection.
    if state.status == RunStatus::Aborted {
        copy_handover(state, workspace, deps.manager.repo_root());
        return Ok(());
    }

    let git_cfg = state.pipeline_config.git.clone();
    let merge_wanted = !matches!(git_cfg.merge_strategy, MergeStrategy::None);

    if merge_wanted && !state.any_commits() {
        deps.logger.log(&format!(
            "no stage produced a commit; skipping {} path",
            match git_cfg.merge_strategy {
                MergeStrategy::PullRequest => "push + pull-request",
                _ => "merge",
            }
        ));
    } else {
        match git_cfg.merge_strategy {
            MergeStrategy::None => {}
            MergeStrategy::PullRequest => {
                run_pull_request(state, workspace, deps).await;
            }
            MergeStrategy::LocalMerge => {
                local_merge(state, workspace, deps).await?;
            }
        }
    }

    copy_handover(state, workspace, deps.manager.repo_root());
    write_summary(state, deps.manager.repo_root());

    dispose_workspace(state, workspace, deps).await;

    Ok(())
}

/// Push the pipeline branch and open a PR. Every failure lands in
/// `artifacts.pr_error`; nothing here is fatal.
async fn run_pull_request(state: &mut PipelineState, workspace: &Workspace, deps: &FinalizeDeps<'_>) {
    let git = deps.manager.git();
    let git_cfg = state.pipeline_config.git.clone();

    if let Err(e) = push_with_retry(git, workspace, deps.logger).await {
        warn!("finalize: push {}: {e:#}", workspace.branch);
        state.artifacts.pr_error = Some(format!("push failed: {e:#}"));
        return;
    }

    match deps.pr.pr_exists(&workspace.branch, &git_cfg.base_branch).await {
        Ok(true) => {
            deps.logger.log(&format!(
                "pull request for {} already exists; skipping creation",
                workspace.branch
            ));
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!("finalize: pr_exists {}: {e:#}", workspace.branch);
            // Fall through and try creation anyway; the provider will
            // reject a duplicate.
        }
    }

    let pr_cfg = &git_cfg.pull_request;
    let title = render_stage_template(&pr_cfg.title, state, &workspace.branch);
    let body = render_stage_template(&pr_cfg.body, state, &workspace.branch);

    match deps
        .pr
        .create_pr(&workspace.branch, &git_cfg.base_branch, &title, &body, pr_cfg.draft)
        .await
    {
        Ok(pr) => {
            info!("created pull request {}", pr.url);
            deps.logger.log(&format!("created pull request {}", pr.url));
            let pr_url = pr.url.clone();
            state.artifacts.pull_request = Some(pr);
            deps.sink.emit(PipelineEvent::PrCreated {
                state: state.clone(),
                pr_url,
            });
        }
        Err(e) => {
            warn!("finalize: create_pr {}: {e:#}", workspace.branch);
            state.artifacts.pr_error = Some(format!("{e:#}"));
        }
    }
}

fn render_stage_template(template: &str, state: &PipelineState, branch: &str) -> String {
    render_template(
        template,
        "",
        &state.pipeline_config.name,
        &state.run_id,
        branch,
    )
}

/// Bounded retry on transient push failures, exponential backoff.
async fn push_with_retry(git: &Git, workspace: &Workspace, logger: &RunLogger) -> Result<()> {
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_secs(2);
    let mut attempt = 1;

    loop {
        let result = git.push(&workspace.path, &workspace.branch).await?;
        if result.success() {
            return Ok(());
        }
        let err = result.stderr.trim().to_string();
        if attempt == ATTEMPTS || !is_transient(&err) {
            anyhow::bail!("{}", truncate(&err, 300));
        }
        logger.log(&format!(
            "push attempt {attempt} failed ({}), retrying in {}s",
            truncate(&err, 120),
            delay.as_secs()
        ));
        tokio::time::sleep(delay).await;
        delay *= 2;
        attempt += 1;
    }
}

fn is_transient(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "network",
        "connection",
        "timed out",
        "timeout",
        "could not resolve",
        "remote hung up",
        "unable to access",
        "early eof",
    ]
    .iter()
    .any(|m| lower.contains(m))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Merge the pipeline branch into the base branch locally.
async fn local_merge(state: &mut PipelineState, workspace: &Workspace, deps: &FinalizeDeps<'_>) -> Result<()> {
    let git = deps.manager.git();
    let base = state.pipeline_config.git.base_branch.clone();

    match git.branch_checkout_path(&base).await? {
        Some(checkout) => {
            if git.is_dirty(&checkout).await? {
                deps.logger.log(&format!(
                    "base branch '{base}' checked out at {} with local changes; \
                     leaving work on branch {}",
                    checkout.display(),
                    workspace.branch
                ));
                return Ok(());
            }
            git.merge(&checkout, &workspace.branch)
                .await
                .with_context(|| format!("merge {} into '{base}'", workspace.branch))?;
            deps.logger
                .log(&format!("merged {} into '{base}'", workspace.branch));
        }
        None => {
            // Base not checked out anywhere: merge in a throwaway worktree.
            let aux = deps
                .manager
                .repo_root()
                .join(DATA_DIR)
                .join("worktrees")
                .join(format!("merge-{}", WorkspaceManager::branch_safe(&base)));
            git.worktree_add(&aux, &base, None).await?;

            match git.merge(&aux, &workspace.branch).await {
                Ok(()) => {
                    git.worktree_remove(&aux, true).await.ok();
                    git.worktree_prune().await.ok();
                    deps.logger
                        .log(&format!("merged {} into '{base}'", workspace.branch));
                }
                Err(e) => {
                    // Leave the auxiliary worktree for the user to resolve.
                    deps.logger.log(&format!(
                        "merge conflict merging {} into '{base}'; resolve in {}",
                        workspace.branch,
                        aux.display()
                    ));
                    return Err(e.context(format!("merge {} into '{base}'", workspace.branch)));
                }
            }
        }
    }
    Ok(())
}

/// Mirror the workspace handover directory into the primary checkout.
fn copy_handover(state: &mut PipelineState, workspace: &Workspace, repo_root: &Path) {
    let dest = repo_root
        .join(DATA_DIR)
        .join("outputs")
        .join(&state.run_id);
    if workspace.handover_dir == dest {
        state.artifacts.main_repo_handover_dir = Some(dest.to_string_lossy().into_owned());
        return;
    }
    match copy_dir(&workspace.handover_dir, &dest) {
        Ok(()) => {
            state.artifacts.main_repo_handover_dir = Some(dest.to_string_lossy().into_owned());
        }
        Err(e) => warn!(
            "finalize: copy handover {} -> {}: {e}",
            workspace.handover_dir.display(),
            dest.display()
        ),
    }
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Aggregate index of the run, written next to the mirrored outputs.
fn write_summary(state: &PipelineState, repo_root: &Path) {
    let dir = repo_root
        .join(DATA_DIR)
        .join("outputs")
        .join(&state.run_id);
    let summary = json!({
        "runId": state.run_id,
        "pipeline": state.pipeline_config.name,
        "status": state.status,
        "startTime": state.start_time,
        "endTime": state.end_time,
        "totalDuration": state.artifacts.total_duration,
        "branch": state.artifacts.branch,
        "changedFiles": compress_file_list(&state.artifacts.changed_files),
        "pullRequest": state.artifacts.pull_request,
        "stages": state.stages.iter().map(|s| json!({
            "name": s.stage_name,
            "status": s.status,
            "duration": s.duration,
            "commitSha": s.commit_sha,
        })).collect::<Vec<_>>(),
    });
    let result = std::fs::create_dir_all(&dir).and_then(|()| {
        std::fs::write(
            dir.join("pipeline-summary.json"),
            serde_json::to_vec_pretty(&summary).unwrap_or_default(),
        )
    });
    if let Err(e) = result {
        warn!("finalize: write summary: {e}");
    }
}

/// Workspace disposition per branch strategy.
async fn dispose_workspace(state: &PipelineState, workspace: &Workspace, deps: &FinalizeDeps<'_>) {
    match state.pipeline_config.git.branch_strategy {
        BranchStrategy::Reusable | BranchStrategy::UniquePerRun => {
            info!("keeping workspace {}", workspace.path.display());
        }
        BranchStrategy::UniqueAndDelete => {
            let succeeded = state.status == RunStatus::Completed;
            let pr_created = state.artifacts.pull_request.is_some();
            if succeeded || pr_created {
                if let Err(e) = deps.manager.remove(workspace).await {
                    warn!("finalize: remove workspace: {e:#}");
                }
            } else {
                deps.logger.log(&format!(
                    "keeping workspace {} for debugging",
                    workspace.path.display()
                ));
            }
        }
    }
}
