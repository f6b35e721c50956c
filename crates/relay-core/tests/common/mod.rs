#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use relay_core::coordinator::RunCoordinator;
use relay_core::pr::PrProvider;
use relay_core::runtime::RuntimeMap;
use relay_core::types::{
    ExecutionConfig, ExecutionMode, FailureStrategy, GitConfig, LoopConfig, MergeStrategy,
    PipelineConfig, PullRequestInfo, RetryConfig, StageConfig, TriggerKind,
};

/// Run git in `dir`, panicking on failure (test setup only).
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("spawn git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Initialise a repository with a `main` branch and one commit.
pub fn init_repo(dir: &Path) {
    let init = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["init", "-b", "main"])
        .output()
        .expect("spawn git init");
    if !init.status.success() {
        git(dir, &["init"]);
        git(dir, &["checkout", "-b", "main"]);
    }
    git(dir, &["config", "user.name", "pipeline-tests"]);
    git(dir, &["config", "user.email", "pipeline-tests@example.invalid"]);
    std::fs::write(dir.join("README.md"), "seed\n").expect("write seed file");
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

/// State observer that keeps every snapshot it sees.
#[derive(Default)]
pub struct RecordingObserver {
    pub snapshots: std::sync::Mutex<Vec<relay_core::types::PipelineState>>,
}

impl relay_core::events::StateObserver for RecordingObserver {
    fn on_state_change(&self, state: &relay_core::types::PipelineState) {
        self.snapshots.lock().unwrap().push(state.clone());
    }
}

/// PR provider stub that records calls instead of reaching a host.
#[derive(Default)]
pub struct StubPr {
    pub exists: bool,
    pub created: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl PrProvider for StubPr {
    async fn pr_exists(&self, _branch: &str, _base: &str) -> Result<bool> {
        Ok(self.exists)
    }

    async fn create_pr(
        &self,
        branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
        _draft: bool,
    ) -> Result<PullRequestInfo> {
        self.created.lock().unwrap().push(branch.to_string());
        Ok(PullRequestInfo {
            url: format!("https://example.invalid/pr/{branch}"),
            number: 1,
            branch: branch.to_string(),
        })
    }
}

/// A stage whose agent is a shell command line.
pub fn shell_stage(name: &str, command: &str, deps: &[&str]) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        agent_ref: command.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        inputs: BTreeMap::new(),
        declared_output_keys: Vec::new(),
        timeout_seconds: 900,
        on_fail: Default::default(),
        retry: RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
        enabled: true,
        runtime: None,
        model: None,
        permission_mode: None,
    }
}

/// Minimal pipeline: parallel, stop-on-failure, no merge step.
pub fn pipeline(name: &str, stages: Vec<StageConfig>) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        trigger: TriggerKind::Manual,
        execution: ExecutionConfig {
            mode: ExecutionMode::Parallel,
            failure_strategy: FailureStrategy::Stop,
            max_parallel: None,
        },
        stages,
        git: GitConfig {
            merge_strategy: MergeStrategy::None,
            ..GitConfig::default()
        },
        looping: LoopConfig::default(),
        notifications: None,
    }
}

/// Coordinator with the shell runtime as the only backend.
pub fn coordinator(root: &Path) -> RunCoordinator {
    coordinator_with_pr(root, Arc::new(StubPr::default()))
}

pub fn coordinator_with_pr(root: &Path, pr: Arc<dyn PrProvider>) -> RunCoordinator {
    let mut runtimes: RuntimeMap = HashMap::new();
    runtimes.insert(
        "shell".to_string(),
        Arc::new(relay_agent::ShellRuntime::new()),
    );
    RunCoordinator::new(root, runtimes, "shell", pr)
}
