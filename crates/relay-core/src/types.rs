use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCategory;

// ── Config enums ─────────────────────────────────────────────────────────

/// What initiated (or may initiate) a pipeline run. The engine treats this
/// as a tag; hook semantics live in the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Manual,
    PreCommit,
    PostCommit,
    PrePush,
    PostMerge,
}

impl Default for TriggerKind {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Parallel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    Stop,
    Continue,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        Self::Stop
    }
}

/// Per-stage reaction to a failed final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFail {
    Stop,
    Continue,
    Warn,
}

impl Default for OnFail {
    fn default() -> Self {
        Self::Stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    /// Deterministic branch name, reused across runs.
    Reusable,
    /// Fresh branch per run, kept afterwards for inspection.
    UniquePerRun,
    /// Fresh branch per run, removed after a successful run.
    UniqueAndDelete,
}

impl Default for BranchStrategy {
    fn default() -> Self {
        Self::Reusable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    PullRequest,
    LocalMerge,
    None,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::None
    }
}

// ── Pipeline config ──────────────────────────────────────────────────────

/// Retry policy for one stage. Delays follow exponential backoff capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff: String,
    /// When false, a timed-out attempt is never retried.
    #[serde(default = "default_true")]
    pub retry_timeouts: bool,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff() -> String {
    "exponential".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: default_backoff(),
            retry_timeouts: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retrying after `attempt` (0-indexed) failed.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = self.initial_delay_ms.saturating_mul(1u64 << attempt.min(16));
        exp.min(self.max_delay_ms)
    }
}

/// One declared stage (config authors call them "agents").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    /// Opaque handle resolved by the agent runtime (typically an agent
    /// definition file or a command line).
    pub agent_ref: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Scalar inputs forwarded to the agent.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Output keys the stage is expected to report via the line protocol.
    #[serde(default)]
    pub declared_output_keys: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub on_fail: OnFail,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Runtime override for this stage. Empty/None = coordinator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Model override forwarded to the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Permission mode forwarded to the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    900
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Maximum stages admitted concurrently within a layer. None = no cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PullRequestConfig {
    #[serde(default = "default_pr_title")]
    pub title: String,
    #[serde(default = "default_pr_body")]
    pub body: String,
    #[serde(default)]
    pub draft: bool,
}

fn default_pr_title() -> String {
    "{{pipeline}}: automated changes".to_string()
}
fn default_pr_body() -> String {
    "Automated changes from pipeline `{{pipeline}}` (run {{runId}}).".to_string()
}

impl Default for PullRequestConfig {
    fn default() -> Self {
        Self {
            title: default_pr_title(),
            body: default_pr_body(),
            draft: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitConfig {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub branch_strategy: BranchStrategy,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Commit message template; variables: {{stage}}, {{pipeline}}, {{runId}}.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
    #[serde(default)]
    pub pull_request: PullRequestConfig,
}

fn default_base_branch() -> String {
    "main".to_string()
}
fn default_commit_prefix() -> String {
    "pipeline: {{stage}}".to_string()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            branch_strategy: BranchStrategy::default(),
            merge_strategy: MergeStrategy::default(),
            auto_commit: true,
            commit_prefix: default_commit_prefix(),
            pull_request: PullRequestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Continuation instructions appended to final-layer stage prompts.
    #[serde(default)]
    pub instructions: String,
}

fn default_max_iterations() -> u32 {
    100
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            instructions: String::new(),
        }
    }
}

/// Declarative input for one run: the full pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Stage list; config authors may spell the key "agents".
    #[serde(alias = "agents")]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub looping: LoopConfig,
    /// Opaque to the engine; forwarded with events for notification senders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
}

// ── Run state enums ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Total aggregation function over stage outcomes; computes the run
    /// status once all groups have finished.
    pub fn aggregate(stages: &[StageExecution], strategy: FailureStrategy, aborted: bool) -> Self {
        if aborted {
            return RunStatus::Aborted;
        }
        let any_failed = stages.iter().any(|s| s.status == StageStatus::Failed);
        match (any_failed, strategy) {
            (true, FailureStrategy::Stop) => RunStatus::Failed,
            (true, FailureStrategy::Continue) => RunStatus::Partial,
            (false, _) => RunStatus::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopTermination {
    Completed,
    LimitReached,
    StoppedByStage,
    Aborted,
}

// ── Run state records ────────────────────────────────────────────────────

/// What initiated this particular run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerInfo {
    pub fn now(kind: TriggerKind, commit_sha: Option<String>) -> Self {
        Self {
            kind,
            commit_sha,
            timestamp: Utc::now(),
        }
    }
}

/// Error recorded on a failed stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
}

impl StageErrorInfo {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            category,
            timestamp: Utc::now(),
        }
    }
}

/// Token accounting reported by runtimes that support it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub estimated_input: u64,
    #[serde(default)]
    pub actual_input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_creation: u64,
    #[serde(default)]
    pub thinking_tokens: u64,
    #[serde(default)]
    pub num_turns: u64,
}

/// One attempted execution of one stage. Created by the stage executor,
/// handed to the coordinator, never mutated after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    pub stage_name: String,
    pub status: StageStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    /// Absent when the stage changed no files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Structured outputs the stage reported via `::report_outputs::`.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Freeform `::kv::` data the stage reported.
    #[serde(default)]
    pub extracted_data: BTreeMap<String, String>,
    /// 0-indexed final attempt number.
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Where the per-stage transcript was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl StageExecution {
    /// A stage that was never started (abort, failed dependency, stop gate).
    pub fn skipped(stage_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage_name: stage_name.into(),
            status: StageStatus::Skipped,
            start_time: now,
            end_time: Some(now),
            duration: 0.0,
            commit_sha: None,
            outputs: BTreeMap::new(),
            extracted_data: BTreeMap::new(),
            retry_attempt: 0,
            max_retries: 0,
            error: None,
            token_usage: None,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestInfo {
    pub url: String,
    pub number: u64,
    pub branch: String,
}

/// Aggregate run outputs recorded on the state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_commit: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_dir: Option<String>,
    /// Mirror of the handover dir in the primary checkout when the run
    /// executed in an isolated workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_repo_handover_dir: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestInfo>,
    /// Last PR-creation error, recorded but never fatal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_error: Option<String>,
    /// Pipeline branch for the run (recorded even when nothing merges).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopContext {
    /// 1-indexed iteration this state belongs to.
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<LoopTermination>,
}

/// The durable record of one run. The coordinator is the only writer while
/// the run is live; everyone else sees snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: String,
    /// Snapshot of the config used, so runs are reproducible.
    pub pipeline_config: PipelineConfig,
    pub trigger: TriggerInfo,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    /// One record per executed or skipped stage, in completion order within
    /// a group, group order across groups.
    #[serde(default)]
    pub stages: Vec<StageExecution>,
    #[serde(default)]
    pub artifacts: RunArtifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_context: Option<LoopContext>,
}

impl PipelineState {
    pub fn new(run_id: impl Into<String>, config: PipelineConfig, trigger: TriggerInfo) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_config: config,
            trigger,
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Pending,
            stages: Vec::new(),
            artifacts: RunArtifacts::default(),
            loop_context: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Names of stages that produced a commit, in record order.
    pub fn committed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.commit_sha.is_some())
            .map(|s| s.stage_name.as_str())
            .collect()
    }

    pub fn any_commits(&self) -> bool {
        self.stages.iter().any(|s| s.commit_sha.is_some())
    }
}
