mod common;

use std::sync::Arc;

use common::{coordinator, coordinator_with_pr, git, init_repo, pipeline, shell_stage, StubPr};
use relay_core::coordinator::RunOptions;
use relay_core::error::ErrorCategory;
use relay_core::events::{EventBus, EventSink};
use relay_core::loops::LoopController;
use relay_core::types::{
    FailureStrategy, LoopTermination, MergeStrategy, RunStatus, StageStatus,
};

fn options_with_bus(bus: &Arc<EventBus>) -> RunOptions {
    RunOptions {
        sink: Arc::clone(bus) as Arc<dyn EventSink>,
        ..RunOptions::default()
    }
}

/// Count terminal pipeline events left on a drained subscription.
fn drain_terminal(sub: &mut relay_core::events::EventSubscription) -> Vec<&'static str> {
    let mut terminal = Vec::new();
    while let Some(event) = sub.try_recv() {
        if event.is_terminal() {
            terminal.push(event.name());
        }
    }
    terminal
}

// ── Scenario A: diamond, parallel, all succeed ───────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn diamond_parallel_all_succeed() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    // The sibling that writes later sleeps past the other's commit so each
    // stage's commit contains exactly its own file.
    let config = pipeline(
        "diamond",
        vec![
            shell_stage("root", "echo seed > root.txt", &[]),
            shell_stage("left", "echo l > left.txt", &["root"]),
            shell_stage("right", "sleep 1 && echo r > right.txt", &["root"]),
            shell_stage("join", "echo j > join.txt", &["left", "right"]),
        ],
    );

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stages.len(), 4);
    for stage in &state.stages {
        assert_eq!(stage.status, StageStatus::Success, "{}", stage.stage_name);
        assert!(stage.commit_sha.is_some(), "{} committed", stage.stage_name);
    }

    // Four distinct commits on top of the initial one.
    let mut shas: Vec<_> = state
        .stages
        .iter()
        .filter_map(|s| s.commit_sha.clone())
        .collect();
    shas.sort();
    shas.dedup();
    assert_eq!(shas.len(), 4);

    let count = git(
        tmp.path(),
        &["rev-list", "--count", "pipeline/diamond"],
    );
    assert_eq!(count.trim(), "5", "initial + one commit per stage");

    // root ran first; join ran last.
    assert_eq!(state.stages[0].stage_name, "root");
    assert_eq!(state.stages[3].stage_name, "join");
}

// ── Scenario B: sibling failure under failureStrategy=continue ───────────

#[tokio::test(flavor = "multi_thread")]
async fn sibling_failure_with_continue_is_partial() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut config = pipeline(
        "siblings",
        vec![
            shell_stage("a", "echo ok", &[]),
            shell_stage("b", "exit 1", &[]),
            shell_stage("c", "echo ok", &[]),
        ],
    );
    config.execution.failure_strategy = FailureStrategy::Continue;

    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let state = coordinator
        .run(&config, &options_with_bus(&bus))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Partial);
    assert_eq!(state.stage("a").unwrap().status, StageStatus::Success);
    assert_eq!(state.stage("c").unwrap().status, StageStatus::Success);
    let b = state.stage("b").unwrap();
    assert_eq!(b.status, StageStatus::Failed);
    assert_eq!(b.error.as_ref().unwrap().category, ErrorCategory::Runtime);

    // Partial maps to pipeline.completed (with the partial flag), never to
    // pipeline.failed.
    let mut saw_partial_completed = false;
    let mut terminal = 0;
    while let Some(event) = sub.try_recv() {
        if event.is_terminal() {
            terminal += 1;
            match event {
                relay_core::events::PipelineEvent::PipelineCompleted { partial, .. } => {
                    saw_partial_completed = partial;
                }
                other => panic!("unexpected terminal event {}", other.name()),
            }
        }
    }
    assert_eq!(terminal, 1);
    assert!(saw_partial_completed);
}

// ── Scenario C: dependent of a failed stage under stop ───────────────────

#[tokio::test(flavor = "multi_thread")]
async fn dependent_of_failed_stage_is_skipped_under_stop() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let config = pipeline(
        "chain",
        vec![
            shell_stage("a", "echo a > a.txt", &[]),
            shell_stage("b", "exit 1", &["a"]),
            shell_stage("c", "echo c > c.txt", &["b"]),
        ],
    );

    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let state = coordinator
        .run(&config, &options_with_bus(&bus))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.stage("a").unwrap().status, StageStatus::Success);
    assert_eq!(state.stage("b").unwrap().status, StageStatus::Failed);
    assert_eq!(state.stage("c").unwrap().status, StageStatus::Skipped);
    assert!(state.stage("c").unwrap().commit_sha.is_none());

    let terminal = drain_terminal(&mut sub);
    assert_eq!(terminal, vec!["pipeline.failed"]);
}

// ── Scenario D: timeout with retry ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn timeout_is_retried_then_fails() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut stage = shell_stage("sleeper", "sleep 30", &[]);
    stage.timeout_seconds = 1;
    stage.retry.max_attempts = 2;
    stage.retry.initial_delay_ms = 100;
    let config = pipeline("timeouts", vec![stage]);

    let started = std::time::Instant::now();
    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    let sleeper = state.stage("sleeper").unwrap();
    assert_eq!(sleeper.status, StageStatus::Failed);
    assert_eq!(sleeper.retry_attempt, 1, "second attempt is 0-indexed 1");
    assert_eq!(sleeper.max_retries, 1);
    assert_eq!(
        sleeper.error.as_ref().unwrap().category,
        ErrorCategory::Timeout
    );
    // Two 1s budgets plus backoff, nowhere near the 30s sleep.
    assert!(started.elapsed().as_secs() < 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_is_not_retried_when_disabled() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut stage = shell_stage("sleeper", "sleep 30", &[]);
    stage.timeout_seconds = 1;
    stage.retry.max_attempts = 3;
    stage.retry.retry_timeouts = false;
    let config = pipeline("timeouts-off", vec![stage]);

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let sleeper = state.stage("sleeper").unwrap();
    assert_eq!(sleeper.status, StageStatus::Failed);
    assert_eq!(sleeper.retry_attempt, 0, "no retry when retryTimeouts=false");
}

// ── Scenario E: commit elision on a clean tree ───────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn clean_tree_elides_commit_and_skips_pr_path() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let pr = Arc::new(StubPr::default());
    let coordinator = coordinator_with_pr(tmp.path(), pr.clone());

    let mut config = pipeline("log-only", vec![shell_stage("logger", "echo just logging", &[])]);
    config.git.merge_strategy = MergeStrategy::PullRequest;

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let logger = state.stage("logger").unwrap();
    assert_eq!(logger.status, StageStatus::Success);
    assert!(logger.commit_sha.is_none());

    // Branch tip never moved.
    assert_eq!(
        state.artifacts.initial_commit, state.artifacts.final_commit,
        "no commits on the pipeline branch"
    );
    // The push + PR path was skipped entirely.
    assert!(pr.created.lock().unwrap().is_empty());
    assert!(state.artifacts.pull_request.is_none());
    assert!(state.artifacts.pr_error.is_none());
}

// ── Scenario F: loop terminated by stage signal ──────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn loop_stops_on_stage_signal() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    // Iteration 1 leaves a marker on the pipeline branch; iteration 2 sees
    // it and reports the stop output.
    let script = "if [ -f .loop-marker ]; then \
                  echo '::report_outputs:: {\"outputs\":{\"stopLooping\":true}}'; \
                  else touch .loop-marker; fi";
    let mut config = pipeline("looper", vec![shell_stage("worker", script, &[])]);
    config.looping.enabled = true;
    config.looping.max_iterations = 5;
    config.looping.instructions = "Stop when nothing is left to do.".to_string();

    let state = LoopController::new(&coordinator)
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let ctx = state.loop_context.expect("loop context recorded");
    assert_eq!(ctx.iteration, 2);
    assert_eq!(ctx.max_iterations, 5);
    assert_eq!(ctx.termination_reason, Some(LoopTermination::StoppedByStage));
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn loop_hits_iteration_limit() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut config = pipeline("limited", vec![shell_stage("worker", "echo tick", &[])]);
    config.looping.enabled = true;
    config.looping.max_iterations = 1;

    let state = LoopController::new(&coordinator)
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let ctx = state.loop_context.unwrap();
    assert_eq!(ctx.iteration, 1);
    assert_eq!(ctx.termination_reason, Some(LoopTermination::LimitReached));
}

// ── Boundary behaviors ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn empty_stage_list_completes_clean() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let state = coordinator
        .run(&pipeline("empty", Vec::new()), &options_with_bus(&bus))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.stages.is_empty());
    assert!(!state.any_commits());
    assert_eq!(drain_terminal(&mut sub), vec!["pipeline.completed"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_before_start_skips_everything() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let bus = EventBus::new();
    let mut sub = bus.subscribe();
    let options = options_with_bus(&bus);
    options.abort.cancel();

    let config = pipeline(
        "aborted",
        vec![
            shell_stage("a", "echo a > a.txt", &[]),
            shell_stage("b", "echo b > b.txt", &["a"]),
        ],
    );
    let state = coordinator.run(&config, &options).await.unwrap();

    assert_eq!(state.status, RunStatus::Aborted);
    assert_eq!(state.stages.len(), 2);
    for stage in &state.stages {
        assert_eq!(stage.status, StageStatus::Skipped);
        assert!(stage.commit_sha.is_none());
    }
    assert_eq!(drain_terminal(&mut sub), vec!["pipeline.aborted"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn structured_outputs_and_kv_are_captured() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let script = "echo plain line && \
                  echo '::report_outputs:: {\"outputs\":{\"reviewScore\":8}}' && \
                  echo '::kv:: note=all good'";
    let mut stage = shell_stage("reporter", script, &[]);
    stage.declared_output_keys = vec!["reviewScore".to_string()];
    let config = pipeline("outputs", vec![stage]);

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let reporter = state.stage("reporter").unwrap();
    assert_eq!(reporter.status, StageStatus::Success);
    assert_eq!(
        reporter.outputs.get("reviewScore").and_then(|v| v.as_i64()),
        Some(8)
    );
    assert_eq!(
        reporter.extracted_data.get("note").map(String::as_str),
        Some("all good")
    );

    // Outputs and transcript land in the mirrored handover directory.
    let mirror = state.artifacts.main_repo_handover_dir.as_ref().unwrap();
    let outputs_file = std::path::Path::new(mirror).join("reporter-output.json");
    let raw_file = std::path::Path::new(mirror).join("reporter-raw.md");
    assert!(outputs_file.exists());
    let transcript = std::fs::read_to_string(raw_file).unwrap();
    assert!(transcript.contains("::report_outputs::"), "protocol lines survive passthrough");
    assert!(transcript.contains("plain line"));

    let summary = std::path::Path::new(mirror).join("pipeline-summary.json");
    assert!(summary.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn runtime_failure_is_retried_until_attempts_exhausted() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    // Fails on the first two attempts, succeeds on the third.
    let script = "if [ -f .tries ] && [ \"$(cat .tries)\" = \"2\" ]; then \
                  echo done; \
                  else echo $(( $(cat .tries 2>/dev/null || echo 0) + 1 )) > .tries; exit 1; fi";
    let mut stage = shell_stage("flaky", script, &[]);
    stage.retry.max_attempts = 3;
    stage.retry.initial_delay_ms = 50;
    let config = pipeline("flaky", vec![stage]);

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let flaky = state.stage("flaky").unwrap();
    assert_eq!(flaky.status, StageStatus::Success);
    assert_eq!(flaky.retry_attempt, 2, "succeeded on the third attempt");
}

#[tokio::test(flavor = "multi_thread")]
async fn state_is_persisted_and_reloadable_after_run() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let config = pipeline("persisted", vec![shell_stage("only", "echo hi", &[])]);
    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    let reloaded = coordinator
        .store()
        .load(&state.run_id)
        .unwrap()
        .expect("terminal state persisted");
    assert_eq!(reloaded.status, state.status);
    assert_eq!(reloaded.stages.len(), state.stages.len());
    assert!(reloaded.end_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_with_reusable_branch_and_no_changes_adds_no_commits() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let config = pipeline("idempotent", vec![shell_stage("noop", "echo nothing", &[])]);

    let first = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();
    let second = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert!(!first.any_commits());
    assert!(!second.any_commits());
    assert_eq!(
        first.artifacts.final_commit, second.artifacts.final_commit,
        "branch tip unchanged across reruns"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dry_run_plans_without_executing() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let config = pipeline(
        "dry",
        vec![shell_stage("writer", "echo x > should-not-exist.txt", &[])],
    );
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };
    let state = coordinator.run(&config, &options).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.stages.len(), 1);
    assert_eq!(state.stages[0].status, StageStatus::Skipped);
    assert!(
        !tmp.path()
            .join(".agent-pipeline/worktrees")
            .exists(),
        "dry run prepares no workspace"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn observer_sees_snapshots_ending_terminal() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let observer = Arc::new(common::RecordingObserver::default());
    let options = RunOptions {
        observer: Some(observer.clone()),
        ..RunOptions::default()
    };

    let config = pipeline("observed", vec![shell_stage("only", "echo hi", &[])]);
    let state = coordinator.run(&config, &options).await.unwrap();

    let snapshots = observer.snapshots.lock().unwrap();
    assert!(snapshots.len() >= 3, "create, per-group, terminal at least");
    // Snapshots arrive in order; the last one is the terminal state.
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, state.status);
    assert!(last.status.is_terminal());
    assert_eq!(snapshots[0].status, RunStatus::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn max_parallel_caps_concurrent_stages() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut config = pipeline(
        "capped",
        vec![
            shell_stage("a", "sleep 0.3", &[]),
            shell_stage("b", "sleep 0.3", &[]),
            shell_stage("c", "sleep 0.3", &[]),
        ],
    );
    config.execution.max_parallel = Some(1);

    let started = std::time::Instant::now();
    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(900),
        "stages admitted one at a time"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn local_merge_lands_work_on_base_branch() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut config = pipeline(
        "merger",
        vec![shell_stage("writer", "echo merged content > merged.txt", &[])],
    );
    config.git.merge_strategy = MergeStrategy::LocalMerge;

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.stage("writer").unwrap().commit_sha.is_some());

    // The primary checkout sits on a clean main, so the pipeline branch
    // merged straight into it.
    assert!(tmp.path().join("merged.txt").exists());
    let listed = git(tmp.path(), &["ls-files"]);
    assert!(listed.contains("merged.txt"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unique_and_delete_removes_workspace_on_success() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let mut config = pipeline(
        "ephemeral",
        vec![shell_stage("writer", "echo x > work.txt", &[])],
    );
    config.git.branch_strategy = relay_core::types::BranchStrategy::UniqueAndDelete;

    let state = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let branch = state.artifacts.branch.clone().unwrap();
    let worktrees = tmp.path().join(".agent-pipeline/worktrees");
    let leftover: Vec<_> = std::fs::read_dir(&worktrees)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(
        leftover.is_empty(),
        "workspace removed after successful run"
    );

    // The branch went with it.
    let check = std::process::Command::new("git")
        .arg("-C")
        .arg(tmp.path())
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
        .output()
        .unwrap();
    assert!(!check.status.success(), "branch {branch} deleted");
}

#[tokio::test(flavor = "multi_thread")]
async fn configuration_error_propagates_before_side_effects() {
    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let coordinator = coordinator(tmp.path());

    let config = pipeline("broken", vec![shell_stage("a", "true", &["missing"])]);
    let err = coordinator
        .run(&config, &RunOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"));

    // Nothing persisted, no workspace created.
    assert!(coordinator.store().list(None).unwrap().is_empty());
    assert!(!tmp.path().join(".agent-pipeline/worktrees").exists());
}
