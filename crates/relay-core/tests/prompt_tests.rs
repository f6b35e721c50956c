mod common;

use common::shell_stage;
use relay_core::prompt::compose_prompt;

#[test]
fn agent_definition_file_is_inlined() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("agents")).unwrap();
    std::fs::write(
        tmp.path().join("agents/reviewer.md"),
        "You review code.\n",
    )
    .unwrap();

    let stage = shell_stage("review", "agents/reviewer.md", &[]);
    let prompt = compose_prompt(&stage, tmp.path(), None);
    assert!(prompt.starts_with("You review code."));
}

#[test]
fn missing_definition_falls_back_to_the_ref_itself() {
    let tmp = tempfile::tempdir().unwrap();
    let stage = shell_stage("inline", "Summarize the diff.", &[]);
    let prompt = compose_prompt(&stage, tmp.path(), None);
    assert_eq!(prompt, "Summarize the diff.");
}

#[test]
fn inputs_are_appended_in_stable_order() {
    let tmp = tempfile::tempdir().unwrap();
    let mut stage = shell_stage("with-inputs", "Do the task.", &[]);
    stage
        .inputs
        .insert("zone".to_string(), serde_json::json!("us-east"));
    stage
        .inputs
        .insert("attempts".to_string(), serde_json::json!(3));

    let prompt = compose_prompt(&stage, tmp.path(), None);
    assert!(prompt.contains("## Inputs"));
    // BTreeMap order: attempts before zone.
    let attempts = prompt.find("- attempts: 3").unwrap();
    let zone = prompt.find("- zone: us-east").unwrap();
    assert!(attempts < zone);
}

#[test]
fn loop_instructions_are_appended_last() {
    let tmp = tempfile::tempdir().unwrap();
    let stage = shell_stage("final", "Finish up.", &[]);
    let prompt = compose_prompt(&stage, tmp.path(), Some("Report stopLooping when done."));
    assert!(prompt.ends_with("Report stopLooping when done."));
    assert!(prompt.find("Finish up.").unwrap() < prompt.find("stopLooping").unwrap());
}

#[test]
fn empty_loop_instructions_add_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let stage = shell_stage("plain", "Just work.", &[]);
    let with_empty = compose_prompt(&stage, tmp.path(), Some(""));
    let without = compose_prompt(&stage, tmp.path(), None);
    assert_eq!(with_empty, without);
}
