use relay_agent::event::{parse_line, parse_stream, AgentEvent};

const SAMPLE_STREAM: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1"}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Looking at the repo."}]}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file":"src/lib.rs"}}]}}
{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"fn main() {}","is_error":false}]}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"All done."}]}}
{"type":"result","subtype":"success","result":"All done.","session_id":"sess-1","is_error":false,"num_turns":3,"usage":{"input_tokens":1200,"output_tokens":340,"cache_read_input_tokens":800,"cache_creation_input_tokens":100}}
"#;

#[test]
fn result_text_wins() {
    let (output, _) = parse_stream(SAMPLE_STREAM);
    assert_eq!(output, "All done.");
}

#[test]
fn token_usage_is_extracted_from_result() {
    let (_, usage) = parse_stream(SAMPLE_STREAM);
    let usage = usage.expect("usage present");
    assert_eq!(usage.actual_input, 1200);
    assert_eq!(usage.output, 340);
    assert_eq!(usage.cache_read, 800);
    assert_eq!(usage.cache_creation, 100);
    assert_eq!(usage.num_turns, 3);
}

#[test]
fn assistant_text_is_fallback_when_result_is_empty() {
    let stream = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"partial answer"}]}}
{"type":"result","subtype":"success","session_id":"s","is_error":false}
"#;
    let (output, _) = parse_stream(stream);
    assert_eq!(output, "partial answer");
}

#[test]
fn multiple_assistant_turns_are_joined() {
    let stream = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"one"}]}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"two"}]}}
"#;
    let (output, usage) = parse_stream(stream);
    assert_eq!(output, "one\ntwo");
    assert!(usage.is_none(), "no result event, no usage");
}

#[test]
fn malformed_lines_are_skipped() {
    let stream = "not json at all\n{\"type\":\"result\",\"result\":\"ok\"}\n";
    let (output, _) = parse_stream(stream);
    assert_eq!(output, "ok");
}

#[test]
fn unknown_event_types_are_tolerated() {
    let parsed = parse_line(r#"{"type":"brand_new_event","payload":1}"#);
    assert!(matches!(parsed, Some(AgentEvent::Unknown)));
}

#[test]
fn blank_lines_parse_to_none() {
    assert!(parse_line("").is_none());
    assert!(parse_line("   ").is_none());
}

#[test]
fn missing_usage_fields_default_to_zero() {
    let stream = r#"{"type":"result","result":"done","usage":{"output_tokens":5}}
"#;
    let (_, usage) = parse_stream(stream);
    let usage = usage.unwrap();
    assert_eq!(usage.actual_input, 0);
    assert_eq!(usage.output, 5);
    assert_eq!(usage.thinking_tokens, 0);
}
