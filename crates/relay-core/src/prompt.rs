use std::path::Path;

use crate::types::StageConfig;

/// Build the prompt for one stage attempt: the referenced agent definition,
/// the declared inputs, and (for final-layer stages of a looping pipeline)
/// the loop-continuation instructions.
pub fn compose_prompt(
    stage: &StageConfig,
    workdir: &Path,
    loop_instructions: Option<&str>,
) -> String {
    let mut s = String::new();

    match resolve_agent_definition(&stage.agent_ref, workdir) {
        Some(definition) => s.push_str(&definition),
        // An agentRef that is not a readable file is passed through as the
        // instruction itself.
        None => s.push_str(&stage.agent_ref),
    }

    if !stage.inputs.is_empty() {
        s.push_str("\n\n## Inputs\n");
        for (key, value) in &stage.inputs {
            let rendered = match value {
                serde_json::Value::String(v) => v.clone(),
                other => other.to_string(),
            };
            s.push_str(&format!("- {key}: {rendered}\n"));
        }
    }

    if let Some(instructions) = loop_instructions.filter(|i| !i.is_empty()) {
        s.push_str("\n\n---\n\n");
        s.push_str(instructions);
    }

    s
}

/// Read the agent definition file behind `agent_ref`: absolute paths as-is,
/// relative paths against the workspace checkout.
fn resolve_agent_definition(agent_ref: &str, workdir: &Path) -> Option<String> {
    let path = Path::new(agent_ref);
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    };
    let content = std::fs::read_to_string(&candidate).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
