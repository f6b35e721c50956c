use relay_core::types::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the Claude Code `stream-json` output, decoded by its `type`
/// tag. The shapes here mirror the CLI's wire format, not our own model.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Session bootstrap, sent before any turn.
    System(SystemEvent),

    /// One assistant turn; carries text and/or tool invocations.
    Assistant(AssistantEvent),

    /// Tool results echoed back into the transcript as a user turn.
    User(UserEvent),

    /// Closing summary of the whole run; arrives exactly once, last.
    Result(ResultEvent),

    /// Forward-compatibility catch-all for message types we don't model.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// One piece of a turn's content list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Ordinary prose from the model; the only kind we re-emit downstream.
    Text { text: String },

    /// Extended-thinking prose, kept out of the stage output.
    Thinking { thinking: String },

    /// The model calling a tool.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// What the tool returned; shows up on the user side of the transcript.
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// The run's closing record: outcome text, cost, and token accounting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Final answer text; empty when the run ended on a tool call.
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
}

/// Parse one NDJSON line; None for blank or non-JSON lines.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Map the final result's usage block into the engine's token record.
pub fn token_usage_from_result(result: &ResultEvent) -> TokenUsage {
    let usage = result.usage.clone().unwrap_or_default();
    TokenUsage {
        estimated_input: 0,
        actual_input: usage.input_tokens.unwrap_or(0),
        output: usage.output_tokens.unwrap_or(0),
        cache_read: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation: usage.cache_creation_input_tokens.unwrap_or(0),
        thinking_tokens: usage.thinking_tokens.unwrap_or(0),
        num_turns: result.num_turns.unwrap_or(0),
    }
}

/// Parse a full NDJSON stream: final output text plus token usage.
///
/// The result event's text wins; assistant text is the fallback when the
/// last turn was a tool call.
pub fn parse_stream(data: &str) -> (String, Option<TokenUsage>) {
    let mut output = String::new();
    let mut assistant_text = String::new();
    let mut usage: Option<TokenUsage> = None;

    for line in data.lines() {
        let Some(event) = parse_line(line) else {
            continue;
        };
        match event {
            AgentEvent::Assistant(e) => {
                for text in assistant_text_blocks(&e) {
                    if !assistant_text.is_empty() {
                        assistant_text.push('\n');
                    }
                    assistant_text.push_str(&text);
                }
            }
            AgentEvent::Result(e) => {
                usage = Some(token_usage_from_result(&e));
                if let Some(text) = e.result {
                    output = text;
                }
            }
            _ => {}
        }
    }

    if output.is_empty() && !assistant_text.is_empty() {
        output = assistant_text;
    }

    (output, usage)
}

/// Text blocks of one assistant event, in order.
pub fn assistant_text_blocks(event: &AssistantEvent) -> Vec<String> {
    let Some(message) = &event.message else {
        return Vec::new();
    };
    let Some(blocks) = &message.content else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
