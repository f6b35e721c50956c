use std::collections::BTreeMap;

use serde_json::Value;

/// Line prefix for the structured-output side channel. Everything after the
/// prefix must be a JSON object whose `outputs` member is merged into the
/// stage's structured outputs.
pub const OUTPUTS_PREFIX: &str = "::report_outputs::";

/// Line prefix for freeform `key=value` extraction.
pub const KV_PREFIX: &str = "::kv::";

/// Classification of one agent stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// `::report_outputs:: {"outputs": {...}}`
    Structured(BTreeMap<String, Value>),
    /// `::kv:: key=value`
    Kv { key: String, value: String },
    /// Anything else; forwarded untouched to logs and UI.
    Text,
}

/// Classify one line of agent output. Malformed protocol lines degrade to
/// `Text` so a half-written sentinel never kills a stage.
pub fn extract_from_stream(line: &str) -> StreamLine {
    if let Some(rest) = line.strip_prefix(OUTPUTS_PREFIX) {
        let parsed: Result<Value, _> = serde_json::from_str(rest.trim());
        if let Ok(Value::Object(obj)) = parsed {
            if let Some(Value::Object(outputs)) = obj.get("outputs") {
                let map = outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>();
                return StreamLine::Structured(map);
            }
        }
        return StreamLine::Text;
    }

    if let Some(rest) = line.strip_prefix(KV_PREFIX) {
        if let Some((key, value)) = rest.trim().split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                return StreamLine::Kv {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                };
            }
        }
        return StreamLine::Text;
    }

    StreamLine::Text
}

/// Collapse a changed-file list into a short summary.
///
/// Small lists are printed verbatim; larger ones are grouped by directory
/// and reported as the top five directories by count. The result depends
/// only on the multiset of directory prefixes and the total length, never
/// on file order.
pub fn compress_file_list(files: &[String]) -> String {
    if files.is_empty() {
        return "No files changed".to_string();
    }
    if files.len() <= 5 {
        return files.join("\n");
    }

    let mut by_dir: BTreeMap<String, usize> = BTreeMap::new();
    for file in files {
        let dir = match file.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => "./".to_string(),
        };
        *by_dir.entry(dir).or_insert(0) += 1;
    }

    // Count descending, then name ascending so output is deterministic.
    let mut dirs: Vec<(String, usize)> = by_dir.into_iter().collect();
    dirs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let shown = dirs
        .iter()
        .take(5)
        .map(|(dir, count)| format!("{dir} ({count})"))
        .collect::<Vec<_>>()
        .join(", ");

    let suffix = if dirs.len() > 5 { ", ..." } else { "" };
    format!("Changed {} files in: {shown}{suffix}", files.len())
}
