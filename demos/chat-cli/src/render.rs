//! Plain-text step cards.

use std::fmt::Write as _;

use agent_session_client::StepRecord;

/// Render one step the way the progress view lays it out.
pub fn step_card(step: &StepRecord) -> String {
    let mark = if step.error.is_some() { 'x' } else { '+' };
    let mut out = format!(
        "[{mark}] Step {} ({:.2}s)\n",
        step.step_number, step.duration
    );

    for call in &step.tool_calls {
        let args = serde_json::to_string_pretty(&call.arguments).unwrap_or_default();
        let _ = writeln!(out, "    Tool: {}", call.name);
        for line in args.lines() {
            let _ = writeln!(out, "      {line}");
        }
    }
    if let Some(thought) = step.model_output.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "    Thought: {thought}");
    }
    if let Some(observations) = step.observations.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "    Observations:");
        for line in observations.lines() {
            let _ = writeln!(out, "      {line}");
        }
    }
    if let Some(error) = &step.error {
        let _ = writeln!(out, "    Error: {error}");
    }
    if let Some(output) = step.final_output() {
        let _ = writeln!(out, "    Output: {output}");
    }
    out
}

/// Parse a `key=value` context pair. Values that parse as JSON keep their
/// type; anything else is a string.
pub fn parse_context_pair(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| value.into());
    Ok((key.to_string(), value))
}
