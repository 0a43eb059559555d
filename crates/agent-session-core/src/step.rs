//! Agent steps and the per-turn trace.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single tool invocation made by the agent during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name.
    pub name: String,
    /// Arguments passed to the tool.
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Invocation id assigned by the agent.
    pub id: String,
}

/// One unit of agent work as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Sequence number, starting at 1 within a turn.
    pub step_number: u64,
    /// Start timestamp (seconds since the Unix epoch).
    pub start_time: f64,
    /// End timestamp (seconds since the Unix epoch).
    pub end_time: f64,
    /// Duration in seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final answer. Non-empty only on the step that ends the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_output: Option<String>,
    /// Raw model output for the step, when the agent reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,
}

impl StepRecord {
    /// Create a bare step; the duration is derived from the timestamps.
    #[must_use]
    pub fn new(step_number: u64, start_time: f64, end_time: f64) -> Self {
        Self {
            step_number,
            start_time,
            end_time,
            duration: (end_time - start_time).max(0.0),
            tool_calls: Vec::new(),
            observations: None,
            error: None,
            action_output: None,
            model_output: None,
        }
    }

    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    #[must_use]
    pub fn with_observations(mut self, observations: impl Into<String>) -> Self {
        self.observations = Some(observations.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_action_output(mut self, output: impl Into<String>) -> Self {
        self.action_output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_model_output(mut self, output: impl Into<String>) -> Self {
        self.model_output = Some(output.into());
        self
    }

    /// The terminal output, if this step ends the turn.
    #[must_use]
    pub fn final_output(&self) -> Option<&str> {
        self.action_output.as_deref().filter(|s| !s.is_empty())
    }

    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Ordered steps of the current turn. Only ever appended to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Trace {
    steps: Vec<StepRecord>,
}

impl Trace {
    #[must_use]
    pub const fn new() -> Self {
        Self { steps: Vec::new() }
    }

    #[must_use]
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StepRecord> {
        self.steps.iter()
    }

    /// Output of the first step carrying a non-empty `action_output`.
    #[must_use]
    pub fn final_output(&self) -> Option<&str> {
        self.steps.iter().find_map(StepRecord::final_output)
    }

    /// Sequence numbers in arrival order.
    #[must_use]
    pub fn step_numbers(&self) -> Vec<u64> {
        self.steps.iter().map(|s| s.step_number).collect()
    }

    pub(crate) fn push(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub(crate) fn clear(&mut self) {
        self.steps.clear();
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a StepRecord;
    type IntoIter = std::slice::Iter<'a, StepRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
