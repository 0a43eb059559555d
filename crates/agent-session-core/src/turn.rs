//! One user-initiated request to the agent.

use serde::{Deserialize, Serialize};

use crate::TurnContext;

/// A user turn: free text plus optional structured context.
///
/// A turn is immutable once handed to the session client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Free-text content typed by the user.
    pub content: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TurnContext>,
}

impl Turn {
    /// Create a turn with text content only.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            context: None,
        }
    }

    /// Attach a context.
    #[must_use]
    pub fn with_context(mut self, context: TurnContext) -> Self {
        self.context = Some(context);
        self
    }

    /// True when there is nothing to send: blank content and no context entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.context.as_ref().is_none_or(TurnContext::is_empty)
    }
}
