use serde_json::Value;

/// Events emitted by protocol adapters while streaming one turn.
///
/// Exactly one `TurnComplete` terminates each turn; everything before it is
/// incremental. `ProcessRestarted` is injected by the supervisor, not by
/// adapters.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental response text.
    TextDelta { text: String },

    /// Incremental internal reasoning. Never stored in history.
    ThinkingDelta { text: String },

    /// The agent started (or reported) a tool invocation.
    ToolBadge { label: String, detail: String },

    /// Streaming output from a running tool (e.g. command stdout).
    ToolOutput { tool_name: String, text: String },

    /// A tool invocation finished.
    ToolResult {
        tool_name: String,
        success: bool,
        /// Truncated summary of the tool output.
        output: String,
    },

    /// The agent is waiting for user approval of a tool call.
    PermissionRequest {
        request_id: String,
        tool_name: String,
        tool_input: Value,
        description: String,
    },

    /// The persistent subprocess died and the turn is being retried.
    ProcessRestarted { reason: String, retry: u32 },

    /// The turn finished. `session_id` is the server-side id for resume.
    TurnComplete {
        text: String,
        session_id: Option<String>,
        success: bool,
        error: Option<String>,
    },
}

impl AgentEvent {
    pub fn turn_complete(text: impl Into<String>, session_id: Option<String>) -> Self {
        AgentEvent::TurnComplete {
            text: text.into(),
            session_id,
            success: true,
            error: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        AgentEvent::TextDelta { text: text.into() }
    }

    pub fn badge(label: impl Into<String>, detail: impl Into<String>) -> Self {
        AgentEvent::ToolBadge {
            label: label.into(),
            detail: detail.into(),
        }
    }
}

/// User decision on a pending permission request.
#[derive(Debug, Clone)]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
}
