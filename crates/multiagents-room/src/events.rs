use std::collections::HashMap;

use serde_json::Value;

use multiagents_agent::AgentResponse;

/// Events emitted by a chat room to its subscribers.
///
/// Ordering guarantees: `RoundStarted(n)` precedes every event tagged with
/// round `n`; `RoundEnded(n)` follows them and fires exactly once per round;
/// a delivery's `AgentDeliveryAcked` precedes any `AgentCompleted` that
/// delivery triggered.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    RoundStarted {
        round_number: u64,
        agents: Vec<String>,
    },

    AgentStreamChunk {
        agent_name: String,
        round_number: u64,
        text: String,
    },

    AgentCompleted {
        agent_name: String,
        round_number: u64,
        response: AgentResponse,
        passed: bool,
        stopped: bool,
    },

    /// An agent was stopped so a DM could replace its turn.
    AgentInterrupted {
        agent_name: String,
        round_number: u64,
        partial_text: String,
    },

    AgentStderr {
        agent_name: String,
        round_number: u64,
        text: String,
    },

    /// Visible system notice about an agent (e.g. process restart).
    AgentNotice {
        agent_name: String,
        message: String,
    },

    /// Fired before dispatching a prompt, for UI visibility.
    AgentPromptAssembled {
        agent_name: String,
        round_number: u64,
        sections: HashMap<String, String>,
    },

    /// Fired when an agent dequeues a delivered inbox message.
    AgentDeliveryAcked {
        delivery_id: String,
        recipient: String,
        sender: String,
        round_number: Option<u64>,
    },

    /// An agent is waiting for user approval of a tool call.
    AgentPermissionRequested {
        agent_name: String,
        round_number: u64,
        request_id: String,
        tool_name: String,
        tool_input: Value,
        description: String,
    },

    RoundEnded {
        round_number: u64,
        all_passed: bool,
    },

    /// Fired after a round where any agent was stopped, before the next one.
    RoundPaused { round_number: u64 },

    /// reason: "all_passed" | "paused" | "error" | "cancelled"
    DiscussionEnded { reason: String },

    UserMessageReceived { text: String },
}
