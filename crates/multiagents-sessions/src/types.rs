use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use multiagents_core::AgentPersona;

/// A session row joined with its per-agent CLI session ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    pub agents: Vec<AgentPersona>,
    pub created_at: String,
    pub updated_at: String,
    pub is_running: bool,
    pub is_paused: bool,
    pub current_round: u64,
    pub last_event_id: u64,
    pub last_event_at: String,
    pub working_dir: String,
    pub config: HashMap<String, Value>,
    pub agent_sessions: HashMap<String, Option<String>>,
}

/// Lightweight running/round snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub is_running: bool,
    pub is_paused: bool,
    pub current_round: u64,
    pub last_event_id: u64,
    pub last_event_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub round_number: Option<u64>,
    pub passed: bool,
    pub created_at: String,
}

/// In-flight stream progress for one agent, used for reconnect catch-up.
#[derive(Debug, Clone, Serialize)]
pub struct AgentProgress {
    pub last_round: u64,
    pub status: String,
    pub stream_text: String,
}
