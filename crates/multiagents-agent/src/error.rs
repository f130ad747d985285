use thiserror::Error;

/// Errors from subprocess adapters and the persistent supervisor.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The subprocess violated its wire contract (closed stdout mid-turn,
    /// ended without a completion marker, malformed handshake response).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The handshake before the first turn failed; the turn cannot start.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A JSON-RPC error object was returned for a request we care about.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The subprocess could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Pipe I/O failed (broken pipe, reset, closed stdin).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handshake or response wait exceeded its budget.
    #[error("timed out after {ms}ms waiting for {what}")]
    Timeout { what: String, ms: u64 },

    /// Crash-recovery retries were exhausted.
    #[error("max retries exceeded after process crash: {0}")]
    RetriesExhausted(String),

    /// The adapter was asked to send before the handshake established state.
    #[error("adapter not ready: {0}")]
    NotReady(String),
}

impl AgentError {
    /// Whether the supervisor should respawn the subprocess and retry.
    ///
    /// Handshake failures are fatal for the turn — the next turn retries
    /// from scratch without resume.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Protocol(_)
                | AgentError::Rpc(_)
                | AgentError::Io(_)
                | AgentError::Spawn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
