use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::AgentEvent;
use crate::permission::PermissionBridge;

/// Pipe halves of a live subprocess.
///
/// The halves are boxed so tests can substitute `tokio::io::duplex` pipes
/// for real child stdio. Stderr is drained by the supervisor, not here.
pub struct ProcessIo {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl ProcessIo {
    pub fn new(
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            stdin,
            stdout: BufReader::new(stdout),
        }
    }

    /// Write one line (appending '\n') and flush.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read one line from stdout. `None` means the subprocess closed its end.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        let n = self.stdout.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }
}

/// Adapter between a common event interface and one vendor's wire protocol.
///
/// One adapter instance exists per live subprocess. `stream_turn` sends the
/// events of the current turn into `tx` and returns only after a single
/// `TurnComplete` went out; the subprocess closing stdout first is a
/// protocol violation.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Run any handshake required before the first message.
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handshake that re-attaches to an existing server-side session.
    async fn start_resume(&mut self, _session_id: &str) -> Result<()> {
        self.start().await
    }

    /// Write the vendor-specific request for one user message to stdin.
    async fn send_message(&mut self, text: &str) -> Result<()>;

    /// Stream the events of the current turn, ending after `TurnComplete`.
    async fn stream_turn(&mut self, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<()>;

    /// Best-effort interruption of the current turn.
    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    /// Graceful wire-level close.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Current server-side session/thread id for resume after a crash.
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Shared handle used to answer pending permission requests mid-turn.
    /// `None` for vendors that never gate on approvals.
    fn permission_bridge(&self) -> Option<Arc<PermissionBridge>> {
        None
    }
}

/// Parse a JSON line, logging and skipping malformed input.
///
/// A single bad line never aborts a turn.
pub(crate) fn parse_json_line(vendor: &str, line: &str) -> Option<serde_json::Value> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::debug!(
                vendor,
                line = crate::labels::truncate_chars(line, 200),
                "json parse failed, skipping line"
            );
            None
        }
    }
}
