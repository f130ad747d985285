//! Codex app-server protocol adapter.
//!
//! The protocol is JSON-RPC 2.0 but the `"jsonrpc":"2.0"` header is
//! OMITTED. Messages are newline-delimited JSON over stdio:
//!   Requests:      `{"method": str, "id": int, "params": obj}`
//!   Responses:     `{"id": int, "result": obj}` or `{"id": int, "error": {...}}`
//!   Notifications: `{"method": str, "params": obj}` (no "id")

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::{parse_json_line, ProcessIo, ProtocolAdapter};
use crate::error::{AgentError, Result};
use crate::event::AgentEvent;
use crate::labels::{short_path, truncate_chars};

const VENDOR: &str = "codex";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Notifications that carry no UI-relevant information.
const INFORMATIONAL: &[&str] = &[
    "thread/started",
    "thread/name/updated",
    "thread/tokenUsage/updated",
    "thread/compacted",
    "turn/diff/updated",
    "turn/plan/updated",
    "account/updated",
    "account/rateLimits/updated",
    "account/login/completed",
    "configWarning",
    "deprecationNotice",
    "sessionConfigured",
    "mcpServer/oauthLogin/completed",
    "authStatusChange",
    "loginChatGptComplete",
    "rawResponseItem/completed",
    "windows/worldWritableWarning",
];

/// Adapter for the Codex CLI app-server.
pub struct CodexAdapter {
    io: ProcessIo,
    id_counter: i64,
    thread_id: Option<String>,
    turn_id: Option<String>,
    approval_policy: String,
    sandbox: String,
    handshake_timeout: Duration,
}

impl CodexAdapter {
    pub fn new(io: ProcessIo, approval_policy: impl Into<String>, sandbox: impl Into<String>) -> Self {
        Self {
            io,
            id_counter: 0,
            thread_id: None,
            turn_id: None,
            approval_policy: approval_policy.into(),
            sandbox: sandbox.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn next_id(&mut self) -> i64 {
        self.id_counter += 1;
        self.id_counter
    }

    async fn send_request(&mut self, id: i64, method: &str, params: Value) -> Result<()> {
        debug!(vendor = VENDOR, method, id, "-> request");
        self.io
            .write_line(&json!({"method": method, "id": id, "params": params}).to_string())
            .await
    }

    async fn send_notification(&mut self, method: &str) -> Result<()> {
        debug!(vendor = VENDOR, method, "-> notification");
        self.io.write_line(&json!({"method": method}).to_string()).await
    }

    /// Extract a thread id from `{threadId}` or a nested `{thread: {id}}`.
    fn extract_thread_id(value: Option<&Value>) -> Option<String> {
        let value = value?;
        if let Some(tid) = value.get("threadId").and_then(Value::as_str) {
            return Some(tid.to_string());
        }
        value
            .get("thread")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Read lines until the response with `expected_id` arrives.
    async fn wait_for_response(&mut self, expected_id: i64) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.io.read_line()).await {
                Err(_) => {
                    warn!(vendor = VENDOR, expected_id, "timeout waiting for response");
                    return Err(AgentError::Timeout {
                        what: format!("response id={expected_id}"),
                        ms: self.handshake_timeout.as_millis() as u64,
                    });
                }
                Ok(read) => read?,
            };
            let Some(line) = line else {
                warn!(vendor = VENDOR, expected_id, "stream ended while waiting for response");
                return Err(AgentError::Handshake(format!(
                    "stream ended while waiting for response id={expected_id}"
                )));
            };
            let Some(obj) = parse_json_line(VENDOR, &line) else {
                continue;
            };
            if obj.get("id").and_then(Value::as_i64) == Some(expected_id) {
                return Ok(obj);
            }
        }
    }

    /// Wait for a thread id coming from the response or a `thread/started`
    /// notification that may arrive before it. A response without an id is
    /// retained so the caller can distinguish "acknowledged without an id"
    /// from an error.
    async fn wait_for_thread_id(
        &mut self,
        request_id: i64,
    ) -> Result<(Option<String>, Option<Value>)> {
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        let mut response: Option<Value> = None;
        loop {
            let line = match tokio::time::timeout_at(deadline, self.io.read_line()).await {
                Err(_) => {
                    warn!(vendor = VENDOR, request_id, "timeout waiting for thread id");
                    return Ok((None, response));
                }
                Ok(read) => read?,
            };
            let Some(line) = line else {
                warn!(vendor = VENDOR, request_id, "stream ended while waiting for thread id");
                return Ok((None, response));
            };
            let Some(obj) = parse_json_line(VENDOR, &line) else {
                continue;
            };

            if obj.get("id").and_then(Value::as_i64) == Some(request_id) {
                if let Some(error) = obj.get("error") {
                    return Err(AgentError::Rpc(error.to_string()));
                }
                let thread_id = Self::extract_thread_id(obj.get("result"));
                response = Some(obj);
                if thread_id.is_some() {
                    return Ok((thread_id, response));
                }
                continue;
            }

            if obj.get("method").and_then(Value::as_str) == Some("thread/started") {
                if let Some(tid) = Self::extract_thread_id(obj.get("params")) {
                    return Ok((Some(tid), response));
                }
            }
        }
    }

    /// Send `initialize` -> wait -> `initialized` notification.
    async fn handshake(&mut self) -> Result<()> {
        let init_id = self.next_id();
        self.send_request(
            init_id,
            "initialize",
            json!({"clientInfo": {"name": "multiagents", "version": "1.0.0"}}),
        )
        .await?;

        let response = self.wait_for_response(init_id).await.map_err(|e| {
            AgentError::Handshake(format!("Codex initialize handshake failed: {e}"))
        })?;
        if let Some(error) = response.get("error") {
            return Err(AgentError::Handshake(format!("Codex initialize failed: {error}")));
        }

        self.send_notification("initialized").await
    }

    fn handle_item_started(item: &Value, tx: &mpsc::UnboundedSender<AgentEvent>) {
        let itype = item.get("type").and_then(Value::as_str).unwrap_or("");
        match itype {
            "commandExecution" => {
                let cmd = item.get("command").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Run", shorten_command(cmd)));
            }
            "mcpToolCall" => {
                let _ = tx.send(AgentEvent::badge("MCP", mcp_label(item)));
            }
            "webSearch" => {
                let query = item.get("query").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Search", truncate_chars(query, 80)));
            }
            "reasoning" => {
                let _ = tx.send(AgentEvent::badge("Thinking", ""));
            }
            "fileChange" => {
                let changes = item.get("changes").and_then(Value::as_array);
                match changes {
                    Some(changes) if !changes.is_empty() => {
                        for ch in changes {
                            let _ = tx.send(AgentEvent::badge(
                                file_change_label(ch.get("kind")),
                                short_path(ch.get("path").and_then(Value::as_str).unwrap_or("")),
                            ));
                        }
                    }
                    _ => {
                        let _ = tx.send(AgentEvent::badge("Write", ""));
                    }
                }
            }
            "plan" => {
                let _ = tx.send(AgentEvent::badge("Planning", ""));
            }
            "collabAgentToolCall" => {
                let tool = item.get("tool").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Agent", tool));
            }
            "contextCompaction" => {
                let _ = tx.send(AgentEvent::badge("Compacting", ""));
            }
            "imageView" => {
                let path = item.get("path").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Image", short_path(path)));
            }
            "agentMessage" | "userMessage" => {}
            other => {
                debug!(vendor = VENDOR, item_type = other, "unhandled item/started type");
            }
        }
    }

    fn handle_item_completed(item: &Value, tx: &mpsc::UnboundedSender<AgentEvent>) {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
        match item_type {
            // Full text already streamed via item/agentMessage/delta.
            "agentMessage" => {}
            "reasoning" => {
                // Summary already streamed via deltas; emit final if present.
                let parts = item
                    .get("summary")
                    .and_then(Value::as_array)
                    .filter(|a| !a.is_empty())
                    .or_else(|| item.get("content").and_then(Value::as_array));
                if let Some(parts) = parts {
                    let text = parts
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.is_empty() {
                        let _ = tx.send(AgentEvent::ThinkingDelta { text });
                    }
                }
            }
            // Plan text already streamed via item/plan/delta.
            "plan" => {}
            "commandExecution" => {
                let cmd = item.get("command").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Run", shorten_command(cmd)));
            }
            "fileChange" => {
                if let Some(changes) = item.get("changes").and_then(Value::as_array) {
                    for ch in changes {
                        let _ = tx.send(AgentEvent::badge(
                            file_change_label(ch.get("kind")),
                            short_path(ch.get("path").and_then(Value::as_str).unwrap_or("")),
                        ));
                    }
                }
            }
            "mcpToolCall" => {
                let _ = tx.send(AgentEvent::badge("MCP", mcp_label(item)));
            }
            "webSearch" => {
                let query = item.get("query").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Search", truncate_chars(query, 80)));
            }
            "collabAgentToolCall" => {
                let tool = item.get("tool").and_then(Value::as_str).unwrap_or("");
                let _ = tx.send(AgentEvent::badge("Agent", tool));
            }
            _ => {}
        }
    }
}

/// Strip `sh -lc` wrapping and cap the command preview at 80 chars.
fn shorten_command(cmd: &str) -> String {
    let cmd = match cmd.split_once(" -lc ") {
        Some((_, rest)) => rest.trim_matches(['\'', '"']),
        None => cmd,
    };
    if cmd.chars().count() > 80 {
        format!("{}...", truncate_chars(cmd, 80))
    } else {
        cmd.to_string()
    }
}

fn mcp_label(item: &Value) -> String {
    let tool = item.get("tool").and_then(Value::as_str).unwrap_or("");
    let server = item.get("server").and_then(Value::as_str).unwrap_or("");
    let label = if server.is_empty() {
        tool.to_string()
    } else {
        format!("{server}/{tool}")
    };
    truncate_chars(&label, 80).to_string()
}

/// Label from a PatchChangeKind (object with "type" field, or legacy string).
fn file_change_label(kind: Option<&Value>) -> &'static str {
    let t = match kind {
        Some(Value::Object(map)) => map.get("type").and_then(Value::as_str).unwrap_or("update"),
        Some(Value::String(s)) => s.as_str(),
        _ => "update",
    };
    if t == "add" {
        "Write"
    } else {
        "Update"
    }
}

#[async_trait::async_trait]
impl ProtocolAdapter for CodexAdapter {
    async fn start(&mut self) -> Result<()> {
        self.handshake().await?;

        let req_id = self.next_id();
        self.send_request(
            req_id,
            "thread/start",
            json!({
                "approvalPolicy": self.approval_policy,
                "sandbox": self.sandbox,
            }),
        )
        .await?;

        let (thread, response) = self.wait_for_thread_id(req_id).await?;
        let Some(thread) = thread else {
            return Err(AgentError::Handshake(format!(
                "Codex thread/start returned no threadId: {response:?}"
            )));
        };
        info!(vendor = VENDOR, thread_id = %thread, "started thread");
        self.thread_id = Some(thread);
        Ok(())
    }

    async fn start_resume(&mut self, session_id: &str) -> Result<()> {
        self.handshake().await?;

        let resume_id = self.next_id();
        self.send_request(
            resume_id,
            "thread/resume",
            json!({
                "threadId": session_id,
                "approvalPolicy": self.approval_policy,
                "sandbox": self.sandbox,
            }),
        )
        .await?;

        let (resumed, response) = self.wait_for_thread_id(resume_id).await?;
        match resumed {
            Some(thread) => self.thread_id = Some(thread),
            None => {
                if let Some(error) = response.as_ref().and_then(|r| r.get("error")) {
                    return Err(AgentError::Handshake(format!(
                        "Codex thread/resume failed: {error}"
                    )));
                }
                // Resume acknowledged but no explicit id in the payload —
                // trust the one we asked for.
                self.thread_id = Some(session_id.to_string());
            }
        }
        info!(
            vendor = VENDOR,
            thread_id = self.thread_id.as_deref().unwrap_or(""),
            "resumed thread"
        );
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        let Some(thread_id) = self.thread_id.clone() else {
            return Err(AgentError::NotReady(
                "must call start() or start_resume() first".into(),
            ));
        };
        let req_id = self.next_id();
        self.send_request(
            req_id,
            "turn/start",
            json!({
                "threadId": thread_id,
                "input": [{"type": "text", "text": text}],
            }),
        )
        .await?;
        info!(vendor = VENDOR, id = req_id, thread_id = %thread_id, chars = text.len(), "turn/start sent");
        Ok(())
    }

    async fn stream_turn(&mut self, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<()> {
        while let Some(line) = self.io.read_line().await? {
            let Some(obj) = parse_json_line(VENDOR, &line) else {
                continue;
            };
            let method = obj.get("method").and_then(Value::as_str).unwrap_or("");
            let params = obj.get("params").cloned().unwrap_or_else(|| json!({}));

            match method {
                // -- Turn lifecycle --------------------------------------
                "turn/started" => {
                    if let Some(tid) = params
                        .get("turn")
                        .and_then(|t| t.get("id"))
                        .and_then(Value::as_str)
                    {
                        debug!(vendor = VENDOR, turn_id = tid, "turn/started");
                        self.turn_id = Some(tid.to_string());
                    }
                }
                "turn/completed" => {
                    let turn = params.get("turn").cloned().unwrap_or_else(|| json!({}));
                    let status = turn.get("status").and_then(Value::as_str);
                    let error_message = turn
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string);
                    let success = matches!(status, None | Some("completed"));

                    info!(
                        vendor = VENDOR,
                        thread_id = self.thread_id.as_deref().unwrap_or(""),
                        status = status.unwrap_or("<unknown>"),
                        "turn/completed"
                    );
                    self.turn_id = None;
                    let _ = tx.send(AgentEvent::TurnComplete {
                        text: String::new(),
                        session_id: self.thread_id.clone(),
                        success,
                        error: error_message,
                    });
                    return Ok(());
                }

                // -- Streaming deltas ------------------------------------
                "item/agentMessage/delta" => {
                    if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            let _ = tx.send(AgentEvent::text(delta));
                        }
                    }
                }
                // Reasoning streams during thinking (can last minutes);
                // summary and plan deltas get the same treatment.
                "item/reasoning/textDelta"
                | "item/reasoning/summaryTextDelta"
                | "item/plan/delta" => {
                    if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            let _ = tx.send(AgentEvent::ThinkingDelta { text: delta.into() });
                        }
                    }
                }
                "item/reasoning/summaryPartAdded" => {}
                "item/commandExecution/outputDelta" => {
                    if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            let _ = tx.send(AgentEvent::ToolOutput {
                                tool_name: "Run".into(),
                                text: truncate_chars(delta, 500).into(),
                            });
                        }
                    }
                }
                "item/commandExecution/terminalInteraction" => {
                    if let Some(output) = params.get("output").and_then(Value::as_str) {
                        if !output.is_empty() {
                            let _ = tx.send(AgentEvent::ToolOutput {
                                tool_name: "Run".into(),
                                text: truncate_chars(output, 500).into(),
                            });
                        }
                    }
                }
                "item/fileChange/outputDelta" => {
                    if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                        if !delta.is_empty() {
                            let _ = tx.send(AgentEvent::ToolOutput {
                                tool_name: "Write".into(),
                                text: truncate_chars(delta, 500).into(),
                            });
                        }
                    }
                }
                "item/mcpToolCall/progress" => {
                    if let Some(message) = params.get("message").and_then(Value::as_str) {
                        if !message.is_empty() {
                            let _ = tx.send(AgentEvent::badge("MCP", truncate_chars(message, 80)));
                        }
                    }
                }

                // -- Item lifecycle --------------------------------------
                "item/started" => {
                    let item = params.get("item").cloned().unwrap_or_else(|| json!({}));
                    Self::handle_item_started(&item, tx);
                }
                "item/completed" => {
                    let item = params.get("item").cloned().unwrap_or_else(|| json!({}));
                    Self::handle_item_completed(&item, tx);
                }

                "error" => {
                    let msg = params
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| params.to_string());
                    warn!(vendor = VENDOR, error = %msg, "error notification");
                }

                "" => {
                    // JSON-RPC responses to our own requests carry no method.
                    if obj.get("id").is_some() && obj.get("result").is_some() {
                        continue;
                    }
                }

                m if INFORMATIONAL.contains(&m) => {}

                other => {
                    debug!(vendor = VENDOR, method = other, "unhandled method");
                }
            }
        }

        Err(AgentError::Protocol(
            "codex process ended before turn/completed".into(),
        ))
    }

    async fn cancel(&mut self) -> Result<()> {
        let Some(thread_id) = self.thread_id.clone() else {
            return Ok(());
        };
        let cancel_id = self.next_id();
        let mut params = json!({"threadId": thread_id});
        match self.turn_id.clone() {
            Some(turn_id) => {
                params["turnId"] = Value::String(turn_id);
            }
            None => {
                warn!(vendor = VENDOR, "cancel called without turnId, sending threadId only");
            }
        }
        // Broken pipes on cancel just mean the process is already gone.
        if let Err(e) = self.send_request(cancel_id, "turn/interrupt", params).await {
            debug!(vendor = VENDOR, error = %e, "turn/interrupt send failed");
            return Ok(());
        }
        info!(
            vendor = VENDOR,
            id = cancel_id,
            thread_id = self.thread_id.as_deref().unwrap_or(""),
            turn_id = self.turn_id.as_deref().unwrap_or("<unknown>"),
            "turn/interrupt sent"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let shutdown_id = self.next_id();
        if self
            .send_request(shutdown_id, "shutdown", json!({}))
            .await
            .is_ok()
        {
            let _ = self.send_notification("exit").await;
            debug!(vendor = VENDOR, id = shutdown_id, "shutdown sent");
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.thread_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn adapter_pair() -> (
        CodexAdapter,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (client_out, server_out) = tokio::io::duplex(64 * 1024);
        let adapter = CodexAdapter::new(
            ProcessIo::new(Box::new(server_in), Box::new(client_out)),
            "never",
            "danger-full-access",
        );
        (adapter, client_in, server_out)
    }

    async fn feed(out: &mut tokio::io::DuplexStream, obj: Value) {
        let mut bytes = obj.to_string().into_bytes();
        bytes.push(b'\n');
        out.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn turn_completed_failed_marks_unsuccessful() {
        let (mut adapter, _stdin, mut server_out) = adapter_pair();
        adapter.thread_id = Some("thread-1".into());

        feed(
            &mut server_out,
            json!({"method": "turn/started", "params": {"turn": {"id": "turn-1"}}}),
        )
        .await;
        feed(
            &mut server_out,
            json!({"method": "turn/completed", "params": {
                "threadId": "thread-1",
                "turn": {"id": "turn-1", "status": "failed",
                         "error": {"message": "upstream disconnected"}},
            }}),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        drop(tx);

        let mut done = None;
        while let Some(ev) = rx.recv().await {
            if let AgentEvent::TurnComplete { success, error, .. } = ev {
                done = Some((success, error));
            }
        }
        let (success, error) = done.unwrap();
        assert!(!success);
        assert_eq!(error.as_deref(), Some("upstream disconnected"));
    }

    #[tokio::test]
    async fn turn_completed_interrupted_marks_unsuccessful_without_error() {
        let (mut adapter, _stdin, mut server_out) = adapter_pair();
        feed(
            &mut server_out,
            json!({"method": "turn/completed", "params": {
                "turn": {"id": "turn-2", "status": "interrupted"},
            }}),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        drop(tx);

        let ev = rx.recv().await.unwrap();
        match ev {
            AgentEvent::TurnComplete { success, error, .. } => {
                assert!(!success);
                assert!(error.is_none());
            }
            other => panic!("expected TurnComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_without_thread_id_in_response_keeps_requested_id() {
        let (adapter, client_in, mut server_out) = adapter_pair();
        let mut adapter = adapter.with_handshake_timeout(Duration::from_millis(200));

        // Answer the handshake and the resume request from a driver task,
        // keeping the adapter's stdin alive for the follow-up turn.
        let driver = tokio::spawn(async move {
            let mut lines = BufReader::new(client_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let obj: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match obj.get("method").and_then(Value::as_str) {
                    Some("initialize") => {
                        feed(&mut server_out, json!({"id": obj["id"], "result": {}})).await;
                    }
                    Some("thread/resume") => {
                        // Empty result: no threadId anywhere, but no error.
                        feed(&mut server_out, json!({"id": obj["id"], "result": {}})).await;
                    }
                    Some("turn/start") => {
                        feed(
                            &mut server_out,
                            json!({"method": "turn/completed",
                                   "params": {"turn": {"status": null}}}),
                        )
                        .await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        adapter.start_resume("thread-keep").await.unwrap();
        assert_eq!(adapter.session_id().as_deref(), Some("thread-keep"));

        // Follow-up turn on the retained id completes successfully.
        adapter.send_message("hello").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        driver.await.unwrap();
        drop(tx);
        match rx.recv().await.unwrap() {
            AgentEvent::TurnComplete { success, session_id, .. } => {
                assert!(success);
                assert_eq!(session_id.as_deref(), Some("thread-keep"));
            }
            other => panic!("expected TurnComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thread_started_notification_beats_missing_response() {
        let (mut adapter, client_in, mut server_out) = adapter_pair();

        let driver = tokio::spawn(async move {
            let mut lines = BufReader::new(client_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let obj: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match obj.get("method").and_then(Value::as_str) {
                    Some("initialize") => {
                        feed(&mut server_out, json!({"id": obj["id"], "result": {}})).await;
                    }
                    Some("thread/start") => {
                        // Notification arrives before (instead of) the response.
                        feed(
                            &mut server_out,
                            json!({"method": "thread/started",
                                   "params": {"thread": {"id": "t-notified"}}}),
                        )
                        .await;
                        break;
                    }
                    _ => {}
                }
            }
        });

        adapter.start().await.unwrap();
        driver.await.unwrap();
        assert_eq!(adapter.session_id().as_deref(), Some("t-notified"));
    }

    #[tokio::test]
    async fn file_change_kinds_map_to_write_or_update() {
        let (mut adapter, _stdin, mut server_out) = adapter_pair();
        feed(
            &mut server_out,
            json!({"method": "item/started", "params": {"item": {
                "type": "fileChange",
                "changes": [
                    {"kind": {"type": "add"}, "path": "/tmp/new.rs"},
                    {"kind": {"type": "delete"}, "path": "/tmp/old.rs"},
                ],
            }}}),
        )
        .await;
        feed(
            &mut server_out,
            json!({"method": "turn/completed", "params": {"turn": {"status": "completed"}}}),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        drop(tx);

        let mut labels = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let AgentEvent::ToolBadge { label, .. } = ev {
                labels.push(label);
            }
        }
        assert_eq!(labels, vec!["Write".to_string(), "Update".to_string()]);
    }

    #[tokio::test]
    async fn send_message_before_start_is_rejected() {
        let (mut adapter, _stdin, _server_out) = adapter_pair();
        let err = adapter.send_message("hi").await.unwrap_err();
        assert!(matches!(err, AgentError::NotReady(_)));
    }
}
