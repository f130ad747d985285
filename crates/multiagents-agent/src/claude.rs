//! Claude NDJSON stream-json protocol adapter.
//!
//! Wire format:
//!   Send: `{"type":"user","message":{"role":"user","content":"..."}}`
//!   Recv: NDJSON lines with types:
//!     system    — init (session info), compact_boundary
//!     assistant — cumulative content blocks (text, thinking, tool_use,
//!                 server_tool_use, web_search_tool_use,
//!                 code_execution_tool_use, mcp_tool_use, and their
//!                 *_result counterparts)
//!     result    — turn complete (subtype: success | error_*)
//!     user      — replayed user messages (skipped)
//!     stream_event — partial streaming events (skipped)

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::{parse_json_line, ProcessIo, ProtocolAdapter};
use crate::error::{AgentError, Result};
use crate::event::AgentEvent;
use crate::labels::{extract_tool_detail, truncate_chars};

const VENDOR: &str = "claude";

/// Adapter for the Claude CLI with `--input-format stream-json
/// --output-format stream-json`.
///
/// Assistant events carry content arrays that are cumulative within one
/// assistant turn, so text/thinking are tracked as running strings and only
/// the suffix beyond the last emission goes out. A changed `message.id`
/// marks a fresh assistant turn and resets the accumulators.
pub struct ClaudeAdapter {
    io: ProcessIo,
    session_id: Option<String>,
    last_cumulative: String,
    last_thinking: String,
    seen_tools: usize,
    seen_server_tools: usize,
    seen_results: usize,
    last_message_id: Option<String>,
}

impl ClaudeAdapter {
    pub fn new(io: ProcessIo) -> Self {
        Self {
            io,
            session_id: None,
            last_cumulative: String::new(),
            last_thinking: String::new(),
            seen_tools: 0,
            seen_server_tools: 0,
            seen_results: 0,
            last_message_id: None,
        }
    }

    fn reset_turn_state(&mut self) {
        self.last_cumulative.clear();
        self.last_thinking.clear();
        self.seen_tools = 0;
        self.seen_server_tools = 0;
        self.seen_results = 0;
        self.last_message_id = None;
    }

    fn handle_assistant(&mut self, obj: &Value, tx: &mpsc::UnboundedSender<AgentEvent>) {
        let msg = &obj["message"];
        let Some(content) = msg.get("content").and_then(Value::as_array) else {
            return;
        };
        if content.is_empty() {
            return;
        }

        // Content resets after tool use: each assistant turn has a unique
        // message id, and when it changes the cumulative arrays start fresh.
        if let Some(msg_id) = msg.get("id").and_then(Value::as_str) {
            if self.last_message_id.as_deref() != Some(msg_id) {
                debug!(vendor = VENDOR, msg_id, "new assistant turn");
                self.last_message_id = Some(msg_id.to_string());
                self.last_cumulative.clear();
                self.last_thinking.clear();
                self.seen_tools = 0;
                self.seen_server_tools = 0;
                self.seen_results = 0;
            }
        }

        // Thinking deltas (cumulative).
        let cumulative_thinking: String = content
            .iter()
            .filter(|p| p["type"] == "thinking")
            .filter_map(|p| p.get("thinking").and_then(Value::as_str))
            .collect();
        if !cumulative_thinking.is_empty() {
            let start = self.last_thinking.len().min(cumulative_thinking.len());
            let delta = cumulative_thinking.get(start..).unwrap_or("").to_string();
            self.last_thinking = cumulative_thinking;
            if !delta.trim().is_empty() {
                let _ = tx.send(AgentEvent::ThinkingDelta { text: delta });
            }
        }

        // Tool use badges — cumulative, only emit new ones.
        let tools: Vec<&Value> = content.iter().filter(|p| p["type"] == "tool_use").collect();
        for t in tools.iter().skip(self.seen_tools) {
            let _ = tx.send(AgentEvent::ToolBadge {
                label: t.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                detail: extract_tool_detail(t.get("input").unwrap_or(&Value::Null)),
            });
        }
        self.seen_tools = tools.len();

        // Server-side tool use (web search, code execution, MCP).
        let server_tools: Vec<&Value> = content
            .iter()
            .filter(|p| {
                matches!(
                    p.get("type").and_then(Value::as_str),
                    Some(
                        "server_tool_use"
                            | "web_search_tool_use"
                            | "code_execution_tool_use"
                            | "mcp_tool_use"
                    )
                )
            })
            .collect();
        for st in server_tools.iter().skip(self.seen_server_tools) {
            let st_type = st.get("type").and_then(Value::as_str).unwrap_or("");
            let event = match st_type {
                "web_search_tool_use" => AgentEvent::badge(
                    "Search",
                    truncate_chars(st.get("query").and_then(Value::as_str).unwrap_or(""), 80),
                ),
                "code_execution_tool_use" => AgentEvent::badge(
                    "Code",
                    st.get("language").and_then(Value::as_str).unwrap_or(""),
                ),
                "mcp_tool_use" => {
                    let name = st.get("name").and_then(Value::as_str).unwrap_or("");
                    let server = st.get("server_name").and_then(Value::as_str).unwrap_or("");
                    let label = if server.is_empty() {
                        name.to_string()
                    } else {
                        format!("{server}/{name}")
                    };
                    AgentEvent::badge("MCP", truncate_chars(&label, 80))
                }
                _ => AgentEvent::badge(
                    st.get("name").and_then(Value::as_str).unwrap_or(st_type),
                    "",
                ),
            };
            let _ = tx.send(event);
        }
        self.seen_server_tools = server_tools.len();

        // Tool results for completed calls.
        let tool_results: Vec<&Value> = content
            .iter()
            .filter(|p| {
                matches!(
                    p.get("type").and_then(Value::as_str),
                    Some(
                        "tool_result"
                            | "server_tool_result"
                            | "web_search_tool_result"
                            | "code_execution_tool_result"
                            | "mcp_tool_result"
                    )
                )
            })
            .collect();
        for tr in tool_results.iter().skip(self.seen_results) {
            let tr_type = tr.get("type").and_then(Value::as_str).unwrap_or("");
            let is_err = tr.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let output = match tr.get("content") {
                Some(Value::String(s)) => truncate_chars(s, 300).to_string(),
                Some(Value::Array(parts)) => {
                    let joined = parts
                        .iter()
                        .filter(|p| p["type"] == "text")
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .map(|t| truncate_chars(t, 100))
                        .collect::<Vec<_>>()
                        .join(" ");
                    truncate_chars(&joined, 300).to_string()
                }
                _ => String::new(),
            };
            let _ = tx.send(AgentEvent::ToolResult {
                tool_name: tr_type.replace("_result", ""),
                success: !is_err,
                output,
            });
        }
        self.seen_results = tool_results.len();

        // Text deltas (cumulative).
        let cumulative: String = content
            .iter()
            .filter(|p| p["type"] == "text")
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if !cumulative.is_empty() {
            let start = self.last_cumulative.len().min(cumulative.len());
            let delta = cumulative.get(start..).unwrap_or("").to_string();
            self.last_cumulative = cumulative;
            if !delta.is_empty() {
                let _ = tx.send(AgentEvent::TextDelta { text: delta });
            }
        }

        for p in content {
            let pt = p.get("type").and_then(Value::as_str).unwrap_or("");
            let known = matches!(
                pt,
                "text"
                    | "thinking"
                    | "tool_use"
                    | "tool_result"
                    | "server_tool_use"
                    | "server_tool_result"
                    | "web_search_tool_use"
                    | "web_search_tool_result"
                    | "code_execution_tool_use"
                    | "code_execution_tool_result"
                    | "mcp_tool_use"
                    | "mcp_tool_result"
            );
            if !pt.is_empty() && !known {
                debug!(vendor = VENDOR, block_type = pt, "unhandled content block type");
            }
        }
    }
}

#[async_trait::async_trait]
impl ProtocolAdapter for ClaudeAdapter {
    async fn send_message(&mut self, text: &str) -> Result<()> {
        info!(vendor = VENDOR, chars = text.len(), "send message");
        let payload = json!({
            "type": "user",
            "message": {"role": "user", "content": text},
        });
        self.io.write_line(&payload.to_string()).await
    }

    async fn stream_turn(&mut self, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<()> {
        self.reset_turn_state();

        while let Some(line) = self.io.read_line().await? {
            let Some(obj) = parse_json_line(VENDOR, &line) else {
                continue;
            };
            let event_type = obj.get("type").and_then(Value::as_str).unwrap_or("");

            match event_type {
                "system" => {
                    let subtype = obj.get("subtype").and_then(Value::as_str).unwrap_or("");
                    if subtype == "compact_boundary" {
                        info!(vendor = VENDOR, "context compaction boundary");
                        let _ = tx.send(AgentEvent::badge("Compacting", ""));
                    } else {
                        debug!(vendor = VENDOR, subtype, "system event");
                    }
                }
                "result" => {
                    self.session_id = obj
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let subtype = obj.get("subtype").and_then(Value::as_str).unwrap_or("success");
                    let is_error = obj.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                    if is_error || subtype != "success" {
                        warn!(
                            vendor = VENDOR,
                            subtype,
                            session_id = self.session_id.as_deref().unwrap_or(""),
                            "turn complete with error"
                        );
                    } else {
                        info!(
                            vendor = VENDOR,
                            session_id = self.session_id.as_deref().unwrap_or(""),
                            "turn complete"
                        );
                    }

                    // Permission denials surface as events BEFORE TurnComplete.
                    if let Some(denials) = obj.get("permission_denials").and_then(Value::as_array) {
                        for denial in denials {
                            let tool_name = denial
                                .get("tool_name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            let _ = tx.send(AgentEvent::PermissionRequest {
                                request_id: denial
                                    .get("tool_use_id")
                                    .and_then(Value::as_str)
                                    .unwrap_or("")
                                    .to_string(),
                                description: format!(
                                    "Claude wants to use {}",
                                    if tool_name.is_empty() { "unknown" } else { &tool_name }
                                ),
                                tool_name,
                                tool_input: denial
                                    .get("tool_input")
                                    .cloned()
                                    .unwrap_or_else(|| json!({})),
                            });
                        }
                    }

                    let _ = tx.send(AgentEvent::turn_complete(
                        obj.get("result").and_then(Value::as_str).unwrap_or(""),
                        self.session_id.clone(),
                    ));
                    return Ok(());
                }
                "assistant" => self.handle_assistant(&obj, tx),
                // Replayed user messages and partial stream events.
                "user" | "stream_event" => {}
                other => {
                    debug!(vendor = VENDOR, event_type = other, "unhandled event type");
                }
            }
        }

        warn!(vendor = VENDOR, "process ended before result event");
        Err(AgentError::Protocol(
            "claude process ended before result event".into(),
        ))
    }

    async fn cancel(&mut self) -> Result<()> {
        // Claude has no wire-level interrupt; the turn budget enforces cancellation.
        debug!(vendor = VENDOR, "cancel requested");
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn run_turn(lines: Vec<Value>) -> Vec<AgentEvent> {
        let (_client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (client_out, mut server_out) = tokio::io::duplex(64 * 1024);

        let mut adapter = ClaudeAdapter::new(ProcessIo::new(
            Box::new(server_in),
            Box::new(client_out),
        ));
        let feeder = tokio::spawn(async move {
            for line in lines {
                let mut bytes = line.to_string().into_bytes();
                bytes.push(b'\n');
                server_out.write_all(&bytes).await.unwrap();
            }
            drop(server_out);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        feeder.await.unwrap();

        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn assistant(msg_id: &str, content: Value) -> Value {
        json!({"type": "assistant", "message": {"id": msg_id, "content": content}})
    }

    #[tokio::test]
    async fn cumulative_text_is_emitted_as_suffix_deltas() {
        let events = run_turn(vec![
            assistant("m1", json!([{"type": "text", "text": "Hello"}])),
            assistant("m1", json!([{"type": "text", "text": "Hello world"}])),
            json!({"type": "result", "result": "Hello world", "session_id": "s1"}),
        ])
        .await;

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hello", " world"]);

        // Round-trip: concatenated deltas equal the final cumulative text.
        assert_eq!(deltas.concat(), "Hello world");
        match events.last().unwrap() {
            AgentEvent::TurnComplete { text, session_id, success, .. } => {
                assert_eq!(text, "Hello world");
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert!(success);
            }
            other => panic!("expected TurnComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_id_change_resets_cumulative_state() {
        let events = run_turn(vec![
            assistant("m1", json!([{"type": "text", "text": "first"}])),
            assistant("m2", json!([{"type": "text", "text": "second"}])),
            json!({"type": "result", "result": "second"}),
        ])
        .await;

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn repeated_tool_use_blocks_emit_one_badge() {
        let tool = json!({"type": "tool_use", "name": "Bash", "input": {"command": "ls"}});
        let events = run_turn(vec![
            assistant("m1", json!([tool])),
            assistant("m1", json!([tool, {"type": "text", "text": "done"}])),
            json!({"type": "result", "result": "done"}),
        ])
        .await;

        let badges: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolBadge { .. }))
            .collect();
        assert_eq!(badges.len(), 1);
        match badges[0] {
            AgentEvent::ToolBadge { label, detail } => {
                assert_eq!(label, "Bash");
                assert_eq!(detail, "ls");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn permission_denials_precede_turn_complete() {
        let events = run_turn(vec![json!({
            "type": "result",
            "result": "blocked",
            "session_id": "s9",
            "permission_denials": [
                {"tool_use_id": "tu1", "tool_name": "Write", "tool_input": {"file_path": "/x"}}
            ]
        })])
        .await;

        assert!(matches!(
            events[0],
            AgentEvent::PermissionRequest { ref request_id, ref tool_name, .. }
                if request_id == "tu1" && tool_name == "Write"
        ));
        assert!(matches!(events[1], AgentEvent::TurnComplete { .. }));
    }

    #[tokio::test]
    async fn eof_before_result_is_a_protocol_error() {
        let (_client_in, server_in) = tokio::io::duplex(1024);
        let (client_out, server_out) = tokio::io::duplex(1024);
        drop(server_out);

        let mut adapter = ClaudeAdapter::new(ProcessIo::new(
            Box::new(server_in),
            Box::new(client_out),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = adapter.stream_turn(&tx).await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[tokio::test]
    async fn compact_boundary_emits_badge_and_bad_json_is_skipped() {
        let (_client_in, server_in) = tokio::io::duplex(4096);
        let (client_out, mut server_out) = tokio::io::duplex(4096);
        let mut adapter = ClaudeAdapter::new(ProcessIo::new(
            Box::new(server_in),
            Box::new(client_out),
        ));
        tokio::spawn(async move {
            server_out.write_all(b"not json at all\n").await.unwrap();
            server_out
                .write_all(b"{\"type\":\"system\",\"subtype\":\"compact_boundary\"}\n")
                .await
                .unwrap();
            server_out
                .write_all(b"{\"type\":\"result\",\"result\":\"ok\"}\n")
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.stream_turn(&tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(
            &events[0],
            AgentEvent::ToolBadge { label, .. } if label == "Compacting"
        ));
    }
}
