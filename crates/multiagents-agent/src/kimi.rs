//! Kimi JSON-RPC wire protocol adapter.
//!
//! Wire format (wire mode, protocol 1.2):
//!   Send: JSON-RPC 2.0 requests (initialize, prompt, cancel)
//!   Recv: JSON-RPC 2.0 notifications wrapped as event/request:
//!     Events:   TurnBegin, TurnEnd, StepBegin, StepInterrupted,
//!               CompactionBegin, CompactionEnd, StatusUpdate,
//!               ContentPart, ToolCall, ToolCallPart, ToolResult,
//!               ApprovalResponse, SubagentEvent
//!     Requests: ApprovalRequest, ToolCallRequest (must respond)
//!     ContentPart types: text, think/thinking, tool_call/toolcall,
//!                        image_url, audio_url, video_url

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use multiagents_core::PermissionMode;

use crate::adapter::{ProcessIo, ProtocolAdapter};
use crate::error::{AgentError, Result};
use crate::event::AgentEvent;
use crate::labels::{extract_tool_detail, truncate_chars};
use crate::permission::PermissionBridge;

const VENDOR: &str = "kimi";
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]|\x1b\].*?\x07").unwrap());

fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Adapter for the Kimi CLI in `--wire` mode (full JSON-RPC 2.0).
pub struct KimiAdapter {
    io: ProcessIo,
    id_counter: u64,
    last_prompt_id: Option<String>,
    initialized: bool,
    session_id: Option<String>,
    permission_mode: PermissionMode,
    permission_timeout: Duration,
    permissions: Arc<PermissionBridge>,
}

impl KimiAdapter {
    pub fn new(io: ProcessIo, permission_mode: PermissionMode, permission_timeout: Duration) -> Self {
        Self {
            io,
            id_counter: 0,
            last_prompt_id: None,
            initialized: false,
            session_id: None,
            permission_mode,
            permission_timeout,
            permissions: Arc::new(PermissionBridge::new()),
        }
    }

    /// Share an externally-owned bridge so permission decisions can be
    /// routed in while a turn stream is in flight.
    pub fn with_permissions(mut self, bridge: Arc<PermissionBridge>) -> Self {
        self.permissions = bridge;
        self
    }

    fn next_id(&mut self) -> String {
        self.id_counter += 1;
        self.id_counter.to_string()
    }

    async fn send_rpc(&mut self, method: &str, params: Option<Value>) -> Result<String> {
        let req_id = self.next_id();
        let mut msg = json!({"jsonrpc": "2.0", "id": req_id, "method": method});
        if let Some(params) = params {
            msg["params"] = params;
        }
        self.io.write_line(&msg.to_string()).await?;
        Ok(req_id)
    }

    async fn send_response(&mut self, req_id: &Value, result: Value) -> Result<()> {
        let msg = json!({"jsonrpc": "2.0", "id": req_id, "result": result});
        self.io.write_line(&msg.to_string()).await
    }

    async fn read_json_line(&mut self) -> Result<Option<Value>> {
        let Some(raw) = self.io.read_line().await? else {
            return Ok(None);
        };
        let line = strip_ansi(&raw);
        match serde_json::from_str(&line) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                debug!(
                    vendor = VENDOR,
                    line = truncate_chars(&line, 200),
                    "json parse failed"
                );
                Ok(Some(Value::Null))
            }
        }
    }

    async fn wait_for_response(&mut self, expected_id: &str) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + INIT_TIMEOUT;
        loop {
            let obj = match tokio::time::timeout_at(deadline, self.read_json_line()).await {
                Err(_) => return Ok(None),
                Ok(read) => read?,
            };
            let Some(obj) = obj else {
                return Ok(None);
            };
            if obj.is_null() {
                continue;
            }
            let id_matches = obj
                .get("id")
                .map(|id| json_id_str(id) == expected_id)
                .unwrap_or(false);
            if id_matches && (obj.get("result").is_some() || obj.get("error").is_some()) {
                return Ok(Some(obj));
            }
        }
    }

    /// Answer a wire `request` notification. Unanswered requests can block
    /// the turn forever, so every type gets some response.
    async fn handle_request(
        &mut self,
        obj: &Value,
        params: &Value,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let Some(req_id) = obj.get("id") else {
            return Ok(());
        };
        let req_id = req_id.clone();
        let req_type = params.get("type").and_then(Value::as_str).unwrap_or("");
        let payload = params
            .get("payload")
            .filter(|p| p.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));

        match req_type {
            "ApprovalRequest" => {
                let response_id = payload
                    .get("id")
                    .or_else(|| payload.get("request_id"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                if self.permission_mode == PermissionMode::Bypass {
                    self.send_response(&req_id, json!({"request_id": response_id, "response": "approve"}))
                        .await?;
                    info!(vendor = VENDOR, request_id = %response_id, "auto-approved request");
                    let _ = tx.send(AgentEvent::badge("Approved", ""));
                    return Ok(());
                }

                // Register the slot BEFORE emitting the event so a fast
                // respond_to_permission() call doesn't race and get dropped.
                let rx = self.permissions.register(&response_id);
                let _ = tx.send(AgentEvent::PermissionRequest {
                    request_id: response_id.clone(),
                    tool_name: payload
                        .get("action")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    tool_input: payload.clone(),
                    description: payload
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                });

                let decision = if self.permission_timeout > Duration::ZERO {
                    match tokio::time::timeout(self.permission_timeout, rx).await {
                        Ok(Ok(response)) if response.approved => "approve",
                        Ok(_) => "reject",
                        Err(_) => {
                            // Fail-closed: deny on timeout.
                            self.permissions.forget(&response_id);
                            warn!(vendor = VENDOR, request_id = %response_id, "permission timed out, denying");
                            "reject"
                        }
                    }
                } else {
                    match rx.await {
                        Ok(response) if response.approved => "approve",
                        _ => "reject",
                    }
                };

                self.send_response(&req_id, json!({"request_id": response_id, "response": decision}))
                    .await?;
                let label = if decision == "approve" { "Approved" } else { "Denied" };
                info!(vendor = VENDOR, request_id = %response_id, decision, "permission resolved");
                let _ = tx.send(AgentEvent::badge(label, ""));
            }
            "ToolCallRequest" => {
                let tool_call_id = payload
                    .get("id")
                    .or_else(|| payload.get("tool_call_id"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.send_response(
                    &req_id,
                    json!({
                        "tool_call_id": tool_call_id,
                        "return_value": {
                            "is_error": true,
                            "output": "",
                            "message": "external tool bridge not configured",
                            "display": [],
                        },
                    }),
                )
                .await?;
                info!(vendor = VENDOR, tool_call_id = %tool_call_id, "rejected external tool request");
            }
            other => {
                self.send_response(&req_id, json!({"ok": true})).await?;
                info!(vendor = VENDOR, request_type = other, "acknowledged request");
            }
        }
        Ok(())
    }
}

/// Render a JSON-RPC id for comparison (kimi echoes string ids back).
fn json_id_str(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn content_part_tool_badge(part: &Value, tx: &mpsc::UnboundedSender<AgentEvent>) {
    let fn_obj = part.get("function").cloned().unwrap_or_else(|| json!({}));
    let name = fn_obj.get("name").and_then(Value::as_str).unwrap_or("");
    let args: Value = fn_obj
        .get("arguments")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| json!({}));
    let _ = tx.send(AgentEvent::ToolBadge {
        label: name.to_string(),
        detail: extract_tool_detail(&args),
    });
}

/// Pull result text from a TurnEnd-like payload (`result` may be a string or
/// an object with `text`/`content`).
fn result_text(result: Option<&Value>) -> String {
    match result {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .or_else(|| map.get("content").and_then(Value::as_str))
            .unwrap_or("")
            .to_string(),
        _ => String::new(),
    }
}

#[async_trait::async_trait]
impl ProtocolAdapter for KimiAdapter {
    async fn start(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let req_id = self
            .send_rpc(
                "initialize",
                Some(json!({
                    "protocol_version": "1.2",
                    "client": {"name": "multiagents", "version": "1.0.0"},
                })),
            )
            .await?;
        let Some(resp) = self.wait_for_response(&req_id).await? else {
            return Err(AgentError::Handshake("kimi initialize timed out".into()));
        };
        if let Some(err) = resp.get("error") {
            return Err(AgentError::Handshake(format!("kimi initialize error: {err}")));
        }
        self.initialized = true;
        info!(vendor = VENDOR, "initialized wire protocol");
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        if !self.initialized {
            self.start().await?;
        }
        info!(vendor = VENDOR, chars = text.len(), "send prompt");
        let id = self.send_rpc("prompt", Some(json!({"user_input": text}))).await?;
        self.last_prompt_id = Some(id);
        Ok(())
    }

    async fn stream_turn(&mut self, tx: &mpsc::UnboundedSender<AgentEvent>) -> Result<()> {
        let mut streamed_text = String::new();
        let mut rpc_error: Option<Value> = None;
        let mut line_count: u64 = 0;
        let mut text_events: u64 = 0;
        let mut thinking_events: u64 = 0;
        let mut tool_events: u64 = 0;

        while let Some(obj) = self.read_json_line().await? {
            if obj.is_null() {
                continue;
            }
            line_count += 1;

            let mut method_norm = obj
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            let mut params = obj.get("params").cloned().unwrap_or_else(|| json!({}));

            // Wire protocol wrapper: event notifications carry typed payloads.
            if method_norm == "event" && params.is_object() {
                method_norm = params
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_lowercase();
                params = params.get("payload").cloned().unwrap_or_else(|| json!({}));
            }

            // Wire protocol request: must respond or the turn blocks forever.
            if method_norm == "request" && params.is_object() {
                self.handle_request(&obj, &params, tx).await?;
                continue;
            }

            match method_norm.as_str() {
                "turnbegin" | "turn_begin" | "turn/begin" => {
                    debug!(vendor = VENDOR, "turn begin");
                    continue;
                }
                "stepbegin" | "step_begin" | "step/begin" => {
                    let step_n = params.get("n").map(json_id_str).unwrap_or_default();
                    debug!(vendor = VENDOR, step = %step_n, "step begin");
                    if !step_n.is_empty() {
                        let _ = tx.send(AgentEvent::badge("Step", step_n));
                    }
                    continue;
                }
                "stepinterrupted" | "step_interrupted" | "step/interrupted" => {
                    info!(vendor = VENDOR, "step interrupted");
                    let _ = tx.send(AgentEvent::badge("Interrupted", ""));
                    continue;
                }
                "compactionbegin" | "compaction_begin" | "compaction/begin" => {
                    info!(vendor = VENDOR, "context compaction started");
                    let _ = tx.send(AgentEvent::badge("Compacting", ""));
                    continue;
                }
                "compactionend" | "compaction_end" | "compaction/end" => {
                    info!(vendor = VENDOR, "context compaction ended");
                    let _ = tx.send(AgentEvent::badge("Compacted", "done"));
                    continue;
                }
                "statusupdate" | "status_update" | "status/update" => {
                    if let Some(usage) = params.get("context_usage").and_then(Value::as_f64) {
                        debug!(vendor = VENDOR, context_usage = usage, "status update");
                    }
                    continue;
                }
                "toolcall" | "tool_call" | "tool/call" => {
                    tool_events += 1;
                    content_part_tool_badge(&params, tx);
                    continue;
                }
                "toolcallpart" | "tool_call_part" | "tool/call/part" => {
                    let args_delta = params
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if !args_delta.is_empty() {
                        let _ = tx.send(AgentEvent::ToolOutput {
                            tool_name: "args".into(),
                            text: truncate_chars(args_delta, 500).into(),
                        });
                    }
                    continue;
                }
                "toolresult" | "tool_result" | "tool/result" => {
                    let ret = params.get("return_value").cloned().unwrap_or_else(|| json!({}));
                    let is_err = ret.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                    let output = match ret.get("output") {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) if !other.is_null() => other.to_string(),
                        _ => String::new(),
                    };
                    let tool_id = params
                        .get("tool_call_id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    if is_err {
                        debug!(vendor = VENDOR, tool_call_id = %tool_id, "tool result error");
                    }
                    let _ = tx.send(AgentEvent::ToolResult {
                        tool_name: tool_id,
                        success: !is_err,
                        output: truncate_chars(&output, 300).into(),
                    });
                    continue;
                }
                "approvalresponse" | "approval_response" | "approval/response" => {
                    debug!(
                        vendor = VENDOR,
                        response = params.get("response").and_then(|v| v.as_str()).unwrap_or(""),
                        "approval response"
                    );
                    continue;
                }
                "subagentevent" | "subagent_event" | "subagent/event" => {
                    let sub_type = params
                        .get("event")
                        .and_then(|e| e.get("type"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let _ = tx.send(AgentEvent::badge("Subagent", truncate_chars(sub_type, 40)));
                    continue;
                }
                "contentpart" | "content_part" | "content/part" => {
                    let part = params.get("part").cloned().unwrap_or(params);
                    let part_type = part
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_lowercase();
                    match part_type.as_str() {
                        "text" => {
                            let raw = part
                                .get("text")
                                .and_then(Value::as_str)
                                .filter(|t| !t.is_empty())
                                .or_else(|| part.get("delta").and_then(Value::as_str))
                                .unwrap_or("");
                            let text = strip_ansi(raw);
                            if !text.is_empty() {
                                streamed_text.push_str(&text);
                                text_events += 1;
                                let _ = tx.send(AgentEvent::TextDelta { text });
                            }
                        }
                        "think" | "thinking" => {
                            let text = part
                                .get("think")
                                .and_then(Value::as_str)
                                .filter(|t| !t.is_empty())
                                .or_else(|| part.get("thinking").and_then(Value::as_str))
                                .unwrap_or("");
                            if !text.is_empty() {
                                thinking_events += 1;
                                let _ = tx.send(AgentEvent::ThinkingDelta { text: text.into() });
                            }
                        }
                        t if t == "tool_call" || t == "toolcall" || part.get("function").is_some() => {
                            tool_events += 1;
                            content_part_tool_badge(&part, tx);
                        }
                        "image_url" | "audio_url" | "video_url" => {
                            debug!(vendor = VENDOR, part_type = %part_type, "media content part");
                        }
                        "" => {}
                        other => {
                            debug!(vendor = VENDOR, part_type = other, "unhandled content part type");
                        }
                    }
                    continue;
                }
                // TurnEnd has no fields per wire spec 1.2, but some builds
                // attach a result and/or session id.
                "turnend" | "turn/end" | "turn_completed" | "turncompleted" => {
                    let text = result_text(params.get("result"));
                    // Only update the session id if present; never overwrite
                    // a known id with nothing.
                    let sid = params
                        .get("session_id")
                        .or_else(|| params.get("sessionId"))
                        .and_then(Value::as_str);
                    if let Some(sid) = sid {
                        self.session_id = Some(sid.to_string());
                    }
                    info!(
                        vendor = VENDOR,
                        method = %method_norm,
                        lines = line_count,
                        text_events,
                        thinking_events,
                        tool_events,
                        session_id = self.session_id.as_deref().unwrap_or(""),
                        "turn complete"
                    );
                    let _ = tx.send(AgentEvent::turn_complete(text, self.session_id.clone()));
                    return Ok(());
                }
                _ => {}
            }

            // JSON-RPC response to one of our requests — may carry the
            // session id, and the prompt response ends the turn.
            if obj.get("id").is_some() && obj.get("result").is_some() {
                let result = &obj["result"];
                if let Some(sid) = result.get("session_id").and_then(Value::as_str) {
                    self.session_id = Some(sid.to_string());
                }
                if let Some(sid) = result.get("sessionId").and_then(Value::as_str) {
                    self.session_id = Some(sid.to_string());
                }
                let is_prompt_response = self
                    .last_prompt_id
                    .as_deref()
                    .map(|expected| json_id_str(&obj["id"]) == expected)
                    .unwrap_or(false);
                if is_prompt_response {
                    info!(
                        vendor = VENDOR,
                        status = result.get("status").and_then(|v| v.as_str()).unwrap_or(""),
                        lines = line_count,
                        text_events,
                        session_id = self.session_id.as_deref().unwrap_or(""),
                        "prompt completed via RPC result"
                    );
                    let _ = tx.send(AgentEvent::turn_complete(
                        streamed_text.clone(),
                        self.session_id.clone(),
                    ));
                    return Ok(());
                }
                continue;
            }
            if obj.get("id").is_some() && obj.get("error").is_some() {
                let err = obj["error"].clone();
                let err_is_prompt = match self.last_prompt_id.as_deref() {
                    None => true,
                    Some(expected) => json_id_str(&obj["id"]) == expected,
                };
                if err_is_prompt {
                    return Err(AgentError::Rpc(format!("kimi prompt RPC error: {err}")));
                }
                rpc_error = Some(err);
                continue;
            }

            // Fallback: some kimi builds emit stream-json style assistant
            // objects outside the event wrapper.
            if obj.get("type").and_then(Value::as_str) == Some("text") {
                let text = strip_ansi(obj.get("text").and_then(Value::as_str).unwrap_or(""));
                if !text.is_empty() {
                    streamed_text.push_str(&text);
                    text_events += 1;
                    let _ = tx.send(AgentEvent::TextDelta { text });
                }
                continue;
            }

            if obj.get("role").and_then(Value::as_str) == Some("assistant") {
                let parts = obj.get("content").and_then(Value::as_array).cloned().unwrap_or_default();
                for part in &parts {
                    if !part.is_object() {
                        continue;
                    }
                    let ptype = part
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_lowercase();
                    match ptype.as_str() {
                        "text" => {
                            let text =
                                strip_ansi(part.get("text").and_then(Value::as_str).unwrap_or(""));
                            if !text.is_empty() {
                                streamed_text.push_str(&text);
                                text_events += 1;
                                let _ = tx.send(AgentEvent::TextDelta { text });
                            }
                        }
                        "think" | "thinking" => {
                            let thinking = part
                                .get("think")
                                .and_then(Value::as_str)
                                .filter(|t| !t.is_empty())
                                .or_else(|| part.get("thinking").and_then(Value::as_str))
                                .unwrap_or("");
                            if !thinking.is_empty() {
                                thinking_events += 1;
                                let _ = tx.send(AgentEvent::ThinkingDelta { text: thinking.into() });
                            }
                        }
                        "tool_call" | "toolcall" => {
                            tool_events += 1;
                            content_part_tool_badge(part, tx);
                        }
                        _ => {}
                    }
                }
                continue;
            }

            let event_type = obj
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if matches!(event_type.as_str(), "turnend" | "turn_end" | "done" | "result") {
                let text = result_text(obj.get("result"));
                if let Some(sid) = obj
                    .get("session_id")
                    .or_else(|| obj.get("sessionId"))
                    .and_then(Value::as_str)
                {
                    self.session_id = Some(sid.to_string());
                }
                info!(
                    vendor = VENDOR,
                    event_type = %event_type,
                    lines = line_count,
                    text_events,
                    thinking_events,
                    tool_events,
                    session_id = self.session_id.as_deref().unwrap_or(""),
                    "turn complete"
                );
                let _ = tx.send(AgentEvent::turn_complete(text, self.session_id.clone()));
                return Ok(());
            }

            if !method_norm.is_empty() || !event_type.is_empty() {
                debug!(
                    vendor = VENDOR,
                    method = %method_norm,
                    event_type = %event_type,
                    "unhandled event"
                );
            }
        }

        if let Some(err) = rpc_error {
            warn!(
                vendor = VENDOR,
                lines = line_count,
                text_events,
                error = %err,
                "rpc error at stream end"
            );
            return Err(AgentError::Rpc(format!("kimi RPC error: {err}")));
        }
        if !streamed_text.is_empty() {
            // Some kimi builds end the stdout stream without an explicit
            // TurnEnd event; complete the turn from streamed text.
            warn!(
                vendor = VENDOR,
                lines = line_count,
                text_events,
                "eof without completion marker; using streamed text"
            );
            let _ = tx.send(AgentEvent::turn_complete(streamed_text, self.session_id.clone()));
            return Ok(());
        }

        error!(vendor = VENDOR, lines = line_count, "eof before completion and no text");
        Err(AgentError::Protocol("kimi process ended before TurnEnd".into()))
    }

    async fn cancel(&mut self) -> Result<()> {
        if let Err(e) = self.send_rpc("cancel", None).await {
            debug!(vendor = VENDOR, error = %e, "cancel send failed");
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn permission_bridge(&self) -> Option<Arc<PermissionBridge>> {
        Some(self.permissions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn feed(out: &mut tokio::io::DuplexStream, obj: Value) {
        let mut bytes = obj.to_string().into_bytes();
        bytes.push(b'\n');
        out.write_all(&bytes).await.unwrap();
    }

    fn adapter(
        mode: PermissionMode,
        permission_timeout: Duration,
    ) -> (
        KimiAdapter,
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
    ) {
        let (client_in, server_in) = tokio::io::duplex(64 * 1024);
        let (client_out, server_out) = tokio::io::duplex(64 * 1024);
        let adapter = KimiAdapter::new(
            ProcessIo::new(Box::new(server_in), Box::new(client_out)),
            mode,
            permission_timeout,
        );
        (adapter, client_in, server_out)
    }

    #[tokio::test]
    async fn initialize_prompt_and_auto_approval() {
        let (mut kimi, client_in, server_out) = adapter(PermissionMode::Bypass, Duration::from_secs(120));
        let server_out = std::sync::Arc::new(tokio::sync::Mutex::new(server_out));

        // Echo-driver: answers initialize, then scripts a full prompt turn.
        let driver_out = server_out.clone();
        let driver = tokio::spawn(async move {
            let mut lines = BufReader::new(client_in).lines();
            let mut outbound: Vec<Value> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let obj: Value = serde_json::from_str(&line).unwrap();
                outbound.push(obj.clone());
                let method = obj.get("method").and_then(Value::as_str);
                match method {
                    Some("initialize") => {
                        let mut out = driver_out.lock().await;
                        feed(&mut out, json!({"jsonrpc": "2.0", "id": obj["id"],
                                              "result": {"protocol_version": "1.2"}}))
                            .await;
                    }
                    Some("prompt") => {
                        let mut out = driver_out.lock().await;
                        feed(&mut out, json!({"jsonrpc": "2.0", "id": "req-1",
                                              "method": "request",
                                              "params": {"type": "ApprovalRequest",
                                                         "payload": {"id": "apr-1"}}}))
                            .await;
                        feed(&mut out, json!({"jsonrpc": "2.0", "method": "event",
                                              "params": {"type": "ContentPart",
                                                         "payload": {"type": "text", "text": "Hi"}}}))
                            .await;
                        feed(&mut out, json!({"jsonrpc": "2.0", "id": obj["id"],
                                              "result": {"status": "finished", "sessionId": "sid-1"}}))
                            .await;
                    }
                    None => {
                        // Responses from the adapter (approval) — collect only.
                    }
                    _ => {}
                }
                if outbound
                    .iter()
                    .any(|o| o.get("id").map(json_id_str) == Some("req-1".into()) && o.get("result").is_some())
                {
                    break;
                }
            }
            outbound
        });

        kimi.send_message("hello").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        kimi.stream_turn(&tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        let text: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, vec!["Hi"]);
        match events.last().unwrap() {
            AgentEvent::TurnComplete { text, session_id, .. } => {
                assert_eq!(text, "Hi");
                assert_eq!(session_id.as_deref(), Some("sid-1"));
            }
            other => panic!("expected TurnComplete, got {other:?}"),
        }

        let outbound = driver.await.unwrap();
        let methods: Vec<_> = outbound
            .iter()
            .filter_map(|o| o.get("method").and_then(Value::as_str))
            .collect();
        assert_eq!(&methods[..2], &["initialize", "prompt"]);
        let approval = outbound
            .iter()
            .find(|o| o.get("id").map(json_id_str) == Some("req-1".into()) && o.get("result").is_some())
            .expect("approval response sent");
        assert_eq!(approval["result"]["response"], "approve");
    }

    #[tokio::test]
    async fn manual_permission_denies_on_timeout() {
        let (mut kimi, client_in, mut server_out) =
            adapter(PermissionMode::Manual, Duration::from_millis(300));
        kimi.initialized = true;
        kimi.last_prompt_id = Some("1".into());

        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "id": "req-9", "method": "request",
                   "params": {"type": "ApprovalRequest",
                              "payload": {"id": "apr-9", "action": "WriteFile"}}}),
        )
        .await;
        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "method": "event",
                   "params": {"type": "TurnEnd", "payload": {}}}),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = std::time::Instant::now();
        kimi.stream_turn(&tx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "no TurnComplete hang");
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::PermissionRequest { request_id, .. } if request_id == "apr-9"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolBadge { label, .. } if label == "Denied"
        )));

        // The wire saw a reject for the request.
        let mut lines = BufReader::new(client_in).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let obj: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json_id_str(&obj["id"]), "req-9");
        assert_eq!(obj["result"]["response"], "reject");
    }

    #[tokio::test]
    async fn eof_with_streamed_text_synthesizes_completion() {
        let (mut kimi, _client_in, mut server_out) =
            adapter(PermissionMode::Bypass, Duration::from_secs(120));
        kimi.initialized = true;
        kimi.last_prompt_id = Some("1".into());

        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "method": "event",
                   "params": {"type": "ContentPart",
                              "payload": {"type": "text", "text": "partial "}}}),
        )
        .await;
        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "method": "event",
                   "params": {"type": "ContentPart",
                              "payload": {"type": "text", "text": "answer"}}}),
        )
        .await;
        drop(server_out);

        let (tx, mut rx) = mpsc::unbounded_channel();
        kimi.stream_turn(&tx).await.unwrap();
        drop(tx);

        let mut last = None;
        while let Some(ev) = rx.recv().await {
            last = Some(ev);
        }
        match last.unwrap() {
            AgentEvent::TurnComplete { text, .. } => assert_eq!(text, "partial answer"),
            other => panic!("expected TurnComplete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn prompt_rpc_error_raises() {
        let (mut kimi, _client_in, mut server_out) =
            adapter(PermissionMode::Bypass, Duration::from_secs(120));
        kimi.initialized = true;
        kimi.last_prompt_id = Some("1".into());

        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "id": "1",
                   "error": {"code": -32000, "message": "model overloaded"}}),
        )
        .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = kimi.stream_turn(&tx).await.unwrap_err();
        assert!(matches!(err, AgentError::Rpc(_)));
    }

    #[tokio::test]
    async fn ansi_escapes_are_stripped_from_text() {
        let (mut kimi, _client_in, mut server_out) =
            adapter(PermissionMode::Bypass, Duration::from_secs(120));
        kimi.initialized = true;
        kimi.last_prompt_id = Some("1".into());

        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "method": "event",
                   "params": {"type": "ContentPart",
                              "payload": {"type": "text",
                                          "text": "\u{1b}[31mred\u{1b}[0m text"}}}),
        )
        .await;
        feed(
            &mut server_out,
            json!({"jsonrpc": "2.0", "id": "1", "result": {"status": "finished"}}),
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        kimi.stream_turn(&tx).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        match first {
            AgentEvent::TextDelta { text } => assert_eq!(text, "red text"),
            other => panic!("expected TextDelta, got {other:?}"),
        }
    }
}
