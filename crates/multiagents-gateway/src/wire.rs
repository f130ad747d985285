//! JSON encoding of chat events for WebSocket transport and the event store.

use chrono::Utc;
use serde_json::{json, Value};

use multiagents_room::ChatEvent;

fn ts() -> String {
    Utc::now().to_rfc3339()
}

/// Encode a chat event as its wire object. The `type` discriminator set here
/// is the exhaustive server->client vocabulary.
pub fn event_to_json(event: &ChatEvent) -> Value {
    match event {
        ChatEvent::RoundStarted {
            round_number,
            agents,
        } => json!({"type": "round_started", "round": round_number, "agents": agents}),

        ChatEvent::AgentStreamChunk {
            agent_name,
            round_number,
            text,
        } => json!({"type": "agent_stream", "agent": agent_name, "round": round_number, "chunk": text}),

        ChatEvent::AgentStderr {
            agent_name,
            round_number,
            text,
        } => json!({"type": "agent_stderr", "agent": agent_name, "round": round_number, "text": text}),

        ChatEvent::AgentNotice {
            agent_name,
            message,
        } => json!({
            "type": "agent_notice", "agent": agent_name, "message": message,
            "created_at": ts(),
        }),

        ChatEvent::AgentCompleted {
            agent_name,
            round_number,
            response,
            passed,
            stopped,
        } => json!({
            "type": "agent_completed",
            "agent": agent_name,
            "round": round_number,
            "text": response.response,
            "passed": passed,
            "success": response.success,
            "latency_ms": response.latency_ms,
            "stopped": stopped,
            "created_at": ts(),
        }),

        ChatEvent::RoundEnded {
            round_number,
            all_passed,
        } => json!({"type": "round_ended", "round": round_number, "all_passed": all_passed}),

        ChatEvent::RoundPaused { round_number } => {
            json!({"type": "paused", "round": round_number})
        }

        ChatEvent::DiscussionEnded { reason } => {
            json!({"type": "discussion_ended", "reason": reason})
        }

        ChatEvent::UserMessageReceived { text } => {
            json!({"type": "user_message", "text": text, "created_at": ts()})
        }

        ChatEvent::AgentInterrupted {
            agent_name,
            round_number,
            partial_text,
        } => json!({
            "type": "agent_interrupted", "agent": agent_name, "round": round_number,
            "partial_text": partial_text, "created_at": ts(),
        }),

        ChatEvent::AgentPromptAssembled {
            agent_name,
            round_number,
            sections,
        } => json!({"type": "agent_prompt", "agent": agent_name, "round": round_number, "sections": sections}),

        ChatEvent::AgentDeliveryAcked {
            delivery_id,
            recipient,
            sender,
            round_number,
        } => json!({
            "type": "delivery_acked",
            "delivery_id": delivery_id,
            "recipient": recipient,
            "sender": sender,
            "round": round_number,
            "created_at": ts(),
        }),

        ChatEvent::AgentPermissionRequested {
            agent_name,
            round_number,
            request_id,
            tool_name,
            tool_input,
            description,
        } => json!({
            "type": "permission_request", "agent": agent_name, "round": round_number,
            "request_id": request_id, "tool_name": tool_name, "tool_input": tool_input,
            "description": description, "created_at": ts(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiagents_agent::AgentResponse;

    #[test]
    fn completed_event_carries_both_pass_and_success() {
        let event = ChatEvent::AgentCompleted {
            agent_name: "claude".into(),
            round_number: 2,
            response: AgentResponse {
                agent: "claude".into(),
                response: "Timeout".into(),
                success: false,
                latency_ms: 12.0,
                session_id: None,
                stderr: None,
            },
            passed: false,
            stopped: true,
        };
        let wire = event_to_json(&event);
        assert_eq!(wire["type"], "agent_completed");
        assert_eq!(wire["agent"], "claude");
        assert_eq!(wire["round"], 2);
        assert_eq!(wire["text"], "Timeout");
        assert_eq!(wire["passed"], false);
        assert_eq!(wire["success"], false);
        assert_eq!(wire["stopped"], true);
        assert!(wire["created_at"].is_string());
    }

    #[test]
    fn delivery_ack_includes_round_and_parties() {
        let event = ChatEvent::AgentDeliveryAcked {
            delivery_id: "d42".into(),
            recipient: "codex".into(),
            sender: "claude".into(),
            round_number: Some(3),
        };
        let wire = event_to_json(&event);
        assert_eq!(wire["type"], "delivery_acked");
        assert_eq!(wire["delivery_id"], "d42");
        assert_eq!(wire["recipient"], "codex");
        assert_eq!(wire["sender"], "claude");
        assert_eq!(wire["round"], 3);
    }

    #[test]
    fn permission_request_keeps_tool_input_verbatim() {
        let event = ChatEvent::AgentPermissionRequested {
            agent_name: "claude".into(),
            round_number: 1,
            request_id: "req-42".into(),
            tool_name: "Write".into(),
            tool_input: json!({"file_path": "/tmp/test.txt"}),
            description: "Claude wants to use Write".into(),
        };
        let wire = event_to_json(&event);
        assert_eq!(wire["type"], "permission_request");
        assert_eq!(wire["request_id"], "req-42");
        assert_eq!(wire["tool_input"]["file_path"], "/tmp/test.txt");
    }

    #[test]
    fn paused_and_round_events_use_short_shapes() {
        let wire = event_to_json(&ChatEvent::RoundPaused { round_number: 4 });
        assert_eq!(wire, json!({"type": "paused", "round": 4}));

        let wire = event_to_json(&ChatEvent::RoundEnded {
            round_number: 4,
            all_passed: true,
        });
        assert_eq!(wire, json!({"type": "round_ended", "round": 4, "all_passed": true}));
    }
}
