//! Client message validation: type vocabulary and required fields.

use serde_json::Value;

const VALID_MSG_TYPES: &[&str] = &[
    "create_session",
    "join_session",
    "message",
    "stop_agent",
    "stop_round",
    "resume",
    "direct_message",
    "add_agent",
    "remove_agent",
    "cancel",
    "ack",
    "permission_response",
    "card_create",
    "card_update",
    "card_start",
    "card_delegate",
    "card_done",
    "card_delete",
];

fn required_fields(msg_type: &str) -> &'static [&'static str] {
    match msg_type {
        "join_session" => &["session_id"],
        "message" => &["text"],
        "stop_agent" => &["agent"],
        "direct_message" => &["agent", "text"],
        "add_agent" => &["name", "agent_type"],
        "remove_agent" => &["name"],
        "ack" => &["event_id"],
        "permission_response" => &["request_id", "approved"],
        "card_create" => &["title"],
        "card_update" => &["card_id"],
        "card_start" => &["card_id"],
        "card_delegate" => &["card_id"],
        "card_done" => &["card_id"],
        "card_delete" => &["card_id"],
        _ => &[],
    }
}

/// Validate an inbound client message; `None` means acceptable.
pub fn validate(msg: &Value) -> Option<String> {
    let Some(msg_type) = msg.get("type").and_then(Value::as_str) else {
        return Some("Missing message type".to_string());
    };
    if !VALID_MSG_TYPES.contains(&msg_type) {
        return Some(format!("Unknown message type: {msg_type}"));
    }
    for field in required_fields(msg_type) {
        let present = msg.get(*field).map(|v| !v.is_null()).unwrap_or(false);
        if !present {
            return Some(format!("Missing required field '{field}' for {msg_type}"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_types_are_rejected() {
        assert!(validate(&json!({"type": "frobnicate"})).is_some());
        assert!(validate(&json!({"no_type": true})).is_some());
    }

    #[test]
    fn required_fields_are_enforced() {
        assert!(validate(&json!({"type": "message"})).is_some());
        assert!(validate(&json!({"type": "message", "text": "hi"})).is_none());
        assert!(validate(&json!({"type": "direct_message", "agent": "claude"})).is_some());
        assert!(
            validate(&json!({"type": "permission_response", "request_id": "r", "approved": true}))
                .is_none()
        );
    }

    #[test]
    fn simple_control_messages_need_no_fields() {
        for t in ["stop_round", "resume", "cancel", "create_session"] {
            assert!(validate(&json!({"type": t})).is_none());
        }
    }
}
