//! Client message dispatch for one WebSocket connection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use multiagents_core::{AgentKind, AgentPersona};

use crate::app::AppState;
use crate::ws::connection::ConnState;

/// Route a validated client message to its handler.
pub async fn dispatch(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        "create_session" => create_session(state, conn, msg).await,
        "join_session" => join_session(state, conn, msg).await,
        "message" => message(state, conn, msg).await,
        "stop_agent" => {
            if let Some(session_id) = &conn.session_id {
                if let Some(agent) = msg.get("agent").and_then(Value::as_str) {
                    state.runner.stop_agent(session_id, agent);
                }
            }
        }
        "stop_round" => {
            if let Some(session_id) = &conn.session_id {
                state.runner.stop_round(session_id);
            }
        }
        "resume" => {
            if let Some(session_id) = &conn.session_id {
                state.runner.resume(session_id);
            }
        }
        "direct_message" => direct_message(state, conn, msg).await,
        "add_agent" => add_agent(state, conn, msg).await,
        "remove_agent" => remove_agent(state, conn, msg).await,
        "cancel" => {
            if let Some(session_id) = &conn.session_id {
                state.runner.cancel(session_id).await;
            }
        }
        "ack" => {
            if let (Some(session_id), Some(conn_id)) = (&conn.session_id, conn.conn_id) {
                if let Some(event_id) = msg.get("event_id").and_then(Value::as_u64) {
                    state.runner.ack(session_id, conn_id, event_id).await;
                }
            }
        }
        "permission_response" => {
            if let Some(session_id) = &conn.session_id {
                let request_id = msg.get("request_id").and_then(Value::as_str).unwrap_or("");
                let approved = msg.get("approved").and_then(Value::as_bool).unwrap_or(false);
                let agent = msg.get("agent").and_then(Value::as_str);
                state
                    .runner
                    .resolve_permission(session_id, request_id, approved, agent);
            }
        }
        "card_create" => card_create(state, conn, msg).await,
        "card_update" => card_update(state, conn, msg).await,
        "card_start" => card_start(state, conn, msg).await,
        "card_delegate" => card_delegate(state, conn, msg).await,
        "card_done" => card_done(state, conn, msg).await,
        "card_delete" => card_delete(state, conn, msg).await,
        other => debug!(msg_type = other, "unhandled message type"),
    }
}

async fn reply(conn: &ConnState, payload: Value) {
    let _ = conn.tx.send(payload.to_string()).await;
}

async fn error(conn: &ConnState, message: impl Into<String>) {
    reply(conn, json!({"type": "error", "message": message.into()})).await;
}

/// Normalize an agent spec (strings or persona objects) and attach the
/// configured default model per type when none was given.
async fn personas_with_models(state: &Arc<AppState>, spec: &Value) -> Option<Vec<AgentPersona>> {
    let mut personas = Vec::new();
    let items = spec.as_array()?;
    for item in items {
        let persona = match item {
            Value::String(kind) => AgentPersona {
                name: kind.clone(),
                kind: kind.parse().ok()?,
                role: String::new(),
                model: None,
            },
            Value::Object(obj) => {
                let kind_str = obj.get("type").and_then(Value::as_str)?;
                AgentPersona {
                    name: obj
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(kind_str)
                        .to_string(),
                    kind: kind_str.parse().ok()?,
                    role: obj
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    model: obj.get("model").and_then(Value::as_str).map(str::to_string),
                }
            }
            _ => return None,
        };
        personas.push(persona);
    }

    let settings = state.runner.settings().clone();
    tokio::task::spawn_blocking(move || {
        for persona in &mut personas {
            if persona.model.is_none() {
                let key = format!("agents.{}.model", persona.kind.as_str());
                if let Some(model) = settings.get(&key).as_str() {
                    persona.model = Some(model.to_string());
                }
            }
        }
        personas
    })
    .await
    .ok()
}

fn default_personas(state: &Arc<AppState>) -> Value {
    Value::Array(
        state
            .default_agents
            .iter()
            .map(|name| Value::String(name.clone()))
            .collect(),
    )
}

async fn create_session(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let spec = msg.get("agents").cloned().unwrap_or_else(|| default_personas(state));
    let Some(personas) = personas_with_models(state, &spec).await else {
        error(conn, "Invalid agents spec").await;
        return;
    };
    let working_dir = msg
        .get("working_dir")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let config: HashMap<String, Value> = msg
        .get("config")
        .and_then(Value::as_object)
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let store = state.runner.store().clone();
    let create_personas = personas.clone();
    let created = tokio::task::spawn_blocking(move || {
        store.create_session(&create_personas, &working_dir, &config)
    })
    .await;
    let session = match created {
        Ok(Ok(session)) => session,
        _ => {
            error(conn, "Failed to create session").await;
            return;
        }
    };

    // Leave any previously joined session.
    if let (Some(old_session), Some(conn_id)) = (&conn.session_id, conn.conn_id) {
        state.runner.unsubscribe(old_session, conn_id);
    }
    conn.conn_id = Some(state.runner.subscribe(&session.id, conn.tx.clone()));
    conn.session_id = Some(session.id.clone());
    state.runner.start_warmup(&session.id, personas.clone());

    reply(
        conn,
        json!({
            "type": "session_created",
            "session_id": session.id,
            "agents": personas,
        }),
    )
    .await;
}

async fn join_session(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = msg.get("session_id").and_then(Value::as_str) else {
        error(conn, "Missing session_id").await;
        return;
    };
    let sid = session_id.to_string();
    let store = state.runner.store().clone();
    let session = tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();
    let Some(session) = session else {
        error(conn, "Session not found").await;
        return;
    };

    if let (Some(old_session), Some(conn_id)) = (&conn.session_id, conn.conn_id) {
        state.runner.unsubscribe(old_session, conn_id);
    }
    conn.conn_id = Some(state.runner.subscribe(session_id, conn.tx.clone()));
    conn.session_id = Some(session_id.to_string());
    state.runner.start_warmup(session_id, session.agents.clone());

    let sid = session_id.to_string();
    let store = state.runner.store().clone();
    let messages = tokio::task::spawn_blocking(move || store.get_messages(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();

    // A session marked running with no live task crashed mid-run; pick the
    // discussion back up from the previous round.
    let mut is_running = state.runner.is_running(session_id);
    let mut in_flight = Value::Null;
    if session.is_running {
        if !is_running {
            let start_round = session.current_round.saturating_sub(1);
            state
                .runner
                .run_prompt(session_id, "", session.agents.clone(), start_round);
            is_running = true;
        }
        let sid = session_id.to_string();
        let store = state.runner.store().clone();
        if let Ok(Ok(progress)) =
            tokio::task::spawn_blocking(move || store.get_agent_progress(&sid)).await
        {
            in_flight = json!({
                "round": session.current_round,
                "agent_streams": progress
                    .iter()
                    .map(|(k, v)| (k.clone(), v.stream_text.clone()))
                    .collect::<HashMap<_, _>>(),
                "agent_statuses": progress
                    .iter()
                    .map(|(k, v)| (k.clone(), v.status.clone()))
                    .collect::<HashMap<_, _>>(),
            });
        }
    }

    let cards = state.runner.get_cards(session_id, &session.agents).await;
    reply(
        conn,
        json!({
            "type": "session_joined",
            "session_id": session_id,
            "title": session.title,
            "agents": session.agents,
            "messages": messages,
            "is_running": is_running,
            "in_flight": in_flight,
            "cards": cards,
        }),
    )
    .await;

    if let Some(last_event_id) = msg.get("last_event_id").and_then(Value::as_u64) {
        if last_event_id > 0 {
            state
                .runner
                .replay_events(session_id, last_event_id, &conn.tx)
                .await;
        }
    }
}

async fn message(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let text = msg
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if text.is_empty() {
        return;
    }

    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let save_text = text.clone();
    let saved = tokio::task::spawn_blocking(move || {
        store.save_message(&sid, "user", &save_text, None, false)
    })
    .await;
    let created_at = match saved {
        Ok(Ok(message)) => message.created_at,
        _ => {
            error(conn, "Failed to save message").await;
            return;
        }
    };

    if state.runner.is_running(&session_id) {
        state.runner.inject_message(&session_id, &text);
        return;
    }

    state
        .runner
        .broadcast(
            &session_id,
            json!({"type": "user_message", "text": text, "created_at": created_at}),
        )
        .await;

    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let session = tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();
    let Some(session) = session else {
        return;
    };

    // First message titles the chat.
    let store = state.runner.store().clone();
    let sid = session_id.clone();
    if let Ok(Ok(messages)) = tokio::task::spawn_blocking(move || store.get_messages(&sid)).await {
        if messages.len() == 1 {
            let mut title: String = text.chars().take(50).collect();
            if text.chars().count() > 50 {
                title.push_str("...");
            }
            let store = state.runner.store().clone();
            let sid = session_id.clone();
            let stored_title = title.clone();
            let _ =
                tokio::task::spawn_blocking(move || store.update_title(&sid, &stored_title)).await;
            state
                .runner
                .broadcast(&session_id, json!({"type": "title_changed", "title": title}))
                .await;
        }
    }

    state.runner.run_prompt(&session_id, &text, session.agents, 0);
}

async fn direct_message(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let agent_name = msg
        .get("agent")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let text = msg
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if agent_name.is_empty() || text.is_empty() {
        return;
    }

    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let session = tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();
    let Some(session) = session else {
        return;
    };
    let Some(persona) = session.agents.iter().find(|a| a.name == agent_name).cloned() else {
        error(conn, format!("Unknown agent: {agent_name}")).await;
        return;
    };

    // Persist the DM under its own role so replays can distinguish it.
    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let role = format!("dm:{agent_name}");
    let dm_text = text.clone();
    let saved = tokio::task::spawn_blocking(move || {
        store.save_message(&sid, &role, &dm_text, None, false)
    })
    .await;
    let created_at = match saved {
        Ok(Ok(message)) => message.created_at,
        _ => return,
    };

    state
        .runner
        .broadcast(
            &session_id,
            json!({
                "type": "dm_sent",
                "agent": agent_name,
                "text": text,
                "round": session.current_round,
                "created_at": created_at,
            }),
        )
        .await;

    if state.runner.is_running(&session_id) {
        // Active round — queue a (debounced) DM for the target agent.
        state.runner.restart_agent(&session_id, &agent_name, &text);
    } else {
        // No active round — start a single-agent round with the DM.
        let dm_prompt = format!("[Direct message to {agent_name}]: {text}");
        let store = state.runner.store().clone();
        let sid = session_id.clone();
        let prompt = dm_prompt.clone();
        let _ = tokio::task::spawn_blocking(move || {
            store.save_message(&sid, "user", &prompt, None, false)
        })
        .await;
        state
            .runner
            .run_prompt(&session_id, &dm_prompt, vec![persona], session.current_round);
    }
}

async fn add_agent(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let name = msg
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let agent_type = msg
        .get("agent_type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let role = msg
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if name.is_empty() || agent_type.is_empty() {
        error(conn, "Missing name or agent_type").await;
        return;
    }
    let Ok(kind) = agent_type.parse::<AgentKind>() else {
        error(conn, format!("Unknown agent type: {agent_type}")).await;
        return;
    };

    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let session = tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();
    let Some(session) = session else {
        return;
    };
    if session.agents.iter().any(|a| a.name == name) {
        error(conn, format!("Agent name '{name}' already exists")).await;
        return;
    }

    let spec = json!([{"name": name, "type": kind.as_str(), "role": role}]);
    let Some(mut personas) = personas_with_models(state, &spec).await else {
        return;
    };
    let persona = personas.remove(0);

    let mut updated = session.agents.clone();
    updated.push(persona.clone());
    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let personas_for_store = updated.clone();
    let agent_name = name.clone();
    let _ = tokio::task::spawn_blocking(move || {
        store.update_agents(&sid, &personas_for_store)?;
        store.add_agent_state(&sid, &agent_name)
    })
    .await;

    state.runner.add_agent(&session_id, persona.clone()).await;
    state
        .runner
        .broadcast(
            &session_id,
            json!({
                "type": "agent_added",
                "name": name,
                "agent_type": agent_type,
                "role": role,
                "model": persona.model,
            }),
        )
        .await;
}

async fn remove_agent(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let name = msg
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() {
        return;
    }
    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let session = tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();
    let Some(session) = session else {
        return;
    };
    let updated: Vec<AgentPersona> = session
        .agents
        .iter()
        .filter(|a| a.name != name)
        .cloned()
        .collect();
    if updated.len() == session.agents.len() {
        error(conn, format!("Agent '{name}' not found")).await;
        return;
    }
    let store = state.runner.store().clone();
    let sid = session_id.clone();
    let agent_name = name.clone();
    let personas_for_store = updated;
    let _ = tokio::task::spawn_blocking(move || {
        store.update_agents(&sid, &personas_for_store)?;
        store.remove_agent_state(&sid, &agent_name)
    })
    .await;
    state.runner.remove_agent(&session_id, &name).await;
    state
        .runner
        .broadcast(&session_id, json!({"type": "agent_removed", "name": name}))
        .await;
}

// -- Cards -------------------------------------------------------------------

async fn session_personas(state: &Arc<AppState>, session_id: &str) -> Option<Vec<AgentPersona>> {
    let store = state.runner.store().clone();
    let sid = session_id.to_string();
    tokio::task::spawn_blocking(move || store.get_session(&sid))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten()
        .map(|s| s.agents)
}

async fn card_create(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let Some(personas) = session_personas(state, &session_id).await else {
        return;
    };
    let field = |key: &str| {
        msg.get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let card = state
        .runner
        .create_card(
            &session_id,
            &personas,
            &field("title"),
            &field("description"),
            &field("planner"),
            &field("implementer"),
            &field("reviewer"),
            &field("coordinator"),
        )
        .await;
    state
        .runner
        .broadcast(&session_id, json!({"type": "card_created", "card": card.to_wire()}))
        .await;
}

async fn card_update(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let card_id = msg.get("card_id").and_then(Value::as_str).unwrap_or("");
    let fields: HashMap<String, Value> = msg
        .get("fields")
        .and_then(Value::as_object)
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    match state.runner.update_card(&session_id, card_id, &fields).await {
        Ok(card) => {
            state
                .runner
                .broadcast(&session_id, json!({"type": "card_updated", "card": card.to_wire()}))
                .await;
        }
        Err(e) => error(conn, e.to_string()).await,
    }
}

async fn card_start(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let card_id = msg.get("card_id").and_then(Value::as_str).unwrap_or("");
    let Some(personas) = session_personas(state, &session_id).await else {
        return;
    };
    if let Err(e) = state.runner.start_card(&session_id, card_id, &personas).await {
        error(conn, e.to_string()).await;
    }
}

async fn card_delegate(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let card_id = msg.get("card_id").and_then(Value::as_str).unwrap_or("");
    let Some(personas) = session_personas(state, &session_id).await else {
        return;
    };
    if let Err(e) = state
        .runner
        .delegate_card(&session_id, card_id, &personas)
        .await
    {
        error(conn, e.to_string()).await;
    }
}

async fn card_done(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let card_id = msg.get("card_id").and_then(Value::as_str).unwrap_or("");
    match state.runner.mark_card_done(&session_id, card_id).await {
        Ok(card) => {
            state
                .runner
                .broadcast(&session_id, json!({"type": "card_updated", "card": card.to_wire()}))
                .await;
        }
        Err(e) => error(conn, e.to_string()).await,
    }
}

async fn card_delete(state: &Arc<AppState>, conn: &mut ConnState, msg: &Value) {
    let Some(session_id) = conn.session_id.clone() else {
        error(conn, "No session").await;
        return;
    };
    let card_id = msg
        .get("card_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    match state.runner.delete_card(&session_id, &card_id).await {
        Ok(()) => {
            state
                .runner
                .broadcast(&session_id, json!({"type": "card_deleted", "card_id": card_id}))
                .await;
        }
        Err(e) => error(conn, e.to_string()).await,
    }
}
