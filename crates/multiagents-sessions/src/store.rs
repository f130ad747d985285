//! SQLite persistence for sessions, messages, events, agent state, and cards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use multiagents_core::AgentPersona;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{AgentProgress, SessionRecord, SessionState, StoredMessage};

/// Replayable events retained per session.
const MAX_SESSION_EVENTS: u64 = 2000;

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Thread-safe store over a single SQLite connection.
///
/// Short, serialized transactions behind a `Mutex` are sufficient for the
/// single-node target; all calls are made off the event pump's critical
/// path by the session runner.
pub struct SessionStore {
    db: Mutex<Connection>,
    path: PathBuf,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- Sessions ------------------------------------------------------------

    pub fn create_session(
        &self,
        agents: &[AgentPersona],
        working_dir: &str,
        config: &HashMap<String, Value>,
    ) -> Result<SessionRecord> {
        let session_id = Uuid::new_v4().simple().to_string();
        let created = now();
        let title = "New Chat".to_string();
        let agents_json = serde_json::to_string(agents)?;
        let config_json = serde_json::to_string(config)?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (id, title, agent_names, created_at, updated_at, working_dir, config)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
            params![session_id, title, agents_json, created, working_dir, config_json],
        )?;
        for agent in agents {
            db.execute(
                "INSERT INTO agent_state (session_id, agent_name) VALUES (?1, ?2)",
                params![session_id, agent.name],
            )?;
        }
        debug!(session_id = %session_id, agents = agents.len(), "session created");

        Ok(SessionRecord {
            id: session_id,
            title,
            agents: agents.to_vec(),
            created_at: created.clone(),
            updated_at: created,
            is_running: false,
            is_paused: false,
            current_round: 0,
            last_event_id: 0,
            last_event_at: String::new(),
            working_dir: working_dir.to_string(),
            config: config.clone(),
            agent_sessions: agents.iter().map(|a| (a.name.clone(), None)).collect(),
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT id, title, agent_names, created_at, updated_at, is_running, is_paused,
                        current_round, last_event_id, last_event_at, working_dir, config
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, String>(11)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            id,
            title,
            agents_json,
            created_at,
            updated_at,
            is_running,
            is_paused,
            current_round,
            last_event_id,
            last_event_at,
            working_dir,
            config_json,
        )) = row
        else {
            return Ok(None);
        };

        let mut stmt =
            db.prepare("SELECT agent_name, cli_session_id FROM agent_state WHERE session_id = ?1")?;
        let agent_sessions = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(SessionRecord {
            id,
            title,
            agents: serde_json::from_str(&agents_json).unwrap_or_default(),
            created_at,
            updated_at,
            is_running: is_running != 0,
            is_paused: is_paused != 0,
            current_round: current_round.max(0) as u64,
            last_event_id: last_event_id.max(0) as u64,
            last_event_at,
            working_dir,
            config: serde_json::from_str(&config_json).unwrap_or_default(),
            agent_sessions,
        }))
    }

    /// Sessions newest-first: (id, title, agents, updated_at).
    pub fn list_sessions(&self) -> Result<Vec<(String, String, Vec<AgentPersona>, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, title, agent_names, updated_at FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .map(|(id, title, agents_json, updated)| {
                (
                    id,
                    title,
                    serde_json::from_str(&agents_json).unwrap_or_default(),
                    updated,
                )
            })
            .collect();
        Ok(rows)
    }

    pub fn update_title(&self, session_id: &str, title: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now(), session_id],
        )?;
        Ok(())
    }

    /// Replace the persona list (agent add/remove).
    pub fn update_agents(&self, session_id: &str, agents: &[AgentPersona]) -> Result<()> {
        let agents_json = serde_json::to_string(agents)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET agent_names = ?1, updated_at = ?2 WHERE id = ?3",
            params![agents_json, now(), session_id],
        )?;
        Ok(())
    }

    /// Delete a session and all related data (cascades via FK).
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    pub fn set_running(&self, session_id: &str, running: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET is_running = ?1, updated_at = ?2 WHERE id = ?3",
            params![running as i64, now(), session_id],
        )?;
        Ok(())
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET is_paused = ?1, updated_at = ?2 WHERE id = ?3",
            params![paused as i64, now(), session_id],
        )?;
        Ok(())
    }

    pub fn set_current_round(&self, session_id: &str, round_number: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET current_round = ?1, updated_at = ?2 WHERE id = ?3",
            params![round_number as i64, now(), session_id],
        )?;
        Ok(())
    }

    pub fn get_session_state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let db = self.db.lock().unwrap();
        let state = db
            .query_row(
                "SELECT is_running, is_paused, current_round, last_event_id, last_event_at
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionState {
                        is_running: row.get::<_, i64>(0)? != 0,
                        is_paused: row.get::<_, i64>(1)? != 0,
                        current_round: row.get::<_, i64>(2)?.max(0) as u64,
                        last_event_id: row.get::<_, i64>(3)?.max(0) as u64,
                        last_event_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Reset running/paused/round and in-flight agent progress after a run.
    pub fn clear_in_flight(&self, session_id: &str) -> Result<()> {
        let stamp = now();
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sessions SET is_running = 0, is_paused = 0, current_round = 0, updated_at = ?1
             WHERE id = ?2",
            params![stamp, session_id],
        )?;
        db.execute(
            "UPDATE agent_state SET last_round = 0, status = 'idle', stream_text = '', updated_at = ?1
             WHERE session_id = ?2",
            params![stamp, session_id],
        )?;
        Ok(())
    }

    // -- Messages ------------------------------------------------------------

    pub fn save_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        round_number: Option<u64>,
        passed: bool,
    ) -> Result<StoredMessage> {
        let msg_id = Uuid::new_v4().simple().to_string();
        let created = now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (id, session_id, role, content, round_number, passed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                msg_id,
                session_id,
                role,
                content,
                round_number.map(|r| r as i64),
                passed as i64,
                created
            ],
        )?;
        db.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![created, session_id],
        )?;
        Ok(StoredMessage {
            id: msg_id,
            role: role.to_string(),
            content: content.to_string(),
            round_number,
            passed,
            created_at: created,
        })
    }

    pub fn get_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, role, content, round_number, passed, created_at
             FROM messages WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    round_number: row.get::<_, Option<i64>>(3)?.map(|r| r.max(0) as u64),
                    passed: row.get::<_, i64>(4)? != 0,
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -- Events --------------------------------------------------------------

    /// Reserve the next event id for a session; strictly increasing.
    pub fn reserve_event_id(&self, session_id: &str) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let current: Option<i64> = db
            .query_row(
                "SELECT last_event_id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StoreError::SessionNotFound {
                id: session_id.to_string(),
            });
        };
        let next = current + 1;
        db.execute(
            "UPDATE sessions SET last_event_id = ?1 WHERE id = ?2",
            params![next, session_id],
        )?;
        Ok(next as u64)
    }

    /// Persist one broadcast event; idempotent on (session_id, event_id).
    /// Old events beyond the retention cap are dropped in the same call.
    pub fn save_event(&self, session_id: &str, event_id: u64, data: &Value) -> Result<()> {
        let stamp = now();
        let payload = serde_json::to_string(data)?;
        let event_type = data
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO session_events (session_id, event_id, type, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, event_id as i64, event_type, payload, stamp],
        )?;
        db.execute(
            "UPDATE sessions SET last_event_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![stamp, session_id],
        )?;
        db.execute(
            "DELETE FROM session_events WHERE session_id = ?1 AND event_id NOT IN (
                 SELECT event_id FROM session_events WHERE session_id = ?1
                 ORDER BY event_id DESC LIMIT ?2
             )",
            params![session_id, MAX_SESSION_EVENTS as i64],
        )?;
        Ok(())
    }

    pub fn get_events_since(
        &self,
        session_id: &str,
        after_event_id: u64,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT data FROM session_events WHERE session_id = ?1 AND event_id > ?2
             ORDER BY event_id ASC LIMIT ?3",
        )?;
        let rows: Vec<String> = stmt
            .query_map(
                params![session_id, after_event_id as i64, limit as i64],
                |row| row.get(0),
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows
            .into_iter()
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect())
    }

    /// Drop events every subscriber has acknowledged.
    pub fn prune_events(&self, session_id: &str, up_to_event_id: u64) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_events WHERE session_id = ?1 AND event_id <= ?2",
            params![session_id, up_to_event_id as i64],
        )?;
        Ok(())
    }

    pub fn clear_events(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM session_events WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    // -- Agent state ---------------------------------------------------------

    pub fn add_agent_state(&self, session_id: &str, agent_name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO agent_state (session_id, agent_name) VALUES (?1, ?2)",
            params![session_id, agent_name],
        )?;
        Ok(())
    }

    pub fn remove_agent_state(&self, session_id: &str, agent_name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM agent_state WHERE session_id = ?1 AND agent_name = ?2",
            params![session_id, agent_name],
        )?;
        Ok(())
    }

    pub fn save_agent_session_id(
        &self,
        session_id: &str,
        agent_name: &str,
        cli_session_id: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE agent_state SET cli_session_id = ?1 WHERE session_id = ?2 AND agent_name = ?3",
            params![cli_session_id, session_id, agent_name],
        )?;
        Ok(())
    }

    pub fn get_agent_session_ids(&self, session_id: &str) -> Result<HashMap<String, Option<String>>> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT agent_name, cli_session_id FROM agent_state WHERE session_id = ?1")?;
        let map = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(map)
    }

    /// Mark agents streaming for a fresh round and clear their buffers.
    pub fn reset_agent_progress(
        &self,
        session_id: &str,
        agent_names: &[String],
        round_number: u64,
    ) -> Result<()> {
        let stamp = now();
        let db = self.db.lock().unwrap();
        for name in agent_names {
            db.execute(
                "UPDATE agent_state SET last_round = ?1, status = 'streaming', stream_text = '', updated_at = ?2
                 WHERE session_id = ?3 AND agent_name = ?4",
                params![round_number as i64, stamp, session_id, name],
            )?;
        }
        Ok(())
    }

    pub fn append_agent_stream(
        &self,
        session_id: &str,
        agent_name: &str,
        round_number: u64,
        chunk: &str,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE agent_state SET last_round = ?1, status = 'streaming',
                    stream_text = stream_text || ?2, updated_at = ?3
             WHERE session_id = ?4 AND agent_name = ?5",
            params![round_number as i64, chunk, now(), session_id, agent_name],
        )?;
        Ok(())
    }

    pub fn set_agent_status(
        &self,
        session_id: &str,
        agent_name: &str,
        status: &str,
        round_number: u64,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE agent_state SET last_round = ?1, status = ?2, updated_at = ?3
             WHERE session_id = ?4 AND agent_name = ?5",
            params![round_number as i64, status, now(), session_id, agent_name],
        )?;
        Ok(())
    }

    pub fn get_agent_progress(&self, session_id: &str) -> Result<HashMap<String, AgentProgress>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT agent_name, last_round, status, stream_text FROM agent_state
             WHERE session_id = ?1",
        )?;
        let map = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    AgentProgress {
                        last_round: row.get::<_, i64>(1)?.max(0) as u64,
                        status: row.get(2)?,
                        stream_text: row.get(3)?,
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(map)
    }

    // -- Cards ---------------------------------------------------------------

    /// Upsert a full card state (wire form, as produced by `Card::to_wire`).
    pub fn save_card(&self, session_id: &str, card: &Value) -> Result<()> {
        let history = serde_json::to_string(card.get("history").unwrap_or(&Value::Array(vec![])))?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO cards
             (id, session_id, title, description, status, planner, implementer, reviewer,
              coordinator, coordination_stage, previous_phase, history, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                card.get("id").and_then(Value::as_str).unwrap_or(""),
                session_id,
                card.get("title").and_then(Value::as_str).unwrap_or(""),
                card.get("description").and_then(Value::as_str).unwrap_or(""),
                card.get("status").and_then(Value::as_str).unwrap_or("backlog"),
                card.get("planner").and_then(Value::as_str).unwrap_or(""),
                card.get("implementer").and_then(Value::as_str).unwrap_or(""),
                card.get("reviewer").and_then(Value::as_str).unwrap_or(""),
                card.get("coordinator").and_then(Value::as_str).unwrap_or(""),
                card.get("coordination_stage").and_then(Value::as_str).unwrap_or(""),
                card.get("previous_phase").and_then(Value::as_str),
                history,
                card.get("created_at")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(now),
            ],
        )?;
        Ok(())
    }

    /// Load all cards for a session in wire form.
    pub fn get_cards(&self, session_id: &str) -> Result<Vec<Value>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, title, description, status, planner, implementer, reviewer,
                    coordinator, coordination_stage, previous_phase, history, created_at
             FROM cards WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let history_json: String = row.get(10)?;
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "title": row.get::<_, String>(1)?,
                    "description": row.get::<_, String>(2)?,
                    "status": row.get::<_, String>(3)?,
                    "planner": row.get::<_, String>(4)?,
                    "implementer": row.get::<_, String>(5)?,
                    "reviewer": row.get::<_, String>(6)?,
                    "coordinator": row.get::<_, String>(7)?,
                    "coordination_stage": row.get::<_, String>(8)?,
                    "previous_phase": row.get::<_, Option<String>>(9)?,
                    "history": serde_json::from_str::<Value>(&history_json)
                        .unwrap_or_else(|_| Value::Array(vec![])),
                    "created_at": row.get::<_, String>(11)?,
                }))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_card(&self, session_id: &str, card_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM cards WHERE id = ?1 AND session_id = ?2",
            params![card_id, session_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiagents_core::AgentKind;

    fn open_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn personas() -> Vec<AgentPersona> {
        vec![
            AgentPersona::bare(AgentKind::Claude),
            AgentPersona::bare(AgentKind::Codex),
        ]
    }

    #[test]
    fn create_and_fetch_session_round_trips_personas() {
        let (_dir, store) = open_store();
        let created = store
            .create_session(&personas(), "/work", &HashMap::new())
            .unwrap();
        let fetched = store.get_session(&created.id).unwrap().unwrap();
        assert_eq!(fetched.title, "New Chat");
        assert_eq!(fetched.working_dir, "/work");
        assert_eq!(fetched.agents.len(), 2);
        assert_eq!(fetched.agents[0].name, "claude");
        assert!(fetched.agent_sessions.contains_key("codex"));
        assert!(!fetched.is_running);
    }

    #[test]
    fn event_ids_are_strictly_increasing_and_persisted_idempotently() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();

        let first = store.reserve_event_id(&session.id).unwrap();
        let second = store.reserve_event_id(&session.id).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let event = serde_json::json!({"type": "round_started", "round": 1});
        store.save_event(&session.id, first, &event).unwrap();
        // Idempotent rewrite of the same slot.
        store.save_event(&session.id, first, &event).unwrap();

        let events = store.get_events_since(&session.id, 0, 100).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "round_started");

        store.prune_events(&session.id, first).unwrap();
        assert!(store.get_events_since(&session.id, 0, 100).unwrap().is_empty());
    }

    #[test]
    fn reserve_event_id_for_unknown_session_errors() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.reserve_event_id("nope"),
            Err(StoreError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn messages_preserve_round_and_pass_flags() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        store
            .save_message(&session.id, "user", "hello", None, false)
            .unwrap();
        store
            .save_message(&session.id, "claude", "[PASS]", Some(1), true)
            .unwrap();

        let messages = store.get_messages(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].round_number, None);
        assert!(messages[1].passed);
        assert_eq!(messages[1].round_number, Some(1));
    }

    #[test]
    fn agent_stream_progress_accumulates_and_clears() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        store
            .reset_agent_progress(&session.id, &["claude".into()], 1)
            .unwrap();
        store
            .append_agent_stream(&session.id, "claude", 1, "hel")
            .unwrap();
        store
            .append_agent_stream(&session.id, "claude", 1, "lo")
            .unwrap();

        let progress = store.get_agent_progress(&session.id).unwrap();
        assert_eq!(progress["claude"].stream_text, "hello");
        assert_eq!(progress["claude"].status, "streaming");

        store.clear_in_flight(&session.id).unwrap();
        let progress = store.get_agent_progress(&session.id).unwrap();
        assert_eq!(progress["claude"].stream_text, "");
        assert_eq!(progress["claude"].status, "idle");
    }

    #[test]
    fn cli_session_ids_survive_round_trips() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        store
            .save_agent_session_id(&session.id, "claude", "sid-77")
            .unwrap();
        let ids = store.get_agent_session_ids(&session.id).unwrap();
        assert_eq!(ids["claude"].as_deref(), Some("sid-77"));
        assert_eq!(ids["codex"], None);
    }

    #[test]
    fn cards_persist_in_wire_form() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        let card = serde_json::json!({
            "id": "card-1",
            "title": "Build",
            "description": "d",
            "status": "planning",
            "planner": "claude",
            "implementer": "codex",
            "reviewer": "kimi",
            "coordinator": "",
            "coordination_stage": "",
            "previous_phase": null,
            "history": [{"phase": "planning", "agent": "claude", "content": "x", "timestamp": "t"}],
            "created_at": "2026-01-01T00:00:00Z",
        });
        store.save_card(&session.id, &card).unwrap();

        let cards = store.get_cards(&session.id).unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0]["status"], "planning");
        assert_eq!(cards[0]["history"][0]["agent"], "claude");

        store.delete_card(&session.id, "card-1").unwrap();
        assert!(store.get_cards(&session.id).unwrap().is_empty());
    }

    #[test]
    fn session_state_tracks_running_round_and_pause() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        store.set_running(&session.id, true).unwrap();
        store.set_current_round(&session.id, 3).unwrap();
        store.set_paused(&session.id, true).unwrap();

        let state = store.get_session_state(&session.id).unwrap().unwrap();
        assert!(state.is_running);
        assert!(state.is_paused);
        assert_eq!(state.current_round, 3);

        store.clear_in_flight(&session.id).unwrap();
        let state = store.get_session_state(&session.id).unwrap().unwrap();
        assert!(!state.is_running);
        assert!(!state.is_paused);
        assert_eq!(state.current_round, 0);

        assert!(store.get_session_state("missing").unwrap().is_none());
    }

    #[test]
    fn delete_session_cascades_children() {
        let (_dir, store) = open_store();
        let session = store
            .create_session(&personas(), "", &HashMap::new())
            .unwrap();
        store
            .save_message(&session.id, "user", "hello", None, false)
            .unwrap();
        let id = store.reserve_event_id(&session.id).unwrap();
        store
            .save_event(&session.id, id, &serde_json::json!({"type": "user_message"}))
            .unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(store.get_session(&session.id).unwrap().is_none());
        assert!(store.get_messages(&session.id).unwrap().is_empty());
        assert!(store.get_events_since(&session.id, 0, 10).unwrap().is_empty());
    }
}
