//! Runtime-editable settings on the shared SQLite database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::db::init_db;
use crate::error::Result;

/// Built-in defaults; a settings row overrides its key, a session config
/// overrides that, and CLI flags override everything.
pub fn defaults() -> HashMap<String, Value> {
    let mut map = HashMap::new();
    map.insert("agents.enabled".into(), json!(["claude", "codex", "kimi"]));
    for agent in ["claude", "codex", "kimi"] {
        map.insert(format!("agents.{agent}.model"), Value::Null);
        map.insert(format!("agents.{agent}.system_prompt"), Value::Null);
        // Permission mode per agent: "bypass" | "auto" | "manual".
        map.insert(format!("agents.{agent}.permissions"), json!("bypass"));
    }
    map.insert("timeouts.idle".into(), json!(1800));
    map.insert("timeouts.parse".into(), json!(1200));
    map.insert("timeouts.send".into(), json!(120));
    map.insert("timeouts.hard".into(), json!(0));
    map.insert("server.warmup_ttl".into(), json!(300));
    map.insert("server.max_events".into(), json!(2000));
    // Dispatch mode per session: "persistent" | "rounds".
    map.insert("room.mode".into(), json!("persistent"));
    // Timeout for pending permission requests (seconds, 0 = no timeout).
    map.insert("permissions.timeout".into(), json!(120));
    map
}

pub struct SettingsStore {
    db: Mutex<Connection>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    pub fn get(&self, key: &str) -> Value {
        let db = self.db.lock().unwrap();
        let stored: Option<String> = db
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        match stored {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::Null),
            None => defaults().get(key).cloned().unwrap_or(Value::Null),
        }
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, encoded],
        )?;
        Ok(())
    }

    pub fn set_many(&self, updates: &HashMap<String, Value>) -> Result<()> {
        let db = self.db.lock().unwrap();
        for (key, value) in updates {
            db.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, serde_json::to_string(value)?],
            )?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Defaults overlaid with every stored row.
    pub fn get_all(&self) -> Result<HashMap<String, Value>> {
        let mut result = defaults();
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            if let Ok(value) = serde_json::from_str(&row.1) {
                result.insert(row.0, value);
            }
        }
        Ok(result)
    }

    /// Layered view: defaults -> stored settings -> session config -> CLI.
    pub fn get_effective(
        &self,
        session_config: Option<&HashMap<String, Value>>,
        cli_overrides: Option<&HashMap<String, Value>>,
    ) -> Result<HashMap<String, Value>> {
        let mut result = self.get_all()?;
        if let Some(config) = session_config {
            result.extend(config.clone());
        }
        if let Some(overrides) = cli_overrides {
            result.extend(overrides.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(&dir.path().join("settings.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn defaults_cover_permission_and_timeout_keys() {
        let defaults = defaults();
        assert_eq!(defaults["agents.claude.permissions"], "bypass");
        assert_eq!(defaults["agents.codex.permissions"], "bypass");
        assert_eq!(defaults["agents.kimi.permissions"], "bypass");
        assert_eq!(defaults["permissions.timeout"], 120);
        assert_eq!(defaults["timeouts.idle"], 1800);
        assert_eq!(defaults["room.mode"], "persistent");
    }

    #[test]
    fn stored_values_shadow_defaults() {
        let (_dir, store) = open();
        assert_eq!(store.get("timeouts.idle"), json!(1800));
        store.set("timeouts.idle", &json!(60)).unwrap();
        assert_eq!(store.get("timeouts.idle"), json!(60));
        store.delete("timeouts.idle").unwrap();
        assert_eq!(store.get("timeouts.idle"), json!(1800));
    }

    #[test]
    fn effective_layers_session_over_settings_over_defaults() {
        let (_dir, store) = open();
        store.set("timeouts.parse", &json!(600)).unwrap();

        let mut session_config = HashMap::new();
        session_config.insert("timeouts.parse".to_string(), json!(300));
        let mut cli = HashMap::new();
        cli.insert("timeouts.idle".to_string(), json!(90));

        let effective = store
            .get_effective(Some(&session_config), Some(&cli))
            .unwrap();
        assert_eq!(effective["timeouts.parse"], 300);
        assert_eq!(effective["timeouts.idle"], 90);
        assert_eq!(effective["timeouts.send"], 120);
    }
}
