use rusqlite::Connection;

use crate::error::Result;

/// Initialise pragmas, tables, and indexes.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY,
            title         TEXT NOT NULL,
            agent_names   TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            is_running    INTEGER NOT NULL DEFAULT 0,
            is_paused     INTEGER NOT NULL DEFAULT 0,
            current_round INTEGER NOT NULL DEFAULT 0,
            last_event_id INTEGER NOT NULL DEFAULT 0,
            last_event_at TEXT NOT NULL DEFAULT '',
            working_dir   TEXT NOT NULL DEFAULT '',
            config        TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            round_number INTEGER,
            passed       INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

        CREATE TABLE IF NOT EXISTS agent_state (
            session_id     TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            agent_name     TEXT NOT NULL,
            cli_session_id TEXT,
            last_round     INTEGER NOT NULL DEFAULT 0,
            status         TEXT NOT NULL DEFAULT 'idle',
            stream_text    TEXT NOT NULL DEFAULT '',
            updated_at     TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (session_id, agent_name)
        );

        CREATE TABLE IF NOT EXISTS session_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            event_id    INTEGER NOT NULL,
            type        TEXT NOT NULL,
            data        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_session_events_session_event
            ON session_events(session_id, event_id);
        CREATE INDEX IF NOT EXISTS idx_session_events_session
            ON session_events(session_id);

        CREATE TABLE IF NOT EXISTS cards (
            id              TEXT PRIMARY KEY,
            session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            title           TEXT NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'backlog',
            planner         TEXT NOT NULL DEFAULT '',
            implementer     TEXT NOT NULL DEFAULT '',
            reviewer        TEXT NOT NULL DEFAULT '',
            coordinator     TEXT NOT NULL DEFAULT '',
            coordination_stage TEXT NOT NULL DEFAULT '',
            previous_phase  TEXT,
            history         TEXT NOT NULL DEFAULT '[]',
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cards_session ON cards(session_id);

        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}
