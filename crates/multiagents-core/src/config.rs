use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8421;
pub const DEFAULT_BIND: &str = "127.0.0.1";

// Timeout defaults in seconds. A hard timeout of 0 means disabled.
pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 1800.0;
pub const DEFAULT_PARSE_TIMEOUT_SECS: f64 = 1200.0;
pub const DEFAULT_SEND_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_HARD_TIMEOUT_SECS: f64 = 0.0;
pub const DEFAULT_PERMISSION_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_WARMUP_TTL_SECS: f64 = 300.0;
pub const DEFAULT_ACK_TTL_SECS: f64 = 300.0;

/// Top-level config (multiagents.toml + MULTIAGENTS_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiagentsConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Default for MultiagentsConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            timeouts: TimeoutsConfig::default(),
            pools: PoolsConfig::default(),
            database: DatabaseConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle per-turn budget in seconds.
    #[serde(default = "default_idle")]
    pub idle: f64,
    /// Adapter parse/stream budget in seconds.
    #[serde(default = "default_parse")]
    pub parse: f64,
    /// WebSocket send budget in seconds.
    #[serde(default = "default_send")]
    pub send: f64,
    /// Hard per-turn cap in seconds (0 = disabled).
    #[serde(default)]
    pub hard: f64,
    /// Budget for a pending permission reply in seconds.
    #[serde(default = "default_permission")]
    pub permission: f64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle: default_idle(),
            parse: default_parse(),
            send: default_send(),
            hard: DEFAULT_HARD_TIMEOUT_SECS,
            permission: default_permission(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Seconds an idle pre-warmed agent pool survives with no subscribers.
    #[serde(default = "default_warmup_ttl")]
    pub warmup_ttl: f64,
    /// Seconds before a silent subscriber's ack cursor is discarded.
    #[serde(default = "default_ack_ttl")]
    pub ack_ttl: f64,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            warmup_ttl: default_warmup_ttl(),
            ack_ttl: default_ack_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Default agent set for new sessions.
    #[serde(default = "default_enabled")]
    pub enabled: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_idle() -> f64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}
fn default_parse() -> f64 {
    DEFAULT_PARSE_TIMEOUT_SECS
}
fn default_send() -> f64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_permission() -> f64 {
    DEFAULT_PERMISSION_TIMEOUT_SECS
}
fn default_warmup_ttl() -> f64 {
    DEFAULT_WARMUP_TTL_SECS
}
fn default_ack_ttl() -> f64 {
    DEFAULT_ACK_TTL_SECS
}
fn default_enabled() -> Vec<String> {
    vec!["claude".into(), "codex".into(), "kimi".into()]
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.multiagents/multiagents.db")
}

impl MultiagentsConfig {
    /// Load config from a TOML file with MULTIAGENTS_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.multiagents/multiagents.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: MultiagentsConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("MULTIAGENTS_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.multiagents/multiagents.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = MultiagentsConfig::default();
        assert_eq!(config.server.port, 8421);
        assert_eq!(config.timeouts.idle, 1800.0);
        assert_eq!(config.timeouts.parse, 1200.0);
        assert_eq!(config.timeouts.hard, 0.0);
        assert_eq!(config.pools.warmup_ttl, 300.0);
        assert_eq!(config.agents.enabled, vec!["claude", "codex", "kimi"]);
    }
}
