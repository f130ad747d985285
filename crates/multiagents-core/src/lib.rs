pub mod config;
pub mod error;
pub mod types;

pub use config::MultiagentsConfig;
pub use error::{CoreError, Result};
pub use types::{AgentKind, AgentPersona, HistoryMessage, PermissionMode};
