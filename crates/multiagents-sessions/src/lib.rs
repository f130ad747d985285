pub mod db;
pub mod error;
pub mod settings;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use settings::SettingsStore;
pub use store::SessionStore;
pub use types::{AgentProgress, SessionRecord, SessionState, StoredMessage};
