pub mod adapter;
pub mod chat_agent;
pub mod claude;
pub mod codex;
pub mod error;
pub mod event;
pub mod factory;
pub mod kimi;
pub mod labels;
pub mod launch;
pub mod permission;
pub mod prompt;
pub mod supervisor;

pub use adapter::{ProcessIo, ProtocolAdapter};
pub use chat_agent::{
    AgentChunk, AgentNotice, AgentPermissionRequest, AgentResponse, ChatAgent, Participant,
};
pub use error::{AgentError, Result};
pub use event::{AgentEvent, PermissionResponse};
pub use factory::create_agents;
pub use permission::PermissionBridge;
pub use supervisor::PersistentAgent;
