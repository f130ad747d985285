use std::sync::Arc;
use std::time::Duration;

use multiagents_core::{AgentPersona, CoreError};

use crate::chat_agent::{AgentSettings, ChatAgent};

/// Build chat agents from personas.
///
/// `parse_timeout`/`hard_timeout` apply to every agent when given; per-type
/// model and prompt overrides are already resolved on the personas by the
/// caller.
pub fn create_agents(
    personas: &[AgentPersona],
    parse_timeout: Option<Duration>,
    hard_timeout: Option<Duration>,
) -> Result<Vec<Arc<ChatAgent>>, CoreError> {
    let mut agents = Vec::with_capacity(personas.len());
    for persona in personas {
        if persona.name.trim().is_empty() {
            return Err(CoreError::Config("agent persona has an empty name".into()));
        }
        let mut settings = AgentSettings {
            model: persona.model.clone(),
            ..AgentSettings::default()
        };
        if let Some(parse) = parse_timeout {
            settings.parse_timeout = parse;
        }
        settings.hard_timeout = hard_timeout;
        agents.push(Arc::new(ChatAgent::new(persona.clone(), settings)));
    }
    Ok(agents)
}
