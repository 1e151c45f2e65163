use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::agent_key_of;
use crate::subject::validate_token;
use crate::{MultiverseError, Result};

/// Static identity of one agent endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub key: String,
    pub display_name: String,
    pub role: String,
}

/// Immutable registry of the agents a deployment knows about.
///
/// Built once at process start and shared behind an `Arc`; there is no way to
/// add or remove entries afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentIdentity>,
}

impl AgentRegistry {
    /// Builds a registry, rejecting keys that are not legal subject tokens
    /// and keys that appear twice.
    pub fn new(agents: impl IntoIterator<Item = AgentIdentity>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for agent in agents {
            validate_token("agent key", &agent.key)?;
            if map.contains_key(&agent.key) {
                return Err(MultiverseError::Config(format!(
                    "agent {} registered twice",
                    agent.key
                )));
            }
            map.insert(agent.key.clone(), agent);
        }
        Ok(Self { agents: map })
    }

    /// The stock persona set.
    pub fn stock() -> Self {
        let agents = STOCK_PERSONAS
            .iter()
            .map(|(key, display_name, role)| {
                (
                    key.to_string(),
                    AgentIdentity {
                        key: key.to_string(),
                        display_name: display_name.to_string(),
                        role: role.to_string(),
                    },
                )
            })
            .collect();
        Self { agents }
    }

    pub fn get(&self, agent_key: &str) -> Option<&AgentIdentity> {
        self.agents.get(agent_key)
    }

    /// Looks up an agent, failing with `UnknownAgent`.
    pub fn require(&self, agent_key: &str) -> Result<&AgentIdentity> {
        self.get(agent_key)
            .ok_or_else(|| MultiverseError::UnknownAgent(agent_key.to_string()))
    }

    pub fn contains(&self, agent_key: &str) -> bool {
        self.agents.contains_key(agent_key)
    }

    /// Resolves an `agent_<key>` user id to a registered identity.
    pub fn by_user_id(&self, user_id: &str) -> Option<&AgentIdentity> {
        agent_key_of(user_id).and_then(|key| self.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    /// All identities, ordered by key.
    pub fn all(&self) -> impl Iterator<Item = &AgentIdentity> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

const STOCK_PERSONAS: &[(&str, &str, &str)] = &[
    ("cynthia", "Cynthia", "Utopian Researcher"),
    ("sylvia", "Sylvia", "Research Skeptic"),
    ("orchestrator", "Orchestrator", "Coordinator"),
    ("tessa", "Tessa", "Far Future UX Designer"),
    ("historian", "Historian", "Wiki Documentation Updater"),
    ("planner", "Planner", "Project Plan Manager"),
    ("ray", "Ray", "Sci-Fi Tech Visionary"),
    ("moss", "Moss", "Feature Implementer"),
    ("roy", "Roy", "Simulation Maintainer"),
    ("priya", "Priya", "Quantitative Validator"),
];
