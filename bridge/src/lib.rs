use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use multiverse_core::{
    AgentRegistry, BrokerConnection, Message, MessageRouter, MessageViewer, MultiverseConfig,
    MultiverseError, ViewerOptions,
};

mod launcher;

pub use launcher::AgentLauncher;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Core(#[from] MultiverseError),
}

impl BridgeError {
    /// True when the caller sent a bad request (unknown agent, empty content,
    /// malformed identifier) and retrying it unchanged cannot succeed.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Core(
                MultiverseError::UnknownAgent(_)
                    | MultiverseError::EmptyMessage
                    | MultiverseError::InvalidIdentifier { .. }
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Result of `send_dm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmReceipt {
    pub id: String,
    pub from_user: String,
    pub to_user: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for DmReceipt {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id().to_string(),
            from_user: msg.from_user().to_string(),
            to_user: msg.to_user().to_string(),
            content: msg.content().to_string(),
            timestamp: msg.timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentsResponse {
    pub agents: BTreeMap<String, AgentSummary>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    pub count: usize,
    /// Agent key the listing was filtered by, or `"all"`.
    pub agent: String,
    /// Messages published before this instant are not included.
    pub observing_since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationResponse {
    pub messages: Vec<Message>,
    pub count: usize,
    pub participants: [String; 2],
}

/// Command surface for external tool callers: one router, one viewer and the
/// registry behind a shared connection.
///
/// Every method takes `&self`; wrap in an `Arc` to serve concurrent callers.
pub struct CommandBridge {
    router: MessageRouter,
    viewer: MessageViewer,
    registry: Arc<AgentRegistry>,
    connection: Arc<BrokerConnection>,
}

impl CommandBridge {
    /// Connects to the configured broker and starts the viewer.
    pub async fn connect(config: &MultiverseConfig) -> Result<Self> {
        let connection = Arc::new(BrokerConnection::connect(&config.broker).await?);
        Self::start(connection, config).await
    }

    /// Builds the bridge on an existing connection. The connection is closed
    /// by [`CommandBridge::shutdown`].
    pub async fn start(connection: Arc<BrokerConnection>, config: &MultiverseConfig) -> Result<Self> {
        let viewer = MessageViewer::start(
            Arc::clone(&connection),
            &config.scheme,
            ViewerOptions::default(),
        )
        .await?;
        let router = MessageRouter::new(
            Arc::clone(&connection),
            Arc::clone(&config.agents),
            config.scheme.clone(),
        );
        info!(url = %connection.url(), namespace = config.scheme.namespace(), "Command bridge ready");
        Ok(Self {
            router,
            viewer,
            registry: Arc::clone(&config.agents),
            connection,
        })
    }

    pub async fn send_dm(&self, agent_key: &str, content: &str, from_user: &str) -> Result<DmReceipt> {
        let message = self.router.send_dm(from_user, agent_key, content).await?;
        Ok(DmReceipt::from(&message))
    }

    pub fn list_agents(&self) -> AgentsResponse {
        let agents: BTreeMap<String, AgentSummary> = self
            .registry
            .all()
            .map(|a| {
                (
                    a.key.clone(),
                    AgentSummary {
                        display_name: a.display_name.clone(),
                        role: a.role.clone(),
                    },
                )
            })
            .collect();
        AgentsResponse {
            count: agents.len(),
            agents,
        }
    }

    /// All observed messages, or only those involving `agent_key`.
    pub async fn list_messages(&self, agent_key: Option<&str>) -> MessagesResponse {
        let messages = match agent_key {
            Some(key) => self.viewer.get_agent_messages(key).await,
            None => self.viewer.get_all_messages().await,
        };
        MessagesResponse {
            count: messages.len(),
            messages,
            agent: agent_key.unwrap_or("all").to_string(),
            observing_since: self.viewer.observing_since(),
        }
    }

    pub async fn get_conversation(&self, user1: &str, user2: &str) -> ConversationResponse {
        let messages = self.viewer.get_conversation(user1, user2).await;
        ConversationResponse {
            count: messages.len(),
            messages,
            participants: [user1.to_string(), user2.to_string()],
        }
    }

    /// Read access to the viewer, e.g. to wait for traffic in tests.
    pub fn viewer(&self) -> &MessageViewer {
        &self.viewer
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.viewer.shutdown().await?;
        self.connection.close().await?;
        info!("Command bridge stopped");
        Ok(())
    }
}
