use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::BrokerConnection;
use crate::registry::{AgentIdentity, AgentRegistry};
use crate::subject::SubjectScheme;
use crate::{MultiverseError, Result};

use super::handler::MessageHandler;
use super::instance::{AgentListener, ListenerHandle, ListenerState, ListenerStats};

/// Runs one listener per agent on a shared connection.
///
/// Every listener gets a child of the runtime's cancellation token, so
/// [`ListenerRuntime::shutdown`] drains all of them at once.
pub struct ListenerRuntime {
    connection: Arc<BrokerConnection>,
    registry: Arc<AgentRegistry>,
    scheme: SubjectScheme,
    listeners: DashMap<String, ListenerHandle>,
    cancel: CancellationToken,
}

impl ListenerRuntime {
    pub fn new(
        connection: Arc<BrokerConnection>,
        registry: Arc<AgentRegistry>,
        scheme: SubjectScheme,
    ) -> Self {
        Self {
            connection,
            registry,
            scheme,
            listeners: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start a listener for one agent
    #[tracing::instrument(skip(self, handler), fields(agent = %agent_key))]
    pub async fn spawn_agent(
        &self,
        agent_key: &str,
        handler: Box<dyn MessageHandler>,
    ) -> Result<()> {
        if self.listeners.contains_key(agent_key) {
            return Err(MultiverseError::Config(format!(
                "agent {agent_key} already has a running listener"
            )));
        }
        let listener = AgentListener::new(&self.registry, agent_key, self.scheme.clone(), handler)?;
        let handle = listener
            .start(Arc::clone(&self.connection), self.cancel.child_token())
            .await?;
        self.listeners.insert(agent_key.to_string(), handle);
        Ok(())
    }

    /// Start a listener for every registered agent, building each handler with
    /// `make_handler`. Returns how many listeners were started.
    pub async fn spawn_all<F>(&self, mut make_handler: F) -> Result<usize>
    where
        F: FnMut(&AgentIdentity) -> Box<dyn MessageHandler>,
    {
        let mut started = 0;
        for identity in self.registry.all() {
            self.spawn_agent(&identity.key, make_handler(identity)).await?;
            started += 1;
        }
        info!(count = started, "All agent listeners started");
        Ok(started)
    }

    /// Drain and remove one agent's listener
    pub async fn stop_agent(&self, agent_key: &str) -> Result<()> {
        let (_, handle) = self
            .listeners
            .remove(agent_key)
            .ok_or_else(|| MultiverseError::UnknownAgent(agent_key.to_string()))?;
        handle.shutdown().await?;
        info!(agent = %agent_key, "Listener stopped");
        Ok(())
    }

    /// Keys of agents with a listener, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn state(&self, agent_key: &str) -> Option<ListenerState> {
        self.listeners.get(agent_key).map(|h| h.state())
    }

    pub fn stats(&self) -> BTreeMap<String, ListenerStats> {
        self.listeners
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect()
    }

    /// Drain every listener, then close the shared connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Listener runtime shutting down");
        self.cancel.cancel();

        let keys: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.listeners.remove(&key) {
                if let Err(e) = handle.shutdown().await {
                    warn!(agent = %key, error = %e, "Listener did not shut down cleanly");
                }
            }
        }
        self.connection.close().await
    }
}
