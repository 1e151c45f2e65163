use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use multiverse_core::listener::ListenerStats;
use multiverse_core::{
    BrokerConnection, EchoHandler, ListenerRuntime, MultiverseConfig, RetryPolicy,
};

use crate::Result;

/// Runs one echo listener per registered agent on a single connection.
pub struct AgentLauncher {
    runtime: ListenerRuntime,
}

impl AgentLauncher {
    /// Connects (retrying transient failures) and starts every listener.
    pub async fn start(config: &MultiverseConfig, retry: RetryPolicy) -> Result<Self> {
        let connection = BrokerConnection::connect_with_retry(&config.broker, retry).await?;
        let runtime = ListenerRuntime::new(
            Arc::new(connection),
            Arc::clone(&config.agents),
            config.scheme.clone(),
        );
        let started = runtime
            .spawn_all(|agent| Box::new(EchoHandler::new(agent.key.clone())))
            .await?;

        for agent in config.agents.all() {
            let inbox = config.scheme.inbox(&agent.key)?;
            info!(agent = %agent.key, name = %agent.display_name, inbox = %inbox, "{}", agent.role);
        }
        info!(count = started, url = %config.broker.url, "All agents listening");
        Ok(Self { runtime })
    }

    pub fn running(&self) -> Vec<String> {
        self.runtime.running()
    }

    pub fn stats(&self) -> BTreeMap<String, ListenerStats> {
        self.runtime.stats()
    }

    /// Drains every listener and returns the final per-agent counters.
    pub async fn shutdown(self) -> Result<BTreeMap<String, ListenerStats>> {
        let stats = self.runtime.stats();
        self.runtime.shutdown().await?;
        Ok(stats)
    }
}
