// Message Router implementation
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, BrokerConnection};
use crate::message::{agent_user_id, Message, MessageKind};
use crate::registry::AgentRegistry;
use crate::subject::{Subject, SubjectScheme};
use crate::{MultiverseError, Result};

/// Turns send requests into broker publications.
///
/// Every send publishes the message to the recipient agent's inbox first and
/// then mirrors it to the all-messages stream. The two publications are not
/// atomic: if the process dies in between, the agent still gets the message
/// but observers never see it. The mirror is for observability only.
///
/// Sending is fire-and-forget; nothing waits for a reply.
pub struct MessageRouter {
    connection: Arc<BrokerConnection>,
    registry: Arc<AgentRegistry>,
    scheme: SubjectScheme,
}

impl MessageRouter {
    pub fn new(
        connection: Arc<BrokerConnection>,
        registry: Arc<AgentRegistry>,
        scheme: SubjectScheme,
    ) -> Self {
        Self {
            connection,
            registry,
            scheme,
        }
    }

    /// Opens a dedicated connection for the router.
    pub async fn connect(
        config: &BrokerConfig,
        registry: Arc<AgentRegistry>,
        scheme: SubjectScheme,
    ) -> Result<Self> {
        let connection = BrokerConnection::connect(config).await?;
        info!("MessageRouter connected to broker");
        Ok(Self::new(Arc::new(connection), registry, scheme))
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn scheme(&self) -> &SubjectScheme {
        &self.scheme
    }

    /// Send a DM from a human (or any identity) to an agent.
    ///
    /// Fails with `UnknownAgent` or `EmptyMessage` before anything is published.
    #[tracing::instrument(skip(self, content), fields(from = %from_user, agent = %agent_key))]
    pub async fn send_dm(&self, from_user: &str, agent_key: &str, content: &str) -> Result<Message> {
        self.send_dm_in_thread(from_user, agent_key, content, None)
            .await
    }

    /// `send_dm` with an explicit thread id.
    pub async fn send_dm_in_thread(
        &self,
        from_user: &str,
        agent_key: &str,
        content: &str,
        thread_id: Option<String>,
    ) -> Result<Message> {
        validate_sender(from_user)?;
        self.registry.require(agent_key)?;
        let inbox = self.scheme.inbox(agent_key)?;
        let message = Message::new_in_thread(
            from_user,
            agent_user_id(agent_key),
            content,
            MessageKind::Dm,
            thread_id,
        )?;

        self.route(&inbox, &message).await?;
        info!(message_id = %message.id(), "Routed DM from {} to agent {}", from_user, agent_key);
        Ok(message)
    }

    /// Send a message from one registered agent to another.
    #[tracing::instrument(skip(self, content), fields(from = %from_agent, to = %to_agent))]
    pub async fn send_agent_to_agent(
        &self,
        from_agent: &str,
        to_agent: &str,
        content: &str,
    ) -> Result<Message> {
        self.registry.require(from_agent)?;
        self.registry.require(to_agent)?;
        let inbox = self.scheme.inbox(to_agent)?;
        let message = Message::new(
            agent_user_id(from_agent),
            agent_user_id(to_agent),
            content,
            MessageKind::AgentToAgent,
        )?;

        self.route(&inbox, &message).await?;
        info!(message_id = %message.id(), "Routed message from agent {} to agent {}", from_agent, to_agent);
        Ok(message)
    }

    /// Send one `broadcast` message to every registered agent.
    ///
    /// All messages are built (and validated) before the first publication.
    /// A publish failure stops the fan-out; agents already reached keep their copy.
    pub async fn broadcast(&self, from_user: &str, content: &str) -> Result<Vec<Message>> {
        validate_sender(from_user)?;
        let mut planned = Vec::with_capacity(self.registry.len());
        for key in self.registry.keys() {
            let inbox = self.scheme.inbox(key)?;
            let message =
                Message::new(from_user, agent_user_id(key), content, MessageKind::Broadcast)?;
            planned.push((inbox, message));
        }

        let mut sent = Vec::with_capacity(planned.len());
        for (inbox, message) in planned {
            self.route(&inbox, &message).await?;
            sent.push(message);
        }
        info!(count = sent.len(), "Broadcast from {}", from_user);
        Ok(sent)
    }

    /// Close the router's connection.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    async fn route(&self, inbox: &Subject, message: &Message) -> Result<()> {
        let payload = message.to_bytes()?;
        self.connection.publish(inbox, payload.clone()).await?;
        debug!(subject = %inbox, message_id = %message.id(), "Delivered to inbox");

        // Inbox delivery already happened; a failed mirror is reported but
        // cannot be rolled back.
        let all = self.scheme.all_messages();
        if let Err(e) = self.connection.publish(&all, payload).await {
            warn!(subject = %all, message_id = %message.id(), error = %e, "Mirror to all-messages failed");
            return Err(e);
        }
        Ok(())
    }
}

fn validate_sender(from_user: &str) -> Result<()> {
    if from_user.trim().is_empty() {
        return Err(MultiverseError::InvalidIdentifier {
            kind: "user id",
            value: from_user.to_string(),
            reason: "sender must not be empty",
        });
    }
    Ok(())
}
