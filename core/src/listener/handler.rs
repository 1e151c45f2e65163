use async_trait::async_trait;
use tracing::info;

use crate::message::Message;
use crate::registry::AgentIdentity;
use crate::Result;

/// Outbound draft produced by a handler. The listener turns it into a
/// [`Message`] sent from the agent, in the inbound message's thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub to_user: String,
    pub content: String,
}

impl Reply {
    pub fn new(to_user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to_user: to_user.into(),
            content: content.into(),
        }
    }

    /// Reply addressed to whoever sent `message`.
    pub fn to_sender(message: &Message, content: impl Into<String>) -> Self {
        Self::new(message.from_user(), content)
    }
}

/// Per-agent message handling logic.
///
/// A listener calls `handle` for one message at a time and never
/// concurrently, so implementations may keep mutable state without locking.
/// An `Err` (or a panic) affects only the message being handled.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_start(&mut self, _agent: &AgentIdentity) -> Result<()> {
        Ok(())
    }

    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>>;

    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Acknowledges every message back to its sender.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    agent_key: String,
}

impl EchoHandler {
    pub fn new(agent_key: impl Into<String>) -> Self {
        Self {
            agent_key: agent_key.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_start(&mut self, agent: &AgentIdentity) -> Result<()> {
        if self.agent_key.is_empty() {
            self.agent_key = agent.key.clone();
        }
        Ok(())
    }

    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>> {
        let preview: String = message.content().chars().take(50).collect();
        Ok(vec![Reply::to_sender(
            message,
            format!(
                "Agent {} received your message: '{}...'",
                self.agent_key, preview
            ),
        )])
    }
}

/// Logs messages and never replies.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentHandler;

#[async_trait]
impl MessageHandler for SilentHandler {
    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>> {
        info!(
            message_id = %message.id(),
            from = %message.from_user(),
            "Received: {}",
            message.content()
        );
        Ok(vec![])
    }
}

/// Adapts a synchronous closure into a handler.
///
/// ```
/// use multiverse_core::{FnHandler, Reply};
///
/// let handler = FnHandler::new(|msg| Ok(vec![Reply::to_sender(msg, "hello!")]));
/// # let _ = handler;
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: FnMut(&Message) -> Result<Vec<Reply>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: FnMut(&Message) -> Result<Vec<Reply>> + Send + Sync,
{
    async fn handle(&mut self, message: &Message) -> Result<Vec<Reply>> {
        (self.f)(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[tokio::test]
    async fn echo_truncates_to_fifty_chars() {
        let mut echo = EchoHandler::new("roy");
        let long = "x".repeat(80);
        let msg = Message::new("bob@example.com", "agent_roy", long, MessageKind::Dm).unwrap();
        let replies = echo.handle(&msg).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].to_user, "bob@example.com");
        assert_eq!(
            replies[0].content,
            format!("Agent roy received your message: '{}...'", "x".repeat(50))
        );
    }

    #[tokio::test]
    async fn echo_takes_key_from_identity_when_unset() {
        let mut echo = EchoHandler::default();
        echo.on_start(&AgentIdentity {
            key: "moss".into(),
            display_name: "Moss".into(),
            role: "Feature Implementer".into(),
        })
        .await
        .unwrap();
        let msg = Message::new("u1", "agent_moss", "hi", MessageKind::Dm).unwrap();
        let replies = echo.handle(&msg).await.unwrap();
        assert!(replies[0].content.starts_with("Agent moss received"));
    }

    #[tokio::test]
    async fn fn_handler_keeps_state() {
        let mut seen = 0;
        let mut handler = FnHandler::new(move |msg: &Message| {
            seen += 1;
            Ok(vec![Reply::to_sender(msg, format!("#{seen}"))])
        });
        let msg = Message::new("u1", "agent_ray", "ping", MessageKind::Dm).unwrap();
        handler.handle(&msg).await.unwrap();
        let second = handler.handle(&msg).await.unwrap();
        assert_eq!(second[0].content, "#2");
    }
}
