// Multiverse Core Library
// Agent messaging substrate over a publish/subscribe broker

pub mod broker;
pub mod config;
pub mod listener;
pub mod message;
pub mod registry;
pub mod router;
pub mod subject;
pub mod telemetry;
pub mod viewer;

// Export core types
pub use broker::{BrokerConfig, BrokerConnection, EventBus, EventBusStats, RetryPolicy};
pub use config::MultiverseConfig;
pub use listener::{
    AgentListener, EchoHandler, FnHandler, ListenerHandle, ListenerRuntime, ListenerState,
    MessageHandler, Reply, SilentHandler,
};
pub use message::{Message, MessageKind};
pub use registry::{AgentIdentity, AgentRegistry};
pub use router::MessageRouter;
pub use subject::{Subject, SubjectScheme};
pub use viewer::{MessageViewer, ViewerOptions};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MultiverseError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Invalid {kind} identifier {value:?}: {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Handler for agent {agent} failed on message {message_id}: {reason}")]
    HandlerFailure {
        agent: String,
        message_id: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MultiverseError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Only transport failures are transient; malformed requests and unknown
    /// identities fail the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, MultiverseError::BrokerUnavailable(_))
    }

    /// Convenience constructor for handler errors raised from inside a `MessageHandler`.
    pub fn handler(agent: impl Into<String>, message_id: impl Into<String>, reason: impl ToString) -> Self {
        MultiverseError::HandlerFailure {
            agent: agent.into(),
            message_id: message_id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MultiverseError>;
