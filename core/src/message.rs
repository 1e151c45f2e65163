//! Message value type and its JSON wire form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MultiverseError, Result};

/// Prefix that turns an agent key into a user identifier (`sylvia` -> `agent_sylvia`).
pub const AGENT_PREFIX: &str = "agent_";

/// Returns the user identifier an agent sends and receives messages as.
pub fn agent_user_id(agent_key: &str) -> String {
    format!("{AGENT_PREFIX}{agent_key}")
}

/// Extracts the agent key from an `agent_<key>` identifier, if it is one.
pub fn agent_key_of(user_id: &str) -> Option<&str> {
    user_id
        .strip_prefix(AGENT_PREFIX)
        .filter(|key| !key.is_empty())
}

/// Discriminator carried on the wire as `message_type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Human to agent (or agent reply to a human)
    #[default]
    Dm,
    /// Agent to agent
    AgentToAgent,
    /// One sender to every registered agent
    Broadcast,
}

/// One unit of communication.
///
/// Fields are private and there are no setters: a `Message` is never changed
/// after construction. A correction is a new `Message` with a new `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    from_user: String,
    to_user: String,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(rename = "message_type", default)]
    kind: MessageKind,
    #[serde(default)]
    thread_id: Option<String>,
}

impl Message {
    /// Builds a new message with a fresh id and the current time.
    ///
    /// Fails with `EmptyMessage` when `content` is empty or whitespace only.
    pub fn new(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Result<Self> {
        Self::new_in_thread(from_user, to_user, content, kind, None)
    }

    /// Like [`Message::new`], placing the message in `thread_id`.
    ///
    /// There is no way to change the thread (or any other field) of an
    /// existing message, so an id always names exactly one message.
    pub fn new_in_thread(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        content: impl Into<String>,
        kind: MessageKind,
        thread_id: Option<String>,
    ) -> Result<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MultiverseError::EmptyMessage);
        }
        Ok(Self {
            id: new_message_id(),
            from_user: from_user.into(),
            to_user: to_user.into(),
            content,
            timestamp: Utc::now(),
            kind,
            thread_id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from_user(&self) -> &str {
        &self.from_user
    }

    pub fn to_user(&self) -> &str {
        &self.to_user
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// True when `user_id` is the sender or the recipient.
    pub fn involves(&self, user_id: &str) -> bool {
        self.from_user == user_id || self.to_user == user_id
    }

    /// Serializes to the JSON wire payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a JSON wire payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}
