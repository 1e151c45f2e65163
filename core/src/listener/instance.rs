use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConfig, BrokerConnection, Subscription};
use crate::message::{agent_key_of, agent_user_id, Message, MessageKind};
use crate::registry::{AgentIdentity, AgentRegistry};
use crate::subject::{Subject, SubjectScheme};
use crate::{MultiverseError, Result};

use super::handler::{MessageHandler, Reply};

/// Lifecycle of one listener.
///
/// `Created -> Connecting -> Listening -> (Handling -> Listening)* -> Draining -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Created,
    Connecting,
    Listening,
    Handling,
    Draining,
    Closed,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Created => "created",
            ListenerState::Connecting => "connecting",
            ListenerState::Listening => "listening",
            ListenerState::Handling => "handling",
            ListenerState::Draining => "draining",
            ListenerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Counters for one listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStats {
    pub received: u64,
    pub handled: u64,
    pub failed: u64,
    pub published: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    published: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

/// Inbox listener for one agent.
pub struct AgentListener {
    identity: AgentIdentity,
    scheme: SubjectScheme,
    inbox: Subject,
    outbox: Subject,
    handler: Box<dyn MessageHandler>,
    state_tx: watch::Sender<ListenerState>,
    counters: Arc<Counters>,
}

impl AgentListener {
    /// Creates a listener for a registered agent.
    ///
    /// Fails with `UnknownAgent` when the key is not in the registry.
    pub fn new(
        registry: &AgentRegistry,
        agent_key: &str,
        scheme: SubjectScheme,
        handler: Box<dyn MessageHandler>,
    ) -> Result<Self> {
        let identity = registry.require(agent_key)?.clone();
        let inbox = scheme.inbox(&identity.key)?;
        let outbox = scheme.outbox(&identity.key)?;
        let (state_tx, _) = watch::channel(ListenerState::Created);
        Ok(Self {
            identity,
            scheme,
            inbox,
            outbox,
            handler,
            state_tx,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn agent_key(&self) -> &str {
        &self.identity.key
    }

    pub fn inbox(&self) -> &Subject {
        &self.inbox
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    /// Opens a dedicated connection and starts listening. The connection is
    /// closed when the listener reaches `Closed`.
    ///
    /// Fails with `BrokerUnavailable` when the broker cannot be reached within
    /// `config.connect_timeout`. Retrying is left to the caller.
    pub async fn connect_and_start(
        self,
        config: &BrokerConfig,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle> {
        self.set_state(ListenerState::Connecting);
        let connection = match BrokerConnection::connect(config).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                error!(agent = %self.identity.key, error = %e, "Listener failed to connect");
                self.set_state(ListenerState::Closed);
                return Err(e);
            }
        };
        self.spawn(connection, true, cancel).await
    }

    /// Starts listening on a shared connection. The connection stays open
    /// when the listener closes.
    pub async fn start(
        self,
        connection: Arc<BrokerConnection>,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle> {
        self.set_state(ListenerState::Connecting);
        self.spawn(connection, false, cancel).await
    }

    async fn spawn(
        self,
        connection: Arc<BrokerConnection>,
        owns_connection: bool,
        cancel: CancellationToken,
    ) -> Result<ListenerHandle> {
        let subscription = match connection.subscribe(&self.inbox).await {
            Ok(sub) => sub,
            Err(e) => {
                self.set_state(ListenerState::Closed);
                if owns_connection {
                    let _ = connection.close().await;
                }
                return Err(e);
            }
        };
        self.set_state(ListenerState::Listening);
        info!(agent = %self.identity.key, subject = %self.inbox, "Agent listening");

        let agent_key = self.identity.key.clone();
        let state_rx = self.state_tx.subscribe();
        let counters = Arc::clone(&self.counters);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            self.run(subscription, connection, owns_connection, task_cancel)
                .await
        });

        Ok(ListenerHandle {
            agent_key,
            cancel,
            state_rx,
            counters,
            task,
        })
    }

    async fn run(
        mut self,
        mut subscription: Subscription,
        connection: Arc<BrokerConnection>,
        owns_connection: bool,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.handler.on_start(&self.identity).await {
            warn!(agent = %self.identity.key, error = %e, "Handler on_start failed");
        }

        loop {
            // Cancellation is only observed between messages, so an in-flight
            // handler invocation always runs to completion.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = subscription.next_message() => next,
            };
            let Some((_, message)) = next else { break };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            self.set_state(ListenerState::Handling);
            match self.handle_one(&connection, &message).await {
                Ok(published) => {
                    self.counters.handled.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .published
                        .fetch_add(published, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(agent = %self.identity.key, message_id = %message.id(), error = %e, "Message handling failed");
                }
            }
            self.set_state(ListenerState::Listening);
        }

        self.set_state(ListenerState::Draining);
        info!(agent = %self.identity.key, "Listener draining");
        if let Err(e) = subscription.unsubscribe().await {
            warn!(agent = %self.identity.key, error = %e, "Unsubscribe failed");
        }
        if let Err(e) = self.handler.on_shutdown().await {
            warn!(agent = %self.identity.key, error = %e, "Handler on_shutdown failed");
        }
        if owns_connection {
            if let Err(e) = connection.close().await {
                warn!(agent = %self.identity.key, error = %e, "Closing connection failed");
            }
        }
        self.set_state(ListenerState::Closed);
        info!(agent = %self.identity.key, "Listener closed");
    }

    /// Runs the handler for one message and publishes its replies.
    /// Returns the number of replies published.
    async fn handle_one(&mut self, connection: &BrokerConnection, message: &Message) -> Result<u64> {
        info!(
            agent = %self.identity.key,
            message_id = %message.id(),
            from = %message.from_user(),
            "Received message: {}",
            preview(message.content())
        );

        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await;
        let replies = match outcome {
            Ok(Ok(replies)) => replies,
            Ok(Err(MultiverseError::HandlerFailure { reason, .. })) => {
                return Err(MultiverseError::handler(&self.identity.key, message.id(), reason))
            }
            Ok(Err(e)) => return Err(MultiverseError::handler(&self.identity.key, message.id(), e)),
            Err(_) => {
                return Err(MultiverseError::handler(
                    &self.identity.key,
                    message.id(),
                    "handler panicked",
                ))
            }
        };

        let mut published = 0;
        for reply in replies {
            match self.publish_reply(connection, message, reply).await {
                Ok(()) => published += 1,
                Err(e) => {
                    error!(agent = %self.identity.key, in_reply_to = %message.id(), error = %e, "Failed to publish reply")
                }
            }
        }
        Ok(published)
    }

    /// Publishes a reply to its recipient, the all-messages stream and the
    /// agent's outbox.
    async fn publish_reply(
        &self,
        connection: &BrokerConnection,
        inbound: &Message,
        reply: Reply,
    ) -> Result<()> {
        let kind = if agent_key_of(&reply.to_user).is_some() {
            MessageKind::AgentToAgent
        } else {
            MessageKind::Dm
        };
        let outbound = Message::new_in_thread(
            agent_user_id(&self.identity.key),
            reply.to_user,
            reply.content,
            kind,
            inbound.thread_id().map(str::to_string),
        )?;

        // Resolved before publishing so an unaddressable reply publishes nothing.
        let recipient = self.recipient_subject(outbound.to_user())?;
        connection.publish_message(&recipient, &outbound).await?;
        connection
            .publish_message(&self.scheme.all_messages(), &outbound)
            .await?;
        connection.publish_message(&self.outbox, &outbound).await?;

        debug!(agent = %self.identity.key, message_id = %outbound.id(), to = %outbound.to_user(), "Sent reply");
        Ok(())
    }

    fn recipient_subject(&self, to_user: &str) -> Result<Subject> {
        match agent_key_of(to_user) {
            Some(agent_key) => self.scheme.inbox(agent_key),
            None => self.scheme.dm_stream(to_user),
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_replace(state);
    }
}

fn preview(content: &str) -> String {
    let mut s: String = content.chars().take(50).collect();
    if s.len() < content.len() {
        s.push_str("...");
    }
    s
}

/// Handle to a running listener.
pub struct ListenerHandle {
    agent_key: String,
    cancel: CancellationToken,
    state_rx: watch::Receiver<ListenerState>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn agent_key(&self) -> &str {
        &self.agent_key
    }

    pub fn state(&self) -> ListenerState {
        *self.state_rx.borrow()
    }

    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }

    /// Waits until the listener reaches `state` (or has already passed into `Closed`).
    pub async fn wait_for(&mut self, state: ListenerState) -> ListenerState {
        match self
            .state_rx
            .wait_for(|s| *s == state || *s == ListenerState::Closed)
            .await
        {
            Ok(s) => *s,
            Err(_) => ListenerState::Closed,
        }
    }

    /// Requests a drain without waiting for it to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the listener and waits until it is closed.
    ///
    /// A listener task that died outside message handling (for example a
    /// panicking `on_shutdown`) is logged; there is nothing left to drain.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(agent = %self.agent_key, error = %e, "Listener task ended abnormally");
        }
        Ok(())
    }
}
