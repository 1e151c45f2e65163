//! Read-side cache of published messages.
//!
//! The viewer only knows what it has observed since its subscription was
//! established ([`MessageViewer::observing_since`]). Messages published
//! earlier are absent: the supported transports do not replay history to new
//! subscribers, so a late-started viewer is incomplete by construction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConfig, BrokerConnection, Subscription};
use crate::message::{agent_user_id, Message};
use crate::subject::SubjectScheme;
use crate::Result;

/// What the viewer subscribes to and how it reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewerOptions {
    /// Also subscribe to every agent inbox and outbox, which surfaces traffic
    /// that was never mirrored to the all-messages stream.
    pub include_agent_streams: bool,
    /// Log every newly indexed message at info level.
    pub echo: bool,
}

#[derive(Debug, Default)]
struct ViewerIndex {
    seen: HashSet<String>,
    all: Vec<Message>,
    // Positions into `all`, which is append-only
    by_participant: HashMap<String, Vec<usize>>,
    by_pair: HashMap<(String, String), Vec<usize>>,
    by_thread: HashMap<String, Vec<usize>>,
}

impl ViewerIndex {
    /// Appends a message unless its id was already indexed.
    fn insert(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id().to_string()) {
            return false;
        }
        let pos = self.all.len();

        self.by_participant
            .entry(message.from_user().to_string())
            .or_default()
            .push(pos);
        if message.to_user() != message.from_user() {
            self.by_participant
                .entry(message.to_user().to_string())
                .or_default()
                .push(pos);
        }
        self.by_pair
            .entry(pair_key(message.from_user(), message.to_user()))
            .or_default()
            .push(pos);
        if let Some(thread) = message.thread_id() {
            self.by_thread.entry(thread.to_string()).or_default().push(pos);
        }

        self.all.push(message);
        true
    }

    fn collect(&self, positions: Option<&Vec<usize>>) -> Vec<Message> {
        positions
            .map(|ps| ps.iter().map(|&i| self.all[i].clone()).collect())
            .unwrap_or_default()
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Subscribes to the message streams and answers history queries.
///
/// All query methods return messages in arrival order at this viewer, which
/// is not a global order: concurrent publishers may be observed in any
/// interleaving.
pub struct MessageViewer {
    index: Arc<RwLock<ViewerIndex>>,
    count_rx: watch::Receiver<usize>,
    observing_since: DateTime<Utc>,
    connection: Arc<BrokerConnection>,
    owns_connection: bool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageViewer {
    /// Opens a dedicated connection and starts viewing.
    pub async fn connect(
        config: &BrokerConfig,
        scheme: &SubjectScheme,
        options: ViewerOptions,
    ) -> Result<Self> {
        let connection = Arc::new(BrokerConnection::connect(config).await?);
        Self::spawn(connection, true, scheme, options).await
    }

    /// Starts viewing on a shared connection, which is left open on shutdown.
    pub async fn start(
        connection: Arc<BrokerConnection>,
        scheme: &SubjectScheme,
        options: ViewerOptions,
    ) -> Result<Self> {
        Self::spawn(connection, false, scheme, options).await
    }

    async fn spawn(
        connection: Arc<BrokerConnection>,
        owns_connection: bool,
        scheme: &SubjectScheme,
        options: ViewerOptions,
    ) -> Result<Self> {
        let mut patterns = vec![scheme.all_messages()];
        if options.include_agent_streams {
            patterns.push(scheme.all_inboxes());
            patterns.push(scheme.all_outboxes());
        }

        let mut subscriptions = Vec::with_capacity(patterns.len());
        for pattern in &patterns {
            match connection.subscribe(pattern).await {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => {
                    for sub in subscriptions {
                        let _ = sub.unsubscribe().await;
                    }
                    if owns_connection {
                        let _ = connection.close().await;
                    }
                    return Err(e);
                }
            }
        }
        let observing_since = Utc::now();

        let index = Arc::new(RwLock::new(ViewerIndex::default()));
        let (count_tx, count_rx) = watch::channel(0usize);
        let count_tx = Arc::new(count_tx);
        let cancel = CancellationToken::new();

        let tasks: Vec<JoinHandle<()>> = subscriptions
            .into_iter()
            .map(|sub| {
                tokio::spawn(ingest(
                    sub,
                    Arc::clone(&index),
                    Arc::clone(&count_tx),
                    cancel.clone(),
                    options.echo,
                ))
            })
            .collect();

        info!(
            subjects = ?patterns.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            "MessageViewer subscribed to message streams"
        );
        Ok(Self {
            index,
            count_rx,
            observing_since,
            connection,
            owns_connection,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Instant the subscriptions were established. Nothing published before
    /// it is in this viewer's cache.
    pub fn observing_since(&self) -> DateTime<Utc> {
        self.observing_since
    }

    pub async fn get_all_messages(&self) -> Vec<Message> {
        self.index.read().await.all.clone()
    }

    /// Messages sent or received by `agent_<agent_key>`; empty if none.
    pub async fn get_agent_messages(&self, agent_key: &str) -> Vec<Message> {
        self.get_user_messages(&agent_user_id(agent_key)).await
    }

    /// Messages sent or received by any identifier.
    pub async fn get_user_messages(&self, user_id: &str) -> Vec<Message> {
        let index = self.index.read().await;
        index.collect(index.by_participant.get(user_id))
    }

    /// Messages exchanged between exactly these two users, in either direction.
    pub async fn get_conversation(&self, user1: &str, user2: &str) -> Vec<Message> {
        let index = self.index.read().await;
        index.collect(index.by_pair.get(&pair_key(user1, user2)))
    }

    pub async fn get_thread(&self, thread_id: &str) -> Vec<Message> {
        let index = self.index.read().await;
        index.collect(index.by_thread.get(thread_id))
    }

    /// Number of distinct messages indexed so far.
    pub fn len(&self) -> usize {
        *self.count_rx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `count` messages are indexed. Returns false on timeout.
    pub async fn wait_for_len(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.count_rx.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Stops intake, waits for the ingest tasks, and closes the connection if
    /// the viewer opened it. The cache stays readable afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Viewer ingest task ended abnormally");
            }
        }
        if self.owns_connection {
            self.connection.close().await?;
        }
        info!("MessageViewer stopped");
        Ok(())
    }
}

async fn ingest(
    mut subscription: Subscription,
    index: Arc<RwLock<ViewerIndex>>,
    count_tx: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
    echo: bool,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            next = subscription.next_message() => next,
        };
        let Some((subject, message)) = next else { break };

        let mut guard = index.write().await;
        if !guard.insert(message.clone()) {
            debug!(subject = %subject, message_id = %message.id(), "Duplicate message ignored");
            continue;
        }
        count_tx.send_replace(guard.all.len());
        drop(guard);

        if echo {
            info!(
                target: "viewer",
                timestamp = %message.timestamp(),
                from = %message.from_user(),
                to = %message.to_user(),
                "{}",
                message.content()
            );
        }
    }

    let subject = subscription.subject().clone();
    if let Err(e) = subscription.unsubscribe().await {
        warn!(subject = %subject, error = %e, "Viewer unsubscribe failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn msg(from: &str, to: &str) -> Message {
        Message::new(from, to, "x", MessageKind::Dm).unwrap()
    }

    #[test]
    fn index_deduplicates_by_id() {
        let mut index = ViewerIndex::default();
        let m = msg("u1", "agent_roy");
        assert!(index.insert(m.clone()));
        assert!(!index.insert(m));
        assert_eq!(index.all.len(), 1);
    }

    #[test]
    fn pair_index_ignores_direction() {
        let mut index = ViewerIndex::default();
        index.insert(msg("u1", "agent_roy"));
        index.insert(msg("agent_roy", "u1"));
        index.insert(msg("u2", "agent_roy"));
        let ab = index.collect(index.by_pair.get(&pair_key("u1", "agent_roy")));
        let ba = index.collect(index.by_pair.get(&pair_key("agent_roy", "u1")));
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 2);
        assert_eq!(index.collect(index.by_participant.get("agent_roy")).len(), 3);
    }

    #[test]
    fn self_addressed_message_is_indexed_once() {
        let mut index = ViewerIndex::default();
        index.insert(msg("agent_moss", "agent_moss"));
        assert_eq!(index.collect(index.by_participant.get("agent_moss")).len(), 1);
    }
}
