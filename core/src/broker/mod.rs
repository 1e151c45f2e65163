//! Broker layer: transport abstraction, owned connection handle, subscriptions.
//!
//! - `Transport`: the publish/subscribe contract every backend implements
//! - `EventBus`: in-process subject bus used for `memory://` URLs and tests
//! - `NatsTransport`: `async-nats` client for `nats://` URLs (feature `nats`)
//! - `BrokerConnection`: what the listener, router and viewer actually hold
//!
//! Delivery guarantee: at-least-once to subscribers that are live when the
//! publication happens, in publish order for any single publisher. Nothing is
//! replayed to subscriptions created later.

mod event_bus;
#[cfg(feature = "nats")]
mod nats;

pub use event_bus::{EventBus, EventBusStats, MemoryTransport};
#[cfg(feature = "nats")]
pub use nats::NatsTransport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::subject::Subject;
use crate::{MultiverseError, Result};

/// URL scheme for the in-process bus.
pub const MEMORY_SCHEME: &str = "memory://";
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One payload received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Concrete subject the payload was published to.
    pub subject: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe transport.
///
/// `publish` must be callable concurrently from several tasks without
/// external locking.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()>;

    /// Subscribes to a subject or wildcard pattern. Returns the subscription id
    /// and the receiving end of its delivery queue.
    async fn subscribe(&self, pattern: &Subject) -> Result<(String, mpsc::Receiver<Delivery>)>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Releases every subscription this transport opened and refuses further use.
    async fn close(&self) -> Result<()>;
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let url = if cfg!(feature = "nats") {
            "nats://localhost:4222"
        } else {
            "memory://default"
        };
        Self {
            url: url.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Bounded exponential backoff for transient connect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Owned handle to a broker.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct BrokerConnection {
    transport: Arc<dyn Transport>,
    url: String,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("transport", &self.transport.name())
            .field("url", &self.url)
            .finish()
    }
}

impl BrokerConnection {
    /// Connects according to `config.url`, bounded by `config.connect_timeout`.
    ///
    /// Fails with `BrokerUnavailable` on timeout or when the transport cannot
    /// be reached, and with `Config` for an unsupported URL scheme.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let url = config.url.trim();
        let connecting = async {
            if let Some(name) = url.strip_prefix(MEMORY_SCHEME) {
                let name = if name.is_empty() { "default" } else { name };
                return Ok(Self::in_memory(EventBus::named(name)));
            }
            if url.starts_with("nats://") || url.starts_with("tls://") {
                return Self::connect_nats(url).await;
            }
            Err(MultiverseError::Config(format!(
                "unsupported broker url {url:?}"
            )))
        };

        match tokio::time::timeout(config.connect_timeout, connecting).await {
            Ok(Ok(conn)) => {
                info!(url = %url, transport = conn.transport.name(), "Connected to broker");
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MultiverseError::BrokerUnavailable(format!(
                "connect to {url} timed out after {:?}",
                config.connect_timeout
            ))),
        }
    }

    /// `connect` with bounded retries for transient failures.
    pub async fn connect_with_retry(config: &BrokerConfig, policy: RetryPolicy) -> Result<Self> {
        retry_transient(policy, &config.url, || Self::connect(config)).await
    }

    #[cfg(feature = "nats")]
    async fn connect_nats(url: &str) -> Result<Self> {
        let transport = NatsTransport::connect(url).await?;
        Ok(Self {
            transport: Arc::new(transport),
            url: url.to_string(),
        })
    }

    #[cfg(not(feature = "nats"))]
    async fn connect_nats(url: &str) -> Result<Self> {
        Err(MultiverseError::Config(format!(
            "{url}: NATS transport not compiled in (enable the `nats` feature)"
        )))
    }

    /// Opens a connection on an in-process bus.
    pub fn in_memory(bus: Arc<EventBus>) -> Self {
        let url = format!("{MEMORY_SCHEME}{}", bus.name());
        Self {
            transport: Arc::new(MemoryTransport::new(bus)),
            url,
        }
    }

    /// Wraps any transport implementation.
    pub fn from_transport(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Publishes raw bytes to a concrete subject.
    pub async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()> {
        if subject.is_pattern() {
            return Err(MultiverseError::InvalidIdentifier {
                kind: "subject",
                value: subject.to_string(),
                reason: "cannot publish to a wildcard subject",
            });
        }
        debug!(subject = %subject, bytes = payload.len(), "Publishing");
        self.transport.publish(subject, payload).await
    }

    /// Publishes a message in its JSON wire form.
    pub async fn publish_message(&self, subject: &Subject, message: &Message) -> Result<()> {
        self.publish(subject, message.to_bytes()?).await
    }

    pub async fn subscribe(&self, pattern: &Subject) -> Result<Subscription> {
        let (id, rx) = self.transport.subscribe(pattern).await?;
        debug!(subject = %pattern, subscription = %id, "Subscribed");
        Ok(Subscription {
            id,
            subject: pattern.clone(),
            rx,
            transport: Arc::clone(&self.transport),
        })
    }

    pub async fn close(&self) -> Result<()> {
        info!(url = %self.url, "Closing broker connection");
        self.transport.close().await
    }
}

/// Runs `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// attempts have been made. Only transient errors are retried.
async fn retry_transient<T, F, Fut>(policy: RetryPolicy, target: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                warn!(target_url = %target, attempt, error = %e, ?wait, "Broker connect failed, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(target_url = %target, attempts = attempt, error = %e, "Giving up on broker");
                }
                return Err(e);
            }
        }
    }
}

/// A live subscription. Deliveries queue until read with [`Subscription::next`].
pub struct Subscription {
    id: String,
    subject: Subject,
    rx: mpsc::Receiver<Delivery>,
    transport: Arc<dyn Transport>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Waits for the next delivery; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next delivery decoded as a [`Message`]. Undecodable payloads are
    /// logged and skipped.
    pub async fn next_message(&mut self) -> Option<(String, Message)> {
        loop {
            let delivery = self.next().await?;
            match Message::from_bytes(&delivery.payload) {
                Ok(msg) => return Some((delivery.subject, msg)),
                Err(e) => warn!(
                    subject = %delivery.subject,
                    error = %e,
                    "Skipping undecodable payload"
                ),
            }
        }
    }

    /// Stops intake and releases the subscription at the broker.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.rx.close();
        self.transport.unsubscribe(&self.id).await
    }
}
