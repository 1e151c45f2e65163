// In-process subject bus
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Delivery, Transport};
use crate::subject::Subject;
use crate::{MultiverseError, Result};

/// Queue depth per subscription; publishers wait when it is full.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Subscription information
#[derive(Debug, Clone)]
struct BusSubscription {
    id: String,
    pattern: Subject,
    sender: mpsc::Sender<Delivery>,
}

/// Per-subject statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped_deliveries: u64,
}

/// In-process publish/subscribe bus with NATS-style subject matching.
///
/// Publishing awaits queue capacity for each matching subscriber rather than
/// dropping, so a live subscriber sees every publication, in order, from any
/// single publisher. Subscriptions whose receiver has gone away are pruned on
/// the next publish that matches them.
pub struct EventBus {
    name: String,
    // Pattern -> subscriber list
    subscriptions: DashMap<String, Vec<BusSubscription>>,
    // Statistics keyed by concrete subject (publish side) or pattern (subscribe side)
    stats: DashMap<String, EventBusStats>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: DashMap::new(),
            stats: DashMap::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Process-wide bus registered under `name`, created on first use.
    ///
    /// Every `memory://<name>` connection in the process shares this bus.
    pub fn named(name: &str) -> Arc<EventBus> {
        static BUSES: OnceLock<DashMap<String, Arc<EventBus>>> = OnceLock::new();
        let entry = BUSES
            .get_or_init(DashMap::new)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EventBus::new(name)));
        Arc::clone(entry.value())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish payload to a concrete subject; returns the number of deliveries.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> u64 {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.update_stats(subject, |stats| stats.total_published += 1);

        // Snapshot matching senders so no map guard is held across an await
        let targets: Vec<BusSubscription> = self
            .subscriptions
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|sub| sub.pattern.matches(subject))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        if targets.is_empty() {
            debug!("No subscriptions for subject: {}", subject);
            return 0;
        }

        let mut delivered = 0;
        let mut dropped = 0;
        for sub in targets {
            let delivery = Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
            };
            match sub.sender.send(delivery).await {
                Ok(_) => delivered += 1,
                Err(_) => {
                    dropped += 1;
                    warn!("Subscription {} is gone, pruning", sub.id);
                    self.remove(&sub.id);
                }
            }
        }

        self.update_stats(subject, |stats| {
            stats.total_delivered += delivered;
            stats.dropped_deliveries += dropped;
        });
        delivered
    }

    /// Subscribe to a subject or pattern
    pub fn subscribe(&self, pattern: &Subject) -> (String, mpsc::Receiver<Delivery>) {
        let subscription_id = format!("sub_{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        self.subscriptions
            .entry(pattern.to_string())
            .or_default()
            .push(BusSubscription {
                id: subscription_id.clone(),
                pattern: pattern.clone(),
                sender: tx,
            });
        self.update_stats(pattern.as_str(), |stats| stats.active_subscriptions += 1);

        info!(
            "Created subscription {} for subject {}",
            subscription_id, pattern
        );
        (subscription_id, rx)
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.remove(subscription_id);
        if removed {
            info!("Unsubscribed {}", subscription_id);
        }
        removed
    }

    pub fn get_stats(&self, subject: &str) -> Option<EventBusStats> {
        self.stats.get(subject).map(|s| s.clone())
    }

    /// Publications across all subjects since the bus was created.
    pub fn total_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.value().len()).sum()
    }

    fn remove(&self, subscription_id: &str) -> bool {
        let mut pattern = None;
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != subscription_id);
            if entry.value().len() != before {
                pattern = Some(entry.key().clone());
                break;
            }
        }
        match pattern {
            Some(p) => {
                self.subscriptions.remove_if(&p, |_, subs| subs.is_empty());
                self.update_stats(&p, |stats| {
                    stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
                });
                true
            }
            None => false,
        }
    }

    fn update_stats<F>(&self, subject: &str, f: F)
    where
        F: FnOnce(&mut EventBusStats),
    {
        f(self.stats.entry(subject.to_string()).or_default().value_mut());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new("default")
    }
}

/// One connection's view of an [`EventBus`].
///
/// Tracks the subscriptions it opened so that `close` releases exactly those.
pub struct MemoryTransport {
    bus: Arc<EventBus>,
    owned: DashSet<String>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            owned: DashSet::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MultiverseError::BrokerUnavailable(format!(
                "connection to memory://{} is closed",
                self.bus.name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.bus.publish(subject.as_str(), payload).await;
        Ok(())
    }

    async fn subscribe(&self, pattern: &Subject) -> Result<(String, mpsc::Receiver<Delivery>)> {
        self.ensure_open()?;
        let (id, rx) = self.bus.subscribe(pattern);
        self.owned.insert(id.clone());
        Ok((id, rx))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.owned.remove(subscription_id);
        self.bus.unsubscribe(subscription_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let ids: Vec<String> = self.owned.iter().map(|id| id.key().clone()).collect();
        for id in ids {
            self.owned.remove(&id);
            self.bus.unsubscribe(&id);
        }
        Ok(())
    }
}
