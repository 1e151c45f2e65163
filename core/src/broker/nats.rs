// NATS transport (feature `nats`)
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Delivery, Transport};
use crate::subject::Subject;
use crate::{MultiverseError, Result};

const FORWARD_CAPACITY: usize = 1024;

/// `async-nats` client adapted to [`Transport`].
///
/// Each subscription runs a forwarder task that moves NATS messages into a
/// bounded queue; aborting the task drops the NATS subscriber, which
/// unsubscribes at the server. `close` drops the client, which ends the
/// connection once the forwarders are gone.
pub struct NatsTransport {
    client: RwLock<Option<async_nats::Client>>,
    forwarders: DashMap<String, JoinHandle<()>>,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| MultiverseError::BrokerUnavailable(format!("{url}: {e}")))?;
        Ok(Self {
            client: RwLock::new(Some(client)),
            forwarders: DashMap::new(),
        })
    }

    async fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| MultiverseError::BrokerUnavailable("NATS connection is closed".into()))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, subject: &Subject, payload: Vec<u8>) -> Result<()> {
        self.client()
            .await?
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| MultiverseError::BrokerUnavailable(format!("publish {subject}: {e}")))
    }

    async fn subscribe(&self, pattern: &Subject) -> Result<(String, mpsc::Receiver<Delivery>)> {
        let mut subscriber = self
            .client()
            .await?
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| MultiverseError::BrokerUnavailable(format!("subscribe {pattern}: {e}")))?;

        let id = format!("nats_{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
        let forward_id = id.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let delivery = Delivery {
                    subject: msg.subject.to_string(),
                    payload: msg.payload.to_vec(),
                };
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!("NATS forwarder {} finished", forward_id);
        });
        self.forwarders.insert(id.clone(), handle);
        info!("Created NATS subscription {} for subject {}", id, pattern);
        Ok((id, rx))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if let Some((_, handle)) = self.forwarders.remove(subscription_id) {
            handle.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };
        let ids: Vec<String> = self.forwarders.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.forwarders.remove(&id) {
                handle.abort();
            }
        }
        let flushed = client
            .flush()
            .await
            .map_err(|e| MultiverseError::BrokerUnavailable(format!("flush on close: {e}")));
        drop(client);
        info!("Closed NATS connection");
        flushed
    }
}
