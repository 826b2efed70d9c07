//! In-process publish/subscribe broker.
//!
//! Behaves like an MQTT broker for our purposes: every subscriber of a
//! topic gets every publish on it, the publisher included, in publish order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::application::ports::{RelayEvent, RelayTransport};

#[derive(Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<RelayEvent>>,
    topics: HashMap<String, HashSet<u64>>,
}

/// Shared broker; clone it to hand it to several clients.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection. Its first event is `Connected`.
    pub fn connect(&self) -> Arc<MemoryRelayTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayEvent::Connected);

        let mut state = self.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(id, tx);

        Arc::new(MemoryRelayTransport {
            id,
            broker: self.clone(),
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, HashSet::len)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, topic: &str, payload: Bytes) {
        let state = self.lock();
        let Some(subscribers) = state.topics.get(topic) else {
            return;
        };
        trace!(%topic, subscribers = subscribers.len(), "Delivering");
        for client in subscribers {
            if let Some(tx) = state.clients.get(client) {
                let _ = tx.send(RelayEvent::Message {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn send_event(&self, client: u64, event: RelayEvent) {
        if let Some(tx) = self.lock().clients.get(&client) {
            let _ = tx.send(event);
        }
    }

    fn disconnect(&self, client: u64) -> Option<mpsc::UnboundedSender<RelayEvent>> {
        let mut state = self.lock();
        for subscribers in state.topics.values_mut() {
            subscribers.remove(&client);
        }
        state.topics.retain(|_, subscribers| !subscribers.is_empty());
        state.clients.remove(&client)
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

pub struct MemoryRelayTransport {
    id: u64,
    broker: MemoryBroker,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    closed: AtomicBool,
}

impl MemoryRelayTransport {
    /// Report a relay-side error to this client, as a flaky broker would.
    pub fn inject_error(&self, reason: &str) {
        self.broker.send_event(self.id, RelayEvent::Error(reason.to_owned()));
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("relay connection closed");
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelayTransport {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.broker
            .lock()
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(self.id);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.broker.publish(topic, payload);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.broker.disconnect(self.id) {
            let _ = tx.send(RelayEvent::Disconnected("closed by client".into()));
        }
    }
}
