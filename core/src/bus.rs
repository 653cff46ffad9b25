// Message bus contract, in-process implementation, and agent outboxes
use crate::message::{DeliveryMode, Envelope, Message};
use crate::{Result, WarrenError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport between the runtime and the rest of the system.
///
/// Publication is fire-and-forget from the caller's side. Events reach every
/// subscriber of [`DeliveryMode::Event`]; tasks reach exactly one subscriber
/// of [`DeliveryMode::Task`].
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish_event(&self, envelope: Envelope) -> Result<()>;
    async fn enqueue_task(&self, envelope: Envelope) -> Result<()>;
    async fn subscribe(&self, mode: DeliveryMode) -> Result<(String, mpsc::Receiver<Envelope>)>;
    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    sender: mpsc::Sender<Envelope>,
}

/// Bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped: u64,
}

/// In-process bus backed by bounded tokio channels.
pub struct InMemoryBus {
    // Mode -> subscriber list
    subscriptions: Arc<DashMap<DeliveryMode, Vec<Subscription>>>,
    stats: Arc<DashMap<DeliveryMode, BusStats>>,
    next_task_subscriber: AtomicUsize,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
            next_task_subscriber: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn stats(&self, mode: DeliveryMode) -> BusStats {
        self.stats.get(&mode).map(|s| s.clone()).unwrap_or_default()
    }

    fn update_stats<F>(&self, mode: DeliveryMode, f: F)
    where
        F: FnOnce(&mut BusStats),
    {
        f(self.stats.entry(mode).or_default().value_mut())
    }

    fn senders(&self, mode: DeliveryMode) -> Vec<Subscription> {
        self.subscriptions
            .get(&mode)
            .map(|subs| subs.value().clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish_event(&self, envelope: Envelope) -> Result<()> {
        debug!(id = %envelope.id, origin = ?envelope.origin, "Publishing event");
        self.update_stats(DeliveryMode::Event, |s| s.total_published += 1);

        // Snapshot subscribers so no map guard is held across await points
        let subs = self.senders(DeliveryMode::Event);
        if subs.is_empty() {
            debug!("No event subscribers");
        }
        let mut delivered = 0;
        let mut dropped = 0;
        for sub in subs {
            match sub.sender.send(envelope.clone()).await {
                Ok(_) => delivered += 1,
                Err(_) => {
                    dropped += 1;
                    warn!("Failed to deliver event to subscription {}", sub.id);
                }
            }
        }
        self.update_stats(DeliveryMode::Event, |s| {
            s.total_delivered += delivered;
            s.dropped += dropped;
        });
        Ok(())
    }

    async fn enqueue_task(&self, envelope: Envelope) -> Result<()> {
        debug!(id = %envelope.id, origin = ?envelope.origin, "Enqueueing task");
        self.update_stats(DeliveryMode::Task, |s| s.total_published += 1);

        let subs = self.senders(DeliveryMode::Task);
        if subs.is_empty() {
            self.update_stats(DeliveryMode::Task, |s| s.dropped += 1);
            return Err(WarrenError::Bus("no task subscribers".to_string()));
        }

        // Round-robin; skip subscribers whose receiver is gone
        let start = self.next_task_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut envelope = envelope;
        for offset in 0..subs.len() {
            let sub = &subs[(start + offset) % subs.len()];
            match sub.sender.send(envelope).await {
                Ok(_) => {
                    self.update_stats(DeliveryMode::Task, |s| s.total_delivered += 1);
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => {
                    warn!("Task subscription {} closed", sub.id);
                    envelope = returned;
                }
            }
        }
        self.update_stats(DeliveryMode::Task, |s| s.dropped += 1);
        Err(WarrenError::Bus("all task subscribers closed".to_string()))
    }

    async fn subscribe(&self, mode: DeliveryMode) -> Result<(String, mpsc::Receiver<Envelope>)> {
        let subscription_id = format!("sub_{:?}_{}", mode, uuid::Uuid::new_v4()).to_lowercase();
        let (tx, rx) = mpsc::channel(self.capacity);

        self.subscriptions
            .entry(mode)
            .or_default()
            .push(Subscription {
                id: subscription_id.clone(),
                sender: tx,
            });
        self.update_stats(mode, |s| s.active_subscriptions += 1);

        info!("Created subscription {} for {:?} delivery", subscription_id, mode);
        Ok((subscription_id, rx))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|sub| sub.id != subscription_id);
            let removed = before - entry.value().len();
            if removed > 0 {
                self.update_stats(*entry.key(), |s| {
                    s.active_subscriptions = s.active_subscriptions.saturating_sub(removed);
                });
            }
        }

        info!("Unsubscribed {}", subscription_id);
        Ok(())
    }
}

/// Handle an agent uses to emit messages.
///
/// Sends never block and never fail from the agent's point of view. Messages
/// from one agent leave in the order they were enqueued.
#[derive(Debug, Clone)]
pub struct Outbox {
    agent_id: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn new(agent_id: impl Into<String>, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tx,
        }
    }

    /// An outbox not wired to any bus; the receiver sees everything sent.
    pub fn detached(agent_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(agent_id, tx), rx)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn publish_event(&self, message: Message) {
        self.send(DeliveryMode::Event, message)
    }

    pub fn enqueue_task(&self, message: Message) {
        self.send(DeliveryMode::Task, message)
    }

    fn send(&self, mode: DeliveryMode, message: Message) {
        let envelope = Envelope::new(mode, Some(self.agent_id.clone()), message);
        if self.tx.send(envelope).is_err() {
            warn!(agent_id = %self.agent_id, "Outbox closed, dropping outbound message");
        }
    }
}
