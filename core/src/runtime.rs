//! Runtime wiring: bus ⇄ dispatcher ⇄ agent pool, plus scheduler and outbox pump.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::agent::{AgentPool, KindRegistry, PoolWiring, Work, DEFAULT_MAILBOX_CAPACITY};
use crate::bus::{Bus, InMemoryBus};
use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;
use crate::message::{DeliveryMode, Envelope};
use crate::scheduler::Scheduler;
use crate::storage::{InMemoryStateRepository, JsonSerializer, Serializer, StateRepository};
use crate::Result;

/// Collects collaborators and agent configuration, then builds a [`Runtime`].
pub struct RuntimeBuilder {
    registry: KindRegistry,
    agents: Vec<AgentConfig>,
    repository: Option<Arc<dyn StateRepository>>,
    serializer: Option<Arc<dyn Serializer>>,
    bus: Option<Arc<dyn Bus>>,
    mailbox_capacity: usize,
}

impl RuntimeBuilder {
    pub fn new(registry: KindRegistry) -> Self {
        Self {
            registry,
            agents: Vec::new(),
            repository: None,
            serializer: None,
            bus: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    pub fn agent(mut self, config: AgentConfig) -> Self {
        self.agents.push(config);
        self
    }

    pub fn agents(mut self, configs: impl IntoIterator<Item = AgentConfig>) -> Self {
        self.agents.extend(configs);
        self
    }

    /// Defaults to an in-memory repository.
    pub fn repository(mut self, repository: Arc<dyn StateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Defaults to JSON.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Defaults to an in-process bus.
    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Messages each instance may have queued before dispatch waits.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Builds the agent pool. Unknown kinds, invalid options and duplicate
    /// ids are start-up faults.
    pub fn build(self) -> Result<Runtime> {
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryStateRepository::new()));
        let serializer = self.serializer.unwrap_or_else(|| Arc::new(JsonSerializer));
        let bus = self.bus.unwrap_or_else(|| Arc::new(InMemoryBus::new()));
        let activity = Arc::new(ActivityLog::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let wiring = PoolWiring {
            repository: Arc::clone(&repository),
            serializer: Arc::clone(&serializer),
            activity: Arc::clone(&activity),
            outbound: outbound_tx,
            mailbox_capacity: self.mailbox_capacity,
        };
        let pool = Arc::new(AgentPool::build(self.agents, &self.registry, &wiring)?);

        Ok(Runtime {
            dispatcher: Dispatcher::new(Arc::clone(&pool)),
            scheduler: Scheduler::new(Arc::clone(&pool)),
            pool,
            bus,
            repository,
            serializer,
            activity,
            outbound_rx: Some(outbound_rx),
            workers: Vec::new(),
            inbound: Vec::new(),
            pump: None,
        })
    }
}

/// Core runtime
pub struct Runtime {
    pool: Arc<AgentPool>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    bus: Arc<dyn Bus>,
    repository: Arc<dyn StateRepository>,
    serializer: Arc<dyn Serializer>,
    activity: Arc<ActivityLog>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    workers: Vec<JoinHandle<()>>,
    inbound: Vec<JoinHandle<()>>,
    pump: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Runtime {
    pub fn builder(registry: KindRegistry) -> RuntimeBuilder {
        RuntimeBuilder::new(registry)
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository> {
        &self.repository
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Warren runtime...");

        for instance in self.pool.iter() {
            if let Some(handle) = instance.spawn_worker() {
                self.workers.push(handle);
            }
        }

        if let Some(outbound_rx) = self.outbound_rx.take() {
            let (stop_tx, stop_rx) = oneshot::channel();
            let handle = tokio::spawn(pump_outbound(
                outbound_rx,
                stop_rx,
                Arc::clone(&self.pool),
                Arc::clone(&self.bus),
                Arc::clone(&self.activity),
            ));
            self.pump = Some((stop_tx, handle));
        }

        let consumes_events = self.pool.iter().any(|a| a.capabilities().event_consumer);
        let consumes_tasks = self.pool.iter().any(|a| a.capabilities().task_consumer);
        for (mode, wanted) in [
            (DeliveryMode::Event, consumes_events),
            (DeliveryMode::Task, consumes_tasks),
        ] {
            if !wanted {
                continue;
            }
            let (_sub_id, mut rx) = self.bus.subscribe(mode).await?;
            let dispatcher = self.dispatcher.clone();
            self.inbound.push(tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    dispatcher.dispatch(envelope).await;
                }
            }));
        }

        self.scheduler.start();

        info!(agents = self.pool.len(), "Warren runtime started");
        Ok(())
    }

    /// Stops scheduling, drains every mailbox, then stops each agent and
    /// flushes its state.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down Warren runtime...");

        self.scheduler.shutdown().await;

        // Inbound loops first so nothing new lands in the mailboxes
        for task in &self.inbound {
            task.abort();
        }
        for task in self.inbound.drain(..) {
            let _ = task.await;
        }
        if !self.workers.is_empty() {
            for instance in self.pool.iter() {
                let _ = instance.post(Work::Close).await;
            }
        }
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        for instance in self.pool.iter() {
            instance.stop().await;
        }

        // Flush whatever the agents queued on their way out
        if let Some((stop_tx, handle)) = self.pump.take() {
            let _ = stop_tx.send(());
            let _ = handle.await;
        }

        info!("Warren runtime shut down");
        Ok(())
    }
}

/// Moves agent outboxes onto the bus, one message at a time, so each
/// agent's messages keep their enqueue order.
async fn pump_outbound(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut stop_rx: oneshot::Receiver<()>,
    pool: Arc<AgentPool>,
    bus: Arc<dyn Bus>,
    activity: Arc<ActivityLog>,
) {
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Some(envelope) => forward(envelope, &pool, bus.as_ref(), &activity).await,
                None => return,
            },
            _ = &mut stop_rx => break,
        }
    }
    while let Ok(envelope) = rx.try_recv() {
        forward(envelope, &pool, bus.as_ref(), &activity).await;
    }
}

async fn forward(envelope: Envelope, pool: &AgentPool, bus: &dyn Bus, activity: &ActivityLog) {
    let origin = envelope.origin.clone().unwrap_or_default();
    let allowed = pool
        .get(&origin)
        .is_some_and(|a| a.capabilities().event_publisher);
    if !allowed {
        warn!(agent_id = %origin, "Agent is not a publisher, dropping outbound message");
        return;
    }

    activity.record_outgoing(&origin, &envelope);
    let result = match envelope.mode {
        DeliveryMode::Event => bus.publish_event(envelope).await,
        DeliveryMode::Task => bus.enqueue_task(envelope).await,
    };
    if let Err(e) = result {
        warn!(agent_id = %origin, error = %e, "Failed to hand outbound message to bus");
    }
}
