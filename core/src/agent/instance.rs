use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityLog;
use crate::config::AgentConfig;
use crate::message::Envelope;
use crate::storage::{Serializer, StateRepository};
use crate::{Result, WarrenError};

use super::capability::{Agent, Capabilities};
use super::options::OptionsSlot;

/// Result of offering one message or tick to one agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Handler ran and any state change was persisted.
    Handled,
    /// The agent lacks the role or its predicate declined.
    Declined,
    /// Handler failed; in-memory state was rolled back, nothing persisted.
    Failed(String),
    /// Handler succeeded but the state could not be saved. The in-memory
    /// state keeps the change.
    Unpersisted(String),
}

impl Outcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled | Outcome::Unpersisted(_))
    }
}

pub(crate) type EventReply = oneshot::Sender<(String, Outcome)>;
pub(crate) type TaskReply = oneshot::Sender<Option<(String, Outcome)>>;

/// Per-instance mailbox size used unless the runtime is told otherwise.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Unit of work queued in an instance's mailbox.
pub(crate) enum Work {
    Event {
        envelope: Arc<Envelope>,
        reply: Option<EventReply>,
    },
    /// Offered to this instance first, then to `remaining` in order until one
    /// accepts.
    Task {
        envelope: Arc<Envelope>,
        remaining: VecDeque<Arc<AgentInstance>>,
        reply: Option<TaskReply>,
    },
    /// A scheduled check. Ticks carry no reply and hold the instance's
    /// pending-check flag until they have run.
    Check {
        reply: Option<oneshot::Sender<Outcome>>,
    },
    Close,
}

struct Hosted {
    agent: Box<dyn Agent>,
    started: bool,
    stopped: bool,
}

/// One configured agent plus the runtime machinery around it.
///
/// Every entry point takes the instance lock, so the agent itself only ever
/// runs one call at a time. Messages and scheduler ticks share one bounded
/// mailbox and are handled in arrival order by a dedicated worker task.
pub struct AgentInstance {
    config: AgentConfig,
    capabilities: Capabilities,
    default_interval: Option<Duration>,
    options: Arc<dyn OptionsSlot>,
    hosted: Mutex<Hosted>,
    mailbox: mpsc::Sender<Work>,
    inbox: std::sync::Mutex<Option<mpsc::Receiver<Work>>>,
    check_pending: AtomicBool,
    repository: Arc<dyn StateRepository>,
    serializer: Arc<dyn Serializer>,
    activity: Arc<ActivityLog>,
}

impl AgentInstance {
    pub(crate) fn new(
        config: AgentConfig,
        mut agent: Box<dyn Agent>,
        options: Arc<dyn OptionsSlot>,
        repository: Arc<dyn StateRepository>,
        serializer: Arc<dyn Serializer>,
        activity: Arc<ActivityLog>,
        mailbox_capacity: usize,
    ) -> Self {
        let capabilities = Capabilities::of(agent.as_mut());
        // Registration-time query, allowed before start
        let default_interval = agent.as_scheduled().map(|s| s.default_interval());
        let (mailbox, inbox) = mpsc::channel(mailbox_capacity.max(1));

        Self {
            config,
            capabilities,
            default_interval,
            options,
            hosted: Mutex::new(Hosted {
                agent,
                started: false,
                stopped: false,
            }),
            mailbox,
            inbox: std::sync::Mutex::new(Some(inbox)),
            check_pending: AtomicBool::new(false),
            repository,
            serializer,
            activity,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Period between checks: the configured override, else the agent's
    /// default. `None` for agents without the scheduled role.
    pub fn check_interval(&self) -> Option<Duration> {
        if !self.capabilities.scheduled {
            return None;
        }
        self.config
            .schedule_ms
            .map(Duration::from_millis)
            .or(self.default_interval)
    }

    /// Source filter. An agent never hears its own messages; an empty
    /// source list accepts every other origin.
    pub fn accepts_origin(&self, origin: Option<&str>) -> bool {
        if origin == Some(self.id()) {
            return false;
        }
        if self.config.source_ids.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.config.source_ids.contains(o))
    }

    pub fn options(&self) -> Result<Value> {
        self.options.current()
    }

    pub fn options_schema(&self) -> Result<Value> {
        self.options.schema()
    }

    /// Re-validates and atomically swaps the options snapshot.
    pub fn update_options(&self, value: Value) -> Result<()> {
        self.options.replace(value)?;
        info!(agent_id = %self.id(), "Options updated");
        Ok(())
    }

    /// Live state if the agent has started, otherwise whatever is persisted.
    pub async fn state(&self) -> Result<Option<Value>> {
        if !self.capabilities.stateful {
            return Ok(None);
        }
        let mut hosted = self.hosted.lock().await;
        if hosted.started {
            if let Some(state) = hosted.agent.as_stateful() {
                return state.state_value().map(Some);
            }
        }
        match self.repository.load(self.id()).await? {
            Some(bytes) => Ok(Some(self.serializer.from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn handle_event(&self, envelope: &Envelope) -> Outcome {
        let mut hosted = self.hosted.lock().await;
        if hosted.stopped {
            return Outcome::Declined;
        }
        self.ensure_started(&mut hosted).await;

        let accepted = match hosted.agent.as_event_consumer() {
            Some(consumer) => consumer.can_consume(&envelope.message),
            None => false,
        };
        if !accepted {
            debug!(agent_id = %self.id(), envelope_id = %envelope.id, "Event declined");
            return Outcome::Declined;
        }

        self.activity.record_incoming(self.id(), envelope);
        let checkpoint = checkpoint(&mut hosted);
        let result = match hosted.agent.as_event_consumer() {
            Some(consumer) => guarded(consumer.consume(&envelope.message)).await,
            None => Ok(()),
        };
        self.settle(&mut hosted, checkpoint, result, "consume", Some(envelope))
            .await
    }

    pub async fn handle_task(&self, envelope: &Envelope) -> Outcome {
        let mut hosted = self.hosted.lock().await;
        if hosted.stopped {
            return Outcome::Declined;
        }
        self.ensure_started(&mut hosted).await;

        let accepted = match hosted.agent.as_task_consumer() {
            Some(worker) => worker.can_work_on(&envelope.message),
            None => false,
        };
        if !accepted {
            return Outcome::Declined;
        }

        self.activity.record_incoming(self.id(), envelope);
        let checkpoint = checkpoint(&mut hosted);
        let result = match hosted.agent.as_task_consumer() {
            Some(worker) => guarded(worker.work_on(&envelope.message)).await,
            None => Ok(()),
        };
        self.settle(&mut hosted, checkpoint, result, "work_on", Some(envelope))
            .await
    }

    async fn run_check(&self) -> Outcome {
        let mut hosted = self.hosted.lock().await;
        if hosted.stopped || !self.capabilities.scheduled {
            return Outcome::Declined;
        }
        self.ensure_started(&mut hosted).await;

        self.activity.record_check(self.id());
        let checkpoint = checkpoint(&mut hosted);
        let result = match hosted.agent.as_scheduled() {
            Some(scheduled) => guarded(scheduled.check()).await,
            None => Ok(()),
        };
        self.settle(&mut hosted, checkpoint, result, "check", None)
            .await
    }

    /// Gives a started stateful agent its `stop()` call and a final save.
    /// Every later call is declined.
    pub async fn stop(&self) -> Outcome {
        let mut hosted = self.hosted.lock().await;
        if hosted.stopped {
            return Outcome::Declined;
        }
        hosted.stopped = true;
        if !hosted.started {
            return Outcome::Declined;
        }
        match hosted.agent.as_stateful() {
            Some(state) => state.shutdown(),
            None => return Outcome::Handled,
        }
        match self.persist(&mut hosted).await {
            Ok(()) => {
                debug!(agent_id = %self.id(), "Agent stopped, state flushed");
                Outcome::Handled
            }
            Err(e) => self.persistence_failed(e),
        }
    }

    async fn ensure_started(&self, hosted: &mut Hosted) {
        if hosted.started {
            return;
        }
        hosted.started = true;
        if !self.capabilities.stateful {
            return;
        }

        let loaded = match self.repository.load(self.id()).await {
            Ok(Some(bytes)) => match self.serializer.from_bytes(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(agent_id = %self.id(), error = %e, "Persisted state unreadable, using default");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(agent_id = %self.id(), error = %e, "State load failed, using default");
                None
            }
        };

        if let Some(state) = hosted.agent.as_stateful() {
            if let Err(e) = state.start_from(loaded) {
                warn!(agent_id = %self.id(), error = %e, "Persisted state does not fit, using default");
                if let Err(e) = state.start_from(None) {
                    error!(agent_id = %self.id(), error = %e, "Agent failed to start from default state");
                }
            }
        }
        debug!(agent_id = %self.id(), "Agent started");
    }

    async fn persist(&self, hosted: &mut Hosted) -> Result<()> {
        let Some(state) = hosted.agent.as_stateful() else {
            return Ok(());
        };
        let value = state.state_value()?;
        let bytes = self.serializer.to_bytes(&value)?;
        self.repository.save(self.id(), bytes).await
    }

    async fn settle(
        &self,
        hosted: &mut Hosted,
        checkpoint: Option<Box<dyn Any + Send>>,
        result: std::result::Result<(), String>,
        context: &str,
        envelope: Option<&Envelope>,
    ) -> Outcome {
        match result {
            Ok(()) => match self.persist(hosted).await {
                Ok(()) => Outcome::Handled,
                Err(e) => self.persistence_failed(e),
            },
            Err(reason) => {
                if let (Some(checkpoint), Some(state)) = (checkpoint, hosted.agent.as_stateful()) {
                    state.rollback(checkpoint);
                }
                let err = WarrenError::HandlerFailure {
                    agent_id: self.id().to_string(),
                    context: context.to_string(),
                    reason,
                };
                error!(
                    agent_id = %self.id(),
                    context,
                    envelope_id = envelope.map(|e| e.id.as_str()).unwrap_or("-"),
                    payload = ?envelope.map(|e| &e.message),
                    error = %err,
                    "Agent handler failed"
                );
                self.activity.record_failure(self.id(), &err.to_string());
                Outcome::Failed(err.to_string())
            }
        }
    }

    fn persistence_failed(&self, e: WarrenError) -> Outcome {
        let err = match e {
            WarrenError::PersistenceFailure(_) => e,
            other => WarrenError::PersistenceFailure(other.to_string()),
        };
        error!(agent_id = %self.id(), error = %err, "State save failed");
        self.activity.record_failure(self.id(), &err.to_string());
        Outcome::Unpersisted(err.to_string())
    }

    /// Queues a scheduler tick behind everything already in the mailbox.
    ///
    /// Returns `false` when the tick is skipped: the agent is not scheduled,
    /// an earlier tick has not run yet, or the mailbox is full or closed.
    pub fn request_check(&self) -> bool {
        if !self.capabilities.scheduled {
            return false;
        }
        if self.check_pending.swap(true, Ordering::AcqRel) {
            debug!(agent_id = %self.id(), "Previous check still pending, tick skipped");
            return false;
        }
        match self.mailbox.try_send(Work::Check { reply: None }) {
            Ok(()) => true,
            Err(e) => {
                self.check_pending.store(false, Ordering::Release);
                if let TrySendError::Full(_) = e {
                    warn!(agent_id = %self.id(), "Mailbox full, tick skipped");
                }
                false
            }
        }
    }

    /// Queues a check behind everything already in the mailbox and waits for
    /// its outcome. Unlike scheduler ticks these are never skipped. Needs a
    /// started runtime to drain the mailbox.
    pub async fn check_and_wait(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        if self.post(Work::Check { reply: Some(tx) }).await.is_err() {
            return Outcome::Declined;
        }
        rx.await.unwrap_or(Outcome::Declined)
    }

    /// Queues work for the mailbox worker, waiting while the mailbox is full.
    /// Gives the work back if the mailbox is closed.
    pub(crate) async fn post(&self, work: Work) -> std::result::Result<(), Work> {
        if self.mailbox.capacity() == 0 {
            debug!(agent_id = %self.id(), "Mailbox full, applying backpressure");
        }
        self.mailbox.send(work).await.map_err(|e| e.0)
    }

    /// Spawns the mailbox worker. Only the first call spawns; the worker
    /// exits after draining everything queued before [`Work::Close`].
    pub(crate) fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run_mailbox(inbox).await }))
    }

    async fn run_mailbox(self: Arc<Self>, mut inbox: mpsc::Receiver<Work>) {
        debug!(agent_id = %self.id(), "Mailbox worker started");
        while let Some(work) = inbox.recv().await {
            match work {
                Work::Event { envelope, reply } => {
                    let outcome = self.handle_event(&envelope).await;
                    if let Some(reply) = reply {
                        let _ = reply.send((self.id().to_string(), outcome));
                    }
                }
                Work::Task {
                    envelope,
                    remaining,
                    reply,
                } => {
                    let outcome = self.handle_task(&envelope).await;
                    if outcome == Outcome::Declined {
                        // Forwarding must not block this worker on a full mailbox
                        tokio::spawn(offer_task(envelope, remaining, reply));
                    } else if let Some(reply) = reply {
                        let _ = reply.send(Some((self.id().to_string(), outcome)));
                    }
                }
                Work::Check { reply } => {
                    let outcome = self.run_check().await;
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(outcome);
                        }
                        None => self.check_pending.store(false, Ordering::Release),
                    }
                }
                Work::Close => break,
            }
        }
        debug!(agent_id = %self.id(), "Mailbox worker stopped");
    }
}

/// Hands a task to the first candidate whose mailbox is open. The candidate
/// passes it on if it declines.
pub(crate) async fn offer_task(
    mut envelope: Arc<Envelope>,
    mut remaining: VecDeque<Arc<AgentInstance>>,
    mut reply: Option<TaskReply>,
) {
    while let Some(next) = remaining.pop_front() {
        let work = Work::Task {
            envelope,
            remaining,
            reply,
        };
        match next.post(work).await {
            Ok(()) => return,
            Err(Work::Task {
                envelope: e,
                remaining: r,
                reply: rp,
            }) => {
                envelope = e;
                remaining = r;
                reply = rp;
            }
            Err(_) => return,
        }
    }
    debug!(envelope_id = %envelope.id, "No agent accepted task");
    if let Some(reply) = reply {
        let _ = reply.send(None);
    }
}

fn checkpoint(hosted: &mut Hosted) -> Option<Box<dyn Any + Send>> {
    hosted.agent.as_stateful().map(|s| s.checkpoint())
}

/// Runs a handler future, turning errors and panics into a failure reason.
async fn guarded<F>(handler: F) -> std::result::Result<(), String>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_reason(panic.as_ref())),
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
