// Inbound message routing
//
// Events fan out to every accepting event consumer; tasks go to the first
// accepting task consumer in id order. The dispatcher only decides who is
// offered a message; the instance's mailbox worker evaluates the predicate
// and runs the handler under the instance lock.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agent::{offer_task, AgentInstance, AgentPool, Outcome, Work};
use crate::message::{DeliveryMode, Envelope};

#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<AgentPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        Self { pool }
    }

    /// Queues `envelope` for every eligible instance and returns without
    /// waiting for handlers; only a full mailbox holds it up. Returns how
    /// many instances were offered it.
    pub async fn dispatch(&self, envelope: Envelope) -> usize {
        let envelope = Arc::new(envelope);
        match envelope.mode {
            DeliveryMode::Event => {
                let targets = self.event_targets(&envelope);
                let mut offered = 0;
                for target in targets {
                    let work = Work::Event {
                        envelope: Arc::clone(&envelope),
                        reply: None,
                    };
                    if target.post(work).await.is_ok() {
                        offered += 1;
                    } else {
                        warn!(agent_id = %target.id(), "Mailbox closed, event not delivered");
                    }
                }
                debug!(envelope_id = %envelope.id, offered, "Event dispatched");
                offered
            }
            DeliveryMode::Task => {
                let candidates = self.task_candidates(&envelope);
                let offered = candidates.len();
                offer_task(envelope, candidates, None).await;
                offered
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch) but waits for every offered
    /// instance to finish, returning `(agent_id, outcome)` pairs. For a task
    /// at most one pair is returned: the instance that took it.
    pub async fn dispatch_and_wait(&self, envelope: Envelope) -> Vec<(String, Outcome)> {
        let envelope = Arc::new(envelope);
        match envelope.mode {
            DeliveryMode::Event => {
                let mut pending = Vec::new();
                for target in self.event_targets(&envelope) {
                    let (tx, rx) = oneshot::channel();
                    let work = Work::Event {
                        envelope: Arc::clone(&envelope),
                        reply: Some(tx),
                    };
                    if target.post(work).await.is_ok() {
                        pending.push(rx);
                    }
                }
                join_all(pending)
                    .await
                    .into_iter()
                    .filter_map(|r| r.ok())
                    .collect()
            }
            DeliveryMode::Task => {
                let candidates = self.task_candidates(&envelope);
                let (tx, rx) = oneshot::channel();
                offer_task(envelope, candidates, Some(tx)).await;
                rx.await.ok().flatten().into_iter().collect()
            }
        }
    }

    fn event_targets(&self, envelope: &Envelope) -> Vec<Arc<AgentInstance>> {
        self.pool
            .iter()
            .filter(|a| a.capabilities().event_consumer)
            .filter(|a| a.accepts_origin(envelope.origin.as_deref()))
            .cloned()
            .collect()
    }

    fn task_candidates(&self, envelope: &Envelope) -> VecDeque<Arc<AgentInstance>> {
        self.pool
            .iter()
            .filter(|a| a.capabilities().task_consumer)
            .filter(|a| a.accepts_origin(envelope.origin.as_deref()))
            .cloned()
            .collect()
    }
}
