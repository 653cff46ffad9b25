// Periodic check driver
//
// One task per scheduled instance. Ticks go through the instance mailbox, so
// a check runs after every message that arrived before it. At most one tick
// per instance is in the mailbox or running; ticks that come due meanwhile
// are skipped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::{AgentInstance, AgentPool};

pub struct Scheduler {
    pool: Arc<AgentPool>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(pool: Arc<AgentPool>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            stop_tx,
            handles: Vec::new(),
        }
    }

    /// Spawns one ticker per scheduled instance. Calling it again while
    /// running does nothing.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        self.stop_tx.send_replace(false);
        for instance in self.pool.iter() {
            let Some(period) = instance.check_interval() else {
                continue;
            };
            if period.is_zero() {
                warn!(agent_id = %instance.id(), "Zero check interval, agent not scheduled");
                continue;
            }
            let stop_rx = self.stop_tx.subscribe();
            self.handles.push(tokio::spawn(run_ticker(
                Arc::clone(instance),
                period,
                stop_rx,
            )));
        }
        info!(scheduled = self.handles.len(), "Scheduler started");
    }

    /// Stops all tickers. Checks already queued or running are left to the
    /// mailbox worker.
    pub async fn shutdown(&mut self) {
        self.stop_tx.send_replace(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}

async fn run_ticker(
    instance: Arc<AgentInstance>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    // First check one full period after start
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(agent_id = %instance.id(), period_ms = period.as_millis() as u64, "Ticker started");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                instance.request_check();
            }
        }
    }
    debug!(agent_id = %instance.id(), "Ticker stopped");
}
