// Per-agent activity log
//
// Records what flowed in and out of each agent so the admin API can show
// message logs and summary counters. Purely observational: nothing in the
// dispatch path reads it back.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::message::{DeliveryMode, Envelope, Message};

const MAX_RECENT_MESSAGES: usize = 50;

/// One logged message with the time the runtime saw it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub occurred: DateTime<Utc>,
    pub mode: DeliveryMode,
    pub message: Message,
}

/// Summary counters for a single agent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub incoming_count: u64,
    pub outgoing_count: u64,
    pub failure_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_event_in: Option<DateTime<Utc>>,
    pub last_event_out: Option<DateTime<Utc>>,
    pub last_task_in: Option<DateTime<Utc>>,
    pub last_task_out: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentLog {
    pub summary: ActivitySummary,
    pub incoming: VecDeque<LoggedMessage>,
    pub outgoing: VecDeque<LoggedMessage>,
}

fn push_recent(list: &mut VecDeque<LoggedMessage>, entry: LoggedMessage) {
    if list.len() >= MAX_RECENT_MESSAGES {
        list.pop_front();
    }
    list.push_back(entry);
}

#[derive(Debug, Default)]
pub struct ActivityLog {
    logs: DashMap<String, AgentLog>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_incoming(&self, agent_id: &str, envelope: &Envelope) {
        let now = Utc::now();
        let mut log = self.logs.entry(agent_id.to_string()).or_default();
        log.summary.incoming_count += 1;
        match envelope.mode {
            DeliveryMode::Event => log.summary.last_event_in = Some(now),
            DeliveryMode::Task => log.summary.last_task_in = Some(now),
        }
        push_recent(
            &mut log.incoming,
            LoggedMessage {
                occurred: now,
                mode: envelope.mode,
                message: envelope.message.clone(),
            },
        );
    }

    pub fn record_outgoing(&self, agent_id: &str, envelope: &Envelope) {
        let now = Utc::now();
        let mut log = self.logs.entry(agent_id.to_string()).or_default();
        log.summary.outgoing_count += 1;
        match envelope.mode {
            DeliveryMode::Event => log.summary.last_event_out = Some(now),
            DeliveryMode::Task => log.summary.last_task_out = Some(now),
        }
        push_recent(
            &mut log.outgoing,
            LoggedMessage {
                occurred: now,
                mode: envelope.mode,
                message: envelope.message.clone(),
            },
        );
    }

    pub fn record_check(&self, agent_id: &str) {
        self.logs
            .entry(agent_id.to_string())
            .or_default()
            .summary
            .last_check = Some(Utc::now());
    }

    pub fn record_failure(&self, agent_id: &str, reason: &str) {
        let mut log = self.logs.entry(agent_id.to_string()).or_default();
        log.summary.failure_count += 1;
        log.summary.last_failure = Some(reason.to_string());
    }

    /// Agents with no recorded activity get an empty log.
    pub fn get(&self, agent_id: &str) -> AgentLog {
        self.logs
            .get(agent_id)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    pub fn summary(&self, agent_id: &str) -> ActivitySummary {
        self.logs
            .get(agent_id)
            .map(|l| l.summary.clone())
            .unwrap_or_default()
    }
}
