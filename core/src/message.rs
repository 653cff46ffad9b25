//! Messages exchanged between the bus and agents.
//!
//! A [`Message`] is a flat string map and is immutable once built. The bus
//! wraps it in an [`Envelope`] carrying delivery metadata the runtime uses for
//! routing (mode, origin) but agents never see.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable string-keyed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    data: HashMap<String, String>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the message with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn data(&self) -> &HashMap<String, String> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Parses `key` as a float. Missing, unparseable and non-finite values
    /// all read as `None`.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|s| s.trim().parse::<i64>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Message
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// How the bus delivers a message: broadcast to every interested consumer, or
/// point-to-point to a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Event,
    Task,
}

/// Bus-owned delivery metadata around a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub mode: DeliveryMode,
    /// Agent that emitted the message; `None` for messages from outside the
    /// runtime.
    pub origin: Option<String>,
    pub published_at: DateTime<Utc>,
    pub message: Message,
}

impl Envelope {
    pub fn new(mode: DeliveryMode, origin: Option<String>, message: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            origin,
            published_at: Utc::now(),
            message,
        }
    }

    pub fn event(message: Message) -> Self {
        Self::new(DeliveryMode::Event, None, message)
    }

    pub fn task(message: Message) -> Self {
        Self::new(DeliveryMode::Task, None, message)
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.origin = Some(agent_id.into());
        self
    }
}
