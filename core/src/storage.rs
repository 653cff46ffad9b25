//! Agent state persistence.
//!
//! Two contracts meet here:
//! - [`Serializer`] turns a state value into bytes and back.
//! - [`StateRepository`] stores those bytes per agent id.
//!
//! Repositories are byte-level and know nothing about agent types; the typed
//! default for a missing entry is produced by the agent's [`Stateful`] impl.
//!
//! [`Stateful`]: crate::agent::Stateful

use crate::{Result, WarrenError};
use async_trait::async_trait;
use dashmap::DashMap;
use rocksdb::{Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Byte encoding for agent state.
///
/// Operates on `serde_json::Value` so the runtime can hold serializers as
/// trait objects; use [`encode`] / [`decode`] for typed values.
pub trait Serializer: Send + Sync {
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>>;
    fn from_bytes(&self, bytes: &[u8]) -> Result<Value>;
}

pub fn encode<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    serializer.to_bytes(&serde_json::to_value(value)?)
}

pub fn decode<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_value(serializer.from_bytes(bytes)?)?)
}

/// UTF-8 JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Durable per-agent state store.
///
/// Callers serialize access per agent id, so implementations only need to be
/// safe across different ids. A completed `save` must be visible to the next
/// `load`.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Returns `None` when nothing has been persisted for `agent_id`.
    async fn load(&self, agent_id: &str) -> Result<Option<Vec<u8>>>;
    async fn save(&self, agent_id: &str, bytes: Vec<u8>) -> Result<()>;
    async fn delete(&self, agent_id: &str) -> Result<()>;
}

fn state_key(agent_id: &str) -> String {
    format!("agent_state:{}", agent_id)
}

/// Persistent storage using RocksDB
pub struct RocksDbStateRepository {
    db: DB,
}

impl RocksDbStateRepository {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| WarrenError::PersistenceFailure(e.to_string()))?;

        info!(path = %path.as_ref().display(), "State repository opened");
        Ok(Self { db })
    }
}

#[async_trait]
impl StateRepository for RocksDbStateRepository {
    async fn load(&self, agent_id: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(state_key(agent_id))
            .map_err(|e| WarrenError::PersistenceFailure(e.to_string()))
    }

    async fn save(&self, agent_id: &str, bytes: Vec<u8>) -> Result<()> {
        debug!(agent_id, len = bytes.len(), "Saving agent state");
        self.db
            .put(state_key(agent_id), bytes)
            .map_err(|e| WarrenError::PersistenceFailure(e.to_string()))
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.db
            .delete(state_key(agent_id))
            .map_err(|e| WarrenError::PersistenceFailure(e.to_string()))
    }
}

/// Process-local repository; state is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryStateRepository {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn load(&self, agent_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(agent_id).map(|e| e.value().clone()))
    }

    async fn save(&self, agent_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.entries.insert(agent_id.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.entries.remove(agent_id);
        Ok(())
    }
}
