//! Hot-swappable option snapshots.
//!
//! Agents read options through [`Options`], which always yields a complete
//! immutable snapshot. An update replaces the snapshot as a whole; fields are
//! never mutated in place.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::{Result, WarrenError};

use super::kind::AgentKind;

/// Read side of an agent's options.
#[derive(Debug)]
pub struct Options<O> {
    rx: watch::Receiver<Arc<O>>,
}

impl<O> Clone for Options<O> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<O> Options<O> {
    /// Options that will never be updated.
    pub fn fixed(options: O) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(options));
        Self { rx }
    }

    pub fn current(&self) -> Arc<O> {
        self.rx.borrow().clone()
    }
}

/// Runtime-side handle over one agent's options, independent of their type.
pub trait OptionsSlot: Send + Sync {
    fn current(&self) -> Result<Value>;
    /// Validates `value` against the options type and swaps it in.
    fn replace(&self, value: Value) -> Result<()>;
    fn schema(&self) -> Result<Value>;
}

pub(crate) struct TypedOptions<K: AgentKind> {
    kind: Arc<K>,
    tx: watch::Sender<Arc<K::Options>>,
}

impl<K: AgentKind> TypedOptions<K> {
    /// Parses and validates the initial options, returning the slot and the
    /// reader handed to the agent.
    pub(crate) fn create(kind: Arc<K>, value: Value) -> Result<(Self, Options<K::Options>)> {
        let options = parse::<K>(&kind, value)?;
        let (tx, rx) = watch::channel(Arc::new(options));
        Ok((Self { kind, tx }, Options { rx }))
    }
}

fn parse<K: AgentKind>(kind: &K, value: Value) -> Result<K::Options> {
    let options: K::Options =
        serde_json::from_value(value).map_err(|e| WarrenError::InvalidOptions(e.to_string()))?;
    kind.validate(&options)?;
    Ok(options)
}

impl<K: AgentKind> OptionsSlot for TypedOptions<K> {
    fn current(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.tx.borrow().as_ref())?)
    }

    fn replace(&self, value: Value) -> Result<()> {
        let options = parse::<K>(&self.kind, value)?;
        self.tx.send_replace(Arc::new(options));
        Ok(())
    }

    fn schema(&self) -> Result<Value> {
        Ok(serde_json::to_value(schemars::schema_for!(K::Options))?)
    }
}
