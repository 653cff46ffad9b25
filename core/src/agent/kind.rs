use std::collections::BTreeMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Serialize};

use crate::bus::Outbox;
use crate::config::AgentConfig;
use crate::{Result, WarrenError};

use super::capability::Agent;
use super::options::{Options, OptionsSlot, TypedOptions};

/// Everything a kind needs to build one agent instance.
pub struct AgentContext<O> {
    pub id: String,
    pub name: String,
    pub options: Options<O>,
    pub outbox: Outbox,
}

/// A family of agents sharing one options type.
///
/// Kinds are registered explicitly in a [`KindRegistry`]; configuration
/// refers to them by [`name`](AgentKind::name).
pub trait AgentKind: Send + Sync + 'static {
    type Options: Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Checks beyond what deserialization already enforces.
    fn validate(&self, _options: &Self::Options) -> Result<()> {
        Ok(())
    }

    fn build(&self, ctx: AgentContext<Self::Options>) -> Result<Box<dyn Agent>>;
}

pub(crate) struct Built {
    pub agent: Box<dyn Agent>,
    pub options: Arc<dyn OptionsSlot>,
}

trait KindFactory: Send + Sync {
    fn create(&self, config: &AgentConfig, outbox: Outbox) -> Result<Built>;
}

struct Factory<K>(Arc<K>);

impl<K: AgentKind> KindFactory for Factory<K> {
    fn create(&self, config: &AgentConfig, outbox: Outbox) -> Result<Built> {
        let (slot, options) = TypedOptions::create(Arc::clone(&self.0), config.options.clone())
            .map_err(|e| match e {
                WarrenError::InvalidOptions(reason) => {
                    WarrenError::InvalidOptions(format!("agent {}: {}", config.id, reason))
                }
                other => other,
            })?;
        let agent = self.0.build(AgentContext {
            id: config.id.clone(),
            name: config.name.clone(),
            options,
            outbox,
        })?;
        Ok(Built {
            agent,
            options: Arc::new(slot),
        })
    }
}

/// Maps kind names to factories. Populated once at start-up.
#[derive(Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<&'static str, Arc<dyn KindFactory>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kind`, replacing any earlier kind with the same name.
    pub fn register<K: AgentKind>(&mut self, kind: K) -> &mut Self {
        let name = kind.name();
        self.kinds.insert(name, Arc::new(Factory(Arc::new(kind))));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.keys().copied().collect()
    }

    pub(crate) fn create(&self, config: &AgentConfig, outbox: Outbox) -> Result<Built> {
        let factory = self
            .kinds
            .get(config.kind.as_str())
            .ok_or_else(|| WarrenError::UnknownKind(config.kind.clone()))?;
        factory.create(config, outbox)
    }
}
