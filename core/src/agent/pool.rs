use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::activity::ActivityLog;
use crate::bus::Outbox;
use crate::config::AgentConfig;
use crate::message::Envelope;
use crate::storage::{Serializer, StateRepository};
use crate::{Result, WarrenError};

use super::instance::AgentInstance;
use super::kind::KindRegistry;

/// Shared collaborators every instance in a pool is wired to.
pub(crate) struct PoolWiring {
    pub repository: Arc<dyn StateRepository>,
    pub serializer: Arc<dyn Serializer>,
    pub activity: Arc<ActivityLog>,
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub mailbox_capacity: usize,
}

/// All configured agent instances, keyed by id.
///
/// Built once at start-up and read-only afterwards, so lookups take no lock.
pub struct AgentPool {
    agents: BTreeMap<String, Arc<AgentInstance>>,
}

impl AgentPool {
    pub(crate) fn build(
        configs: Vec<AgentConfig>,
        registry: &KindRegistry,
        wiring: &PoolWiring,
    ) -> Result<Self> {
        let mut agents = BTreeMap::new();
        for mut config in configs {
            if agents.contains_key(&config.id) {
                return Err(WarrenError::DuplicateAgent(config.id));
            }
            if config.name.is_empty() {
                config.name = config.id.clone();
            }

            let outbox = Outbox::new(config.id.clone(), wiring.outbound.clone());
            let built = registry.create(&config, outbox)?;
            let instance = AgentInstance::new(
                config,
                built.agent,
                built.options,
                Arc::clone(&wiring.repository),
                Arc::clone(&wiring.serializer),
                Arc::clone(&wiring.activity),
                wiring.mailbox_capacity,
            );

            info!(
                agent_id = %instance.id(),
                kind = %instance.kind(),
                capabilities = ?instance.capabilities().names(),
                check_interval = ?instance.check_interval(),
                "Registered agent"
            );
            agents.insert(instance.id().to_string(), Arc::new(instance));
        }
        Ok(Self { agents })
    }

    pub fn get(&self, agent_id: &str) -> Option<&Arc<AgentInstance>> {
        self.agents.get(agent_id)
    }

    pub fn require(&self, agent_id: &str) -> Result<&Arc<AgentInstance>> {
        self.get(agent_id)
            .ok_or_else(|| WarrenError::ConfigurationNotFound(agent_id.to_string()))
    }

    /// Instances in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AgentInstance>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
