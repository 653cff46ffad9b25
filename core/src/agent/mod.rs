//! Agent hosting, split into smaller files for readability.
//! - capability.rs: role traits (Agent, Stateful, EventConsumer, ...) and flags
//! - options.rs: hot-swappable option snapshots
//! - kind.rs: AgentKind trait and the kind registry
//! - instance.rs: AgentInstance (lock, state lifecycle, mailbox worker)
//! - pool.rs: AgentPool registry

mod capability;
mod instance;
mod kind;
mod options;
mod pool;

pub use capability::{
    Agent, Capabilities, EventConsumer, ScheduledCheck, StateHandle, Stateful, TaskConsumer,
};
pub use instance::{AgentInstance, Outcome, DEFAULT_MAILBOX_CAPACITY};
pub use kind::{AgentContext, AgentKind, KindRegistry};
pub use options::{Options, OptionsSlot};
pub use pool::AgentPool;

pub(crate) use instance::{offer_task, Work};
pub(crate) use pool::PoolWiring;
