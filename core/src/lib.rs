// Warren Core Library
// Agent dispatch-and-state runtime

pub mod activity;
pub mod admin;
pub mod agent;
pub mod agents;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

// Export core types
pub use activity::{ActivityLog, ActivitySummary};
pub use agent::{
    Agent, AgentContext, AgentInstance, AgentKind, AgentPool, Capabilities, EventConsumer,
    KindRegistry, Options, Outcome, ScheduledCheck, StateHandle, Stateful, TaskConsumer,
    DEFAULT_MAILBOX_CAPACITY,
};
pub use bus::{Bus, InMemoryBus, Outbox};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, RuntimeConfig};
pub use dispatcher::Dispatcher;
pub use message::{DeliveryMode, Envelope, Message};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::Scheduler;
pub use storage::{
    InMemoryStateRepository, JsonSerializer, RocksDbStateRepository, Serializer, StateRepository,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WarrenError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Agent {agent_id} failed during {context}: {reason}")]
    HandlerFailure {
        agent_id: String,
        context: String,
        reason: String,
    },

    #[error("Persistence error: {0}")]
    PersistenceFailure(String),

    #[error("No configuration for agent {0}")]
    ConfigurationNotFound(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Unknown agent kind: {0}")]
    UnknownKind(String),

    #[error("Agent {0} configured more than once")]
    DuplicateAgent(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WarrenError>;
