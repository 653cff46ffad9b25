use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{Message, Result};

/// A hosted unit of behavior.
///
/// Each role is optional. An agent opts into a role by implementing the role
/// trait and returning `Some(self)` from the matching accessor; the runtime
/// asks once at registration and never assumes a role it was not given.
///
/// All entry points of one instance are serialized by the runtime, so
/// implementations can mutate `self` freely.
pub trait Agent: Send + 'static {
    fn as_stateful(&mut self) -> Option<&mut dyn StateHandle> {
        None
    }

    fn as_event_consumer(&mut self) -> Option<&mut dyn EventConsumer> {
        None
    }

    fn as_task_consumer(&mut self) -> Option<&mut dyn TaskConsumer> {
        None
    }

    fn as_scheduled(&mut self) -> Option<&mut dyn ScheduledCheck> {
        None
    }

    /// Whether the agent emits messages through its outbox.
    fn publishes_events(&self) -> bool {
        false
    }
}

/// Broadcast event handling.
#[async_trait]
pub trait EventConsumer: Send {
    /// Must be cheap and side-effect free. Returning `false` for messages
    /// with missing or unparseable fields is how malformed input is ignored.
    fn can_consume(&self, message: &Message) -> bool;
    async fn consume(&mut self, message: &Message) -> Result<()>;
}

/// Point-to-point work items.
#[async_trait]
pub trait TaskConsumer: Send {
    fn can_work_on(&self, task: &Message) -> bool;
    async fn work_on(&mut self, task: &Message) -> Result<()>;
}

/// Periodic work, independent of message traffic.
#[async_trait]
pub trait ScheduledCheck: Send {
    /// Read once at registration, before the agent is started, so it must
    /// not depend on state. A configured `schedule_ms` takes precedence.
    fn default_interval(&self) -> Duration;
    async fn check(&mut self) -> Result<()>;
}

/// Typed durable state.
///
/// The runtime loads the state before the first handler call and hands it
/// over through [`start`](Stateful::start); a missing entry yields
/// `State::default()`. After each successful handler the value returned by
/// [`state`](Stateful::state) is persisted.
pub trait Stateful: Send {
    type State: Serialize + DeserializeOwned + Default + Clone + Send + 'static;

    fn state(&self) -> &Self::State;
    fn state_mut(&mut self) -> &mut Self::State;

    fn start(&mut self, state: Self::State) {
        *self.state_mut() = state;
    }

    /// Last call before shutdown; the state is persisted right after.
    fn stop(&mut self) {}
}

/// Type-erased view of a [`Stateful`] agent, used by the runtime.
pub trait StateHandle: Send {
    /// Starts the agent from a decoded state value, or the default if `None`.
    fn start_from(&mut self, value: Option<Value>) -> Result<()>;
    fn state_value(&self) -> Result<Value>;
    fn checkpoint(&self) -> Box<dyn Any + Send>;
    fn rollback(&mut self, checkpoint: Box<dyn Any + Send>);
    fn shutdown(&mut self);
}

impl<T: Stateful> StateHandle for T {
    fn start_from(&mut self, value: Option<Value>) -> Result<()> {
        let state = match value {
            Some(v) => serde_json::from_value::<T::State>(v)?,
            None => T::State::default(),
        };
        self.start(state);
        Ok(())
    }

    fn state_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.state())?)
    }

    fn checkpoint(&self) -> Box<dyn Any + Send> {
        Box::new(self.state().clone())
    }

    fn rollback(&mut self, checkpoint: Box<dyn Any + Send>) {
        if let Ok(state) = checkpoint.downcast::<T::State>() {
            *self.state_mut() = *state;
        }
    }

    fn shutdown(&mut self) {
        Stateful::stop(self)
    }
}

/// Roles an agent declared at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub stateful: bool,
    pub event_consumer: bool,
    pub event_publisher: bool,
    pub task_consumer: bool,
    pub scheduled: bool,
}

impl Capabilities {
    pub fn of(agent: &mut dyn Agent) -> Self {
        Self {
            stateful: agent.as_stateful().is_some(),
            event_consumer: agent.as_event_consumer().is_some(),
            event_publisher: agent.publishes_events(),
            task_consumer: agent.as_task_consumer().is_some(),
            scheduled: agent.as_scheduled().is_some(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.stateful {
            names.push("stateful");
        }
        if self.event_consumer {
            names.push("event_consumer");
        }
        if self.event_publisher {
            names.push("event_publisher");
        }
        if self.task_consumer {
            names.push("task_consumer");
        }
        if self.scheduled {
            names.push("scheduled");
        }
        names
    }
}
