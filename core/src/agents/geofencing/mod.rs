//! Circle geofence agent.
//!
//! Consumes `{lat, lon}` location events and, on its periodic check, commits
//! pending transitions whose grace period has run out. Each commit publishes
//! `{fence, description, state}`.

mod fence;

pub use fence::{
    CircleFence, FenceCrossing, FenceMode, FenceState, GeoPoint, GeofencingOptions,
    EARTH_RADIUS_M, ISSUED_FENCES_LIMIT,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::agent::{
    Agent, AgentContext, AgentKind, EventConsumer, Options, ScheduledCheck, StateHandle,
    Stateful,
};
use crate::bus::Outbox;
use crate::clock::{Clock, SystemClock};
use crate::{Message, Result};

pub const KIND: &str = "geofencing";

/// Checks run every 10 s unless the agent config says otherwise.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10_000);

pub struct GeofencingAgent {
    id: String,
    options: Options<GeofencingOptions>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
    state: FenceState,
}

impl GeofencingAgent {
    pub fn new(
        id: impl Into<String>,
        options: Options<GeofencingOptions>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            outbox,
            clock,
            state: FenceState::default(),
        }
    }

    fn location(message: &Message) -> Option<GeoPoint> {
        Some(GeoPoint::new(
            message.get_f64("lat")?,
            message.get_f64("lon")?,
        ))
    }

    fn publish(&self, crossing: &FenceCrossing) {
        self.outbox.publish_event(
            Message::new()
                .with("fence", crossing.fence.clone())
                .with("description", crossing.description.clone())
                .with("state", crossing.state.to_string()),
        );
    }
}

impl Stateful for GeofencingAgent {
    type State = FenceState;

    fn state(&self) -> &FenceState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut FenceState {
        &mut self.state
    }
}

#[async_trait]
impl EventConsumer for GeofencingAgent {
    fn can_consume(&self, message: &Message) -> bool {
        Self::location(message).is_some()
    }

    async fn consume(&mut self, message: &Message) -> Result<()> {
        let Some(point) = Self::location(message) else {
            return Ok(());
        };
        let options = self.options.current();
        let inside = options.circle_fence.contains(&point);
        let before = self.state.mode;
        self.state.observe(inside, self.clock.now());

        if before != self.state.mode {
            debug!(
                agent_id = %self.id,
                fence = %options.circle_fence.id,
                from = %before,
                to = %self.state.mode,
                "Fence mode changed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledCheck for GeofencingAgent {
    fn default_interval(&self) -> Duration {
        DEFAULT_CHECK_INTERVAL
    }

    async fn check(&mut self) -> Result<()> {
        let options = self.options.current();
        if let Some(crossing) = self.state.tick(&options, self.clock.now()) {
            info!(
                agent_id = %self.id,
                fence = %crossing.fence,
                state = %crossing.state,
                "Fence crossing committed"
            );
            self.publish(&crossing);
        }
        Ok(())
    }
}

impl Agent for GeofencingAgent {
    fn as_stateful(&mut self) -> Option<&mut dyn StateHandle> {
        Some(self)
    }

    fn as_event_consumer(&mut self) -> Option<&mut dyn EventConsumer> {
        Some(self)
    }

    fn as_scheduled(&mut self) -> Option<&mut dyn ScheduledCheck> {
        Some(self)
    }

    fn publishes_events(&self) -> bool {
        true
    }
}

/// Registers as `"geofencing"`.
pub struct GeofencingKind {
    clock: Arc<dyn Clock>,
}

impl GeofencingKind {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    /// Every agent built by this kind reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for GeofencingKind {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentKind for GeofencingKind {
    type Options = GeofencingOptions;

    fn name(&self) -> &'static str {
        KIND
    }

    fn validate(&self, options: &GeofencingOptions) -> Result<()> {
        options.validate()
    }

    fn build(&self, ctx: AgentContext<GeofencingOptions>) -> Result<Box<dyn Agent>> {
        Ok(Box::new(GeofencingAgent::new(
            ctx.id,
            ctx.options,
            ctx.outbox,
            Arc::clone(&self.clock),
        )))
    }
}
