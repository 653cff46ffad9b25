use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use warren_core::agents::GeofencingKind;
use warren_core::{
    Agent, AgentConfig, AgentContext, AgentKind, Bus, Clock, DeliveryMode, Envelope,
    EventConsumer, InMemoryBus, KindRegistry, ManualClock, Message, Outbox, Result, Runtime,
    WarrenError,
};

fn fence_config() -> AgentConfig {
    AgentConfig::new(
        "home-fence",
        "geofencing",
        json!({
            "circle_fence": {
                "id": "home",
                "center": { "lat": 59.9139, "lon": 10.7522 },
                "radius": 200.0,
                "entering_description": "Welcome home",
                "leaving_description": "See you later"
            },
            "leaving_grace_ms": 60000,
            "arriving_grace_ms": 30000
        }),
    )
    .with_sources(["phone"])
    // Checks are driven by hand below
    .with_schedule_ms(3_600_000)
}

async fn next_from(
    rx: &mut mpsc::Receiver<Envelope>,
    origin: &str,
) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let envelope = tokio::time::timeout_at(deadline, rx.recv()).await.ok()??;
        if envelope.origin.as_deref() == Some(origin) {
            return Some(envelope);
        }
    }
}

async fn wait_for_mode(runtime: &Runtime, mode: &str) -> Result<()> {
    let instance = runtime.pool().require("home-fence")?;
    for _ in 0..100 {
        if let Some(state) = instance.state().await? {
            if state["mode"] == mode {
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(WarrenError::Bus(format!("agent never reached {}", mode)))
}

#[tokio::test]
async fn crossing_travels_from_bus_to_bus() -> Result<()> {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    ));
    let shared: Arc<dyn Clock> = clock.clone();
    let mut registry = KindRegistry::new();
    registry.register(GeofencingKind::with_clock(shared));

    let bus = Arc::new(InMemoryBus::new());
    let mut runtime = Runtime::builder(registry)
        .agent(fence_config())
        .bus(bus.clone())
        .build()?;
    runtime.start().await?;

    let (_sub, mut observed) = bus.subscribe(DeliveryMode::Event).await?;

    bus.publish_event(
        Envelope::event(
            Message::new()
                .with("lat", "59.9140")
                .with("lon", "10.7521"),
        )
        .from_agent("phone"),
    )
    .await?;
    wait_for_mode(&runtime, "Arriving").await?;

    clock.advance(chrono::Duration::seconds(30));
    let outcome = runtime.pool().require("home-fence")?.check_and_wait().await;
    assert!(outcome.is_handled());

    let crossing = next_from(&mut observed, "home-fence")
        .await
        .expect("crossing published on the bus");
    assert_eq!(crossing.message.get("state"), Some("In"));
    assert_eq!(crossing.message.get("fence"), Some("home"));
    assert_eq!(crossing.message.get("description"), Some("Welcome home"));

    let summary = runtime.activity().summary("home-fence");
    assert_eq!(summary.incoming_count, 1);
    assert_eq!(summary.outgoing_count, 1);
    assert!(summary.last_event_out.is_some());

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn events_from_unlisted_sources_are_ignored() -> Result<()> {
    let bus = Arc::new(InMemoryBus::new());
    let mut runtime = Runtime::builder(warren_core::agents::builtin_registry())
        .agent(fence_config())
        .bus(bus.clone())
        .build()?;
    runtime.start().await?;

    bus.publish_event(
        Envelope::event(
            Message::new()
                .with("lat", "59.9140")
                .with("lon", "10.7521"),
        )
        .from_agent("stranger"),
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let instance = runtime.pool().require("home-fence")?;
    assert_eq!(runtime.activity().summary("home-fence").incoming_count, 0);
    // Never started, nothing persisted
    assert_eq!(instance.state().await?, None);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn options_update_is_validated_and_applied() -> Result<()> {
    let runtime = Runtime::builder(warren_core::agents::builtin_registry())
        .agent(fence_config())
        .build()?;
    let instance = runtime.pool().require("home-fence")?;

    let mut options = instance.options()?;
    options["circle_fence"]["center"]["lat"] = json!(123.0);
    assert!(matches!(
        instance.update_options(options),
        Err(WarrenError::InvalidOptions(_))
    ));
    assert_eq!(instance.options()?["circle_fence"]["center"]["lat"], 59.9139);

    let mut options = instance.options()?;
    options["arriving_grace_ms"] = json!(1000);
    instance.update_options(options)?;
    assert_eq!(instance.options()?["arriving_grace_ms"], 1000);
    Ok(())
}

#[test]
fn build_rejects_bad_configuration() {
    let registry = warren_core::agents::builtin_registry;

    let unknown = Runtime::builder(registry())
        .agent(AgentConfig::new("x", "teleporter", json!({})))
        .build();
    assert!(matches!(unknown, Err(WarrenError::UnknownKind(_))));

    let duplicate = Runtime::builder(registry())
        .agent(fence_config())
        .agent(fence_config())
        .build();
    assert!(matches!(duplicate, Err(WarrenError::DuplicateAgent(_))));

    let mut bad = fence_config();
    bad.options["circle_fence"]["radius"] = json!(0);
    let invalid = Runtime::builder(registry()).agent(bad).build();
    assert!(matches!(invalid, Err(WarrenError::InvalidOptions(_))));
}

// Sends through its outbox without declaring itself a publisher
struct Chatty {
    outbox: Outbox,
}

#[async_trait]
impl EventConsumer for Chatty {
    fn can_consume(&self, _message: &Message) -> bool {
        true
    }

    async fn consume(&mut self, message: &Message) -> Result<()> {
        self.outbox.publish_event(message.clone().with("echo", "1"));
        Ok(())
    }
}

impl Agent for Chatty {
    fn as_event_consumer(&mut self) -> Option<&mut dyn EventConsumer> {
        Some(self)
    }
}

struct ChattyKind;

impl AgentKind for ChattyKind {
    type Options = serde_json::Value;

    fn name(&self) -> &'static str {
        "chatty"
    }

    fn build(&self, ctx: AgentContext<serde_json::Value>) -> Result<Box<dyn Agent>> {
        Ok(Box::new(Chatty { outbox: ctx.outbox }))
    }
}

#[tokio::test]
async fn messages_from_non_publishers_are_dropped() -> Result<()> {
    let mut registry = KindRegistry::new();
    registry.register(ChattyKind);
    let bus = Arc::new(InMemoryBus::new());
    let mut runtime = Runtime::builder(registry)
        .agent(AgentConfig::new("chatty", "chatty", json!({})))
        .bus(bus.clone())
        .build()?;
    runtime.start().await?;

    let (_sub, mut observed) = bus.subscribe(DeliveryMode::Event).await?;
    bus.publish_event(Envelope::event(Message::new().with("hello", "world")))
        .await?;

    assert!(next_from(&mut observed, "chatty").await.is_none());
    assert_eq!(runtime.activity().summary("chatty").incoming_count, 1);
    assert_eq!(runtime.activity().summary("chatty").outgoing_count, 0);

    runtime.shutdown().await?;
    Ok(())
}
