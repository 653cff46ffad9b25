use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mockall::mock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use warren_core::{
    Agent, AgentConfig, AgentContext, AgentKind, Envelope, EventConsumer, InMemoryStateRepository,
    KindRegistry, Message, Options, Outcome, Result, Runtime, ScheduledCheck, StateHandle,
    StateRepository, Stateful, TaskConsumer, WarrenError,
};

// Tracks how many handlers of one kind run at the same time
#[derive(Default)]
struct Probe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    starts: AtomicUsize,
}

impl Probe {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
struct ProbeOptions {
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    accept_tasks: bool,
    #[serde(default)]
    fail_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Seen {
    items: Vec<String>,
}

struct ProbeAgent {
    options: Options<ProbeOptions>,
    probe: Arc<Probe>,
    state: Seen,
}

impl ProbeAgent {
    async fn record(&mut self, item: &str) -> Result<()> {
        self.probe.enter();
        let options = self.options.current();
        if options.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(options.delay_ms)).await;
        }
        self.state.items.push(item.to_string());
        self.probe.exit();

        if item == "panic" {
            panic!("probe asked to panic");
        }
        if options.fail_on.as_deref() == Some(item) {
            return Err(WarrenError::MalformedMessage(format!("refusing {}", item)));
        }
        Ok(())
    }
}

impl Stateful for ProbeAgent {
    type State = Seen;

    fn state(&self) -> &Seen {
        &self.state
    }

    fn state_mut(&mut self) -> &mut Seen {
        &mut self.state
    }

    fn start(&mut self, state: Seen) {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        self.state = state;
    }
}

#[async_trait]
impl EventConsumer for ProbeAgent {
    fn can_consume(&self, message: &Message) -> bool {
        message.get("n").is_some()
    }

    async fn consume(&mut self, message: &Message) -> Result<()> {
        let item = message.get("n").unwrap_or_default().to_string();
        self.record(&item).await
    }
}

#[async_trait]
impl TaskConsumer for ProbeAgent {
    fn can_work_on(&self, task: &Message) -> bool {
        self.options.current().accept_tasks && task.get("job").is_some()
    }

    async fn work_on(&mut self, task: &Message) -> Result<()> {
        let item = task.get("job").unwrap_or_default().to_string();
        self.record(&item).await
    }
}

#[async_trait]
impl ScheduledCheck for ProbeAgent {
    fn default_interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn check(&mut self) -> Result<()> {
        self.record("check").await
    }
}

impl Agent for ProbeAgent {
    fn as_stateful(&mut self) -> Option<&mut dyn StateHandle> {
        Some(self)
    }

    fn as_event_consumer(&mut self) -> Option<&mut dyn EventConsumer> {
        Some(self)
    }

    fn as_task_consumer(&mut self) -> Option<&mut dyn TaskConsumer> {
        Some(self)
    }

    fn as_scheduled(&mut self) -> Option<&mut dyn ScheduledCheck> {
        Some(self)
    }
}

struct ProbeKind {
    probe: Arc<Probe>,
}

impl AgentKind for ProbeKind {
    type Options = ProbeOptions;

    fn name(&self) -> &'static str {
        "probe"
    }

    fn build(&self, ctx: AgentContext<ProbeOptions>) -> Result<Box<dyn Agent>> {
        Ok(Box::new(ProbeAgent {
            options: ctx.options,
            probe: Arc::clone(&self.probe),
            state: Seen::default(),
        }))
    }
}

fn probe_runtime(
    configs: Vec<AgentConfig>,
    probe: Arc<Probe>,
    repository: Arc<dyn StateRepository>,
) -> Result<Runtime> {
    let mut registry = KindRegistry::new();
    registry.register(ProbeKind { probe });
    Runtime::builder(registry)
        .agents(configs)
        .repository(repository)
        .build()
}

fn probe_config(id: &str, options: serde_json::Value) -> AgentConfig {
    AgentConfig::new(id, "probe", options)
}

fn event(n: &str) -> Envelope {
    Envelope::event(Message::new().with("n", n))
}

fn handled_ids(outcomes: &[(String, Outcome)]) -> Vec<String> {
    let mut ids: Vec<String> = outcomes
        .iter()
        .filter(|(_, o)| *o == Outcome::Handled)
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn handlers_of_one_instance_never_overlap() -> Result<()> {
    let probe = Arc::new(Probe::default());
    let mut runtime = probe_runtime(
        vec![probe_config("solo", json!({ "delay_ms": 3 })).with_schedule_ms(2)],
        Arc::clone(&probe),
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;

    let instance = Arc::clone(runtime.pool().require("solo")?);
    let checks: Vec<_> = (0..5)
        .map(|_| {
            let instance = Arc::clone(&instance);
            tokio::spawn(async move { instance.check_and_wait().await })
        })
        .collect();

    let dispatcher = runtime.dispatcher().clone();
    let events = (0..30).map(|i| dispatcher.dispatch_and_wait(event(&i.to_string())));
    let outcomes = join_all(events).await;

    for check in checks {
        let _ = check.await;
    }
    runtime.shutdown().await?;

    assert!(outcomes
        .iter()
        .all(|o| o.len() == 1 && o[0].1 == Outcome::Handled));
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(probe.calls.load(Ordering::SeqCst) >= 35);
    Ok(())
}

#[tokio::test]
async fn events_are_handled_in_arrival_order() -> Result<()> {
    let probe = Arc::new(Probe::default());
    let mut runtime = probe_runtime(
        vec![probe_config("ordered", json!({}))],
        probe,
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;

    for i in 0..20 {
        runtime.dispatcher().dispatch(event(&i.to_string())).await;
    }
    // Anything queued before this one is handled first
    runtime.dispatcher().dispatch_and_wait(event("last")).await;

    let state = runtime.pool().require("ordered")?.state().await?;
    let mut expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    expected.push("last".to_string());
    assert_eq!(state, Some(json!({ "items": expected })));

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn ticks_queue_behind_earlier_messages() -> Result<()> {
    let mut runtime = probe_runtime(
        vec![probe_config("steady", json!({ "delay_ms": 20 }))],
        Arc::new(Probe::default()),
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;
    let instance = Arc::clone(runtime.pool().require("steady")?);

    runtime.dispatcher().dispatch(event("a")).await;
    assert!(instance.request_check());
    // One tick at a time; the next is skipped until this one has run
    assert!(!instance.request_check());
    runtime.dispatcher().dispatch_and_wait(event("b")).await;

    assert_eq!(
        instance.state().await?,
        Some(json!({ "items": ["a", "check", "b"] }))
    );
    assert!(instance.request_check());

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn full_mailbox_holds_dispatch_back() -> Result<()> {
    let mut registry = KindRegistry::new();
    registry.register(ProbeKind {
        probe: Arc::new(Probe::default()),
    });
    let mut runtime = Runtime::builder(registry)
        .agent(probe_config("narrow", json!({ "delay_ms": 50 })))
        .mailbox_capacity(1)
        .build()?;
    runtime.start().await?;

    let dispatcher = runtime.dispatcher().clone();
    let sender = tokio::spawn(async move {
        for i in 0..4 {
            dispatcher.dispatch(event(&i.to_string())).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sender.is_finished(), "dispatch should wait for mailbox room");

    sender.await.expect("sender task");
    runtime.dispatcher().dispatch_and_wait(event("last")).await;
    assert_eq!(
        runtime.pool().require("narrow")?.state().await?,
        Some(json!({ "items": ["0", "1", "2", "3", "last"] }))
    );

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn registration_does_not_start_the_agent() -> Result<()> {
    let probe = Arc::new(Probe::default());
    let mut runtime = probe_runtime(
        vec![probe_config("idle", json!({}))],
        Arc::clone(&probe),
        Arc::new(InMemoryStateRepository::new()),
    )?;

    let instance = Arc::clone(runtime.pool().require("idle")?);
    assert_eq!(instance.check_interval(), Some(Duration::from_secs(3600)));
    assert_eq!(probe.starts.load(Ordering::SeqCst), 0);

    runtime.start().await?;
    runtime.dispatcher().dispatch_and_wait(event("1")).await;
    assert_eq!(probe.starts.load(Ordering::SeqCst), 1);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failing_handler_rolls_back_and_skips_persistence() -> Result<()> {
    let repository = Arc::new(InMemoryStateRepository::new());
    let mut runtime = probe_runtime(
        vec![probe_config("keeper", json!({ "fail_on": "boom" }))],
        Arc::new(Probe::default()),
        repository.clone(),
    )?;
    runtime.start().await?;
    let dispatcher = runtime.dispatcher().clone();

    let outcomes = dispatcher.dispatch_and_wait(event("1")).await;
    assert_eq!(outcomes, vec![("keeper".to_string(), Outcome::Handled)]);
    let committed = repository.load("keeper").await?.expect("state saved");

    for bad in ["boom", "panic"] {
        let outcomes = dispatcher.dispatch_and_wait(event(bad)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(
            matches!(outcomes[0].1, Outcome::Failed(_)),
            "{} should fail, got {:?}",
            bad,
            outcomes[0].1
        );
        assert_eq!(repository.load("keeper").await?, Some(committed.clone()));
    }

    let live = runtime.pool().require("keeper")?.state().await?;
    assert_eq!(live, Some(json!({ "items": ["1"] })));
    assert_eq!(runtime.activity().summary("keeper").failure_count, 2);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn persisted_bytes_match_in_memory_state() -> Result<()> {
    let repository = Arc::new(InMemoryStateRepository::new());
    let mut runtime = probe_runtime(
        vec![probe_config("mirror", json!({}))],
        Arc::new(Probe::default()),
        repository.clone(),
    )?;
    runtime.start().await?;

    for n in ["a", "b", "c"] {
        runtime.dispatcher().dispatch_and_wait(event(n)).await;

        let live = runtime
            .pool()
            .require("mirror")?
            .state()
            .await?
            .expect("started agent has state");
        let stored = repository.load("mirror").await?.expect("state saved");
        assert_eq!(runtime.serializer().to_bytes(&live)?, stored);
    }

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn source_filter_limits_who_hears_an_event() -> Result<()> {
    let mut runtime = probe_runtime(
        vec![
            probe_config("a", json!({})),
            probe_config("b", json!({})).with_sources(["a"]),
            probe_config("c", json!({})).with_sources(["x"]),
        ],
        Arc::new(Probe::default()),
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;
    let dispatcher = runtime.dispatcher().clone();

    let from_x = dispatcher.dispatch_and_wait(event("1").from_agent("x")).await;
    assert_eq!(handled_ids(&from_x), vec!["a", "c"]);

    // a never hears itself
    let from_a = dispatcher.dispatch_and_wait(event("2").from_agent("a")).await;
    assert_eq!(handled_ids(&from_a), vec!["b"]);

    let external = dispatcher.dispatch_and_wait(event("3")).await;
    assert_eq!(handled_ids(&external), vec!["a"]);

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn tasks_are_claimed_by_exactly_one_agent() -> Result<()> {
    let mut runtime = probe_runtime(
        vec![
            probe_config("w1", json!({ "accept_tasks": true })),
            probe_config("w2", json!({ "accept_tasks": true })),
            probe_config("w3", json!({ "accept_tasks": false })),
        ],
        Arc::new(Probe::default()),
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;
    let dispatcher = runtime.dispatcher().clone();

    let task = Envelope::task(Message::new().with("job", "resize"));
    let outcomes = dispatcher.dispatch_and_wait(task).await;
    assert_eq!(outcomes, vec![("w1".to_string(), Outcome::Handled)]);
    assert_eq!(runtime.pool().require("w2")?.state().await?, None);

    // w1 stops accepting; the next candidate in id order takes over
    runtime
        .pool()
        .require("w1")?
        .update_options(json!({ "accept_tasks": false }))?;
    let task = Envelope::task(Message::new().with("job", "crop"));
    let outcomes = dispatcher.dispatch_and_wait(task).await;
    assert_eq!(outcomes, vec![("w2".to_string(), Outcome::Handled)]);

    let unclaimed = Envelope::task(Message::new().with("not-a-job", "x"));
    assert!(dispatcher.dispatch_and_wait(unclaimed).await.is_empty());

    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn one_failing_agent_does_not_affect_others() -> Result<()> {
    let mut runtime = probe_runtime(
        vec![
            probe_config("fragile", json!({ "fail_on": "boom" })),
            probe_config("sturdy", json!({})),
        ],
        Arc::new(Probe::default()),
        Arc::new(InMemoryStateRepository::new()),
    )?;
    runtime.start().await?;
    let dispatcher = runtime.dispatcher().clone();

    let mut outcomes = dispatcher.dispatch_and_wait(event("boom")).await;
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    assert!(matches!(outcomes[0], (ref id, Outcome::Failed(_)) if id == "fragile"));
    assert_eq!(outcomes[1], ("sturdy".to_string(), Outcome::Handled));

    let next = dispatcher.dispatch_and_wait(event("fine")).await;
    assert_eq!(handled_ids(&next), vec!["fragile", "sturdy"]);

    runtime.shutdown().await?;
    Ok(())
}

mock! {
    pub Repo {}

    #[async_trait]
    impl StateRepository for Repo {
        async fn load(&self, agent_id: &str) -> Result<Option<Vec<u8>>>;
        async fn save(&self, agent_id: &str, bytes: Vec<u8>) -> Result<()>;
        async fn delete(&self, agent_id: &str) -> Result<()>;
    }
}

#[tokio::test]
async fn failed_save_keeps_the_in_memory_change() -> Result<()> {
    let mut repository = MockRepo::new();
    repository.expect_load().returning(|_| Ok(None));
    repository
        .expect_save()
        .returning(|_, _| Err(WarrenError::PersistenceFailure("disk full".to_string())));

    let mut runtime = probe_runtime(
        vec![probe_config("unlucky", json!({}))],
        Arc::new(Probe::default()),
        Arc::new(repository),
    )?;
    runtime.start().await?;

    let outcomes = runtime.dispatcher().dispatch_and_wait(event("1")).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1, Outcome::Unpersisted(_)));
    assert!(outcomes[0].1.is_handled());

    let live = runtime.pool().require("unlucky")?.state().await?;
    assert_eq!(live, Some(json!({ "items": ["1"] })));
    assert_eq!(runtime.activity().summary("unlucky").failure_count, 1);

    runtime.shutdown().await?;
    Ok(())
}
