#![allow(dead_code)]

use statecraft_core::store::MemoryBackend;
use statecraft_core::{
    Context, Event, HandlerOutcome, KdfParams, Resource, ResourceHandler, ResourceRegistry,
    RootOptions, StoreFactory, Value, async_trait,
};
use std::sync::{Arc, Mutex};

pub const KIND: &str = "test::Thing";

/// One handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub event: Event,
    pub id: String,
    pub props: Value,
    pub old_props: Option<Value>,
}

/// Every call the test handler received, in order
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(Event, String)> {
        self.calls()
            .into_iter()
            .map(|call| (call.event, call.id))
            .collect()
    }

    pub fn count(&self, event: Event) -> usize {
        self.calls().iter().filter(|c| c.event == event).count()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.event == Event::Delete)
            .map(|c| c.id)
            .collect()
    }

    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }
}

/// Ids whose handler calls fail until cleared, for every event or just one
#[derive(Clone, Default)]
pub struct Faults(Arc<Mutex<Vec<(String, Option<Event>)>>>);

impl Faults {
    pub fn fail(&self, id: &str) {
        self.0.lock().unwrap().push((id.to_string(), None));
    }

    pub fn fail_on(&self, id: &str, event: Event) {
        self.0.lock().unwrap().push((id.to_string(), Some(event)));
    }

    pub fn clear(&self, id: &str) {
        self.0.lock().unwrap().retain(|(failing, _)| failing != id);
    }

    fn is_failing(&self, id: &str, event: Event) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .any(|(failing, on)| failing == id && on.is_none_or(|on| on == event))
    }
}

/// Echoes `props.name` and counts its own invocations in `data`.
/// Props with `replace: true` make an update request a replacement.
pub struct TestHandler {
    journal: Journal,
    faults: Faults,
}

#[async_trait]
impl ResourceHandler for TestHandler {
    fn kind(&self) -> &str {
        KIND
    }

    async fn handle(
        &self,
        ctx: &mut Context,
        id: &str,
        props: &Value,
    ) -> anyhow::Result<HandlerOutcome> {
        self.journal.push(Call {
            event: ctx.event(),
            id: id.to_string(),
            props: props.clone(),
            old_props: ctx.old_props().cloned(),
        });
        if self.faults.is_failing(id, ctx.event()) {
            anyhow::bail!("simulated failure for {}", id);
        }

        if ctx.event() == Event::Delete {
            return Ok(ctx.destroy());
        }
        if ctx.event() == Event::Update
            && props.get("replace").and_then(Value::as_bool) == Some(true)
            && !ctx.is_replacing()
        {
            ctx.replace();
            return Ok(Value::Null.into());
        }

        let generation = ctx.get("generation").and_then(Value::as_u64).unwrap_or(0) + 1;
        ctx.set("generation", generation).await?;

        Ok(Value::object([
            ("name", props.get("name").cloned().unwrap_or_default()),
            ("event", Value::from(ctx.event().to_string())),
        ])
        .into())
    }
}

/// Backend, registry and handler bookkeeping shared by the runs of a test
pub struct Harness {
    pub memory: MemoryBackend,
    pub backend: Arc<dyn StoreFactory>,
    pub registry: Arc<ResourceRegistry>,
    pub journal: Journal,
    pub faults: Faults,
}

impl Harness {
    pub fn new() -> Self {
        let memory = MemoryBackend::new();
        Self::build(memory.clone(), Arc::new(memory))
    }

    pub fn on(backend: impl StoreFactory + 'static) -> Self {
        Self::build(MemoryBackend::new(), Arc::new(backend))
    }

    fn build(memory: MemoryBackend, backend: Arc<dyn StoreFactory>) -> Self {
        let journal = Journal::default();
        let faults = Faults::default();
        let registry = ResourceRegistry::new().with(TestHandler {
            journal: journal.clone(),
            faults: faults.clone(),
        });
        Self {
            memory,
            backend,
            registry: Arc::new(registry),
            journal,
            faults,
        }
    }

    pub fn options(&self, stage: &str) -> RootOptions {
        RootOptions::new(stage)
            .with_shared_backend(self.backend.clone())
            .with_registry(self.registry.clone())
            .with_kdf(KdfParams::light())
            .quiet(true)
    }
}

pub fn thing() -> Resource {
    Resource::new(KIND)
}

pub fn props(name: &str) -> Value {
    Value::object([("name", name)])
}

pub fn chain(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
