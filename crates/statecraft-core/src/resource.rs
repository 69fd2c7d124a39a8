//! Resource handler contract and registry
//!
//! A provider plugs into the engine by implementing [`ResourceHandler`] for a
//! kind string (e.g. `"cloudflare::Worker"`) and registering it in the
//! [`ResourceRegistry`] of the root scope.

use crate::apply::{self, ApplyOptions};
use crate::context::Context;
use crate::error::Result;
use crate::scope::Scope;
use crate::value::{Symbol, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

/// Kind of the records that stand for nested scopes
pub const SCOPE_KIND: &str = "statecraft::Scope";

/// Kind of the per-stage salt record
pub const SALT_KIND: &str = "statecraft::Salt";

/// Symbol keys embedded into every object output
pub static RESOURCE_KIND: LazyLock<Symbol> =
    LazyLock::new(|| Symbol::for_name("statecraft::ResourceKind"));
pub static RESOURCE_ID: LazyLock<Symbol> =
    LazyLock::new(|| Symbol::for_name("statecraft::ResourceID"));
pub static RESOURCE_FQN: LazyLock<Symbol> =
    LazyLock::new(|| Symbol::for_name("statecraft::ResourceFQN"));
pub static RESOURCE_SCOPE: LazyLock<Symbol> =
    LazyLock::new(|| Symbol::for_name("statecraft::ResourceScope"));
pub static RESOURCE_SEQ: LazyLock<Symbol> =
    LazyLock::new(|| Symbol::for_name("statecraft::ResourceSeq"));

/// Why a handler is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Create => write!(f, "create"),
            Event::Update => write!(f, "update"),
            Event::Delete => write!(f, "delete"),
        }
    }
}

/// What a handler call produced
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// The resource exists with this output
    Output(Value),
    /// The resource is gone; only valid for [`Event::Delete`]
    Deleted,
}

impl From<Value> for HandlerOutcome {
    fn from(value: Value) -> Self {
        HandlerOutcome::Output(value)
    }
}

/// Lifecycle implementation for one resource kind
///
/// Handlers must tolerate being re-invoked with the same props after a crash:
/// the engine checkpoints before every call and does not retry on its own.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Unique kind string, e.g. "neon::Branch"
    fn kind(&self) -> &str;

    /// Create, update or delete the resource according to `ctx.event()`
    async fn handle(
        &self,
        ctx: &mut Context,
        id: &str,
        props: &Value,
    ) -> anyhow::Result<HandlerOutcome>;
}

/// Maps kind strings to handlers
#[derive(Default)]
pub struct ResourceRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ResourceHandler>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, returning the one it replaced
    pub fn register(
        &self,
        handler: impl ResourceHandler + 'static,
    ) -> Option<Arc<dyn ResourceHandler>> {
        let handler: Arc<dyn ResourceHandler> = Arc::new(handler);
        let kind = handler.kind().to_string();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let previous = handlers.insert(kind.clone(), handler);
        if previous.is_some() {
            tracing::warn!("Replaced handler for resource kind {}", kind);
        }
        previous
    }

    pub fn with(self, handler: impl ResourceHandler + 'static) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.get(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

/// Declares resources of one kind in the ambient scope
#[derive(Debug, Clone)]
pub struct Resource {
    kind: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Reconcile `id` with `props` in the current scope
    pub async fn apply(&self, id: &str, props: impl Into<Value>) -> Result<Value> {
        self.apply_with(id, props, ApplyOptions::default()).await
    }

    pub async fn apply_with(
        &self,
        id: &str,
        props: impl Into<Value>,
        opts: ApplyOptions,
    ) -> Result<Value> {
        let scope = Scope::current_or_fail()?;
        apply::apply(&scope, &self.kind, id, props.into(), opts).await
    }
}

/// Identity of a resource, read back from the fields embedded in its output
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
    pub fqn: String,
    pub seq: u64,
    pub scope: Option<Scope>,
}

impl ResourceRef {
    pub fn from_output(output: &Value) -> Option<Self> {
        let text = |symbol: &Symbol| {
            output
                .get_symbol(symbol)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Some(Self {
            kind: text(&RESOURCE_KIND)?,
            id: text(&RESOURCE_ID)?,
            fqn: text(&RESOURCE_FQN)?,
            seq: output
                .get_symbol(&RESOURCE_SEQ)
                .and_then(Value::as_u64)
                .unwrap_or_default(),
            scope: match output.get_symbol(&RESOURCE_SCOPE) {
                Some(Value::Scope(scope)) => Some(scope.clone()),
                _ => None,
            },
        })
    }
}

/// Adds the identity fields to an object output; other outputs are unchanged
pub(crate) fn embed_identity(
    mut output: Value,
    scope: &Scope,
    kind: &str,
    id: &str,
    fqn: &str,
    seq: u64,
) -> Value {
    if let Some(map) = output.as_object_mut() {
        map.insert((&*RESOURCE_KIND).into(), Value::from(kind));
        map.insert((&*RESOURCE_ID).into(), Value::from(id));
        map.insert((&*RESOURCE_FQN).into(), Value::from(fqn));
        map.insert((&*RESOURCE_SCOPE).into(), Value::Scope(scope.clone()));
        map.insert((&*RESOURCE_SEQ).into(), Value::from(seq));
    }
    output
}
