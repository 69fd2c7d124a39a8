//! The context a handler runs with

use crate::error::Result;
use crate::resource::{Event, HandlerOutcome};
use crate::scope::Scope;
use crate::state::State;
use crate::value::{Key, Value};

/// Everything a handler may see or touch during one call
pub struct Context {
    scope: Scope,
    event: Event,
    state: State,
    replace: bool,
}

impl Context {
    pub(crate) fn new(scope: Scope, event: Event, state: State) -> Self {
        Self {
            scope,
            event,
            state,
            replace: false,
        }
    }

    pub fn event(&self) -> Event {
        self.event
    }

    pub fn stage(&self) -> &str {
        self.scope.stage()
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn fqn(&self) -> &str {
        &self.state.fqn
    }

    pub fn kind(&self) -> &str {
        &self.state.kind
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Props the handler was called with
    pub fn props(&self) -> &Value {
        &self.state.props
    }

    /// Output of the previous successful apply; `None` on create
    pub fn output(&self) -> Option<&Value> {
        self.state.output.as_ref()
    }

    /// Props of the previous successful apply; `None` on create
    pub fn old_props(&self) -> Option<&Value> {
        self.state.old_props.as_ref()
    }

    /// Ask the engine to delete the current instance and create a new one.
    ///
    /// Only honoured during an update. Whatever the handler returns from the
    /// update call is discarded; the engine then calls it with a delete event
    /// for the old props and a create event for the new ones.
    pub fn replace(&mut self) {
        if self.replace {
            tracing::warn!("replace() already requested for {}", self.state.fqn);
            return;
        }
        self.replace = true;
    }

    pub fn is_replacing(&self) -> bool {
        self.replace
    }

    /// Read a provider-private `data` entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get_data(key)
    }

    /// Store a provider-private `data` entry; persisted immediately
    pub async fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.state
            .data
            .insert(Key::Name(key.to_string()), value.into());
        self.scope.save_state(&self.state).await
    }

    /// Remove a provider-private `data` entry; persisted immediately
    pub async fn delete(&mut self, key: &str) -> Result<Option<Value>> {
        let removed = self.state.data.shift_remove(&Key::Name(key.to_string()));
        if removed.is_some() {
            self.scope.save_state(&self.state).await?;
        }
        Ok(removed)
    }

    /// Terminal result of a delete handler
    pub fn destroy(&self) -> HandlerOutcome {
        HandlerOutcome::Deleted
    }

    pub(crate) fn finish(self) -> (State, bool) {
        (self.state, self.replace)
    }
}
