//! Apply engine
//!
//! Reconciles one declared resource with its persisted state. Every handler
//! call is preceded by a checkpoint, so a crash leaves a `creating` or
//! `updating` record behind and the next run resumes the same event instead
//! of starting over.

use crate::context::Context;
use crate::error::{Result, StatecraftError};
use crate::resource::{Event, HandlerOutcome, ResourceHandler, embed_identity};
use crate::scope::{Declaration, Phase, Scope};
use crate::state::{ResourceStatus, State};
use crate::value::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Call the handler even when the props did not change
    pub always_update: bool,
}

/// Reconcile resource `id` of `kind` in `scope` with `props` and return its output
pub async fn apply(
    scope: &Scope,
    kind: &str,
    id: &str,
    props: Value,
    opts: ApplyOptions,
) -> Result<Value> {
    scope.init().await?;
    let seq = scope.declare(id, kind)?;
    let result = reconcile(scope, kind, id, props, seq, &opts).await;
    scope.mark(
        id,
        if result.is_ok() {
            Declaration::Applied
        } else {
            Declaration::Failed
        },
    );
    result
}

async fn reconcile(
    scope: &Scope,
    kind: &str,
    id: &str,
    props: Value,
    seq: u64,
    opts: &ApplyOptions,
) -> Result<Value> {
    let fqn = scope.fqn(id);
    let existing = scope.get_state(id).await?;

    match scope.phase() {
        Phase::Read => {
            return existing
                .and_then(|state| state.output)
                .ok_or(StatecraftError::ResourceNotFound(fqn));
        }
        // Declarations still resolve so dependents can be built; the
        // scope deletes everything when it finalizes
        Phase::Destroy => {
            return Ok(existing.and_then(|state| state.output).unwrap_or_default());
        }
        Phase::Up => {}
    }

    let handler = scope
        .registry()
        .get(kind)
        .ok_or_else(|| StatecraftError::UnknownResourceKind(kind.to_string()))?;

    let mut state = match existing {
        Some(state) => state,
        None => {
            let state = State::new(kind, id, fqn.clone(), seq);
            scope.save_state(&state).await?;
            state
        }
    };

    if state.status.is_settled()
        && !opts.always_update
        && unchanged(scope, &state.props, &props)?
    {
        if !scope.is_quiet() {
            info!("Skipping {} (no changes)", fqn);
        }
        // Destroy order follows the latest run's declaration order
        if state.seq != seq {
            state.seq = seq;
            scope.save_state(&state).await?;
        }
        return Ok(state.output.unwrap_or_default());
    }

    let event = if state.status == ResourceStatus::Creating {
        Event::Create
    } else {
        Event::Update
    };
    let previous_props = std::mem::replace(&mut state.props, props.clone());
    // A resumed update keeps the props of the last settled apply
    if event == Event::Update && state.status.is_settled() {
        state.old_props = Some(previous_props);
    }
    state.seq = seq;
    state.set_status(match event {
        Event::Create => ResourceStatus::Creating,
        _ => ResourceStatus::Updating,
    });
    scope.save_state(&state).await?;

    if !scope.is_quiet() {
        match event {
            Event::Create => info!("Creating {}", fqn),
            _ => info!("Updating {}", fqn),
        }
    }

    let mut ctx = Context::new(scope.clone(), event, state);
    let outcome = handler.handle(&mut ctx, id, &props).await?;
    let (mut state, replace) = ctx.finish();
    let mut output = expect_output(outcome, &fqn)?;

    if replace && event == Event::Update {
        let (replaced, new_output) = replace_resource(scope, &handler, state, id, &props).await?;
        state = replaced;
        output = new_output;
    }

    state.output = Some(embed_identity(output, scope, kind, id, &fqn, state.seq));
    state.set_status(match event {
        Event::Create => ResourceStatus::Created,
        _ => ResourceStatus::Updated,
    });
    scope.save_state(&state).await?;

    if !scope.is_quiet() {
        match event {
            Event::Create => info!("Created {}", fqn),
            _ => info!("Updated {}", fqn),
        }
    }
    Ok(state.output.unwrap_or_default())
}

/// Delete the current instance with its old props, then create it anew
async fn replace_resource(
    scope: &Scope,
    handler: &Arc<dyn ResourceHandler>,
    state: State,
    id: &str,
    props: &Value,
) -> Result<(State, Value)> {
    if !scope.is_quiet() {
        info!("Replacing {}", state.fqn);
    }
    let old_props = state.old_props.clone().unwrap_or_default();
    let mut ctx = Context::new(scope.clone(), Event::Delete, state);
    handler.handle(&mut ctx, id, &old_props).await?;
    let (mut state, _) = ctx.finish();

    // The old instance is gone; from here on a crash resumes as a create
    state.output = None;
    state.set_status(ResourceStatus::Creating);
    scope.save_state(&state).await?;

    let mut ctx = Context::new(scope.clone(), Event::Create, state);
    let outcome = handler.handle(&mut ctx, id, props).await?;
    let (state, _) = ctx.finish();
    let output = expect_output(outcome, &state.fqn)?;
    Ok((state, output))
}

fn expect_output(outcome: HandlerOutcome, fqn: &str) -> Result<Value> {
    match outcome {
        HandlerOutcome::Output(output) => Ok(output),
        HandlerOutcome::Deleted => Err(StatecraftError::UnexpectedDestroy(fqn.to_string())),
    }
}

/// Structural comparison of the plaintext encodings
fn unchanged(scope: &Scope, stored: &Value, declared: &Value) -> Result<bool> {
    Ok(scope.comparable(stored)? == scope.comparable(declared)?)
}
