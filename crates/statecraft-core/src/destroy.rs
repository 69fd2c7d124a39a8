//! Destroy engine
//!
//! Deletes resources through their handlers and removes their records.
//! Scopes are torn down in reverse declaration order so dependents go before
//! the resources they were built on.

use crate::context::Context;
use crate::error::{Result, StatecraftError};
use crate::resource::{Event, ResourceRef, SCOPE_KIND};
use crate::scope::{Scope, ScopeOptions};
use crate::state::ResourceStatus;
use crate::store::SALT_ID;
use crate::value::Value;
use futures_util::future::{BoxFuture, join_all};
use tracing::{debug, error, info};

/// Order in which the members of a scope are deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyStrategy {
    /// One at a time, highest sequence number first
    #[default]
    Sequential,
    /// All at once
    Parallel,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    pub strategy: DestroyStrategy,
    /// Keep going after a failure and report every failure at the end
    pub best_effort: bool,
}

impl DestroyOptions {
    pub fn parallel() -> Self {
        Self {
            strategy: DestroyStrategy::Parallel,
            ..Default::default()
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

/// Delete one resource of `scope` by id. Deleting a missing resource is a no-op.
pub async fn destroy_resource(scope: &Scope, id: &str, opts: &DestroyOptions) -> Result<()> {
    let Some(mut state) = scope.get_state(id).await? else {
        debug!("{} is already gone", scope.fqn(id));
        return Ok(());
    };

    if state.kind == SCOPE_KIND {
        let child = scope.child(id, ScopeOptions::default())?;
        destroy_scope(&child, opts).await?;
        return scope.delete_state(id).await;
    }

    let handler = scope
        .registry()
        .get(&state.kind)
        .ok_or_else(|| StatecraftError::UnknownResourceKind(state.kind.clone()))?;

    if !scope.is_quiet() {
        info!("Deleting {}", state.fqn);
    }
    state.set_status(ResourceStatus::Deleting);
    scope.save_state(&state).await?;

    let fqn = state.fqn.clone();
    let props = state.props.clone();
    let mut ctx = Context::new(scope.clone(), Event::Delete, state);
    // Either outcome means the handler finished; the record goes away
    handler.handle(&mut ctx, id, &props).await?;

    scope.delete_state(id).await?;
    if !scope.is_quiet() {
        info!("Deleted {}", fqn);
    }
    Ok(())
}

/// Delete the resource a value was returned for
pub async fn destroy_output(output: &Value, opts: &DestroyOptions) -> Result<()> {
    let resource = ResourceRef::from_output(output)
        .ok_or_else(|| StatecraftError::NotAResource(format!("{output:?}")))?;
    let scope = resource
        .scope
        .ok_or_else(|| StatecraftError::NotAResource(resource.fqn.clone()))?;
    destroy_resource(&scope, &resource.id, opts).await
}

/// Delete everything in `scope`, its child scopes included, and release its
/// store. Destroying a root scope also removes the stage's salt.
pub fn destroy_scope<'a>(scope: &'a Scope, opts: &'a DestroyOptions) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let mut members: Vec<(String, u64)> = scope
            .states()
            .await?
            .into_iter()
            .map(|(id, state)| (id, state.seq))
            .collect();
        members.sort_by(|a, b| b.1.cmp(&a.1));
        let ids: Vec<String> = members.into_iter().map(|(id, _)| id).collect();

        if !ids.is_empty() && !scope.is_quiet() {
            info!(
                "Destroying {} resource(s) in {}",
                ids.len(),
                scope.chain().join("/")
            );
        }
        destroy_ids(scope, &ids, opts).await?;

        if scope.is_root() {
            scope.store().delete(SALT_ID).await?;
            scope.reset_keys().await;
        }
        scope.store().deinit().await
    })
}

/// Delete `ids` (already in the intended order) according to `opts`
pub(crate) async fn destroy_ids(scope: &Scope, ids: &[String], opts: &DestroyOptions) -> Result<()> {
    let total = ids.len();
    let errors = match opts.strategy {
        DestroyStrategy::Sequential => {
            let mut errors = Vec::new();
            for id in ids {
                if let Err(e) = destroy_resource(scope, id, opts).await {
                    if !opts.best_effort {
                        return Err(e);
                    }
                    error!("Failed to delete {}: {}", scope.fqn(id), e);
                    errors.push(e);
                }
            }
            errors
        }
        DestroyStrategy::Parallel => {
            let results = join_all(ids.iter().map(|id| destroy_resource(scope, id, opts))).await;
            let mut errors = Vec::new();
            for (id, result) in ids.iter().zip(results) {
                if let Err(e) = result {
                    error!("Failed to delete {}: {}", scope.fqn(id), e);
                    errors.push(e);
                }
            }
            if !opts.best_effort && !errors.is_empty() {
                return Err(errors.swap_remove(0));
            }
            errors
        }
    };
    StatecraftError::aggregate(errors, total)
}
