//! Password rotation
//!
//! Re-encrypts every secret of a stage, child scopes included, from an old
//! password to a new one. Plaintext-marked secrets are encrypted on the way.
//! Rotation does not stop at the first bad record: it rotates what it can and
//! then reports every failure together.

use crate::codec::{self, SerializeOptions};
use crate::encryption::EncryptionKeys;
use crate::error::{Result, StatecraftError};
use crate::resource::SCOPE_KIND;
use crate::scope::{Scope, ScopeOptions};
use crate::state::StoredState;
use crate::store::is_reserved_id;
use futures_util::future::BoxFuture;
use serde_json::Value as Json;
use tracing::{error, info};

/// Counts from a rotation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Scopes visited
    pub scopes: usize,
    /// Records re-encrypted
    pub rotated: usize,
    /// Records left untouched because they held no secret
    pub skipped: usize,
}

struct Rotation {
    old: EncryptionKeys,
    new: EncryptionKeys,
    report: RotationReport,
    errors: Vec<StatecraftError>,
}

/// Re-encrypt the secrets under `scope` from `old_password` to `new_password`.
///
/// Scope handles created before the rotation keep their cached keys; open a
/// new root with the new password afterwards.
pub async fn rotate_password(
    scope: &Scope,
    old_password: &str,
    new_password: &str,
) -> Result<RotationReport> {
    let mut rotation = Rotation {
        old: scope.derive_keys(old_password, false).await?,
        new: scope.derive_keys(new_password, true).await?,
        report: RotationReport::default(),
        errors: Vec::new(),
    };

    rotate_scope(scope, &mut rotation).await?;

    let Rotation { report, errors, .. } = rotation;
    info!(
        "Rotated {} record(s) across {} scope(s), {} failed",
        report.rotated,
        report.scopes,
        errors.len()
    );
    let total = report.rotated + errors.len();
    StatecraftError::aggregate(errors, total)?;
    Ok(report)
}

fn rotate_scope<'a>(scope: &'a Scope, rotation: &'a mut Rotation) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        scope.init().await?;
        rotation.report.scopes += 1;

        let mut children = Vec::new();
        for (id, record) in scope.store().all().await? {
            if is_reserved_id(&id) {
                continue;
            }
            if record.kind == SCOPE_KIND {
                children.push(id);
                continue;
            }
            if !record.contains_secret() {
                rotation.report.skipped += 1;
                continue;
            }

            let fqn = record.fqn.clone();
            let rotated = match reencrypt(scope, &rotation.old, &rotation.new, record) {
                Ok(rotated) => scope.store().set(&id, &rotated).await,
                Err(e) => Err(e),
            };
            match rotated {
                Ok(()) => rotation.report.rotated += 1,
                Err(e) => {
                    error!("Failed to rotate {}: {}", fqn, e);
                    rotation.errors.push(e);
                }
            }
        }

        for name in children {
            let child = scope.child(&name, ScopeOptions::default())?;
            rotate_scope(&child, rotation).await?;
        }
        Ok(())
    })
}

fn reencrypt(
    scope: &Scope,
    old: &EncryptionKeys,
    new: &EncryptionKeys,
    mut record: StoredState,
) -> Result<StoredState> {
    let convert = |tree: &Json| -> Result<Json> {
        let value = codec::deserialize_with_keys(scope, Some(old), tree)?;
        codec::serialize_with_keys(scope, Some(new), &value, SerializeOptions::default())
    };

    record.props = convert(&record.props)?;
    record.data = convert(&record.data)?;
    record.old_props = record.old_props.as_ref().map(convert).transpose()?;
    record.output = record.output.as_ref().map(convert).transpose()?;
    Ok(record)
}
