use crate::backend;
use serde_json::Value as Json;
use statecraft_core::Scope;
use statecraft_core::codec::{TAG_SECRET, TAG_SECRET_PLAINTEXT};
use statecraft_core::store::is_reserved_id;

const REDACTED: &str = "<redacted>";

pub async fn handle(root: &Scope, scope_path: Option<&str>, id: &str) -> anyhow::Result<()> {
    let scope = backend::resolve_scope(root, scope_path)?;
    if is_reserved_id(id) {
        anyhow::bail!("'{}' はエンジン管理用のIDです", id);
    }

    let record = scope.store().get(id).await?.ok_or_else(|| {
        anyhow::anyhow!(
            "リソース '{}' がスコープ '{}' に見つかりません",
            id,
            scope.chain().join("/")
        )
    })?;

    crate::print_scope_header(scope.chain());
    println!();
    let tree = redact_secrets(serde_json::to_value(&record)?);
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

/// シークレットの値を伏せ字に置き換える
fn redact_secrets(tree: Json) -> Json {
    match tree {
        Json::Object(map) => {
            if map.len() == 1
                && (map.contains_key(TAG_SECRET) || map.contains_key(TAG_SECRET_PLAINTEXT))
            {
                return Json::String(REDACTED.to_string());
            }
            Json::Object(
                map.into_iter()
                    .map(|(key, value)| (key, redact_secrets(value)))
                    .collect(),
            )
        }
        Json::Array(items) => Json::Array(items.into_iter().map(redact_secrets).collect()),
        other => other,
    }
}
