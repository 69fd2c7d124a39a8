//! Persisted resource state
//!
//! [`State`] is the in-memory record the engines work with. [`StoredState`] is
//! the same record after the codec has turned every value field into a
//! JSON-safe tree; it is what state stores read and write.

use crate::codec::{self, SerializeOptions};
use crate::error::Result;
use crate::scope::Scope;
use crate::value::{Key, Object, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Checkpointed before the first create call
    Creating,
    /// Create finished
    Created,
    /// Checkpointed before an update call
    Updating,
    /// Update finished
    Updated,
    /// Checkpointed before the delete call
    Deleting,
    /// Delete finished; such records are removed rather than stored
    Deleted,
}

impl ResourceStatus {
    /// Whether the last create/update ran to completion
    pub fn is_settled(&self) -> bool {
        matches!(self, ResourceStatus::Created | ResourceStatus::Updated)
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Creating => write!(f, "creating"),
            ResourceStatus::Created => write!(f, "created"),
            ResourceStatus::Updating => write!(f, "updating"),
            ResourceStatus::Updated => write!(f, "updated"),
            ResourceStatus::Deleting => write!(f, "deleting"),
            ResourceStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// State of a single resource
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub status: ResourceStatus,

    /// Provider type tag (e.g. "cloudflare::Worker")
    pub kind: String,

    /// Caller-chosen id, unique within the scope
    pub id: String,

    pub fqn: String,

    /// Declaration order within the scope
    pub seq: u64,

    /// Last applied input properties
    pub props: Value,

    /// Props of the previous successful apply
    pub old_props: Option<Value>,

    /// Provider result; `None` until the first create finishes
    pub output: Option<Value>,

    /// Provider-private scratch space
    pub data: Object,

    pub updated_at: DateTime<Utc>,
}

impl State {
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        fqn: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            status: ResourceStatus::Creating,
            kind: kind.into(),
            id: id.into(),
            fqn: fqn.into(),
            seq,
            props: Value::Null,
            old_props: None,
            output: None,
            data: Object::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn set_status(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Look up a `data` entry
    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.data.get(&Key::Name(key.to_string()))
    }

    /// Encode every value field through the codec
    pub async fn to_stored(&self, scope: &Scope) -> Result<StoredState> {
        let output = match &self.output {
            Some(output) => Some(codec::serialize(scope, output, SerializeOptions::default()).await?),
            None => None,
        };
        let old_props = match &self.old_props {
            Some(old) => Some(codec::serialize(scope, old, SerializeOptions::default()).await?),
            None => None,
        };
        Ok(StoredState {
            status: self.status,
            kind: self.kind.clone(),
            id: self.id.clone(),
            fqn: self.fqn.clone(),
            seq: self.seq,
            props: codec::serialize(scope, &self.props, SerializeOptions::default()).await?,
            old_props,
            output,
            data: codec::serialize(
                scope,
                &Value::Object(self.data.clone()),
                SerializeOptions::default(),
            )
            .await?,
            updated_at: self.updated_at,
        })
    }
}

/// A [`State`] whose value fields are codec trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub status: ResourceStatus,
    pub kind: String,
    pub id: String,
    pub fqn: String,
    pub seq: u64,
    pub props: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_props: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl StoredState {
    /// Decode the value fields, resolving `@scope` to `scope`
    pub async fn into_state(self, scope: &Scope) -> Result<State> {
        let output = match &self.output {
            Some(tree) => Some(codec::deserialize(scope, tree).await?),
            None => None,
        };
        let old_props = match &self.old_props {
            Some(tree) => Some(codec::deserialize(scope, tree).await?),
            None => None,
        };
        let data = match codec::deserialize(scope, &self.data).await? {
            Value::Object(map) => map,
            _ => Object::new(),
        };
        Ok(State {
            status: self.status,
            kind: self.kind,
            id: self.id,
            fqn: self.fqn,
            seq: self.seq,
            props: codec::deserialize(scope, &self.props).await?,
            old_props,
            output,
            data,
            updated_at: self.updated_at,
        })
    }

    /// Whether any value field holds a secret marker
    pub fn contains_secret(&self) -> bool {
        codec::contains_secret(&self.props)
            || codec::contains_secret(&self.data)
            || self.old_props.as_ref().is_some_and(codec::contains_secret)
            || self.output.as_ref().is_some_and(codec::contains_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::RootOptions;
    use serde_json::json;

    #[test]
    fn test_status_display() {
        assert_eq!(ResourceStatus::Creating.to_string(), "creating");
        assert_eq!(ResourceStatus::Updated.to_string(), "updated");
        assert!(ResourceStatus::Created.is_settled());
        assert!(!ResourceStatus::Updating.is_settled());
    }

    #[tokio::test]
    async fn test_stored_state_round_trip() {
        let scope = Scope::root(RootOptions::new("dev"));
        let mut state = State::new("test::Bucket", "assets", "dev/assets", 3)
            .with_status(ResourceStatus::Created)
            .with_props(Value::from(json!({"name": "assets"})))
            .with_output(Value::from(json!({"url": "https://assets"})));
        state
            .data
            .insert(Key::Name("etag".into()), Value::from("abc"));

        let stored = state.to_stored(&scope).await.unwrap();
        let text = serde_json::to_string_pretty(&stored).unwrap();
        assert!(text.contains("\"status\": \"created\""));
        assert!(!text.contains("old_props"));

        let parsed: StoredState = serde_json::from_str(&text).unwrap();
        let restored = parsed.into_state(&scope).await.unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_stored_state_secret_detection() {
        let stored = StoredState {
            status: ResourceStatus::Created,
            kind: "k".into(),
            id: "a".into(),
            fqn: "dev/a".into(),
            seq: 0,
            props: json!({"token": {"@secret": "abc"}}),
            old_props: None,
            output: None,
            data: json!({}),
            updated_at: Utc::now(),
        };
        assert!(stored.contains_secret());
    }
}
