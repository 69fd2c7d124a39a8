//! Tagged serialization of values into JSON-safe trees
//!
//! Non-JSON variants are written as single-key tag objects:
//!
//! | Variant  | Tree                                   |
//! |----------|----------------------------------------|
//! | Secret   | `{"@secret": "<base64 ciphertext>"}`   |
//! | Date     | `{"@date": "2024-05-01T10:00:00Z"}`    |
//! | Symbol   | `{"@symbol": "Symbol(name)"}`          |
//! | Schema   | `{"@schema": { ...json schema... }}`   |
//! | Scope    | `{"@scope": null}`                     |
//!
//! Symbol object keys are written as `"Symbol(name)"` keys. Functions are
//! dropped. `@scope` always resolves to the scope doing the deserialization,
//! which keeps the otherwise cyclic scope/output graph a tree.

use crate::encryption::EncryptionKeys;
use crate::error::{Result, StatecraftError};
use crate::scope::Scope;
use crate::secret::Secret;
use crate::value::{Key, Object, Symbol, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as Json, json};

pub const TAG_SECRET: &str = "@secret";
/// Unencrypted secret marker, written only when encryption is disabled
pub const TAG_SECRET_PLAINTEXT: &str = "@secret-plaintext";
pub const TAG_DATE: &str = "@date";
pub const TAG_SYMBOL: &str = "@symbol";
pub const TAG_SCHEMA: &str = "@schema";
pub const TAG_SCOPE: &str = "@scope";

/// Called on every value before it is dispatched; returning `Some` replaces it
pub type Transform<'a> = &'a mut (dyn FnMut(&Value) -> Option<Value> + Send);

pub struct SerializeOptions<'a> {
    /// Encrypt secrets. When false they are written in clear, which is only
    /// meant for in-memory comparisons.
    pub encrypt: bool,
    pub transform: Option<Transform<'a>>,
}

impl Default for SerializeOptions<'_> {
    fn default() -> Self {
        Self {
            encrypt: true,
            transform: None,
        }
    }
}

impl SerializeOptions<'_> {
    /// Options for comparing values: secrets stay in clear, nothing is transformed
    pub fn plaintext() -> Self {
        Self {
            encrypt: false,
            transform: None,
        }
    }
}

/// Serializes `value`, fetching the scope's encryption keys when it holds secrets
pub async fn serialize(scope: &Scope, value: &Value, opts: SerializeOptions<'_>) -> Result<Json> {
    // A transform may introduce secrets the input does not hold
    let keys = if opts.encrypt && (value.contains_secret() || opts.transform.is_some()) {
        scope.encryption_keys(true).await?
    } else {
        None
    };
    serialize_with_keys(scope, keys.as_ref(), value, opts)
}

/// Serializes `value` with explicitly supplied keys
pub fn serialize_with_keys(
    scope: &Scope,
    keys: Option<&EncryptionKeys>,
    value: &Value,
    opts: SerializeOptions<'_>,
) -> Result<Json> {
    let mut serializer = Serializer {
        scope,
        keys,
        encrypt: opts.encrypt,
        transform: opts.transform,
    };
    Ok(serializer.to_tree(value)?.unwrap_or(Json::Null))
}

/// Restores a value, decrypting secrets with the scope's keys
pub async fn deserialize(scope: &Scope, tree: &Json) -> Result<Value> {
    let keys = if contains_tag(tree, TAG_SECRET) {
        scope.encryption_keys(false).await?
    } else {
        None
    };
    deserialize_with_keys(scope, keys.as_ref(), tree)
}

/// Restores a value with explicitly supplied keys
pub fn deserialize_with_keys(
    scope: &Scope,
    keys: Option<&EncryptionKeys>,
    tree: &Json,
) -> Result<Value> {
    Deserializer { scope, keys }.from_tree(tree)
}

/// Whether the tree holds an encrypted or plaintext-marked secret
pub fn contains_secret(tree: &Json) -> bool {
    contains_tag(tree, TAG_SECRET) || contains_tag(tree, TAG_SECRET_PLAINTEXT)
}

fn contains_tag(tree: &Json, tag: &str) -> bool {
    match tree {
        Json::Object(map) => {
            (map.len() == 1 && map.contains_key(tag)) || map.values().any(|v| contains_tag(v, tag))
        }
        Json::Array(items) => items.iter().any(|v| contains_tag(v, tag)),
        _ => false,
    }
}

struct Serializer<'a, 't> {
    scope: &'a Scope,
    keys: Option<&'a EncryptionKeys>,
    encrypt: bool,
    transform: Option<Transform<'t>>,
}

impl Serializer<'_, '_> {
    /// `None` means the value is dropped from the tree
    fn to_tree(&mut self, value: &Value) -> Result<Option<Json>> {
        if let Some(transform) = self.transform.as_deref_mut() {
            if let Some(replaced) = transform(value) {
                return self.dispatch(&replaced);
            }
        }
        self.dispatch(value)
    }

    fn dispatch(&mut self, value: &Value) -> Result<Option<Json>> {
        let tree = match value {
            Value::Function(_) => return Ok(None),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => Json::Number(n.clone()),
            Value::String(s) => Json::String(s.clone()),
            Value::Secret(secret) => self.secret(secret)?,
            Value::Date(date) => json!({ TAG_DATE: date.to_rfc3339_opts(SecondsFormat::AutoSi, true) }),
            Value::Symbol(symbol) => json!({ TAG_SYMBOL: symbol_name(symbol)? }),
            Value::Schema(schema) => json!({ TAG_SCHEMA: schema }),
            Value::Scope(_) => json!({ TAG_SCOPE: null }),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.to_tree(item)?.unwrap_or(Json::Null));
                }
                Json::Array(out)
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    let key = match key {
                        Key::Name(name) => name.clone(),
                        Key::Symbol(symbol) => symbol_name(symbol)?,
                    };
                    if let Some(tree) = self.to_tree(item)? {
                        out.insert(key, tree);
                    }
                }
                Json::Object(out)
            }
        };
        Ok(Some(tree))
    }

    fn secret(&self, secret: &Secret) -> Result<Json> {
        if !self.encrypt {
            return Ok(json!({ TAG_SECRET_PLAINTEXT: secret.expose() }));
        }
        let keys = self.keys.ok_or_else(|| StatecraftError::MissingPassword {
            scope: self.scope.chain().join("/"),
            action: "serialize",
        })?;
        Ok(json!({ TAG_SECRET: keys.encrypt(secret.expose())? }))
    }
}

/// `Symbol(name)` for registered symbols; unique symbols cannot be restored
fn symbol_name(symbol: &Symbol) -> Result<String> {
    match symbol.registered_name() {
        Some(_) => Ok(symbol.to_string()),
        None => Err(StatecraftError::UniqueSymbol(
            symbol.description().unwrap_or("<anonymous>").to_string(),
        )),
    }
}

fn parse_symbol(text: &str) -> Option<Symbol> {
    text.strip_prefix("Symbol(")
        .and_then(|rest| rest.strip_suffix(')'))
        .map(Symbol::for_name)
}

struct Deserializer<'a> {
    scope: &'a Scope,
    keys: Option<&'a EncryptionKeys>,
}

impl Deserializer<'_> {
    fn from_tree(&self, tree: &Json) -> Result<Value> {
        match tree {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(Value::Number(n.clone())),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => items
                .iter()
                .map(|item| self.from_tree(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some((tag, inner)) = map.iter().next() {
                        if let Some(value) = self.tagged(tag, inner)? {
                            return Ok(value);
                        }
                    }
                }
                let mut out = Object::with_capacity(map.len());
                for (key, item) in map {
                    let key = match parse_symbol(key) {
                        Some(symbol) => Key::Symbol(symbol),
                        None => Key::Name(key.clone()),
                    };
                    out.insert(key, self.from_tree(item)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    /// `None` when `tag` is an ordinary key
    fn tagged(&self, tag: &str, inner: &Json) -> Result<Option<Value>> {
        let value = match tag {
            TAG_SECRET => {
                let ciphertext = expect_str(TAG_SECRET, inner)?;
                let keys = self.keys.ok_or_else(|| StatecraftError::MissingPassword {
                    scope: self.scope.chain().join("/"),
                    action: "deserialize",
                })?;
                Value::Secret(Secret::new(keys.decrypt(ciphertext)?))
            }
            TAG_SECRET_PLAINTEXT => {
                Value::Secret(Secret::new(expect_str(TAG_SECRET_PLAINTEXT, inner)?))
            }
            TAG_DATE => {
                let text = expect_str(TAG_DATE, inner)?;
                let date = DateTime::parse_from_rfc3339(text).map_err(|e| {
                    StatecraftError::InvalidTag {
                        tag: TAG_DATE,
                        message: e.to_string(),
                    }
                })?;
                Value::Date(date.with_timezone(&Utc))
            }
            TAG_SYMBOL => {
                let text = expect_str(TAG_SYMBOL, inner)?;
                let symbol = parse_symbol(text).ok_or_else(|| StatecraftError::InvalidTag {
                    tag: TAG_SYMBOL,
                    message: format!("expected Symbol(name), got '{text}'"),
                })?;
                Value::Symbol(symbol)
            }
            TAG_SCHEMA => Value::Schema(inner.clone()),
            TAG_SCOPE => Value::Scope(self.scope.clone()),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

fn expect_str<'j>(tag: &'static str, inner: &'j Json) -> Result<&'j str> {
    inner.as_str().ok_or_else(|| StatecraftError::InvalidTag {
        tag,
        message: format!("expected a string, got {inner}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::KdfParams;
    use crate::scope::{RootOptions, Scope};
    use crate::value::Callable;
    use chrono::TimeZone;

    fn scope_with_password() -> Scope {
        Scope::root(
            RootOptions::new("test")
                .with_password("correct horse")
                .with_kdf(KdfParams::light()),
        )
    }

    #[tokio::test]
    async fn test_primitives_pass_through() {
        let scope = Scope::root(RootOptions::new("test"));
        let value = Value::from(json!({"s": "x", "n": 1, "f": 1.5, "b": true, "z": null}));
        let tree = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap();
        assert_eq!(tree, json!({"s": "x", "n": 1, "f": 1.5, "b": true, "z": null}));
        assert_eq!(deserialize(&scope, &tree).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_round_trip_of_tagged_values() {
        let scope = scope_with_password();
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut value = Value::object([
            ("token", Value::Secret(Secret::new("sk_live_abc"))),
            ("created", Value::Date(date)),
            ("marker", Value::Symbol(Symbol::for_name("test::Marker"))),
            ("schema", Value::Schema(json!({"type": "string"}))),
            ("owner", Value::Scope(scope.clone())),
            (
                "list",
                Value::Array(vec![Value::from(1i64), Value::Secret(Secret::new("n"))]),
            ),
        ]);
        value.as_object_mut().unwrap().insert(
            Key::Symbol(Symbol::for_name("test::Internal")),
            Value::from("hidden"),
        );

        let tree = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap();
        assert_eq!(tree["created"], json!({"@date": "2024-05-01T10:00:00Z"}));
        assert_eq!(tree["marker"], json!({"@symbol": "Symbol(test::Marker)"}));
        assert_eq!(tree["owner"], json!({"@scope": null}));
        assert_eq!(tree["Symbol(test::Internal)"], json!("hidden"));
        assert!(tree["token"]["@secret"].is_string());

        let restored = deserialize(&scope, &tree).await.unwrap();
        assert_eq!(restored, value);
    }

    #[tokio::test]
    async fn test_secret_is_never_in_clear() {
        let scope = scope_with_password();
        let value = Value::Secret(Secret::new("sk_live_abc"));
        let a = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap();
        let b = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap();
        assert!(!a.to_string().contains("sk_live_abc"));
        assert_ne!(a, b);
        assert_eq!(deserialize(&scope, &a).await.unwrap(), value);
        assert_eq!(deserialize(&scope, &b).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_secret_without_password_fails() {
        let scope = Scope::root(RootOptions::new("test"));
        let value = Value::object([("token", Value::Secret(Secret::new("x")))]);
        let err = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatecraftError::MissingPassword { .. }));

        let tree = json!({"token": {"@secret": "AAAA"}});
        let err = deserialize(&scope, &tree).await.unwrap_err();
        assert!(matches!(err, StatecraftError::MissingPassword { .. }));
    }

    #[tokio::test]
    async fn test_plaintext_mode_keeps_secret_in_clear() {
        let scope = Scope::root(RootOptions::new("test"));
        let value = Value::Secret(Secret::new("x"));
        let tree = serialize(&scope, &value, SerializeOptions::plaintext())
            .await
            .unwrap();
        assert_eq!(tree, json!({"@secret-plaintext": "x"}));
        assert_eq!(deserialize(&scope, &tree).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_unique_symbol_is_rejected() {
        let scope = Scope::root(RootOptions::new("test"));
        let value = Value::Symbol(Symbol::unique(Some("local")));
        let err = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatecraftError::UniqueSymbol(name) if name == "local"));
    }

    #[tokio::test]
    async fn test_functions_are_dropped() {
        let scope = Scope::root(RootOptions::new("test"));
        let f = Value::Function(Callable::new(|_| Value::Null));
        let value = Value::object([("keep", Value::from(1i64)), ("drop", f.clone())]);
        let tree = serialize(&scope, &value, SerializeOptions::default())
            .await
            .unwrap();
        assert_eq!(tree, json!({"keep": 1}));

        let list = Value::Array(vec![f, Value::from(2i64)]);
        let tree = serialize(&scope, &list, SerializeOptions::default())
            .await
            .unwrap();
        assert_eq!(tree, json!([null, 2]));
    }

    #[tokio::test]
    async fn test_scope_reference_resolves_to_current_scope() {
        let first = Scope::root(RootOptions::new("one"));
        let second = Scope::root(RootOptions::new("two"));
        let tree = serialize(&first, &Value::Scope(first.clone()), SerializeOptions::default())
            .await
            .unwrap();
        let restored = deserialize(&second, &tree).await.unwrap();
        assert_eq!(restored, Value::Scope(second));
    }

    #[tokio::test]
    async fn test_transform_sees_every_value() {
        let scope = scope_with_password();
        let value = Value::object([
            ("a", Value::Secret(Secret::new("one"))),
            ("b", Value::Array(vec![Value::Secret(Secret::new("two"))])),
        ]);
        let mut seen = Vec::new();
        let mut collect = |v: &Value| -> Option<Value> {
            if let Value::Secret(s) = v {
                seen.push(s.expose().to_string());
            }
            None
        };
        serialize(
            &scope,
            &value,
            SerializeOptions {
                encrypt: true,
                transform: Some(&mut collect),
            },
        )
        .await
        .unwrap();
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_transform_may_introduce_secrets() {
        let scope = scope_with_password();
        let value = Value::object([("password", Value::from("hunter2"))]);
        let mut wrap = |v: &Value| -> Option<Value> {
            match v {
                Value::String(s) if s == "hunter2" => Some(Value::Secret(Secret::new(s.clone()))),
                _ => None,
            }
        };
        let tree = serialize(
            &scope,
            &value,
            SerializeOptions {
                encrypt: true,
                transform: Some(&mut wrap),
            },
        )
        .await
        .unwrap();

        assert!(tree["password"]["@secret"].is_string());
        assert!(!tree.to_string().contains("hunter2"));
        let restored = deserialize(&scope, &tree).await.unwrap();
        assert_eq!(
            restored,
            Value::object([("password", Value::Secret(Secret::new("hunter2")))])
        );
    }

    #[tokio::test]
    async fn test_malformed_tag_is_an_error() {
        let scope = Scope::root(RootOptions::new("test"));
        let err = deserialize(&scope, &json!({"@date": "yesterday"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StatecraftError::InvalidTag { tag: "@date", .. }));
    }

    #[test]
    fn test_contains_secret_detects_both_markers() {
        assert!(contains_secret(&json!({"a": [{"@secret": "x"}]})));
        assert!(contains_secret(&json!({"@secret-plaintext": "x"})));
        assert!(!contains_secret(&json!({"@secret": "x", "other": 1})));
    }
}
