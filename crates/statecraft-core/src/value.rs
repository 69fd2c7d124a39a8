//! The value model shared by resource props, outputs and provider data

use crate::error::Result;
use crate::scope::Scope;
use crate::secret::Secret;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};

/// Ordered object map
pub type Object = IndexMap<Key, Value>;

/// Any value a resource can take as props, return as output, or keep in `data`
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(Object),
    Secret(Secret),
    Date(DateTime<Utc>),
    Symbol(Symbol),
    /// A JSON schema describing a validator
    Schema(serde_json::Value),
    /// Back-reference to the scope that owns the value
    Scope(Scope),
    /// Never persisted
    Function(Callable),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Secret(a), Value::Secret(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Schema(a), Value::Schema(b)) => a == b,
            (Value::Scope(a), Value::Scope(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Object key: a plain name or an internal symbol-tagged marker
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Name(String),
    Symbol(Symbol),
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<Symbol> for Key {
    fn from(symbol: Symbol) -> Self {
        Key::Symbol(symbol)
    }
}

impl From<&Symbol> for Key {
    fn from(symbol: &Symbol) -> Self {
        Key::Symbol(symbol.clone())
    }
}

struct SymbolInner {
    description: Option<String>,
    registered: bool,
}

/// An identity-compared marker, optionally interned under a stable name
///
/// Symbols created with [`Symbol::for_name`] live in a process-wide registry,
/// so the same name always yields the same symbol and survives a restart.
/// Symbols created with [`Symbol::unique`] do not and cannot be serialized.
#[derive(Clone)]
pub struct Symbol(Arc<SymbolInner>);

static SYMBOLS: LazyLock<Mutex<HashMap<String, Symbol>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl Symbol {
    /// Returns the registered symbol for `name`, interning it on first use
    pub fn for_name(name: &str) -> Symbol {
        let mut symbols = SYMBOLS.lock().unwrap_or_else(|e| e.into_inner());
        symbols
            .entry(name.to_string())
            .or_insert_with(|| {
                Symbol(Arc::new(SymbolInner {
                    description: Some(name.to_string()),
                    registered: true,
                }))
            })
            .clone()
    }

    /// Creates a fresh symbol that is equal only to itself
    pub fn unique(description: Option<&str>) -> Symbol {
        Symbol(Arc::new(SymbolInner {
            description: description.map(str::to_string),
            registered: false,
        }))
    }

    pub fn description(&self) -> Option<&str> {
        self.0.description.as_deref()
    }

    /// The name this symbol can be re-interned under, if any
    pub fn registered_name(&self) -> Option<&str> {
        if self.0.registered {
            self.0.description.as_deref()
        } else {
            None
        }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({})", self.description().unwrap_or_default())
    }
}

type CallableFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// A function carried inside a value; dropped on serialization
#[derive(Clone)]
pub struct Callable(Arc<CallableFn>);

impl Callable {
    pub fn new(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Function")
    }
}

impl Value {
    /// Builds an object from name/value pairs
    pub fn object<K, V, I>(entries: I) -> Value
    where
        K: Into<Key>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// A JSON schema value generated from a Rust type
    pub fn schema_for<T: schemars::JsonSchema>() -> Result<Value> {
        let schema = schemars::schema_for!(T);
        Ok(Value::Schema(serde_json::to_value(schema)?))
    }

    /// Converts any serializable type; the result carries no tagged variants
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Value> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Converts into a plain serde type via [`Value::to_plain_json`]
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_plain_json())?)
    }

    /// Lossy conversion to JSON for handing values to provider SDKs.
    ///
    /// Secrets are exposed as their plaintext, dates become RFC 3339 strings,
    /// symbol keys, scopes and functions are dropped.
    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Scope(_) | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .filter_map(|(k, v)| match (k, v) {
                        (Key::Name(name), v) if !matches!(v, Value::Function(_)) => {
                            Some((name.clone(), v.to_plain_json()))
                        }
                        _ => None,
                    })
                    .collect(),
            ),
            Value::Secret(secret) => serde_json::Value::String(secret.expose().to_string()),
            Value::Date(date) => serde_json::Value::String(date.to_rfc3339()),
            Value::Symbol(symbol) => serde_json::Value::String(symbol.to_string()),
            Value::Schema(schema) => schema.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            Value::Secret(secret) => Some(secret),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup by name on an object
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_object()
            .and_then(|map| map.get(&Key::Name(name.to_string())))
    }

    /// Field lookup by symbol key on an object
    pub fn get_symbol(&self, symbol: &Symbol) -> Option<&Value> {
        self.as_object()
            .and_then(|map| map.get(&Key::Symbol(symbol.clone())))
    }

    /// Whether a secret appears anywhere inside this value
    pub fn contains_secret(&self) -> bool {
        match self {
            Value::Secret(_) => true,
            Value::Array(items) => items.iter().any(Value::contains_secret),
            Value::Object(map) => map.values().any(Value::contains_secret),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (Key::Name(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<Secret> for Value {
    fn from(secret: Secret) -> Self {
        Value::Secret(secret)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<Symbol> for Value {
    fn from(symbol: Symbol) -> Self {
        Value::Symbol(symbol)
    }
}

impl From<Scope> for Value {
    fn from(scope: Scope) -> Self {
        Value::Scope(scope)
    }
}

impl From<Callable> for Value {
    fn from(f: Callable) -> Self {
        Value::Function(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Object> for Value {
    fn from(map: Object) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
