//! Assertion payload values
//!
//! Dynamic values attached to assertions as `expected`, `actual` or `error`,
//! and their conversion to a JSON form that can always be transmitted.

use serde_json::{Map as JsonMap, Number, Value as Json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Key carrying the type marker of a non-plain value
pub const TYPE_MARKER: &str = "$type";

/// A dynamic payload value
///
/// Most variants map onto plain JSON. `Set`, `Map`, `Error`, `Regex`,
/// `Symbol` and non-finite floats have no JSON counterpart and are tagged
/// with [`TYPE_MARKER`] when sanitized. `Shared` nodes may form cycles.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Error(ErrorValue),
    Regex { source: String, flags: String },
    Symbol(String),
    Shared(SharedValue),
}

impl Value {
    pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn regex(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::Regex {
            source: source.into(),
            flags: flags.into(),
        }
    }

    pub fn symbol(description: impl Into<String>) -> Self {
        Value::Symbol(description.into())
    }

    /// Identity comparison
    ///
    /// Shared nodes compare by reference, floats treat NaN as itself and
    /// distinguish signed zeros. Everything else compares by value.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Shared(a), Value::Shared(b)) => a.ptr_eq(b),
            (Value::Float(a), Value::Float(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            _ => self == other,
        }
    }
}

/// Deep equality over the sanitized forms, which terminates on cycles
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        sanitize(self) == sanitize(other)
    }
}

/// An error-like value
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub fields: BTreeMap<String, Value>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Capture a std error and its source chain
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        let value = Self::new("Error", error.to_string());
        if chain.is_empty() {
            value
        } else {
            value.with_stack(chain.join("\n"))
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A shared, mutable node that can be referenced from several places
#[derive(Clone, Default)]
pub struct SharedValue(Arc<Mutex<Value>>);

impl SharedValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(Arc::new(Mutex::new(value.into())))
    }

    /// Replace the node's content
    pub fn set(&self, value: impl Into<Value>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = value.into();
    }

    /// Snapshot of the content; nested shared nodes stay shared
    pub fn get(&self) -> Value {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:#x})", self.addr())
    }
}

/// Convert a value into transmission-safe JSON
///
/// Never fails: values JSON cannot represent are replaced by tagged objects.
pub fn sanitize(value: &Value) -> Json {
    let mut path = Vec::new();
    sanitize_inner(value, &mut path)
}

fn sanitize_inner(value: &Value, path: &mut Vec<usize>) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None => tagged("Number", [("value", Json::String(f.to_string()))]),
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Array(items) => Json::Array(items.iter().map(|v| sanitize_inner(v, path)).collect()),
        Value::Object(entries) => {
            let map: JsonMap<String, Json> = entries
                .iter()
                .map(|(k, v)| (k.clone(), sanitize_inner(v, path)))
                .collect();
            if map.contains_key(TYPE_MARKER) {
                tagged("Object", [("entries", Json::Object(map))])
            } else {
                Json::Object(map)
            }
        }
        Value::Set(items) => tagged(
            "Set",
            [(
                "values",
                Json::Array(items.iter().map(|v| sanitize_inner(v, path)).collect()),
            )],
        ),
        Value::Map(entries) => tagged(
            "Map",
            [(
                "entries",
                Json::Array(
                    entries
                        .iter()
                        .map(|(k, v)| {
                            Json::Array(vec![sanitize_inner(k, path), sanitize_inner(v, path)])
                        })
                        .collect(),
                ),
            )],
        ),
        Value::Error(error) => {
            let mut fields = vec![
                ("name", Json::String(error.name.clone())),
                ("message", Json::String(error.message.clone())),
            ];
            if let Some(stack) = &error.stack {
                fields.push(("stack", Json::String(stack.clone())));
            }
            if !error.fields.is_empty() {
                let extra = error
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), sanitize_inner(v, path)))
                    .collect();
                fields.push(("fields", Json::Object(extra)));
            }
            tagged("Error", fields)
        }
        Value::Regex { source, flags } => tagged(
            "RegExp",
            [
                ("source", Json::String(source.clone())),
                ("flags", Json::String(flags.clone())),
            ],
        ),
        Value::Symbol(description) => {
            tagged("Symbol", [("description", Json::String(description.clone()))])
        }
        Value::Shared(node) => {
            let addr = node.addr();
            if path.contains(&addr) {
                return tagged("Circular", []);
            }
            // Snapshot first so no lock is held while descending.
            let inner = node.get();
            path.push(addr);
            let json = sanitize_inner(&inner, path);
            path.pop();
            json
        }
    }
}

fn tagged<'a>(tag: &str, fields: impl IntoIterator<Item = (&'a str, Json)>) -> Json {
    let mut map = JsonMap::new();
    map.insert(TYPE_MARKER.to_string(), Json::String(tag.to_string()));
    for (key, value) in fields {
        map.insert(key.to_string(), value);
    }
    Json::Object(map)
}

/// Recover a value from its sanitized form
///
/// Circular placeholders come back as `Symbol("[Circular]")`.
pub fn revive(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(revive).collect()),
        Json::Object(map) => match map.get(TYPE_MARKER).and_then(Json::as_str) {
            Some(tag) => revive_tagged(tag, map),
            None => Value::Object(map.iter().map(|(k, v)| (k.clone(), revive(v))).collect()),
        },
    }
}

fn revive_tagged(tag: &str, map: &JsonMap<String, Json>) -> Value {
    let text = |key: &str| {
        map.get(key)
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let list = |key: &str| {
        map.get(key)
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default()
    };

    match tag {
        "Number" => Value::Float(text("value").parse().unwrap_or(f64::NAN)),
        "Set" => Value::Set(list("values").iter().map(revive).collect()),
        "Map" => Value::Map(
            list("entries")
                .iter()
                .filter_map(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([k, v]) => Some((revive(k), revive(v))),
                    _ => None,
                })
                .collect(),
        ),
        "Error" => Value::Error(ErrorValue {
            name: text("name"),
            message: text("message"),
            stack: map.get("stack").and_then(Json::as_str).map(str::to_string),
            fields: map
                .get("fields")
                .and_then(Json::as_object)
                .map(|f| f.iter().map(|(k, v)| (k.clone(), revive(v))).collect())
                .unwrap_or_default(),
        }),
        "RegExp" => Value::regex(text("source"), text("flags")),
        "Symbol" => Value::Symbol(text("description")),
        "Circular" => Value::symbol("[Circular]"),
        "Object" => match map.get("entries") {
            Some(Json::Object(entries)) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), revive(v)))
                    .collect(),
            ),
            _ => Value::Object(BTreeMap::new()),
        },
        _ => Value::Object(map.iter().map(|(k, v)| (k.clone(), revive(v))).collect()),
    }
}

/// Deep equality used by `equal` / `not_equal` assertions
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    a == b
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i.into())
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        i64::try_from(i).map_or(Value::Float(i as f64), Value::Int)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        i64::try_from(i).map_or(Value::Float(i as f64), Value::Int)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
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

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Value::Error(error)
    }
}

impl From<SharedValue> for Value {
    fn from(node: SharedValue) -> Self {
        Value::Shared(node)
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        revive(&json)
    }
}
