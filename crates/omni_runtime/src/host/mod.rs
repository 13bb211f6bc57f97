//! Host-side values reachable from the guest through handles.
//!
//! The guest never sees these types. It only sees the `i32` handles that the
//! [`HandleTable`] mints for them, and the bridge in `engine::bridge` translates
//! between the two.

mod builtins;
mod catalogue;
mod handles;
mod objects;
mod output;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use catalogue::{HostCatalogue, HostFactory, BUILTIN_GLOBALS};
pub use handles::{Handle, HandleTable, NAMED_HANDLE_BASE, NULL_HANDLE};
pub use objects::{BoundMethod, HostArray, HostFunction, PropertyBag, StrObject};
pub use output::OutputSink;

use crate::engine::MemoryError;

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no linear memory is attached to this instance")]
    NoMemory,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("unknown handle {0}")]
    UnknownHandle(i32),
    #[error("{0} is not an object")]
    NotAnObject(&'static str),
    #[error("`{type_name}` has no property `{name}`")]
    MissingProperty { type_name: String, name: String },
    #[error("property `{name}` of `{type_name}` is read-only")]
    ReadOnlyProperty { type_name: String, name: String },
    #[error("`{type_name}` has no method `{name}`")]
    MissingMethod { type_name: String, name: String },
    #[error("`{0}` is not callable")]
    NotCallable(String),
    #[error("invalid argument count: expected {expected}, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("host operation failed: {0}")]
    Failed(String),
    #[error("host operation panicked: {0}")]
    Panicked(String),
}

impl HostError {
    /// Whether the error came from the host operation itself rather than from
    /// the guest addressing something that does not exist.
    pub fn is_fault(&self) -> bool {
        matches!(self, HostError::Failed(_) | HostError::Panicked(_))
    }
}

/// A host value held by a [`HandleTable`].
///
/// `Bool`, `Int`, `Number` and `Str` are the primitive wrappers: they are
/// unwrapped to their bare value when handed to host calls.
#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Int(i32),
    Number(f64),
    Str(Arc<str>),
    Object(Arc<dyn HostObject>),
}

impl HostValue {
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        HostValue::Str(s.into())
    }

    pub fn object<T: HostObject + 'static>(object: T) -> Self {
        HostValue::Object(Arc::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::Number(_) => "number",
            HostValue::Str(_) => "string",
            HostValue::Object(object) => object.type_name(),
        }
    }

    /// View the value as something properties and methods can be dispatched on.
    /// Boxed strings get a transient [`StrObject`]; other primitives have no members.
    pub fn as_object(&self) -> Option<Arc<dyn HostObject>> {
        match self {
            HostValue::Object(object) => Some(Arc::clone(object)),
            HostValue::Str(s) => Some(Arc::new(StrObject::new(Arc::clone(s)))),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by host functions; strings and objects are not numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Int(n) => Some(f64::from(*n)),
            HostValue::Number(n) => Some(*n),
            HostValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Same identity: objects compare by pointer, primitives by value.
    pub fn same_as(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Object(a), HostValue::Object(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (HostValue::Object(_), _) | (_, HostValue::Object(_)) => false,
            _ => self == other,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(*b),
            HostValue::Int(n) => serde_json::Value::from(*n),
            HostValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            HostValue::Str(s) => serde_json::Value::String(s.to_string()),
            HostValue::Object(object) => object.to_json().unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64().map(i32::try_from) {
                Some(Ok(n)) => HostValue::Int(n),
                _ => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => HostValue::string(s),
            serde_json::Value::Array(items) => HostValue::object(HostArray::from_values(
                items.into_iter().map(HostValue::from_json).collect(),
            )),
            serde_json::Value::Object(map) => HostValue::object(PropertyBag::from_entries(
                map.into_iter().map(|(k, v)| (k, HostValue::from_json(v))),
            )),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::Int(a), HostValue::Number(b)) | (HostValue::Number(b), HostValue::Int(a)) => {
                f64::from(*a) == *b
            }
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Object(_), HostValue::Object(_)) => self.same_as(other),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            HostValue::Int(n) => f.debug_tuple("Int").field(n).finish(),
            HostValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            HostValue::Str(s) => f.debug_tuple("Str").field(s).finish(),
            HostValue::Object(object) => write!(f, "Object({})", object.type_name()),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Null => f.write_str("null"),
            HostValue::Bool(b) => write!(f, "{b}"),
            HostValue::Int(n) => write!(f, "{n}"),
            HostValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e21 => write!(f, "{n:.0}"),
            HostValue::Number(n) => write!(f, "{n}"),
            HostValue::Str(s) => f.write_str(s),
            HostValue::Object(object) => match object.to_json() {
                Some(json) => write!(f, "{json}"),
                None => write!(f, "[object {}]", object.type_name()),
            },
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Int(n)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::string(s)
    }
}

/// The closed set of operations the bridge performs on host objects.
///
/// Every method fails by default, so an implementation only spells out the
/// members it actually has.
pub trait HostObject: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn get_property(&self, name: &str) -> HostResult<HostValue> {
        Err(HostError::MissingProperty {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })
    }

    fn set_property(&self, name: &str, _value: HostValue) -> HostResult<()> {
        Err(HostError::ReadOnlyProperty {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })
    }

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(&self, name: &str, _args: Vec<HostValue>) -> HostResult<HostValue> {
        Err(HostError::MissingMethod {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })
    }

    fn is_callable(&self) -> bool {
        false
    }

    /// Call the object itself, without a receiver.
    fn invoke(&self, _args: Vec<HostValue>) -> HostResult<HostValue> {
        Err(HostError::NotCallable(self.type_name().to_string()))
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        None
    }
}

/// `ToInt32` from ECMAScript: truncate, wrap modulo 2^32, non-finite is 0.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    const TWO_32: f64 = 4_294_967_296.0;
    let wrapped = n.trunc().rem_euclid(TWO_32);
    if wrapped >= TWO_32 / 2.0 {
        (wrapped - TWO_32) as i32
    } else {
        wrapped as i32
    }
}

/// `parseInt(s)` narrowed to 32 bits. Returns `None` when `s` has no leading digits.
pub fn parse_leading_int(s: &str) -> Option<i32> {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = match s.get(..2) {
        Some("0x") | Some("0X") => (16, &s[2..]),
        _ => (10, s),
    };

    let mut value = 0.0f64;
    let mut seen = false;
    for c in digits.chars() {
        let Some(d) = c.to_digit(radix) else { break };
        value = value * f64::from(radix) + f64::from(d);
        seen = true;
    }
    if !seen {
        return None;
    }
    Some(to_int32(if negative { -value } else { value }))
}
