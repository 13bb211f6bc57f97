use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;

use super::{HostError, HostObject, HostResult, HostValue};

type HostFn = dyn Fn(Vec<HostValue>) -> HostResult<HostValue> + Send + Sync;

/// A free host function. Invoked with no receiver.
pub struct HostFunction {
    name: String,
    func: Box<HostFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> HostResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

impl HostObject for HostFunction {
    fn type_name(&self) -> &'static str {
        "Function"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn invoke(&self, args: Vec<HostValue>) -> HostResult<HostValue> {
        (self.func)(args)
    }
}

/// A method read off an object with `host_get`. Calling it dispatches back to
/// the receiver, so the receiver stays bound when the guest later calls the
/// handle without a method name.
pub struct BoundMethod {
    receiver: Arc<dyn HostObject>,
    name: String,
}

impl BoundMethod {
    pub fn new(receiver: Arc<dyn HostObject>, name: impl Into<String>) -> Self {
        Self {
            receiver,
            name: name.into(),
        }
    }
}

impl HostObject for BoundMethod {
    fn type_name(&self) -> &'static str {
        "Function"
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn invoke(&self, args: Vec<HostValue>) -> HostResult<HostValue> {
        self.receiver.call_method(&self.name, args)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking host call is caught at the bridge; the data is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plain object with dynamic properties. Properties holding callables act as
/// methods.
#[derive(Default)]
pub struct PropertyBag {
    properties: Mutex<IndexMap<String, HostValue>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, HostValue)>) -> Self {
        Self {
            properties: Mutex::new(entries.into_iter().collect()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, value: HostValue) {
        lock(&self.properties).insert(name.into(), value);
    }

    fn callable(&self, name: &str) -> Option<Arc<dyn HostObject>> {
        match lock(&self.properties).get(name) {
            Some(HostValue::Object(object)) if object.is_callable() => Some(Arc::clone(object)),
            _ => None,
        }
    }
}

impl HostObject for PropertyBag {
    fn type_name(&self) -> &'static str {
        "Object"
    }

    fn get_property(&self, name: &str) -> HostResult<HostValue> {
        lock(&self.properties)
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::MissingProperty {
                type_name: self.type_name().to_string(),
                name: name.to_string(),
            })
    }

    fn set_property(&self, name: &str, value: HostValue) -> HostResult<()> {
        self.insert(name, value);
        Ok(())
    }

    fn has_method(&self, name: &str) -> bool {
        self.callable(name).is_some()
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        let func = self.callable(name).ok_or_else(|| HostError::MissingMethod {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })?;
        // Lock is released before calling out, so the method may touch this object.
        func.invoke(args)
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        let properties = lock(&self.properties);
        let map = properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Some(serde_json::Value::Object(map))
    }
}

#[derive(Default)]
pub struct HostArray {
    items: Mutex<Vec<HostValue>>,
}

impl HostArray {
    pub fn from_values(items: Vec<HostValue>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index(&self, value: &HostValue) -> HostResult<usize> {
        value
            .as_number()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0)
            .map(|n| n as usize)
            .ok_or_else(|| HostError::InvalidArgument(format!("bad array index {value}")))
    }
}

impl HostObject for HostArray {
    fn type_name(&self) -> &'static str {
        "Array"
    }

    fn get_property(&self, name: &str) -> HostResult<HostValue> {
        if name == "length" {
            return Ok(HostValue::Int(self.len() as i32));
        }
        let missing = || HostError::MissingProperty {
            type_name: "Array".to_string(),
            name: name.to_string(),
        };
        let index: usize = name.parse().map_err(|_| missing())?;
        lock(&self.items).get(index).cloned().ok_or_else(missing)
    }

    fn set_property(&self, name: &str, value: HostValue) -> HostResult<()> {
        let index: usize = name.parse().map_err(|_| HostError::ReadOnlyProperty {
            type_name: "Array".to_string(),
            name: name.to_string(),
        })?;
        let mut items = lock(&self.items);
        match index.cmp(&items.len()) {
            std::cmp::Ordering::Less => items[index] = value,
            std::cmp::Ordering::Equal => items.push(value),
            std::cmp::Ordering::Greater => {
                return Err(HostError::InvalidArgument(format!(
                    "array index {index} out of range (length {})",
                    items.len()
                )));
            }
        }
        Ok(())
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "push" | "get")
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        match name {
            "push" => {
                let mut items = lock(&self.items);
                items.extend(args);
                Ok(HostValue::Int(items.len() as i32))
            }
            "get" => {
                let index = self.index(args.first().unwrap_or(&HostValue::Null))?;
                Ok(lock(&self.items).get(index).cloned().unwrap_or(HostValue::Null))
            }
            _ => Err(HostError::MissingMethod {
                type_name: self.type_name().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        let items = lock(&self.items);
        Some(serde_json::Value::Array(
            items.iter().map(HostValue::to_json).collect(),
        ))
    }
}

/// Member view over a boxed string.
pub struct StrObject {
    value: Arc<str>,
}

impl StrObject {
    pub fn new(value: Arc<str>) -> Self {
        Self { value }
    }

    fn string_arg(args: &[HostValue], index: usize) -> String {
        args.get(index).map(ToString::to_string).unwrap_or_default()
    }
}

impl HostObject for StrObject {
    fn type_name(&self) -> &'static str {
        "String"
    }

    fn get_property(&self, name: &str) -> HostResult<HostValue> {
        match name {
            "length" => Ok(HostValue::Int(self.value.encode_utf16().count() as i32)),
            _ => Err(HostError::MissingProperty {
                type_name: self.type_name().to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "toUpperCase" | "toLowerCase" | "trim" | "concat" | "includes" | "indexOf" | "charCodeAt"
        )
    }

    fn call_method(&self, name: &str, args: Vec<HostValue>) -> HostResult<HostValue> {
        let s = &*self.value;
        let value = match name {
            "toUpperCase" => HostValue::string(s.to_uppercase()),
            "toLowerCase" => HostValue::string(s.to_lowercase()),
            "trim" => HostValue::string(s.trim()),
            "concat" => {
                let mut out = s.to_string();
                for arg in &args {
                    out.push_str(&arg.to_string());
                }
                HostValue::string(out)
            }
            "includes" => HostValue::Bool(s.contains(Self::string_arg(&args, 0).as_str())),
            "indexOf" => {
                let needle = Self::string_arg(&args, 0);
                let index = s
                    .find(needle.as_str())
                    .map(|byte| s[..byte].encode_utf16().count() as i32)
                    .unwrap_or(-1);
                HostValue::Int(index)
            }
            "charCodeAt" => {
                let index = args.first().and_then(HostValue::as_number).unwrap_or(0.0);
                match s.encode_utf16().nth(index as usize) {
                    Some(unit) if index >= 0.0 => HostValue::Int(i32::from(unit)),
                    _ => HostValue::Number(f64::NAN),
                }
            }
            _ => {
                return Err(HostError::MissingMethod {
                    type_name: self.type_name().to_string(),
                    name: name.to_string(),
                })
            }
        };
        Ok(value)
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        Some(serde_json::Value::String(self.value.to_string()))
    }
}
