//! Integer-only host interop surface.
//!
//! Every operation takes and returns `i32`s and never fails towards the guest:
//! errors are logged and turned into the null handle (or a no-op). Words passed
//! as values follow one rule everywhere: a word naming a live handle stands for
//! that handle's value, anything else is a raw integer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::host::{
    parse_leading_int, to_int32, BoundMethod, Handle, HandleTable, HostError, HostObject,
    HostResult, HostValue, NULL_HANDLE,
};

use super::memory::LinearMemory;

pub struct HostBridge<'a> {
    memory: Option<&'a LinearMemory>,
    handles: &'a mut HandleTable,
}

fn absorb(op: &str, result: HostResult<i32>) -> i32 {
    match result {
        Ok(value) => value,
        Err(e) if e.is_fault() => {
            tracing::warn!("{op}: {e}");
            NULL_HANDLE
        }
        Err(e) => {
            tracing::debug!("{op}: {e}");
            NULL_HANDLE
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run host object code, turning a panic into `HostError::Panicked`.
fn guard<T>(op: impl FnOnce() -> HostResult<T>) -> HostResult<T> {
    catch_unwind(AssertUnwindSafe(op))
        .unwrap_or_else(|payload| Err(HostError::Panicked(panic_message(&*payload))))
}

impl<'a> HostBridge<'a> {
    pub fn new(memory: Option<&'a LinearMemory>, handles: &'a mut HandleTable) -> Self {
        Self { memory, handles }
    }

    fn read_str(&self, ptr: i32) -> HostResult<String> {
        let memory = self.memory.ok_or(HostError::NoMemory)?;
        Ok(memory.read_cstring(ptr)?)
    }

    fn resolve(&self, handle: Handle) -> HostResult<&HostValue> {
        self.handles
            .resolve(handle)
            .ok_or(HostError::UnknownHandle(handle))
    }

    fn resolve_object(&self, handle: Handle) -> HostResult<Arc<dyn HostObject>> {
        let value = self.resolve(handle)?;
        value
            .as_object()
            .ok_or(HostError::NotAnObject(value.type_name()))
    }

    /// A word passed by the guest where a value is expected.
    fn unpack_word(&self, word: i32) -> HostValue {
        match self.handles.resolve(word) {
            Some(value) => value.clone(),
            None => HostValue::Int(word),
        }
    }

    /// Handle-returning results: every non-null value gets a handle.
    fn export_handle(&mut self, value: HostValue) -> i32 {
        self.handles.register(value)
    }

    /// `call` results: numbers and booleans come back raw, everything else boxed.
    fn export_call_result(&mut self, value: HostValue) -> i32 {
        match value {
            HostValue::Null => NULL_HANDLE,
            HostValue::Bool(b) => i32::from(b),
            HostValue::Int(n) => n,
            HostValue::Number(n) => to_int32(n),
            value @ (HostValue::Str(_) | HostValue::Object(_)) => self.handles.register(value),
        }
    }

    /// `host_get_global(namePtr) -> handle`
    pub fn get_global(&mut self, name_ptr: i32) -> i32 {
        let result = self.read_str(name_ptr).and_then(|name| {
            self.handles
                .lookup_named(&name)
                .ok_or(HostError::MissingProperty {
                    type_name: "globals".to_string(),
                    name,
                })
        });
        absorb("host_get_global", result)
    }

    /// `host_get(handle, propPtr) -> handle`
    pub fn get(&mut self, handle: Handle, prop_ptr: i32) -> i32 {
        let result = self.try_get(handle, prop_ptr);
        absorb("host_get", result)
    }

    fn try_get(&mut self, handle: Handle, prop_ptr: i32) -> HostResult<i32> {
        let target = self.resolve_object(handle)?;
        let prop = self.read_str(prop_ptr)?;
        if guard(|| Ok(target.has_method(&prop)))? {
            let method = BoundMethod::new(target, prop);
            return Ok(self.export_handle(HostValue::object(method)));
        }
        let value = guard(|| target.get_property(&prop))?;
        Ok(self.export_handle(value))
    }

    /// `host_set(handle, propPtr, value)`
    pub fn set(&mut self, handle: Handle, prop_ptr: i32, value: i32) {
        let result = self.try_set(handle, prop_ptr, value).map(|()| 0);
        absorb("host_set", result);
    }

    fn try_set(&mut self, handle: Handle, prop_ptr: i32, value: i32) -> HostResult<()> {
        let target = self.resolve_object(handle)?;
        let prop = self.read_str(prop_ptr)?;
        let value = match value {
            NULL_HANDLE => HostValue::Null,
            word => self.unpack_word(word),
        };
        guard(|| target.set_property(&prop, value))
    }

    /// `host_call(handle, methodPtrOrZero, argsPtr, argsCount) -> handle | raw`
    pub fn call(&mut self, handle: Handle, method_ptr: i32, args_ptr: i32, args_count: i32) -> i32 {
        let result = self.try_call(handle, method_ptr, args_ptr, args_count);
        absorb("host_call", result)
    }

    fn try_call(
        &mut self,
        handle: Handle,
        method_ptr: i32,
        args_ptr: i32,
        args_count: i32,
    ) -> HostResult<i32> {
        let target = self.resolve_object(handle)?;
        let method = match method_ptr {
            0 => None,
            ptr => Some(self.read_str(ptr)?),
        };
        let args = self.read_call_args(args_ptr, args_count)?;

        let has_method = match &method {
            Some(name) => guard(|| Ok(target.has_method(name)))?,
            None => false,
        };
        match &method {
            Some(name) if !has_method => {
                return Err(HostError::MissingMethod {
                    type_name: target.type_name().to_string(),
                    name: name.clone(),
                });
            }
            None if !target.is_callable() => {
                return Err(HostError::NotCallable(target.type_name().to_string()));
            }
            _ => {}
        }

        let outcome = guard(|| match &method {
            Some(name) => target.call_method(name, args),
            None => target.invoke(args),
        });
        let value = match outcome {
            Ok(value) => value,
            // Whatever the host call returned is its own failure, not a protocol error.
            Err(e) if e.is_fault() => return Err(e),
            Err(e) => return Err(HostError::Failed(e.to_string())),
        };
        Ok(self.export_call_result(value))
    }

    fn read_call_args(&self, args_ptr: i32, args_count: i32) -> HostResult<Vec<HostValue>> {
        let count = usize::try_from(args_count)
            .map_err(|_| HostError::InvalidArgument(format!("argument count {args_count}")))?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let memory = self.memory.ok_or(HostError::NoMemory)?;
        let words = memory.read_i32_slice(args_ptr, count)?;
        Ok(words.into_iter().map(|word| self.unpack_word(word)).collect())
    }

    /// `host_from_int(value) -> value`. Ints need no boxing.
    pub fn from_int(&mut self, value: i32) -> i32 {
        value
    }

    /// `host_from_string(ptr) -> handle`
    pub fn from_string(&mut self, ptr: i32) -> i32 {
        let result = self
            .read_str(ptr)
            .map(|s| self.handles.register(HostValue::string(s)));
        absorb("host_from_string", result)
    }

    /// `host_to_int(word) -> int`
    ///
    /// `to_int(from_int(n)) == n` holds unless `n` equals a handle that is
    /// live in this thread's table, in which case the handle's value is
    /// converted instead. Dynamic handles count up from 1, so small integers
    /// collide first once the guest has created objects.
    pub fn to_int(&mut self, word: i32) -> i32 {
        match self.unpack_word(word) {
            HostValue::Null => 0,
            HostValue::Bool(b) => i32::from(b),
            HostValue::Int(n) => n,
            HostValue::Number(n) => to_int32(n),
            HostValue::Str(s) => parse_leading_int(&s).unwrap_or(0),
            HostValue::Object(_) => 0,
        }
    }
}
