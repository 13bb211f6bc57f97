use std::collections::HashMap;

use indexmap::IndexMap;

use super::{HostCatalogue, HostValue};

/// Guest-visible reference to a host value. `0` is the null handle.
pub type Handle = i32;

pub const NULL_HANDLE: Handle = 0;

/// First handle of the range reserved for named host modules.
/// Dynamic handles are minted below it, so the two never collide.
pub const NAMED_HANDLE_BASE: Handle = 0x4000_0000;

/// Per-instance mapping from handles to host values.
///
/// Dynamic handles are allocated monotonically from 1 and never reused, even
/// after [`HandleTable::remove`]. Nothing the guest can call removes entries, so
/// the table only grows for the lifetime of its instance.
pub struct HandleTable {
    entries: HashMap<Handle, HostValue>,
    next_handle: Handle,
    named: IndexMap<String, Handle>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_handle: 1,
            named: IndexMap::new(),
        }
    }

    /// Build a table with every catalogue entry registered under its name.
    /// Each call produces fresh objects from the catalogue's factories.
    pub fn with_catalogue(catalogue: &HostCatalogue) -> Self {
        let mut table = Self::new();
        for (name, factory) in catalogue.iter() {
            table.register_named(name, factory());
        }
        table
    }

    /// Store `value` and return its handle. Null is never stored and yields `0`.
    pub fn register(&mut self, value: HostValue) -> Handle {
        if value.is_null() {
            return NULL_HANDLE;
        }
        if self.next_handle >= NAMED_HANDLE_BASE {
            tracing::warn!(
                "handle table exhausted after {} allocations; returning null",
                self.next_handle - 1
            );
            return NULL_HANDLE;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, value);
        handle
    }

    /// Expose `value` under a well-known name, outside of the dynamic counter.
    /// Re-registering a name replaces its value but keeps its handle.
    pub fn register_named(&mut self, name: &str, value: HostValue) -> Handle {
        let handle = match self.named.get(name) {
            Some(handle) => *handle,
            None => {
                let handle = NAMED_HANDLE_BASE + self.named.len() as Handle;
                self.named.insert(name.to_string(), handle);
                handle
            }
        };
        if value.is_null() {
            self.entries.remove(&handle);
        } else {
            self.entries.insert(handle, value);
        }
        handle
    }

    pub fn lookup_named(&self, name: &str) -> Option<Handle> {
        let handle = *self.named.get(name)?;
        self.entries.contains_key(&handle).then_some(handle)
    }

    /// Unknown, removed and null handles all resolve to `None`.
    pub fn resolve(&self, handle: Handle) -> Option<&HostValue> {
        if handle == NULL_HANDLE {
            return None;
        }
        self.entries.get(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<HostValue> {
        self.entries.remove(&handle)
    }

    /// Number of live entries, named ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn named_globals(&self) -> impl Iterator<Item = (&str, Handle)> {
        self.named.iter().map(|(name, handle)| (name.as_str(), *handle))
    }
}
