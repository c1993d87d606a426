//! Identity Map pattern for tracking unique instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! instance within a session. This provides:
//!
//! - **Uniqueness**: the same key always resolves to the same handle
//! - **Consistency**: a refresh is visible through every clone of the handle
//!
//! # Design
//!
//! Entries are keyed by model name plus the primary key normalized to the
//! key column types, so `Int32(1)` and `Int64(1)` for an `Int64` key land on
//! the same entry. Values are type-erased [`AnyInstance`] handles; typed
//! access goes through [`IdentityMap::get_typed`].
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.insert("User", vec![Value::Int64(1)], user.erase());
//!
//! let again = map.get_typed::<User>(&[Value::Int64(1)]).unwrap();
//! assert!(again.ptr_eq(&user));
//! ```

use std::collections::HashMap;
use ydborm_core::{AnyInstance, Instance, Model, Value};

/// Key of one identity map entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub model: &'static str,
    pub key: Vec<Value>,
}

impl IdentityKey {
    pub fn new(model: &'static str, key: Vec<Value>) -> Self {
        Self { model, key }
    }
}

/// Canonical instances of one session.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, AnyInstance>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &'static str, key: &[Value]) -> Option<AnyInstance> {
        // HashMap lookups need an owned key; keys are short.
        self.entries
            .get(&IdentityKey::new(model, key.to_vec()))
            .cloned()
    }

    /// Typed lookup. `None` when absent or when the entry is another type.
    pub fn get_typed<M: Model>(&self, key: &[Value]) -> Option<Instance<M>> {
        self.get(M::MODEL_NAME, key)?.downcast::<M>()
    }

    /// Insert `instance`, returning the entry it replaced.
    pub fn insert(
        &mut self,
        model: &'static str,
        key: Vec<Value>,
        instance: AnyInstance,
    ) -> Option<AnyInstance> {
        self.entries.insert(IdentityKey::new(model, key), instance)
    }

    pub fn remove(&mut self, model: &'static str, key: &[Value]) -> Option<AnyInstance> {
        self.entries.remove(&IdentityKey::new(model, key.to_vec()))
    }

    /// Remove the entry for `key` only if it is `instance` itself.
    pub fn remove_instance(
        &mut self,
        model: &'static str,
        key: &[Value],
        instance: &AnyInstance,
    ) -> bool {
        let id = IdentityKey::new(model, key.to_vec());
        match self.entries.get(&id) {
            Some(existing) if existing.ptr_eq(instance) => {
                self.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Whether `instance` is the canonical entry for `key`.
    pub fn contains_instance(
        &self,
        model: &'static str,
        key: &[Value],
        instance: &AnyInstance,
    ) -> bool {
        self.get(model, key)
            .is_some_and(|existing| existing.ptr_eq(instance))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries for one model.
    pub fn count_model(&self, model: &str) -> usize {
        self.entries.keys().filter(|k| k.model == model).count()
    }

    pub fn instances(&self) -> impl Iterator<Item = &AnyInstance> {
        self.entries.values()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<AnyInstance> {
        self.entries.drain().map(|(_, instance)| instance).collect()
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}
