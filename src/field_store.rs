//! Draft field storage for a wizard session.
//!
//! [`FieldStore`] holds every in-progress value of a session, independent of
//! which step is active. All mutation goes through
//! [`update_field`](FieldStore::update_field) or
//! [`update_with`](FieldStore::update_with); the latter hands the closure the
//! value stored *at mutation time*, never an earlier copy.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

/// The in-progress draft values of one wizard session.
///
/// Keys declared as *selection sets* (amenities, features, ...) hold JSON
/// arrays that are deduplicated on every mutation: first insertion order is
/// kept and no value appears twice.
///
/// # Example
///
/// ```
/// use stepwise::FieldStore;
/// use serde_json::json;
///
/// let mut fields = FieldStore::new().with_selection_set("amenities");
/// fields.add_to_selection("amenities", json!("pool"));
/// fields.add_to_selection("amenities", json!("gym"));
/// fields.add_to_selection("amenities", json!("pool"));
/// assert_eq!(fields.get("amenities"), Some(&json!(["pool", "gym"])));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStore {
    values: BTreeMap<String, JsonValue>,
    selection_sets: BTreeSet<String>,
    /// Per-key revision of the last user mutation.
    revisions: BTreeMap<String, u64>,
    /// Monotonic counter bumped on every user mutation.
    revision: u64,
}

impl FieldStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `key` as a selection set.
    pub fn with_selection_set(mut self, key: impl Into<String>) -> Self {
        self.declare_selection_set(key);
        self
    }

    /// Declares `key` as a selection set, deduplicating any current value.
    pub fn declare_selection_set(&mut self, key: impl Into<String>) {
        let key = key.into();
        if let Some(value) = self.values.get_mut(&key) {
            dedup_in_place(value);
        }
        self.selection_sets.insert(key);
    }

    /// Returns true if `key` is a declared selection set.
    pub fn is_selection_set(&self, key: &str) -> bool {
        self.selection_sets.contains(key)
    }

    /// Sets `key` to `value`.
    ///
    /// This is the single mutation entry point; every other mutator funnels
    /// through it.
    pub fn update_field(&mut self, key: impl Into<String>, value: JsonValue) {
        let key = key.into();
        let mut value = value;
        if self.selection_sets.contains(&key) {
            dedup_in_place(&mut value);
        }
        self.revision += 1;
        self.revisions.insert(key.clone(), self.revision);
        self.values.insert(key, value);
    }

    /// Computes the new value of `key` from the value stored right now.
    pub fn update_with<F>(&mut self, key: impl Into<String>, f: F)
    where
        F: FnOnce(Option<&JsonValue>) -> JsonValue,
    {
        let key = key.into();
        let next = f(self.values.get(&key));
        self.update_field(key, next);
    }

    /// Appends `item` to a list field unless it is already present.
    pub fn add_to_selection(&mut self, key: impl Into<String>, item: JsonValue) {
        self.update_with(key, |current| {
            let mut items = as_list(current);
            if !items.contains(&item) {
                items.push(item);
            }
            JsonValue::Array(items)
        });
    }

    /// Removes every occurrence of `item` from a list field.
    pub fn remove_from_selection(&mut self, key: impl Into<String>, item: &JsonValue) {
        self.update_with(key, |current| {
            let mut items = as_list(current);
            items.retain(|existing| existing != item);
            JsonValue::Array(items)
        });
    }

    /// Adds `item` if absent, removes it if present.
    pub fn toggle_selection(&mut self, key: impl Into<String>, item: JsonValue) {
        self.update_with(key, |current| {
            let mut items = as_list(current);
            match items.iter().position(|existing| *existing == item) {
                Some(index) => {
                    items.remove(index);
                }
                None => items.push(item),
            }
            JsonValue::Array(items)
        });
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    /// Returns the value for `key` as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(JsonValue::as_str)
    }

    /// Returns the value for `key` as a bool; absent or non-bool is `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Returns the list stored for `key`, or an empty slice.
    pub fn list(&self, key: &str) -> &[JsonValue] {
        self.values
            .get(key)
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns true if `key` holds a meaningful value.
    ///
    /// Null, empty strings, empty lists and empty objects count as absent.
    pub fn is_present(&self, key: &str) -> bool {
        self.values.get(key).is_some_and(is_meaningful)
    }

    /// Returns the global revision counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns the revision at which `key` was last mutated (0 if never).
    pub fn key_revision(&self, key: &str) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    /// Writes server-side values back into the store.
    ///
    /// A key is only overwritten if it has not been mutated since
    /// `snapshot` was taken, so edits made while a request was in flight
    /// win over the response. Merges do not count as user mutations.
    /// Returns the number of keys written.
    pub fn merge_from_server<I>(&mut self, values: I, snapshot: &FieldStore) -> usize
    where
        I: IntoIterator<Item = (String, JsonValue)>,
    {
        let mut merged = 0;
        for (key, mut value) in values {
            if self.key_revision(&key) != snapshot.key_revision(&key) {
                continue;
            }
            if self.selection_sets.contains(&key) {
                dedup_in_place(&mut value);
            }
            self.values.insert(key, value);
            merged += 1;
        }
        merged
    }

    /// Replaces every value with `seed`, keeping selection-set declarations.
    ///
    /// Used when a session is resumed from a backend entity. Revisions are
    /// reset because nothing has been edited yet.
    pub fn reseed<I>(&mut self, seed: I)
    where
        I: IntoIterator<Item = (String, JsonValue)>,
    {
        self.values.clear();
        self.revisions.clear();
        for (key, mut value) in seed {
            if self.selection_sets.contains(&key) {
                dedup_in_place(&mut value);
            }
            self.values.insert(key, value);
        }
    }

    /// Iterates over all stored fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of stored fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns all fields as a JSON object.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Returns true for values that count as "filled in".
pub(crate) fn is_meaningful(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::String(s) => !s.trim().is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => true,
    }
}

fn as_list(value: Option<&JsonValue>) -> Vec<JsonValue> {
    match value {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(JsonValue::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    }
}

fn dedup_in_place(value: &mut JsonValue) {
    if let JsonValue::Array(items) = value {
        let mut seen: Vec<JsonValue> = Vec::with_capacity(items.len());
        items.retain(|item| {
            if seen.contains(item) {
                false
            } else {
                seen.push(item.clone());
                true
            }
        });
    }
}
