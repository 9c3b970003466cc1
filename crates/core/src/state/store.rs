//! Ephemeral key-value handoff store.
//!
//! Entries are grouped by run id and keyed by participant id. A controller
//! writes its iteration output here, and the coordination layer consumes it
//! (or writes what arrived from the network for the controller to consume).
//!
//! Removal leaves an empty placeholder instead of deleting the key, so a
//! group keeps its membership stable while individual members drain.

use dcp_protocol::run_models::RunError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a participant produced for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Output(Value),
    Error(RunError),
}

impl StoreValue {
    /// JSON form used when a group is handed to a computation or suspended.
    pub fn to_json(&self) -> Value {
        match self {
            StoreValue::Output(value) => value.clone(),
            StoreValue::Error(error) => {
                serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.message.clone()))
            }
        }
    }
}

type Group = BTreeMap<String, Option<StoreValue>>;

/// Shared handle to the store. Clones refer to the same entries.
#[derive(Clone, Default)]
pub struct RunStore {
    groups: Arc<Mutex<HashMap<String, Group>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` for `id` in `group`, replacing any pending entry.
    pub fn put(&self, group: &str, id: &str, value: StoreValue) {
        self.groups
            .lock()
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string(), Some(value));
    }

    pub fn get(&self, group: &str, id: &str) -> Option<StoreValue> {
        self.groups
            .lock()
            .get(group)
            .and_then(|entries| entries.get(id))
            .and_then(Clone::clone)
    }

    /// Take the entry, leaving a placeholder. A second call returns `None`
    /// until the next `put`.
    pub fn get_and_remove(&self, group: &str, id: &str) -> Option<StoreValue> {
        self.groups
            .lock()
            .get_mut(group)
            .and_then(|entries| entries.get_mut(id))
            .and_then(Option::take)
    }

    /// All non-empty entries of `group`, ordered by participant id.
    pub fn get_group(&self, group: &str) -> BTreeMap<String, StoreValue> {
        self.groups
            .lock()
            .get(group)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(id, value)| value.clone().map(|v| (id.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Take every non-empty entry of `group`, leaving placeholders.
    pub fn get_and_remove_group(&self, group: &str) -> BTreeMap<String, StoreValue> {
        let mut groups = self.groups.lock();
        let Some(entries) = groups.get_mut(group) else {
            return BTreeMap::new();
        };
        entries
            .iter_mut()
            .filter_map(|(id, value)| value.take().map(|v| (id.clone(), v)))
            .collect()
    }

    /// Whether `id` has a pending entry in `group`.
    pub fn has(&self, group: &str, id: &str) -> bool {
        self.groups
            .lock()
            .get(group)
            .and_then(|entries| entries.get(id))
            .is_some_and(Option::is_some)
    }

    /// Drop the pending entry of `id`, keeping the placeholder.
    pub fn remove(&self, group: &str, id: &str) {
        if let Some(slot) = self
            .groups
            .lock()
            .get_mut(group)
            .and_then(|entries| entries.get_mut(id))
        {
            *slot = None;
        }
    }

    /// Forget a whole group. Used when a run is torn down.
    pub fn remove_group(&self, group: &str) {
        self.groups.lock().remove(group);
    }

    /// Participant ids known in `group`, including drained ones.
    pub fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .lock()
            .get(group)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }
}
