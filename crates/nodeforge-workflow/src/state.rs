//! Per-step state bag
//!
//! Values recorded during execute are read back during rollback. The bag is
//! JSON-backed so a whole workflow's state can be persisted and restored
//! by a later process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Execution-scoped key/value store owned by a single step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepState {
    values: Map<String, Value>,
}

impl StepState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserialize a value, `None` if missing or of the wrong shape
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    /// True only when the key is present and set to `true`
    pub fn flag(&self, key: &str) -> bool {
        self.get_bool(key).unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Fold in the state an earlier run left for the same step.
    ///
    /// A `*ByThisStep` flag set by either run stays set, and an `already*`
    /// that was false before either run stays false. Other keys keep this
    /// run's value and fall back to the earlier one.
    pub fn merge_earlier(&mut self, earlier: &StepState) {
        for (key, value) in &earlier.values {
            let sticky = (key.ends_with("ByThisStep") && value.as_bool() == Some(true))
                || (key.starts_with("already") && value.as_bool() == Some(false));
            if sticky || !self.values.contains_key(key) {
                self.values.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut state = StepState::new();
        assert!(!state.flag("loadedByThisStep"));

        state.set("loadedByThisStep", true);
        state.set("alreadyPersisted", false);
        assert!(state.flag("loadedByThisStep"));
        assert_eq!(state.get_bool("alreadyPersisted"), Some(false));
        assert!(!state.flag("alreadyPersisted"));

        state.remove("loadedByThisStep");
        assert!(!state.contains("loadedByThisStep"));
    }

    #[test]
    fn test_structured_values() {
        let mut state = StepState::new();
        state.set(
            "commentedLines",
            serde_json::json!(["/swap.img none swap sw 0 0"]),
        );
        let lines: Vec<String> = state.get_as("commentedLines").unwrap();
        assert_eq!(lines, vec!["/swap.img none swap sw 0 0"]);

        let wrong: Option<u32> = state.get_as("commentedLines");
        assert!(wrong.is_none());
    }

    #[test]
    fn test_merge_keeps_earlier_changes() {
        let mut earlier = StepState::new();
        earlier.set("alreadyLoaded", false);
        earlier.set("alreadyPersisted", false);
        earlier.set("loadedByThisStep", true);
        earlier.set("persistedByThisStep", true);
        earlier.set("confCreated", true);

        // the rerun found everything in place
        let mut state = StepState::new();
        state.set("alreadyLoaded", true);
        state.set("alreadyPersisted", true);
        state.set("confCreated", false);
        state.merge_earlier(&earlier);

        assert_eq!(state.get_bool("alreadyLoaded"), Some(false));
        assert_eq!(state.get_bool("alreadyPersisted"), Some(false));
        assert!(state.flag("loadedByThisStep"));
        assert!(state.flag("persistedByThisStep"));
        assert_eq!(state.get_bool("confCreated"), Some(false));
    }

    #[test]
    fn test_merge_does_not_invent_changes() {
        let mut earlier = StepState::new();
        earlier.set("alreadyLoaded", true);
        earlier.set("alreadyPersisted", true);

        let mut state = StepState::new();
        state.set("alreadyLoaded", true);
        state.set("alreadyPersisted", false);
        state.set("persistedByThisStep", true);
        state.merge_earlier(&earlier);

        assert_eq!(state.get_bool("alreadyLoaded"), Some(true));
        assert_eq!(state.get_bool("alreadyPersisted"), Some(false));
        assert!(!state.flag("loadedByThisStep"));
        assert!(state.flag("persistedByThisStep"));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut state = StepState::new();
        state.set("alreadyMounted", true);
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"alreadyMounted":true}"#);

        let back: StepState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
