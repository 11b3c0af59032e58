//! Value Store
//!
//! The single source of truth for the current value of every named
//! variable. Each variable carries a monotonic version that is bumped on
//! every effective write; the scheduler compares versions, never values, to
//! decide what is dirty.
//!
//! # Writes
//!
//! - [`ValueStore::set`] is used by cell execution and always bumps.
//! - [`ValueStore::inject`] is used for external (control) values. It may
//!   declare a new source variable, refuses variables a cell produces, and
//!   optionally treats a write of an identical value as a no-op.
//!
//! Values are held behind `Arc` so input snapshots are cheap to take.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{GraphError, GraphResult};
use crate::graph::DependencyGraph;

/// A named, versioned slot.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Arc<Value>,
    version: u64,
    producer: Option<String>,
}

impl Variable {
    fn new(name: String, producer: Option<String>) -> Self {
        Self {
            name,
            value: Arc::new(Value::Null),
            version: 0,
            producer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Arc<Value> {
        &self.value
    }

    /// Zero until the first write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Name of the producing cell, `None` for external variables.
    pub fn producer(&self) -> Option<&str> {
        self.producer.as_deref()
    }

    fn write(&mut self, value: Value) -> u64 {
        self.value = Arc::new(value);
        self.version += 1;
        self.version
    }
}

/// Current values of all declared variables.
#[derive(Debug, Clone)]
pub struct ValueStore {
    vars: IndexMap<String, Variable>,
    skip_unchanged: bool,
}

impl ValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            vars: IndexMap::new(),
            skip_unchanged: true,
        }
    }

    /// Create a store declaring every variable of `graph`.
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let mut store = Self::new();
        for name in graph.variables() {
            let producer = graph
                .producer(name)
                .map(|id| graph.cell_name(id).to_string());
            store.declare(name, producer);
        }
        store
    }

    /// Whether identical injections are ignored (default `true`).
    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    /// Declare a variable. Re-declaring an existing name is a no-op.
    pub fn declare(&mut self, name: &str, producer: Option<String>) {
        if !self.vars.contains_key(name) {
            self.vars
                .insert(name.to_string(), Variable::new(name.to_string(), producer));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn variable(&self, name: &str) -> GraphResult<&Variable> {
        self.vars
            .get(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))
    }

    /// Current value and version.
    pub fn get(&self, name: &str) -> GraphResult<(Arc<Value>, u64)> {
        self.variable(name)
            .map(|var| (Arc::clone(&var.value), var.version))
    }

    pub fn version(&self, name: &str) -> GraphResult<u64> {
        self.variable(name).map(|var| var.version)
    }

    pub fn producer(&self, name: &str) -> GraphResult<Option<&str>> {
        self.variable(name).map(|var| var.producer())
    }

    /// Overwrite a declared variable and bump its version.
    ///
    /// Returns the new version.
    pub fn set(&mut self, name: &str, value: Value) -> GraphResult<u64> {
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;
        Ok(var.write(value))
    }

    /// Write an external value.
    ///
    /// Unknown names are declared as source variables. Returns the new
    /// version, or `None` if the value was identical and identical writes
    /// are skipped.
    pub fn inject(&mut self, name: &str, value: Value) -> GraphResult<Option<u64>> {
        self.declare(name, None);
        let skip_unchanged = self.skip_unchanged;
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownVariable(name.to_string()))?;

        if let Some(producer) = &var.producer {
            return Err(GraphError::NotInjectable {
                variable: name.to_string(),
                producer: producer.clone(),
            });
        }

        if skip_unchanged && var.version > 0 && *var.value == value {
            return Ok(None);
        }
        Ok(Some(var.write(value)))
    }

    /// Versions of every variable, keyed by name.
    pub fn snapshot_versions(&self) -> HashMap<String, u64> {
        self.vars
            .iter()
            .map(|(name, var)| (name.clone(), var.version))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declared_variable_starts_null_at_version_zero() {
        let mut store = ValueStore::new();
        store.declare("df", Some("load".into()));
        let (value, version) = store.get("df").unwrap();
        assert_eq!(*value, Value::Null);
        assert_eq!(version, 0);
        assert_eq!(store.producer("df").unwrap(), Some("load"));
    }

    #[test]
    fn set_bumps_version_every_time() {
        let mut store = ValueStore::new();
        store.declare("b", Some("c2".into()));
        assert_eq!(store.set("b", json!(1)).unwrap(), 1);
        assert_eq!(store.set("b", json!(1)).unwrap(), 2);
        assert_eq!(*store.get("b").unwrap().0, json!(1));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let mut store = ValueStore::new();
        assert_eq!(
            store.get("nope").unwrap_err(),
            GraphError::UnknownVariable("nope".into())
        );
        assert!(store.set("nope", json!(1)).is_err());
    }

    #[test]
    fn inject_declares_source_variable() {
        let mut store = ValueStore::new();
        assert_eq!(store.inject("threshold", json!(10)).unwrap(), Some(1));
        assert!(store.contains("threshold"));
        assert_eq!(store.producer("threshold").unwrap(), None);
    }

    #[test]
    fn identical_injection_is_skipped() {
        let mut store = ValueStore::new();
        assert_eq!(store.inject("threshold", json!(10)).unwrap(), Some(1));
        assert_eq!(store.inject("threshold", json!(10)).unwrap(), None);
        assert_eq!(store.version("threshold").unwrap(), 1);
        assert_eq!(store.inject("threshold", json!(20)).unwrap(), Some(2));
    }

    #[test]
    fn first_injection_of_null_still_counts() {
        let mut store = ValueStore::new();
        store.declare("picked", None);
        assert_eq!(store.inject("picked", Value::Null).unwrap(), Some(1));
    }

    #[test]
    fn identical_injection_can_be_forced() {
        let mut store = ValueStore::new().with_skip_unchanged(false);
        store.inject("threshold", json!(10)).unwrap();
        assert_eq!(store.inject("threshold", json!(10)).unwrap(), Some(2));
    }

    #[test]
    fn produced_variable_cannot_be_injected() {
        let mut store = ValueStore::new();
        store.declare("b", Some("c2".into()));
        assert_eq!(
            store.inject("b", json!(1)).unwrap_err(),
            GraphError::NotInjectable {
                variable: "b".into(),
                producer: "c2".into()
            }
        );
        assert_eq!(store.version("b").unwrap(), 0);
    }

    #[test]
    fn snapshot_versions_covers_everything() {
        let mut store = ValueStore::new();
        store.declare("a", Some("c1".into()));
        store.inject("t", json!(true)).unwrap();
        store.set("a", json!("x")).unwrap();
        store.set("a", json!("y")).unwrap();

        let versions = store.snapshot_versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions["a"], 2);
        assert_eq!(versions["t"], 1);
    }
}
