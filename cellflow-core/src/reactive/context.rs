//! Execution Context
//!
//! Two pieces of per-run state live here:
//!
//! - [`CellInputs`], the read-only snapshot handed to a cell computation.
//!   It only exposes the cell's declared read set.
//! - [`ExecutionContext`], a thread-local stack recording which cell is
//!   currently computing. The engine consults it to recognise change
//!   requests issued from inside a cell body, which are queued for the next
//!   pass instead of being run re-entrantly.

use std::cell::RefCell;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CellError;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone)]
struct ContextEntry {
    pass: u64,
    cell: String,
}

/// Guard marking a cell computation as in progress on this thread.
///
/// The entry is popped when the guard is dropped, including during unwinding.
pub struct ExecutionContext {
    pass: u64,
}

impl ExecutionContext {
    pub(crate) fn enter(pass: u64, cell: &str) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                pass,
                cell: cell.to_string(),
            });
        });
        Self { pass }
    }

    /// Whether a cell computation is running on this thread.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Name of the innermost computing cell, if any.
    pub fn current_cell() -> Option<String> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.cell.clone()))
    }

    /// Pass id of the innermost computing cell, if any.
    pub fn current_pass() -> Option<u64> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.pass))
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.pass, self.pass,
                    "ExecutionContext mismatch: expected pass {}, got {}",
                    self.pass, entry.pass
                );
            }
        });
    }
}

/// Snapshot of a cell's declared inputs for one run.
#[derive(Debug, Clone, Default)]
pub struct CellInputs {
    values: IndexMap<String, (Arc<Value>, u64)>,
}

impl CellInputs {
    pub(crate) fn new(values: IndexMap<String, (Arc<Value>, u64)>) -> Self {
        Self { values }
    }

    /// Build inputs directly, for exercising a computation outside an engine.
    /// Every entry gets version 1.
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), (Arc::new(v), 1)))
                .collect(),
        }
    }

    /// Value of a declared input.
    pub fn get(&self, name: &str) -> Result<&Value, CellError> {
        self.values
            .get(name)
            .map(|(value, _)| value.as_ref())
            .ok_or_else(|| CellError::UndeclaredInput(name.to_string()))
    }

    /// Version of a declared input at the time the snapshot was taken.
    pub fn version(&self, name: &str) -> Result<u64, CellError> {
        self.values
            .get(name)
            .map(|(_, version)| *version)
            .ok_or_else(|| CellError::UndeclaredInput(name.to_string()))
    }

    /// Decode a declared input into `T`.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<T, CellError> {
        let value = self.get(name)?.clone();
        serde_json::from_value(value).map_err(|e| CellError::Decode {
            input: name.to_string(),
            message: e.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
