//! Cellflow Core
//!
//! This crate provides the dataflow engine behind the cellflow reactive
//! notebook. It implements:
//!
//! - Cells with explicitly declared read and write sets
//! - A dependency graph with duplicate-output and cycle rejection
//! - Minimal, topologically ordered re-execution after a change
//! - A control event bridge with optional debouncing
//! - A render sink contract for display output and error markers
//!
//! The crate is designed to be used both as a native Rust library and, with
//! the `python` feature, as a Python extension module via PyO3.
//!
//! # Architecture
//!
//! - `graph`: cells and the sealed dependency graph
//! - `reactive`: value store, scheduler, engine handle, event bridge and
//!   render sinks
//! - `config`: engine tunables
//! - `error`: error types
//!
//! # Example
//!
//! ```rust
//! use cellflow_core::graph::{Cell, GraphBuilder, Outputs};
//! use cellflow_core::reactive::{CellInputs, Engine, RecordingSink};
//! use serde_json::json;
//!
//! let mut builder = GraphBuilder::new();
//! builder
//!     .register(Cell::new("double", ["x"], ["y"], |inputs: &CellInputs| {
//!         let x: i64 = inputs.decode("x")?;
//!         Ok(Outputs::new().with("y", json!(x * 2)))
//!     }))
//!     .unwrap();
//!
//! let engine = Engine::new(builder, RecordingSink::new()).unwrap();
//! engine.inject("x", json!(21)).unwrap();
//! assert_eq!(engine.value("y").unwrap(), json!(42));
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

#[cfg(feature = "python")]
mod python;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module definition.
///
/// This function is called by Python when importing the module.
/// It registers all Python-exposed types.
#[cfg(feature = "python")]
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyNotebook>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
