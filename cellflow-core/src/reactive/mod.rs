//! Reactive Execution
//!
//! This module turns a sealed [`DependencyGraph`](crate::graph::DependencyGraph)
//! into a running notebook.
//!
//! # Pieces
//!
//! ## Value Store
//!
//! [`ValueStore`] holds the current value and version of every variable.
//! Versions, not values, decide what is dirty.
//!
//! ## Scheduler
//!
//! [`Scheduler`] runs one pass at a time: it applies a [`ChangeBatch`],
//! computes the downstream closure of whatever moved, and executes it in
//! topological order. Failures are contained to the failing cell and its
//! dependents.
//!
//! ## Engine
//!
//! [`Engine`] is the shared handle. It serializes passes, coalesces changes
//! that arrive while a pass is running, and exposes [`Completion`] for
//! results that arrive asynchronously.
//!
//! ## Event Bridge
//!
//! [`EventBridge`] translates UI control events into injections, optionally
//! debouncing bursts so only a control's settled value is applied.
//!
//! ## Render Sink
//!
//! [`RenderSink`] receives display output and error markers in plan order.

mod bridge;
mod context;
mod render;
mod runtime;
mod scheduler;
mod store;

pub use bridge::EventBridge;
pub use context::{CellInputs, ExecutionContext};
pub use render::{
    ChannelSink, ErrorMarker, NullSink, RecordingSink, RenderContent, RenderFrame, RenderPayload,
    RenderSink, SinkEvent,
};
pub use runtime::{Completion, Engine};
pub use scheduler::{CellFailure, ChangeBatch, PassReport, Scheduler};
pub use store::{ValueStore, Variable};
