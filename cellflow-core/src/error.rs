//! Error types
//!
//! Errors fall into two groups:
//!
//! - Construction-time errors ([`GraphError`]). These abort graph
//!   finalization; an engine is never built from an invalid graph.
//! - Per-pass cell failures ([`CellError`], wrapped in
//!   [`CellExecutionError`]). These are recovered locally by the scheduler:
//!   the failing cell and its dependents are skipped for that pass and the
//!   failure is surfaced to the render sink.

use thiserror::Error;

/// Errors raised while building or querying the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two cells (or one cell twice) claim the same output variable.
    #[error("variable `{variable}` is produced by both `{existing}` and `{duplicate}`")]
    DuplicateOutput {
        variable: String,
        existing: String,
        duplicate: String,
    },

    /// A cell name was registered more than once.
    #[error("cell `{0}` is already registered")]
    DuplicateCell(String),

    /// The induced dependency graph contains a cycle.
    ///
    /// `cycle` lists cell names in dependency order with the first cell
    /// repeated at the end.
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    /// A variable name that was never declared.
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    /// A cell name that was never registered.
    #[error("unknown cell `{0}`")]
    UnknownCell(String),

    /// An external write targeted a variable that a cell produces.
    #[error("variable `{variable}` is produced by cell `{producer}` and cannot be injected")]
    NotInjectable { variable: String, producer: String },
}

/// Failure reported by (or on behalf of) a single cell computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// The computation itself reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The computation read a variable outside its declared read set.
    #[error("read of undeclared input `{0}`")]
    UndeclaredInput(String),

    /// The computation returned without one of its declared outputs.
    #[error("missing declared output `{0}`")]
    MissingOutput(String),

    /// The computation returned a variable it does not declare.
    #[error("returned undeclared output `{0}`")]
    UndeclaredOutput(String),

    /// The computation panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// An input could not be decoded into the requested type.
    #[error("input `{input}` could not be decoded: {message}")]
    Decode { input: String, message: String },
}

impl CellError {
    /// Convenience constructor for user-level failures.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A cell failure observed during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cell `{cell}` failed: {source}")]
pub struct CellExecutionError {
    pub cell: String,
    #[source]
    pub source: CellError,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("async completion task failed: {0}")]
    Join(String),

    /// A blocking engine call was made from inside a running cell body.
    #[error("engine state is locked by the running pass (called from cell `{cell}`)")]
    Reentrant { cell: String },
}

/// Result alias for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
