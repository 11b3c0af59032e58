//! Cells
//!
//! This module defines the unit of computation that lives in the dependency
//! graph: a named cell with a declared read set, a declared write set, a
//! computation function and an optional render action.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::CellError;
use crate::reactive::{CellInputs, RenderPayload};

/// Inline list of variable names. Most cells read and write a handful.
pub type VarList = SmallVec<[String; 4]>;

/// Computation function: declared inputs to declared outputs.
pub type ComputeFn = Arc<dyn Fn(&CellInputs) -> Result<Outputs, CellError> + Send + Sync>;

/// Render action: freshly computed outputs to display payloads. A failing
/// render fails the cell.
pub type RenderFn = Arc<dyn Fn(&Outputs) -> Result<Vec<RenderPayload>, CellError> + Send + Sync>;

/// Identifier of a registered cell.
///
/// The raw value is the cell's declaration index, which is also the
/// tie-breaker for deterministic execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(usize);

impl CellId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Declaration index of the cell.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shape of a cell, derived from its declared sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// No inputs. Runs on the initial pass or when explicitly re-executed.
    Source,

    /// Has inputs and produces outputs.
    Derived,

    /// Has inputs but produces nothing; exists for its render action.
    Sink,
}

/// Values produced by one run of a cell, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outputs(IndexMap<String, Value>);

impl Outputs {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.shift_remove(name)
    }
}

impl IntoIterator for Outputs {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Outputs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A unit of computation in the notebook.
///
/// Read and write sets are fixed at construction. The graph derives edges
/// from them; nothing is inferred from the computation body.
#[derive(Clone)]
pub struct Cell {
    name: String,
    reads: VarList,
    writes: VarList,
    compute: ComputeFn,
    render: Option<RenderFn>,
}

impl Cell {
    /// Create a cell from its declared read set, write set and computation.
    ///
    /// Repeated names in the read set collapse to one. Repeated names in the
    /// write set are kept so that registration can reject them.
    pub fn new<R, W, F>(name: impl Into<String>, reads: R, writes: W, compute: F) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
        F: Fn(&CellInputs) -> Result<Outputs, CellError> + Send + Sync + 'static,
    {
        let mut read_set = VarList::new();
        for name in reads.into_iter().map(Into::into) {
            if !read_set.contains(&name) {
                read_set.push(name);
            }
        }

        Self {
            name: name.into(),
            reads: read_set,
            writes: writes.into_iter().map(Into::into).collect(),
            compute: Arc::new(compute),
            render: None,
        }
    }

    /// Create a cell with no inputs.
    pub fn source<W, F>(name: impl Into<String>, writes: W, compute: F) -> Self
    where
        W: IntoIterator,
        W::Item: Into<String>,
        F: Fn(&CellInputs) -> Result<Outputs, CellError> + Send + Sync + 'static,
    {
        Self::new(name, std::iter::empty::<String>(), writes, compute)
    }

    /// Attach a render action, invoked with the fresh outputs after every
    /// successful run.
    pub fn with_render<F>(self, render: F) -> Self
    where
        F: Fn(&Outputs) -> Vec<RenderPayload> + Send + Sync + 'static,
    {
        self.with_try_render(move |outputs: &Outputs| Ok(render(outputs)))
    }

    /// Attach a render action that can fail. A failure is reported like a
    /// failed computation and the cell's outputs are not written.
    pub fn with_try_render<F>(mut self, render: F) -> Self
    where
        F: Fn(&Outputs) -> Result<Vec<RenderPayload>, CellError> + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(render));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared read set.
    pub fn reads(&self) -> &[String] {
        &self.reads
    }

    /// Declared write set.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    pub fn reads_var(&self, name: &str) -> bool {
        self.reads.iter().any(|r| r == name)
    }

    pub fn writes_var(&self, name: &str) -> bool {
        self.writes.iter().any(|w| w == name)
    }

    pub fn has_render(&self) -> bool {
        self.render.is_some()
    }

    pub fn kind(&self) -> CellKind {
        match (self.reads.is_empty(), self.writes.is_empty()) {
            (true, _) => CellKind::Source,
            (false, false) => CellKind::Derived,
            (false, true) => CellKind::Sink,
        }
    }

    pub(crate) fn compute(&self, inputs: &CellInputs) -> Result<Outputs, CellError> {
        (self.compute)(inputs)
    }

    pub(crate) fn render(&self, outputs: &Outputs) -> Option<Result<Vec<RenderPayload>, CellError>> {
        self.render.as_ref().map(|render| render(outputs))
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("has_render", &self.has_render())
            .finish()
    }
}
