//! Scheduler
//!
//! The scheduler owns the value store and the render sink and executes one
//! pass at a time.
//!
//! # A pass
//!
//! 1. Apply the batch's injections to the store. Identical values may be
//!    skipped, in which case they dirty nothing.
//! 2. Keep only the named variables whose version moved since the last
//!    completed pass (the dirty set).
//! 3. Take the downstream closure of the dirty set, plus any cells that were
//!    explicitly re-executed and everything downstream of them.
//! 4. Order the closure topologically and run each cell:
//!    - a cell whose producer failed earlier in the pass is skipped and
//!      marked failed itself;
//!    - otherwise its declared inputs are snapshotted, the computation runs,
//!      the outputs are checked against the write set, the render action is
//!      invoked and the outputs are written.
//!
//! A failed cell writes nothing, so its outputs keep their prior values and
//! versions.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::context::{CellInputs, ExecutionContext};
use super::render::{ErrorMarker, RenderContent, RenderFrame, RenderSink};
use super::store::ValueStore;
use crate::config::EngineConfig;
use crate::error::{CellError, CellExecutionError, GraphError, GraphResult};
use crate::graph::{Cell, CellId, DependencyGraph, Outputs};

/// A coalesced set of pending changes, consumed by one pass.
///
/// Later injections for the same variable replace earlier ones, so only the
/// latest value of a control is ever applied.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    injections: IndexMap<String, Value>,
    changed: IndexSet<String>,
    reruns: IndexSet<String>,
    run_all: bool,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an external value; replaces any earlier value for `name`.
    pub fn inject(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.changed.shift_remove(&name);
        self.injections.insert(name, value);
    }

    /// Report that `name` changed without supplying a value.
    pub fn mark_changed(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.injections.contains_key(&name) {
            self.changed.insert(name);
        }
    }

    /// Queue an explicit re-execution of `cell`.
    pub fn rerun(&mut self, cell: impl Into<String>) {
        self.reruns.insert(cell.into());
    }

    /// Queue a full evaluation of every cell.
    pub fn run_all(&mut self) {
        self.run_all = true;
    }

    /// Fold `other` into `self`; `other` wins on conflicting injections.
    pub fn merge(&mut self, other: ChangeBatch) {
        for (name, value) in other.injections {
            self.inject(name, value);
        }
        for name in other.changed {
            self.mark_changed(name);
        }
        self.reruns.extend(other.reruns);
        self.run_all |= other.run_all;
    }

    pub fn is_empty(&self) -> bool {
        self.injections.is_empty() && self.changed.is_empty() && self.reruns.is_empty() && !self.run_all
    }

    /// Latest queued value for `name`, if any.
    pub fn pending_value(&self, name: &str) -> Option<&Value> {
        self.injections.get(name)
    }

    /// Names with a queued injection.
    pub fn injected(&self) -> impl Iterator<Item = &str> {
        self.injections.keys().map(String::as_str)
    }

    /// Check the batch against `graph` without applying anything.
    ///
    /// Injections must not target produced variables, changed names must be
    /// declared and re-executed cells must exist.
    pub fn validate(&self, graph: &DependencyGraph) -> GraphResult<()> {
        self.validate_with(graph, |_| false)
    }

    /// Like [`validate`](Self::validate), but a changed name is also accepted
    /// when `is_external` knows it, e.g. a variable injected earlier that no
    /// cell reads.
    pub fn validate_with<F>(&self, graph: &DependencyGraph, is_external: F) -> GraphResult<()>
    where
        F: Fn(&str) -> bool,
    {
        for name in self.injections.keys() {
            if let Some(producer) = graph.producer(name) {
                return Err(GraphError::NotInjectable {
                    variable: name.clone(),
                    producer: graph.cell_name(producer).to_string(),
                });
            }
        }
        for name in &self.changed {
            if !graph.contains_variable(name) && !is_external(name) {
                return Err(GraphError::UnknownVariable(name.clone()));
            }
        }
        for cell in &self.reruns {
            graph.cell_id(cell)?;
        }
        Ok(())
    }
}

/// A cell that did not complete in a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    pub cell: String,
    pub marker: ErrorMarker,
}

/// Summary of one executed pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: u64,
    /// Variables whose change triggered the pass.
    pub dirty: Vec<String>,
    /// Every cell scheduled, in execution order.
    pub plan: Vec<String>,
    /// Cells that ran to completion.
    pub executed: Vec<String>,
    /// Cells that failed or were skipped.
    pub failed: Vec<CellFailure>,
}

impl PassReport {
    pub fn succeeded(&self, cell: &str) -> bool {
        self.executed.iter().any(|c| c == cell)
    }

    pub fn failure(&self, cell: &str) -> Option<&ErrorMarker> {
        self.failed
            .iter()
            .find(|f| f.cell == cell)
            .map(|f| &f.marker)
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Executes passes over a sealed graph.
pub struct Scheduler {
    graph: Arc<DependencyGraph>,
    store: ValueStore,
    sink: Box<dyn RenderSink>,
    /// Versions observed at the end of the last completed pass.
    seen: HashMap<String, u64>,
    next_pass: u64,
    catch_panics: bool,
}

impl Scheduler {
    pub fn new(graph: Arc<DependencyGraph>, sink: Box<dyn RenderSink>, config: &EngineConfig) -> Self {
        let store = ValueStore::from_graph(&graph)
            .with_skip_unchanged(config.skip_unchanged_injections);
        Self {
            graph,
            store,
            sink,
            seen: HashMap::new(),
            next_pass: 1,
            catch_panics: config.catch_panics,
        }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn store(&self) -> &ValueStore {
        &self.store
    }

    /// Number of passes that executed at least one cell.
    pub fn passes_run(&self) -> u64 {
        self.next_pass - 1
    }

    /// Write an external value without scheduling anything.
    ///
    /// The change is picked up by the next pass that names `name` (or any
    /// later injection batch), exactly like a value written by a control
    /// before its change event is delivered.
    pub fn write_external(&mut self, name: &str, value: Value) -> GraphResult<Option<u64>> {
        let version = self.store.inject(name, value)?;
        debug!(variable = name, ?version, "external write");
        Ok(version)
    }

    /// Run a pass for variables whose value has just changed.
    ///
    /// Returns `None` when nothing is dirty.
    pub fn run_pass<I>(&mut self, changed: I) -> GraphResult<Option<PassReport>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut batch = ChangeBatch::new();
        for name in changed {
            batch.mark_changed(name);
        }
        self.execute(batch)
    }

    /// Evaluate every cell in topological order.
    pub fn run_all(&mut self) -> GraphResult<Option<PassReport>> {
        let mut batch = ChangeBatch::new();
        batch.run_all();
        self.execute(batch)
    }

    /// Apply a batch and execute the resulting plan.
    ///
    /// The batch is validated first; an invalid batch changes nothing.
    pub fn execute(&mut self, batch: ChangeBatch) -> GraphResult<Option<PassReport>> {
        let store = &self.store;
        batch.validate_with(&self.graph, |name| store.contains(name))?;
        let graph = Arc::clone(&self.graph);

        let mut candidates = batch.changed;
        for (name, value) in batch.injections {
            match self.store.inject(&name, value)? {
                Some(version) => {
                    debug!(variable = %name, version, "applied injection");
                    candidates.insert(name);
                }
                None => debug!(variable = %name, "identical injection skipped"),
            }
        }

        let dirty: Vec<String> = candidates
            .into_iter()
            .filter(|name| {
                let current = self.store.version(name).unwrap_or(0);
                current != self.seen.get(name).copied().unwrap_or(0)
            })
            .collect();

        let mut closure = if batch.run_all {
            graph.all_cells()
        } else {
            graph.downstream_closure(dirty.iter().filter(|v| graph.contains_variable(v)))?
        };
        let reruns = batch
            .reruns
            .iter()
            .map(|name| graph.cell_id(name))
            .collect::<GraphResult<Vec<_>>>()?;
        closure.extend(graph.downstream_of_cells(reruns));

        let plan = graph.topological_order(closure);
        if plan.is_empty() {
            self.seen = self.store.snapshot_versions();
            debug!(dirty = dirty.len(), "nothing to recompute");
            return Ok(None);
        }

        let pass = self.next_pass;
        self.next_pass += 1;
        let span = tracing::info_span!("pass", pass);
        let _enter = span.enter();

        let mut report = PassReport {
            pass,
            dirty,
            plan: plan.iter().map(|&id| graph.cell_name(id).to_string()).collect(),
            ..PassReport::default()
        };
        info!(plan_len = plan.len(), dirty = ?report.dirty, "starting pass");
        self.sink.begin_pass(pass, &report.plan);

        let mut failed: HashSet<CellId> = HashSet::new();
        let mut seq = 0;

        for &id in &plan {
            let Some(cell) = graph.cell(id) else { continue };

            let upstream = graph
                .dependencies(id)
                .iter()
                .find(|dep| failed.contains(dep))
                .copied();
            let content = if let Some(upstream) = upstream {
                let marker = ErrorMarker::Skipped {
                    upstream: graph.cell_name(upstream).to_string(),
                };
                debug!(cell = cell.name(), upstream = graph.cell_name(upstream), "skipping cell");
                failed.insert(id);
                report.failed.push(CellFailure {
                    cell: cell.name().to_string(),
                    marker: marker.clone(),
                });
                Some(RenderContent::Error(marker))
            } else {
                let inputs = self.snapshot_inputs(cell)?;
                match self.run_cell(pass, cell, &inputs) {
                    Ok((outputs, payload)) => {
                        for (name, value) in outputs {
                            self.store.set(&name, value)?;
                        }
                        report.executed.push(cell.name().to_string());
                        debug!(cell = cell.name(), "cell executed");
                        payload.map(RenderContent::Display)
                    }
                    Err(source) => {
                        let error = CellExecutionError {
                            cell: cell.name().to_string(),
                            source,
                        };
                        warn!(cell = cell.name(), %error, "cell failed");
                        let marker = ErrorMarker::Failed {
                            message: error.source.to_string(),
                        };
                        failed.insert(id);
                        report.failed.push(CellFailure {
                            cell: error.cell,
                            marker: marker.clone(),
                        });
                        Some(RenderContent::Error(marker))
                    }
                }
            };

            if let Some(content) = content {
                self.sink.render(RenderFrame {
                    pass,
                    seq,
                    cell: cell.name().to_string(),
                    content,
                });
                seq += 1;
            }
        }

        self.seen = self.store.snapshot_versions();
        info!(
            executed = report.executed.len(),
            failed = report.failed.len(),
            "pass complete"
        );
        self.sink.end_pass(&report);
        Ok(Some(report))
    }

    fn snapshot_inputs(&self, cell: &Cell) -> GraphResult<CellInputs> {
        let mut values = IndexMap::with_capacity(cell.reads().len());
        for name in cell.reads() {
            values.insert(name.clone(), self.store.get(name)?);
        }
        Ok(CellInputs::new(values))
    }

    /// Compute, validate and render one cell without touching the store.
    fn run_cell(
        &self,
        pass: u64,
        cell: &Cell,
        inputs: &CellInputs,
    ) -> Result<(Outputs, Option<Vec<super::RenderPayload>>), CellError> {
        let _ctx = ExecutionContext::enter(pass, cell.name());

        let outputs = self.guarded(|| cell.compute(inputs))??;
        let outputs = check_outputs(cell, outputs)?;
        let payload = self.guarded(|| cell.render(&outputs))?.transpose()?;
        Ok((outputs, payload))
    }

    fn guarded<T>(&self, f: impl FnOnce() -> T) -> Result<T, CellError> {
        if !self.catch_panics {
            return Ok(f());
        }
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| CellError::Panicked(panic_message(&*payload)))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cells", &self.graph.len())
            .field("variables", &self.store.len())
            .field("passes_run", &self.passes_run())
            .finish()
    }
}

/// Reorder outputs to match the write set, rejecting missing or extra names.
fn check_outputs(cell: &Cell, mut outputs: Outputs) -> Result<Outputs, CellError> {
    let mut ordered = Outputs::new();
    for name in cell.writes() {
        let value = outputs
            .remove(name)
            .ok_or_else(|| CellError::MissingOutput(name.clone()))?;
        ordered.insert(name.clone(), value);
    }
    if let Some((extra, _)) = outputs.iter().next() {
        return Err(CellError::UndeclaredOutput(extra.to_string()));
    }
    Ok(ordered)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
