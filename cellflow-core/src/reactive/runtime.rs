//! Engine Runtime
//!
//! The engine is the shared entry point that connects the scheduler to the
//! rest of the world. It owns the scheduler behind a lock and a single
//! pending accumulator for changes that arrive while a pass is running.
//!
//! # How It Works
//!
//! 1. A change (injection, changed variable, re-execution) is validated
//!    against the graph and merged into the pending accumulator.
//!
//! 2. The submitting thread then tries to become the runner by taking the
//!    scheduler lock without blocking.
//!
//! 3. The runner drains the accumulator one batch at a time until it is
//!    empty. Changes that arrive meanwhile are coalesced into the next batch,
//!    so a burst of control values collapses into one pass that observes the
//!    latest value.
//!
//! 4. A thread that could not take the lock returns immediately; its change
//!    is picked up by the running thread.
//!
//! # Thread Safety
//!
//! [`Engine`] is a cheap handle around an `Arc` and is `Send + Sync`. Change
//! requests issued from inside a cell body are queued, never run
//! re-entrantly.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::context::ExecutionContext;
use super::render::RenderSink;
use super::scheduler::{ChangeBatch, PassReport, Scheduler};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, GraphError, GraphResult};
use crate::graph::{DependencyGraph, GraphBuilder};

struct EngineInner {
    graph: Arc<DependencyGraph>,
    scheduler: Mutex<Scheduler>,
    pending: Mutex<ChangeBatch>,
    /// Names written from outside that the graph does not know.
    externals: DashSet<String>,
    config: EngineConfig,
}

/// Shared handle to a running notebook.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Finalize `builder` and start an engine with the default configuration.
    pub fn new<S>(builder: GraphBuilder, sink: S) -> EngineResult<Self>
    where
        S: RenderSink + 'static,
    {
        Self::with_config(builder, sink, EngineConfig::default())
    }

    /// Finalize `builder` and start an engine with `config`.
    pub fn with_config<S>(builder: GraphBuilder, sink: S, config: EngineConfig) -> EngineResult<Self>
    where
        S: RenderSink + 'static,
    {
        let graph = builder.finalize()?;
        Ok(Self::from_graph(graph, Box::new(sink), config))
    }

    /// Start an engine over an already sealed graph.
    pub fn from_graph(graph: DependencyGraph, sink: Box<dyn RenderSink>, config: EngineConfig) -> Self {
        let graph = Arc::new(graph);
        let scheduler = Scheduler::new(Arc::clone(&graph), sink, &config);
        debug!(
            cells = graph.len(),
            variables = graph.variables().count(),
            "engine started"
        );
        Self {
            inner: Arc::new(EngineInner {
                graph,
                scheduler: Mutex::new(scheduler),
                pending: Mutex::new(ChangeBatch::new()),
                externals: DashSet::new(),
                config,
            }),
        }
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.inner.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Write an external value and run the resulting pass.
    ///
    /// Returns the passes executed by this call, which is empty when the
    /// change was handed to a pass already in progress.
    pub fn inject(&self, name: impl Into<String>, value: Value) -> GraphResult<Vec<PassReport>> {
        let mut batch = ChangeBatch::new();
        batch.inject(name, value);
        self.submit(batch)
    }

    /// Run a pass for variables that changed outside the engine's view.
    pub fn run_pass<I>(&self, changed: I) -> GraphResult<Vec<PassReport>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut batch = ChangeBatch::new();
        for name in changed {
            batch.mark_changed(name);
        }
        self.submit(batch)
    }

    /// Evaluate every cell, as on first load.
    pub fn run_all(&self) -> GraphResult<Vec<PassReport>> {
        let mut batch = ChangeBatch::new();
        batch.run_all();
        self.submit(batch)
    }

    /// Re-execute `cell` and everything downstream of it.
    pub fn rerun_cell(&self, cell: &str) -> GraphResult<Vec<PassReport>> {
        let mut batch = ChangeBatch::new();
        batch.rerun(cell);
        self.submit(batch)
    }

    /// Validate and queue `batch`, then drain the queue if no pass is running.
    pub fn submit(&self, batch: ChangeBatch) -> GraphResult<Vec<PassReport>> {
        self.enqueue(batch)?;
        Ok(self.flush())
    }

    /// Validate and queue `batch` without running anything.
    pub fn enqueue(&self, batch: ChangeBatch) -> GraphResult<()> {
        let externals = &self.inner.externals;
        batch.validate_with(&self.inner.graph, |name| externals.contains(name))?;
        for name in batch.injected() {
            self.note_external(name);
        }
        self.inner.pending.lock().merge(batch);
        Ok(())
    }

    /// Write an external value without requesting a pass.
    ///
    /// A later [`run_pass`](Self::run_pass) naming `name` picks the change
    /// up. Blocks while a pass is running. Returns the new version, or `None`
    /// if the value was identical and skipped.
    pub fn write_external(&self, name: &str, value: Value) -> EngineResult<Option<u64>> {
        if let Some(cell) = ExecutionContext::current_cell() {
            return Err(EngineError::Reentrant { cell });
        }
        let version = self.inner.scheduler.lock().write_external(name, value)?;
        self.note_external(name);
        Ok(version)
    }

    fn note_external(&self, name: &str) {
        if !self.inner.graph.contains_variable(name) && !self.inner.externals.contains(name) {
            self.inner.externals.insert(name.to_string());
        }
    }

    /// Run queued changes until the queue is empty.
    ///
    /// Returns immediately with no reports if another thread is running a
    /// pass; that thread drains the queue before it lets go.
    pub fn flush(&self) -> Vec<PassReport> {
        let mut reports = Vec::new();

        if let Some(cell) = ExecutionContext::current_cell() {
            debug!(cell = %cell, "change requested inside a cell; queued for next pass");
            return reports;
        }

        loop {
            {
                let Some(mut scheduler) = self.inner.scheduler.try_lock() else {
                    debug!("pass in progress; change queued");
                    return reports;
                };
                while let Some(batch) = self.take_pending() {
                    match scheduler.execute(batch) {
                        Ok(Some(report)) => reports.push(report),
                        Ok(None) => {}
                        Err(error) => error!(%error, "queued change rejected"),
                    }
                }
            }

            // A submitter may have queued work between the last drain and
            // the unlock, and seen the lock still held.
            if self.inner.pending.lock().is_empty() {
                return reports;
            }
        }
    }

    fn take_pending(&self) -> Option<ChangeBatch> {
        let mut pending = self.inner.pending.lock();
        if pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *pending))
        }
    }

    /// Whether changes are waiting for a pass.
    pub fn has_pending(&self) -> bool {
        !self.inner.pending.lock().is_empty()
    }

    /// Current value and version of `name`.
    ///
    /// Blocks while a pass is running. Calling it from inside a cell body is
    /// an error; cells read through their inputs.
    pub fn get(&self, name: &str) -> EngineResult<(Arc<Value>, u64)> {
        Ok(self.with_scheduler(|s| s.store().get(name))??)
    }

    /// Current value of `name`, cloned.
    pub fn value(&self, name: &str) -> EngineResult<Value> {
        self.get(name).map(|(value, _)| (*value).clone())
    }

    pub fn version(&self, name: &str) -> EngineResult<u64> {
        Ok(self.with_scheduler(|s| s.store().version(name))??)
    }

    /// Number of passes that executed at least one cell.
    pub fn passes_run(&self) -> EngineResult<u64> {
        self.with_scheduler(|s| s.passes_run())
    }

    fn with_scheduler<T>(&self, f: impl FnOnce(&Scheduler) -> T) -> EngineResult<T> {
        if let Some(cell) = ExecutionContext::current_cell() {
            return Err(EngineError::Reentrant { cell });
        }
        Ok(f(&self.inner.scheduler.lock()))
    }

    /// Handle for an asynchronously produced external variable.
    pub fn completion(&self, variable: impl Into<String>) -> GraphResult<Completion> {
        let variable = variable.into();
        if let Some(producer) = self.inner.graph.producer(&variable) {
            return Err(GraphError::NotInjectable {
                variable,
                producer: self.inner.graph.cell_name(producer).to_string(),
            });
        }
        Ok(Completion {
            engine: self.clone(),
            variable,
        })
    }

    /// Await `future` on the tokio runtime and inject its output into
    /// `variable` when it resolves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_completion<F>(
        &self,
        variable: impl Into<String>,
        future: F,
    ) -> GraphResult<JoinHandle<EngineResult<Vec<PassReport>>>>
    where
        F: Future<Output = Value> + Send + 'static,
    {
        let completion = self.completion(variable)?;
        Ok(tokio::spawn(completion.resolve_with(future)))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("cells", &self.inner.graph.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Pending external value produced outside the synchronous cell model.
///
/// Resolving it is an ordinary change event: the value is injected and a
/// pass is requested.
#[derive(Debug, Clone)]
pub struct Completion {
    engine: Engine,
    variable: String,
}

impl Completion {
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Inject `value` and run the resulting pass on this thread.
    pub fn resolve(self, value: Value) -> GraphResult<Vec<PassReport>> {
        debug!(variable = %self.variable, "completion resolved");
        self.engine.inject(self.variable, value)
    }

    /// Await `future`, then resolve with its output.
    ///
    /// The pass runs on tokio's blocking pool so the async caller is not
    /// held up by cell computations.
    pub async fn resolve_with<F>(self, future: F) -> EngineResult<Vec<PassReport>>
    where
        F: Future<Output = Value>,
    {
        let value = future.await;
        let reports = tokio::task::spawn_blocking(move || self.resolve(value))
            .await
            .map_err(|e| {
                warn!(error = %e, "completion task failed");
                EngineError::Join(e.to_string())
            })??;
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;
    use crate::graph::{Cell, Outputs};
    use crate::reactive::{CellInputs, NullSink, RecordingSink};
    use serde_json::json;
    use std::sync::mpsc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;
    use std::thread;

    fn doubler() -> Cell {
        Cell::new("double", ["x"], ["y"], |inputs: &CellInputs| {
            let x = inputs.get("x")?.as_i64().unwrap_or(0);
            Ok(Outputs::new().with("y", json!(x * 2)))
        })
    }

    fn engine(cells: Vec<Cell>) -> Engine {
        let mut builder = GraphBuilder::new();
        for cell in cells {
            builder.register(cell).unwrap();
        }
        Engine::new(builder, NullSink).unwrap()
    }

    #[test]
    fn inject_runs_a_pass() {
        let engine = engine(vec![doubler()]);
        let reports = engine.inject("x", json!(21)).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].plan, vec!["double"]);
        assert_eq!(engine.value("y").unwrap(), json!(42));
        assert_eq!(engine.version("y").unwrap(), 1);
        assert!(!engine.has_pending());
    }

    #[test]
    fn produced_variable_is_rejected_before_queueing() {
        let engine = engine(vec![doubler()]);
        assert!(matches!(
            engine.inject("y", json!(1)).unwrap_err(),
            GraphError::NotInjectable { .. }
        ));
        assert!(!engine.has_pending());
        assert!(engine.completion("y").is_err());
    }

    #[test]
    fn rerun_cell_includes_the_cell() {
        let engine = engine(vec![
            Cell::source("load", ["df"], |_: &CellInputs| Ok(Outputs::new().with("df", json!([1, 2])))),
            Cell::new("count", ["df"], ["n"], |inputs: &CellInputs| {
                let n = inputs.get("df")?.as_array().map(Vec::len).unwrap_or(0);
                Ok(Outputs::new().with("n", json!(n)))
            }),
        ]);
        let reports = engine.rerun_cell("load").unwrap();
        assert_eq!(reports[0].plan, vec!["load", "count"]);
        assert_eq!(engine.value("n").unwrap(), json!(2));
        assert!(engine.rerun_cell("ghost").is_err());
    }

    #[test]
    fn external_write_is_observed_by_run_pass() {
        let engine = engine(vec![
            Cell::new("c2", ["a"], ["b"], |inputs: &CellInputs| {
                Ok(Outputs::new().with("b", inputs.get("a")?.clone()))
            }),
            Cell::new("c3", ["b"], ["c"], |inputs: &CellInputs| {
                Ok(Outputs::new().with("c", inputs.get("b")?.clone()))
            }),
        ]);
        assert!(engine.run_pass(["a"]).unwrap().is_empty());

        assert_eq!(engine.write_external("a", json!("v1")).unwrap(), Some(1));
        assert_eq!(engine.passes_run().unwrap(), 0);

        let reports = engine.run_pass(["a"]).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].plan, vec!["c2", "c3"]);
        assert_eq!(engine.value("c").unwrap(), json!("v1"));
        assert!(matches!(
            engine.write_external("b", json!(0)).unwrap_err(),
            EngineError::Graph(GraphError::NotInjectable { .. })
        ));
    }

    #[test]
    fn injected_name_outside_graph_is_a_known_variable() {
        let engine = engine(vec![doubler()]);
        assert!(engine.inject("note", json!("hello")).unwrap().is_empty());
        assert_eq!(engine.value("note").unwrap(), json!("hello"));
        assert!(engine.run_pass(["note"]).unwrap().is_empty());

        engine.write_external("scratch", json!(1)).unwrap();
        assert!(engine.run_pass(["scratch"]).unwrap().is_empty());

        assert_eq!(
            engine.run_pass(["never_written"]).unwrap_err(),
            GraphError::UnknownVariable("never_written".into())
        );
    }

    #[test]
    fn burst_during_a_pass_coalesces_into_one_pass() {
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = Mutex::new(go_rx);
        let block_once = AtomicBool::new(true);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);

        let engine = engine(vec![
            Cell::new("slow", ["trigger"], ["s"], move |_: &CellInputs| {
                if block_once.swap(false, Ordering::SeqCst) {
                    started_tx.send(()).ok();
                    go_rx.lock().recv().ok();
                }
                Ok(Outputs::new().with("s", json!(true)))
            }),
            Cell::new("filter", ["threshold"], ["filtered"], move |inputs: &CellInputs| {
                let t = inputs.get("threshold")?.as_i64().unwrap_or(0);
                seen.lock().push(t);
                Ok(Outputs::new().with("filtered", json!(t)))
            }),
        ]);

        let runner = {
            let engine = engine.clone();
            thread::spawn(move || engine.inject("trigger", json!(1)).unwrap())
        };
        started_rx.recv().unwrap();

        assert!(engine.inject("threshold", json!(10)).unwrap().is_empty());
        assert!(engine.inject("threshold", json!(20)).unwrap().is_empty());
        assert!(engine.has_pending());
        go_tx.send(()).unwrap();

        let reports = runner.join().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].plan, vec!["filter"]);
        assert_eq!(*observed.lock(), vec![20]);
        assert_eq!(engine.value("filtered").unwrap(), json!(20));
        assert_eq!(engine.passes_run().unwrap(), 2);
    }

    #[test]
    fn change_requested_inside_a_cell_runs_next() {
        let handle: Arc<OnceLock<Engine>> = Arc::new(OnceLock::new());
        let inner = Arc::clone(&handle);

        let engine = engine(vec![
            Cell::new("kick", ["x"], ["k"], move |inputs: &CellInputs| {
                let engine = inner.get().ok_or_else(|| CellError::failed("engine not set"))?;
                let x = inputs.get("x")?.clone();
                let ran = engine
                    .inject("follow_up", x.clone())
                    .map_err(|e| CellError::failed(e.to_string()))?;
                assert!(ran.is_empty());
                assert!(matches!(engine.get("k"), Err(EngineError::Reentrant { .. })));
                Ok(Outputs::new().with("k", x))
            }),
            Cell::new("echo", ["follow_up"], ["e"], |inputs: &CellInputs| {
                Ok(Outputs::new().with("e", inputs.get("follow_up")?.clone()))
            }),
        ]);
        handle.set(engine.clone()).unwrap();

        let reports = engine.inject("x", json!("hi")).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].plan, vec!["kick"]);
        assert_eq!(reports[1].plan, vec!["echo"]);
        assert_eq!(engine.value("e").unwrap(), json!("hi"));
    }

    #[test]
    fn concurrent_submitters_all_land() {
        let sink = RecordingSink::new();
        let mut builder = GraphBuilder::new();
        for i in 0..4 {
            let input = format!("in{i}");
            let output = format!("out{i}");
            let key = output.clone();
            builder
                .register(Cell::new(format!("c{i}"), [input.clone()], [output], move |inputs: &CellInputs| {
                    Ok(Outputs::new().with(key.clone(), inputs.get(&input)?.clone()))
                }))
                .unwrap();
        }
        let engine = Engine::new(builder, sink.clone()).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for v in 0..25 {
                        engine.inject(format!("in{i}"), json!(v)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        engine.flush();

        for i in 0..4 {
            assert_eq!(engine.value(&format!("out{i}")).unwrap(), json!(24));
        }
        assert!(sink.reports().iter().all(|r| r.is_clean()));
    }

    #[tokio::test]
    async fn spawned_completion_injects_result() {
        let engine = engine(vec![doubler()]);
        let handle = engine
            .spawn_completion("x", async { json!(5) })
            .unwrap();
        let reports = handle.await.unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(engine.value("y").unwrap(), json!(10));
    }

    #[tokio::test]
    async fn completion_can_be_resolved_directly() {
        let engine = engine(vec![doubler()]);
        let completion = engine.completion("x").unwrap();
        assert_eq!(completion.variable(), "x");
        let reports = completion
            .resolve_with(async { json!(3) })
            .await
            .unwrap();
        assert_eq!(reports[0].executed, vec!["double"]);
    }
}
