//! Dependency Graph
//!
//! Cells are registered into a [`GraphBuilder`], which checks write-set
//! disjointness as each cell arrives. [`GraphBuilder::finalize`] derives the
//! edge set and rejects cycles, producing an immutable [`DependencyGraph`].
//!
//! # Algorithms
//!
//! - Cycle detection: depth-first traversal along producer → reader edges,
//!   with a per-cell in-progress marker. Reaching a cell that is still in
//!   progress closes a cycle.
//! - Downstream closure: breadth-first walk from the readers of the changed
//!   variables along dependent edges.
//! - Topological order: Kahn's algorithm restricted to the requested cells,
//!   with a min-heap of ready cells keyed on declaration index so that
//!   unconstrained cells always run in declaration order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::cell::{Cell, CellId};
use crate::error::{GraphError, GraphResult};

/// A set of cells, iterated in declaration order.
pub type CellSet = BTreeSet<CellId>;

type Adjacency = SmallVec<[CellId; 4]>;

/// Producer name reported when a cell tries to write a declared input.
const EXTERNAL_PRODUCER: &str = "<external input>";

/// Collects cells before the graph is sealed.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    cells: Vec<Cell>,
    names: IndexMap<String, CellId>,
    producers: IndexMap<String, CellId>,
    inputs: IndexSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cell.
    ///
    /// Fails with [`GraphError::DuplicateOutput`] if any variable in the
    /// cell's write set is already produced (by another cell, by this cell's
    /// own write set, or as a declared external input). On failure the
    /// builder is left unchanged.
    pub fn register(&mut self, cell: Cell) -> GraphResult<CellId> {
        if self.names.contains_key(cell.name()) {
            return Err(GraphError::DuplicateCell(cell.name().to_string()));
        }

        self.check_writes(&cell)?;

        let id = CellId::new(self.cells.len());
        for var in cell.writes() {
            self.producers.insert(var.clone(), id);
        }
        self.names.insert(cell.name().to_string(), id);
        tracing::trace!(cell = cell.name(), id = id.index(), "registered cell");
        self.cells.push(cell);
        Ok(id)
    }

    /// Reject a write set that overlaps an existing producer, a declared
    /// input or itself.
    fn check_writes(&self, cell: &Cell) -> GraphResult<()> {
        let mut claimed: SmallVec<[&str; 4]> = SmallVec::new();
        for var in cell.writes() {
            let existing = if let Some(producer) = self.producers.get(var) {
                Some(self.cells[producer.index()].name().to_string())
            } else if claimed.contains(&var.as_str()) {
                Some(cell.name().to_string())
            } else if self.inputs.contains(var) {
                Some(EXTERNAL_PRODUCER.to_string())
            } else {
                None
            };

            if let Some(existing) = existing {
                return Err(GraphError::DuplicateOutput {
                    variable: var.clone(),
                    existing,
                    duplicate: cell.name().to_string(),
                });
            }
            claimed.push(var.as_str());
        }
        Ok(())
    }

    /// Declare an external (control) variable ahead of time.
    ///
    /// Variables read by some cell but produced by none are external
    /// implicitly; this is only needed for inputs nothing reads yet.
    pub fn declare_input(&mut self, name: impl Into<String>) -> GraphResult<()> {
        let name = name.into();
        if let Some(producer) = self.producers.get(&name) {
            return Err(GraphError::NotInjectable {
                producer: self.cells[producer.index()].name().to_string(),
                variable: name,
            });
        }
        self.inputs.insert(name);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Derive edges and seal the graph.
    ///
    /// Fails with [`GraphError::Cycle`] if the induced graph is not acyclic.
    pub fn finalize(self) -> GraphResult<DependencyGraph> {
        let n = self.cells.len();
        let mut variables = IndexSet::new();
        let mut readers: IndexMap<String, Adjacency> = IndexMap::new();
        let mut dependencies = vec![Adjacency::new(); n];
        let mut dependents = vec![Adjacency::new(); n];

        for (index, cell) in self.cells.iter().enumerate() {
            let id = CellId::new(index);
            for var in cell.reads() {
                variables.insert(var.clone());
                readers.entry(var.clone()).or_default().push(id);

                if let Some(&producer) = self.producers.get(var) {
                    if !dependencies[index].contains(&producer) {
                        dependencies[index].push(producer);
                    }
                    if !dependents[producer.index()].contains(&id) {
                        dependents[producer.index()].push(id);
                    }
                }
            }
            for var in cell.writes() {
                variables.insert(var.clone());
            }
        }
        for input in self.inputs {
            variables.insert(input);
        }

        let graph = DependencyGraph {
            cells: self.cells,
            names: self.names,
            producers: self.producers,
            readers,
            variables,
            dependencies,
            dependents,
        };

        if let Some(cycle) = graph.find_cycle() {
            let cycle: Vec<String> = cycle
                .into_iter()
                .map(|id| graph.cells[id.index()].name().to_string())
                .collect();
            return Err(GraphError::Cycle { cycle });
        }

        tracing::debug!(
            cells = graph.len(),
            variables = graph.variables.len(),
            "dependency graph finalized"
        );
        Ok(graph)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// The sealed, acyclic dependency graph.
///
/// Edges run from a producing cell to every cell that reads one of its
/// outputs. Both directions are indexed by declaration index.
#[derive(Debug)]
pub struct DependencyGraph {
    cells: Vec<Cell>,
    names: IndexMap<String, CellId>,
    producers: IndexMap<String, CellId>,
    readers: IndexMap<String, Adjacency>,
    variables: IndexSet<String>,
    dependencies: Vec<Adjacency>,
    dependents: Vec<Adjacency>,
}

impl DependencyGraph {
    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All cells in declaration order.
    pub fn cells(&self) -> impl Iterator<Item = (CellId, &Cell)> {
        self.cells
            .iter()
            .enumerate()
            .map(|(i, cell)| (CellId::new(i), cell))
    }

    /// Every cell id, as a set.
    pub fn all_cells(&self) -> CellSet {
        (0..self.cells.len()).map(CellId::new).collect()
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(id.index())
    }

    pub fn cell_id(&self, name: &str) -> GraphResult<CellId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownCell(name.to_string()))
    }

    pub(crate) fn cell_name(&self, id: CellId) -> &str {
        self.cells[id.index()].name()
    }

    /// Every declared variable in declaration order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(String::as_str)
    }

    pub fn contains_variable(&self, name: &str) -> bool {
        self.variables.contains(name)
    }

    /// The cell producing `var`, if any.
    pub fn producer(&self, var: &str) -> Option<CellId> {
        self.producers.get(var).copied()
    }

    /// Cells reading `var`, in declaration order.
    pub fn readers(&self, var: &str) -> &[CellId] {
        self.readers.get(var).map(|r| r.as_slice()).unwrap_or(&[])
    }

    /// Whether `var` is declared and produced by no cell.
    pub fn is_external(&self, var: &str) -> bool {
        self.variables.contains(var) && !self.producers.contains_key(var)
    }

    /// Cells that `id` reads from.
    pub fn dependencies(&self, id: CellId) -> &[CellId] {
        &self.dependencies[id.index()]
    }

    /// Cells that read from `id`.
    pub fn dependents(&self, id: CellId) -> &[CellId] {
        &self.dependents[id.index()]
    }

    /// All cells transitively affected by a change to `changed`.
    ///
    /// Seeds are the direct readers of each changed variable, whether it is
    /// produced by a cell or injected externally; the producer itself is not
    /// included. An empty input yields an empty closure.
    pub fn downstream_closure<I>(&self, changed: I) -> GraphResult<CellSet>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut seeds = Vec::new();
        for var in changed {
            let var = var.as_ref();
            if !self.variables.contains(var) {
                return Err(GraphError::UnknownVariable(var.to_string()));
            }
            seeds.extend_from_slice(self.readers(var));
        }
        Ok(self.closure_from(seeds))
    }

    /// The given cells plus everything downstream of them.
    pub fn downstream_of_cells<I>(&self, cells: I) -> CellSet
    where
        I: IntoIterator<Item = CellId>,
    {
        self.closure_from(cells)
    }

    fn closure_from<I>(&self, seeds: I) -> CellSet
    where
        I: IntoIterator<Item = CellId>,
    {
        let mut closure = CellSet::new();
        let mut queue: VecDeque<CellId> = seeds.into_iter().collect();

        while let Some(id) = queue.pop_front() {
            if !closure.insert(id) {
                continue;
            }
            queue.extend(self.dependents(id).iter().copied());
        }

        closure
    }

    /// Order `cells` so that each appears after every cell it depends on
    /// within the set. Unconstrained cells keep declaration order.
    pub fn topological_order<I>(&self, cells: I) -> Vec<CellId>
    where
        I: IntoIterator<Item = CellId>,
    {
        let set: CellSet = cells
            .into_iter()
            .filter(|id| id.index() < self.cells.len())
            .collect();
        let mut in_degree: HashMap<CellId, usize> = HashMap::with_capacity(set.len());
        let mut ready = BinaryHeap::new();

        // In-degrees only count edges inside the requested set.
        for &id in &set {
            let degree = self
                .dependencies(id)
                .iter()
                .filter(|d| set.contains(d))
                .count();
            in_degree.insert(id, degree);
            if degree == 0 {
                ready.push(Reverse(id));
            }
        }

        let mut order = Vec::with_capacity(set.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for dependent in self.dependents(id) {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*dependent));
                    }
                }
            }
        }

        order
    }

    /// Depth-first search along dependents with an explicit stack, so long
    /// chains do not grow the call stack.
    fn find_cycle(&self) -> Option<Vec<CellId>> {
        let mut marks = vec![Mark::Unvisited; self.cells.len()];
        // (cell, index of the next dependent to visit)
        let mut stack: Vec<(CellId, usize)> = Vec::new();

        for index in 0..self.cells.len() {
            if marks[index] != Mark::Unvisited {
                continue;
            }
            marks[index] = Mark::InProgress;
            stack.push((CellId::new(index), 0));

            while let Some(top) = stack.last_mut() {
                let (id, cursor) = *top;
                let Some(&next) = self.dependents(id).get(cursor) else {
                    marks[id.index()] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;

                match marks[next.index()] {
                    Mark::InProgress => {
                        let start = stack.iter().position(|&(p, _)| p == next).unwrap_or(0);
                        let mut cycle: Vec<CellId> = stack[start..].iter().map(|&(p, _)| p).collect();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;
    use crate::graph::cell::Outputs;
    use crate::reactive::CellInputs;

    fn noop(_: &CellInputs) -> Result<Outputs, CellError> {
        Ok(Outputs::new())
    }

    fn cell(name: &str, reads: &[&str], writes: &[&str]) -> Cell {
        Cell::new(name, reads.iter().copied(), writes.iter().copied(), noop)
    }

    fn build(cells: Vec<Cell>) -> GraphResult<DependencyGraph> {
        let mut builder = GraphBuilder::new();
        for c in cells {
            builder.register(c)?;
        }
        builder.finalize()
    }

    fn names(graph: &DependencyGraph, ids: &[CellId]) -> Vec<String> {
        ids.iter().map(|&id| graph.cell_name(id).to_string()).collect()
    }

    fn chain() -> DependencyGraph {
        build(vec![
            cell("c1", &[], &["a"]),
            cell("c2", &["a"], &["b"]),
            cell("c3", &["b"], &[]),
            cell("other", &["z"], &["y"]),
        ])
        .unwrap()
    }

    #[test]
    fn duplicate_output_rejected_in_either_order() {
        for (first, second) in [("p", "q"), ("q", "p")] {
            let mut builder = GraphBuilder::new();
            builder.register(cell(first, &[], &["x", "y"])).unwrap();
            let err = builder.register(cell(second, &["w"], &["y"])).unwrap_err();
            assert_eq!(
                err,
                GraphError::DuplicateOutput {
                    variable: "y".into(),
                    existing: first.into(),
                    duplicate: second.into(),
                }
            );
            // The rejected cell left nothing behind.
            assert_eq!(builder.len(), 1);
        }
    }

    #[test]
    fn duplicate_output_within_one_cell_rejected() {
        let mut builder = GraphBuilder::new();
        let err = builder.register(cell("p", &[], &["x", "x"])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateOutput { ref existing, .. } if existing == "p"));
    }

    #[test]
    fn duplicate_cell_name_rejected() {
        let mut builder = GraphBuilder::new();
        builder.register(cell("p", &[], &["x"])).unwrap();
        let err = builder.register(cell("p", &[], &["y"])).unwrap_err();
        assert_eq!(err, GraphError::DuplicateCell("p".into()));
    }

    #[test]
    fn declared_input_cannot_be_produced() {
        let mut builder = GraphBuilder::new();
        builder.declare_input("threshold").unwrap();
        let err = builder.register(cell("p", &[], &["threshold"])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateOutput { .. }));

        let mut builder = GraphBuilder::new();
        builder.register(cell("p", &[], &["x"])).unwrap();
        let err = builder.declare_input("x").unwrap_err();
        assert!(matches!(err, GraphError::NotInjectable { .. }));
    }

    #[test]
    fn two_cell_cycle_detected() {
        let err = build(vec![cell("a", &["y"], &["x"]), cell("b", &["x"], &["y"])]).unwrap_err();
        match err {
            GraphError::Cycle { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 3);
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn transitive_cycle_detected() {
        let err = build(vec![
            cell("a", &["z"], &["x"]),
            cell("b", &["x"], &["y"]),
            cell("c", &["y"], &["z"]),
            cell("d", &["x"], &[]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
    }

    #[test]
    fn self_read_is_a_cycle() {
        let err = build(vec![cell("a", &["x"], &["x"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn closure_of_computed_variable_excludes_producer() {
        let graph = chain();
        let closure = graph.downstream_closure(["a"]).unwrap();
        let plan = graph.topological_order(closure);
        assert_eq!(names(&graph, &plan), vec!["c2", "c3"]);
    }

    #[test]
    fn rerun_includes_cell_itself() {
        let graph = chain();
        let c1 = graph.cell_id("c1").unwrap();
        let plan = graph.topological_order(graph.downstream_of_cells([c1]));
        assert_eq!(names(&graph, &plan), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn unrelated_change_leaves_chain_alone() {
        let graph = chain();
        let closure = graph.downstream_closure(["z"]).unwrap();
        assert_eq!(names(&graph, &graph.topological_order(closure)), vec!["other"]);
        assert!(graph.is_external("z"));
        assert!(!graph.is_external("a"));
    }

    #[test]
    fn empty_change_set_is_empty_closure() {
        let graph = chain();
        assert!(graph.downstream_closure(Vec::<String>::new()).unwrap().is_empty());
    }

    #[test]
    fn unknown_variable_rejected() {
        let graph = chain();
        assert_eq!(
            graph.downstream_closure(["nope"]).unwrap_err(),
            GraphError::UnknownVariable("nope".into())
        );
    }

    #[test]
    fn ties_follow_declaration_order() {
        // `late` is declared before `early` but both only depend on `src`.
        let graph = build(vec![
            cell("src", &["t"], &["s"]),
            cell("late", &["s"], &["l"]),
            cell("early", &["s"], &["e"]),
            cell("join", &["e", "l"], &[]),
        ])
        .unwrap();
        let plan = graph.topological_order(graph.all_cells());
        assert_eq!(names(&graph, &plan), vec!["src", "late", "early", "join"]);
    }

    #[test]
    fn dependency_declared_after_dependent_still_runs_first() {
        let graph = build(vec![
            cell("report", &["summary"], &[]),
            cell("summarize", &["df"], &["summary"]),
            cell("load", &[], &["df"]),
        ])
        .unwrap();
        let plan = graph.topological_order(graph.all_cells());
        assert_eq!(names(&graph, &plan), vec!["load", "summarize", "report"]);
    }

    /// Deterministic pseudo-random DAGs: cell i reads outputs of earlier
    /// cells only, then the whole list is registered in shuffled order.
    #[test]
    fn full_order_respects_transitive_inputs() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..25 {
            let n = 12;
            let mut specs: Vec<(String, Vec<String>, String)> = Vec::new();
            for i in 0..n {
                let mut reads = Vec::new();
                for j in 0..i {
                    if next() % 4 == 0 {
                        reads.push(format!("v{j}"));
                    }
                }
                specs.push((format!("c{i}"), reads, format!("v{i}")));
            }
            // Fisher-Yates on the registration order.
            for i in (1..specs.len()).rev() {
                let j = (next() % (i as u64 + 1)) as usize;
                specs.swap(i, j);
            }

            let mut builder = GraphBuilder::new();
            for (name, reads, write) in &specs {
                builder
                    .register(Cell::new(name.clone(), reads.clone(), [write.clone()], noop))
                    .unwrap();
            }
            let graph = builder.finalize().unwrap();
            let order = graph.topological_order(graph.all_cells());
            assert_eq!(order.len(), graph.len());

            let position: HashMap<CellId, usize> =
                order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
            for &id in &order {
                // Walk the transitive inputs of `id`.
                let mut stack: Vec<CellId> = graph.dependencies(id).to_vec();
                while let Some(dep) = stack.pop() {
                    assert!(position[&dep] < position[&id]);
                    stack.extend_from_slice(graph.dependencies(dep));
                }
            }
        }
    }

    fn long_chain(n: usize, close_loop: bool) -> GraphBuilder {
        let mut builder = GraphBuilder::new();
        for i in 0..n {
            let input = if i == 0 {
                if close_loop { format!("v{}", n - 1) } else { "seed".to_string() }
            } else {
                format!("v{}", i - 1)
            };
            builder
                .register(Cell::new(format!("c{i}"), [input], [format!("v{i}")], noop))
                .unwrap();
        }
        builder
    }

    #[test]
    fn deep_chain_finalizes_without_recursion() {
        let graph = long_chain(100_000, false).finalize().unwrap();
        assert_eq!(graph.len(), 100_000);
        let closure = graph.downstream_closure(["seed"]).unwrap();
        assert_eq!(closure.len(), 100_000);
        let order = graph.topological_order(closure);
        assert_eq!(graph.cell_name(order[0]), "c0");
        assert_eq!(graph.cell_name(order[99_999]), "c99999");
    }

    #[test]
    fn deep_cycle_is_reported_in_full() {
        let err = long_chain(100_000, true).finalize().unwrap_err();
        match err {
            GraphError::Cycle { cycle } => {
                assert_eq!(cycle.len(), 100_001);
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle[0], "c0");
                assert_eq!(cycle[1], "c1");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejected_registration_leaves_builder_usable() {
        let mut builder = GraphBuilder::new();
        builder.register(cell("p", &[], &["x"])).unwrap();
        assert!(builder.register(cell("q", &[], &["y", "x"])).is_err());
        let id = builder.register(cell("q", &[], &["y"])).unwrap();
        assert_eq!(id.index(), 1);
        let graph = builder.finalize().unwrap();
        assert_eq!(graph.producer("y"), Some(id));
    }
}
