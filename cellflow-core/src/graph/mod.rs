//! Dependency Graph
//!
//! This module holds the cells of a notebook and the graph derived from
//! their declared read and write sets.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph over cells where an edge runs from
//! the producer of a variable to every cell that reads it. It is built in two
//! phases:
//!
//! - [`GraphBuilder`] accepts cells and rejects duplicate outputs as they
//!   are registered.
//! - [`GraphBuilder::finalize`] derives the edges, rejects cycles and seals
//!   the result into an immutable [`DependencyGraph`].
//!
//! Forward (dependencies) and reverse (dependents) edges are both kept, so
//! downstream closures and topological orderings are cheap to compute.

mod cell;
mod dependency;

pub use cell::{Cell, CellId, CellKind, ComputeFn, Outputs, RenderFn, VarList};
pub use dependency::{CellSet, DependencyGraph, GraphBuilder};
