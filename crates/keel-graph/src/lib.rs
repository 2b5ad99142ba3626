//! Keel Graph
//!
//! This crate provides the install-time bookkeeping for a set of manifolds.
//! A [`Graph`] is built once from every manifold's declared inputs and never
//! changes afterwards; only the engine's runtime state does.
//!
//! Building a graph:
//! - Rejects duplicate names, duplicate inputs and references to unknown manifolds
//! - Rejects dependency cycles, reporting the full offending path
//! - Indexes dependents (reverse edges) for bounce propagation
//! - Computes a topological start order used for the initial start attempts

mod error;
mod graph;

pub use error::GraphError;
pub use graph::Graph;
