//! Graph construction: nodes, builders and bodies of higher-order operations.

pub mod graph;

pub use graph::{ComputationBuilder, Op};
