//! Operation-graph construction.
//!
//! A [`ComputationBuilder`] owns a mutable graph; [`Op`] handles expose the construction
//! vocabulary and [`ComputationBuilder::build`] freezes a root into a reusable
//! [`Computation`](crate::backend::computation::Computation). Reduction, loop and branch
//! bodies are passed as [`Body`] values.
mod body;
mod builder;
mod infer;
mod op;
mod state;

pub use body::{mkconditional, mkwhile, wrap_function, Body, BodyOutput, DeferredBody};
pub use builder::ComputationBuilder;
pub use op::{Op, Padding};
