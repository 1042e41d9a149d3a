//! Graph builder and shape-specialized compilation cache over portable backends.
//!
//! - [`ops::graph`] builds typed operation graphs ([`Op`], [`ComputationBuilder`]) with nested
//!   bodies for reductions, loops and conditionals.
//! - [`tree`] flattens nested call arguments into tensor leaves and a reusable layout.
//! - [`cache`] compiles a function once per argument signature and replays it afterwards,
//!   either through the native builder or through a staged compiler.
//! - [`pure`] records tensor functions against placeholders and replays the recording with
//!   captured values substituted.
//! - [`tensor`] is the lazy tensor front end tying these together.

pub mod backend;
pub mod cache;
mod env;
pub mod ops;
pub mod profiling;
pub mod pure;
pub mod tensor;
pub mod tree;

pub use backend::spec::{DType, PortableBackend, Shape, TensorLiteral};
pub use backend::Computation;
pub use cache::{CompiledCallableWithCache, Signature};
pub use ops::graph::{Body, ComputationBuilder, Op};
pub use pure::{make_pure, make_pure_with_seed, PureFunction, PureModule, PureRecorder};
pub use tensor::{Tensor, TensorReadError};
pub use tree::{Arg, CallArgs, FlattenError, StaticLeaf, TreeLayout};
