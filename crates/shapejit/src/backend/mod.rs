pub mod computation;
pub mod hashing;
pub mod literal;
pub mod spec;

pub use computation::{Computation, ComputationSerdeError, Instruction};
pub use literal::Element;
pub use spec::{BackendError, BackendResult, DType, PortableBackend, Shape, TensorLiteral};
