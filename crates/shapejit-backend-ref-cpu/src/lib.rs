//! Reference CPU backend: evaluates frozen computations element by element on the host.

pub mod cpu;
mod interp;

pub use cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend, NoopInterceptor,
};
pub use interp::Value;
