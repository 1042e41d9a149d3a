//! Lazy tensors over a [`PortableBackend`].
//!
//! A [`Tensor`] is either a concrete backend buffer, a placeholder that only carries a shape,
//! or a node recorded into a [`Trace`]. Operations pick their recording context in this
//! order:
//! 1. the innermost default trace installed on the current thread;
//! 2. the trace owning a traced operand;
//! 3. none, in which case the operation runs eagerly as a one-shot computation.
//!
//! Reading the value of a placeholder or of a traced tensor fails with [`TensorReadError`].

pub mod trace;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::backend::computation::Computation;
use crate::backend::literal::Element;
use crate::backend::spec::{DType, PortableBackend, Shape, TensorLiteral};
use crate::ops::graph::{Body, ComputationBuilder, Op};

pub use trace::{
    current_trace, next_seed_draw, push_seed_scope, push_trace, with_trace, SeedGuard, Trace,
    TraceGuard, TraceParam,
};

static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static FRESH_SEED_COUNTER: AtomicU64 = AtomicU64::new(0x5eed);

/// Shared by every `sum_axes` call, so each reduced dtype is traced once.
static SUM_BODY: Lazy<Body> =
    Lazy::new(|| Body::deferred("sum", |params: &[Op]| params[0].add(&params[1])));

fn next_tensor_id() -> u64 {
    TENSOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorReadError {
    #[error("cannot read the value of placeholder tensor {shape}")]
    Placeholder { shape: Shape },
    #[error("cannot read the value of traced tensor {shape} while it is being recorded")]
    Traced { shape: Shape },
}

pub(crate) enum TensorRepr<B: PortableBackend + 'static> {
    Concrete(B::TensorHandle),
    Placeholder,
    Traced { trace: Arc<Trace<B>>, op: Op },
}

pub struct Tensor<B: PortableBackend + 'static> {
    backend: Arc<B>,
    shape: Shape,
    id: u64,
    repr: Arc<TensorRepr<B>>,
}

impl<B: PortableBackend + 'static> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            backend: Arc::clone(&self.backend),
            shape: self.shape.clone(),
            id: self.id,
            repr: Arc::clone(&self.repr),
        }
    }
}

impl<B: PortableBackend + 'static> fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<B: PortableBackend + 'static> Tensor<B> {
    fn with_repr(backend: Arc<B>, shape: Shape, repr: TensorRepr<B>) -> Self {
        Tensor {
            backend,
            shape,
            id: next_tensor_id(),
            repr: Arc::new(repr),
        }
    }

    pub fn from_handle(backend: Arc<B>, shape: Shape, handle: B::TensorHandle) -> Self {
        Tensor::with_repr(backend, shape, TensorRepr::Concrete(handle))
    }

    pub fn from_literal(backend: Arc<B>, literal: TensorLiteral) -> Result<Self> {
        let shape = literal.shape.clone();
        let handle = backend.materialize(literal)?;
        Ok(Tensor::from_handle(backend, shape, handle))
    }

    pub fn from_vec<E: Element>(backend: Arc<B>, sizes: &[usize], data: &[E]) -> Result<Self> {
        let literal = TensorLiteral::from_elements(sizes, data)?;
        Tensor::from_literal(backend, literal)
    }

    pub fn scalar(backend: Arc<B>, value: f64, dtype: DType) -> Result<Self> {
        Tensor::from_literal(backend, TensorLiteral::scalar(dtype, value))
    }

    pub fn scalar_u32(backend: Arc<B>, value: u32) -> Result<Self> {
        Tensor::from_vec(backend, &[], &[value])
    }

    pub fn zeros(backend: Arc<B>, shape: Shape) -> Result<Self> {
        let bytes = vec![0u8; shape.byte_len()];
        let literal = TensorLiteral::new(shape, Arc::from(bytes))?;
        Tensor::from_literal(backend, literal)
    }

    /// Shape-only stand-in used while tracing; it has no value.
    pub fn placeholder(backend: Arc<B>, shape: Shape) -> Self {
        Tensor::with_repr(backend, shape, TensorRepr::Placeholder)
    }

    pub(crate) fn traced(trace: Arc<Trace<B>>, op: Op) -> Self {
        let shape = op.shape().clone();
        Tensor::with_repr(trace.backend(), shape, TensorRepr::Traced { trace, op })
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype()
    }

    /// Identity shared by clones of the same tensor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn repr(&self) -> &TensorRepr<B> {
        &self.repr
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(*self.repr, TensorRepr::Placeholder)
    }

    pub fn is_traced(&self) -> bool {
        matches!(*self.repr, TensorRepr::Traced { .. })
    }

    pub fn is_concrete(&self) -> bool {
        matches!(*self.repr, TensorRepr::Concrete(_))
    }

    /// Trace that recorded this tensor, if any.
    pub fn trace(&self) -> Option<Arc<Trace<B>>> {
        match &*self.repr {
            TensorRepr::Traced { trace, .. } => Some(Arc::clone(trace)),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        let kind = match &*self.repr {
            TensorRepr::Concrete(_) => "concrete",
            TensorRepr::Placeholder => "placeholder",
            TensorRepr::Traced { .. } => "traced",
        };
        format!("{kind} tensor #{} {}", self.id, self.shape)
    }

    /// Backend buffer of a concrete tensor.
    pub fn handle(&self) -> Result<B::TensorHandle, TensorReadError> {
        match &*self.repr {
            TensorRepr::Concrete(handle) => Ok(handle.clone()),
            TensorRepr::Placeholder => Err(TensorReadError::Placeholder {
                shape: self.shape.clone(),
            }),
            TensorRepr::Traced { .. } => Err(TensorReadError::Traced {
                shape: self.shape.clone(),
            }),
        }
    }

    pub fn to_literal(&self) -> Result<TensorLiteral> {
        let handle = self.handle()?;
        Ok(self.backend.to_literal(&handle)?)
    }

    pub fn to_vec<E: Element>(&self) -> Result<Vec<E>> {
        Ok(self.to_literal()?.to_elements::<E>()?)
    }

    /// Records `f` over `inputs` and returns its single result.
    pub fn lift<F>(inputs: &[&Tensor<B>], f: F) -> Result<Tensor<B>>
    where
        F: FnOnce(&[Op]) -> Result<Op>,
    {
        let mut outputs = Tensor::lift_many(inputs, |ops| Ok(vec![f(ops)?]))?;
        Ok(outputs.remove(0))
    }

    /// Records `f` over `inputs`, returning one tensor per produced node.
    pub fn lift_many<F>(inputs: &[&Tensor<B>], f: F) -> Result<Vec<Tensor<B>>>
    where
        F: FnOnce(&[Op]) -> Result<Vec<Op>>,
    {
        let backend = match inputs.first() {
            Some(first) => first.backend(),
            None => match current_trace::<B>() {
                Some(trace) => trace.backend(),
                None => anyhow::bail!("tensor operation needs at least one input outside a trace"),
            },
        };
        if let Some(trace) = select_trace(inputs) {
            let ops = inputs
                .iter()
                .map(|tensor| trace.import(tensor))
                .collect::<Result<Vec<_>>>()?;
            let outputs = f(&ops)?;
            return Ok(outputs.into_iter().map(|op| trace.wrap(op)).collect());
        }

        let builder = ComputationBuilder::new("eager");
        let mut handles = Vec::with_capacity(inputs.len());
        let mut params = Vec::with_capacity(inputs.len());
        for (index, tensor) in inputs.iter().enumerate() {
            handles.push(tensor.handle()?);
            params.push(builder.param(index, tensor.shape().clone())?);
        }
        let outputs = f(&params)?;
        let root = Op::tuple(&outputs, Some(&builder))?;
        let computation = builder.build(&root)?;
        run_eager(&backend, &computation, &handles)
    }

    /// Applies a frozen computation to `inputs`.
    ///
    /// Inside a trace this records a `call`, so applications nest; otherwise the backend runs
    /// the computation immediately. A tuple-rooted computation yields one tensor per element.
    pub fn apply_computation(
        backend: &Arc<B>,
        computation: &Computation,
        inputs: &[Tensor<B>],
    ) -> Result<Vec<Tensor<B>>> {
        let refs: Vec<&Tensor<B>> = inputs.iter().collect();
        if let Some(trace) = select_trace(&refs) {
            let ops = inputs
                .iter()
                .map(|tensor| trace.import(tensor))
                .collect::<Result<Vec<_>>>()?;
            let result = Op::call(computation, &ops, Some(trace.builder()))?;
            let outputs = if result.shape().is_tuple() {
                result.tuple_elements()?
            } else {
                vec![result]
            };
            return Ok(outputs.into_iter().map(|op| trace.wrap(op)).collect());
        }
        let handles = inputs
            .iter()
            .map(|tensor| tensor.handle())
            .collect::<Result<Vec<_>, _>>()?;
        run_eager(backend, computation, &handles)
    }

    pub fn add(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].add(&ops[1]))
    }

    pub fn sub(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].sub(&ops[1]))
    }

    pub fn mul(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].mul(&ops[1]))
    }

    pub fn div(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].div(&ops[1]))
    }

    pub fn maximum(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].max(&ops[1]))
    }

    pub fn neg(&self) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].neg())
    }

    pub fn exp(&self) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].exp())
    }

    pub fn log(&self) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].log())
    }

    pub fn tanh(&self) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].tanh())
    }

    pub fn sqrt(&self) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].sqrt())
    }

    pub fn matmul(&self, other: &Tensor<B>) -> Result<Tensor<B>> {
        Tensor::lift(&[self, other], |ops| ops[0].dot(&ops[1]))
    }

    pub fn reshape(&self, sizes: &[usize]) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].reshape(sizes))
    }

    pub fn transpose(&self, permutation: &[usize]) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].transpose(permutation))
    }

    /// Broadcasts with trailing-axis alignment; size-1 axes stretch.
    pub fn broadcast_to(&self, sizes: &[usize]) -> Result<Tensor<B>> {
        let rank = self.shape.rank();
        anyhow::ensure!(
            rank <= sizes.len(),
            "cannot broadcast {} to lower rank {:?}",
            self.shape,
            sizes
        );
        let offset = sizes.len() - rank;
        let dimensions: Vec<usize> = (offset..sizes.len()).collect();
        Tensor::lift(&[self], |ops| ops[0].broadcast_in_dim(sizes, &dimensions))
    }

    /// Sums over `axes`, dropping them from the result.
    pub fn sum_axes(&self, axes: &[usize]) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| {
            let init = Op::zero(ops[0].builder(), ops[0].dtype())?;
            ops[0].reduce(&init, &SUM_BODY, axes)
        })
    }

    pub fn cast(&self, dtype: DType) -> Result<Tensor<B>> {
        Tensor::lift(&[self], |ops| ops[0].cast(dtype))
    }

    /// Uniform `[0, 1)` samples with `self`'s shape (floating-point dtype kept, else `f32`).
    ///
    /// Draws come from the active seed scope. Without one, a fresh seed value is taken and
    /// captured like any other external tensor, so replays of a recording repeat the draw.
    pub fn rand_uniform_like(&self) -> Result<Tensor<B>> {
        let (seed, stream) = match next_seed_draw::<B>() {
            Some(draw) => draw,
            None => {
                let value = FRESH_SEED_COUNTER.fetch_add(1, Ordering::Relaxed) as u32;
                (Tensor::scalar_u32(self.backend(), value)?, 0)
            }
        };
        let shape = if self.dtype().is_float() {
            self.shape.clone()
        } else {
            self.shape.with_dtype(DType::F32)
        };
        Tensor::lift(&[&seed], |ops| ops[0].rng_uniform(shape, stream))
    }
}

fn select_trace<B: PortableBackend + 'static>(inputs: &[&Tensor<B>]) -> Option<Arc<Trace<B>>> {
    current_trace::<B>().or_else(|| inputs.iter().find_map(|tensor| tensor.trace()))
}

fn run_eager<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    computation: &Computation,
    handles: &[B::TensorHandle],
) -> Result<Vec<Tensor<B>>> {
    let outputs = backend
        .invoke(computation.name(), computation, handles)
        .with_context(|| {
            format!(
                "backend '{}' failed to run '{}'",
                backend.backend_name(),
                computation.name()
            )
        })?;
    let shapes = computation.result_shapes();
    anyhow::ensure!(
        outputs.len() == shapes.len(),
        "backend returned {} results for {} declared outputs",
        outputs.len(),
        shapes.len()
    );
    Ok(outputs
        .into_iter()
        .zip(shapes)
        .map(|(handle, shape)| Tensor::from_handle(Arc::clone(backend), shape, handle))
        .collect())
}

/// Wraps a frozen computation as a function over concrete (or traced) tensors.
pub fn computation_as_func<B: PortableBackend + 'static>(
    backend: Arc<B>,
    computation: Computation,
) -> impl Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Send + Sync + 'static {
    move |inputs: &[Tensor<B>]| Tensor::apply_computation(&backend, &computation, inputs)
}
