//! Recording contexts for lazy tensors and the thread-local stacks that select them.
//!
//! A [`Trace`] owns one [`ComputationBuilder`]. Tensors that enter a trace from outside
//! (concrete values, tensors of another trace, bound placeholders) are imported as
//! parameters in first-use order; each parameter slot remembers the tensor it stands for so
//! the finished computation can later be fed the same values.
//!
//! The default trace stack mirrors the arena stack of the graph capture layer: a trace pushed
//! on the current thread receives every tensor operation that does not already name a trace
//! through its operands. Seed scopes work the same way for random-number operations.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::PortableBackend;
use crate::ops::graph::{ComputationBuilder, Op};

use super::{Tensor, TensorRepr};

static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A tensor imported into a trace as parameter `slot`.
pub struct TraceParam<B: PortableBackend + 'static> {
    pub slot: usize,
    pub tensor: Tensor<B>,
}

impl<B: PortableBackend + 'static> Clone for TraceParam<B> {
    fn clone(&self) -> Self {
        TraceParam {
            slot: self.slot,
            tensor: self.tensor.clone(),
        }
    }
}

struct TraceState<B: PortableBackend + 'static> {
    imports: HashMap<u64, Op>,
    params: Vec<TraceParam<B>>,
}

pub struct Trace<B: PortableBackend + 'static> {
    id: u64,
    backend: Arc<B>,
    builder: ComputationBuilder,
    state: Mutex<TraceState<B>>,
}

impl<B: PortableBackend + 'static> Trace<B> {
    pub fn new(backend: Arc<B>, name: &str) -> Arc<Self> {
        Arc::new(Trace {
            id: TRACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            backend,
            builder: ComputationBuilder::new(name),
            state: Mutex::new(TraceState {
                imports: HashMap::new(),
                params: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn builder(&self) -> &ComputationBuilder {
        &self.builder
    }

    /// Parameters imported so far, ordered by slot.
    pub fn params(&self) -> Vec<TraceParam<B>> {
        self.state.lock().expect("trace state poisoned").params.clone()
    }

    /// Binds a placeholder to the next parameter slot.
    ///
    /// Placeholders can only enter a trace this way; importing an unbound placeholder fails.
    pub fn bind_placeholder(&self, tensor: &Tensor<B>) -> Result<Op> {
        if !tensor.is_placeholder() {
            bail!("only placeholders can be bound, got {}", tensor.describe());
        }
        let mut state = self.state.lock().expect("trace state poisoned");
        if let Some(op) = state.imports.get(&tensor.id()) {
            return Ok(op.clone());
        }
        self.add_param(&mut state, tensor)
    }

    /// Returns the node standing for `tensor` inside this trace, importing it if needed.
    pub fn import(&self, tensor: &Tensor<B>) -> Result<Op> {
        if let TensorRepr::Traced { trace, op } = tensor.repr() {
            if trace.id == self.id {
                return Ok(op.clone());
            }
        }
        let mut state = self.state.lock().expect("trace state poisoned");
        if let Some(op) = state.imports.get(&tensor.id()) {
            return Ok(op.clone());
        }
        if tensor.is_placeholder() {
            bail!(
                "placeholder {} was captured by trace '{}' but is not one of its inputs",
                tensor.describe(),
                self.builder.name()
            );
        }
        self.add_param(&mut state, tensor)
    }

    fn add_param(&self, state: &mut TraceState<B>, tensor: &Tensor<B>) -> Result<Op> {
        let slot = state.params.len();
        let op = self
            .builder
            .param(slot, tensor.shape().clone())
            .with_context(|| {
                format!("failed to import {} as parameter {slot}", tensor.describe())
            })?;
        state.imports.insert(tensor.id(), op.clone());
        state.params.push(TraceParam {
            slot,
            tensor: tensor.clone(),
        });
        Ok(op)
    }

    /// Wraps a node of this trace as a lazy tensor.
    pub fn wrap(self: &Arc<Self>, op: Op) -> Tensor<B> {
        Tensor::traced(Arc::clone(self), op)
    }

    /// Freezes the trace with `outputs` packed into the root tuple.
    ///
    /// Outputs that never passed through the trace are imported first, so they come back as
    /// parameters forwarded to the result.
    pub fn finish(&self, outputs: &[Tensor<B>]) -> Result<(Computation, Vec<TraceParam<B>>)> {
        let roots = outputs
            .iter()
            .map(|tensor| self.import(tensor))
            .collect::<Result<Vec<_>>>()?;
        let root = Op::tuple(&roots, Some(&self.builder))?;
        let computation = self.builder.build(&root)?;
        Ok((computation, self.params()))
    }
}

thread_local! {
    static TRACE_STACK: RefCell<Vec<Arc<dyn Any + Send + Sync>>> = RefCell::new(Vec::new());
    static SEED_STACK: RefCell<Vec<Arc<dyn Any + Send + Sync>>> = RefCell::new(Vec::new());
}

/// Pops the default trace pushed by [`push_trace`] when dropped.
pub struct TraceGuard {
    active: bool,
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if self.active {
            TRACE_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

pub fn push_trace<B: PortableBackend + 'static>(trace: Arc<Trace<B>>) -> TraceGuard {
    TRACE_STACK.with(|stack| {
        stack.borrow_mut().push(trace as Arc<dyn Any + Send + Sync>);
    });
    TraceGuard { active: true }
}

/// Runs `f` with `trace` installed as the default recording context.
pub fn with_trace<B, F, R>(trace: Arc<Trace<B>>, f: F) -> R
where
    B: PortableBackend + 'static,
    F: FnOnce() -> R,
{
    let guard = push_trace(trace);
    let result = f();
    drop(guard);
    result
}

/// Innermost default trace for backend type `B`.
pub fn current_trace<B: PortableBackend + 'static>() -> Option<Arc<Trace<B>>> {
    TRACE_STACK.with(|stack| {
        let stack = stack.borrow();
        for entry in stack.iter().rev() {
            if let Ok(trace) = entry.clone().downcast::<Trace<B>>() {
                return Some(trace);
            }
        }
        None
    })
}

struct SeedScope<B: PortableBackend + 'static> {
    seed: Tensor<B>,
    next_stream: AtomicU64,
}

pub struct SeedGuard {
    active: bool,
}

impl Drop for SeedGuard {
    fn drop(&mut self) {
        if self.active {
            SEED_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

/// Installs `seed` (a `u32[]` tensor) as the source of random draws on this thread.
///
/// Each draw inside the scope takes the next stream of the seed, so draws are distinct but
/// reproducible for a given seed value.
pub fn push_seed_scope<B: PortableBackend + 'static>(seed: Tensor<B>) -> SeedGuard {
    let scope = Arc::new(SeedScope {
        seed,
        next_stream: AtomicU64::new(0),
    });
    SEED_STACK.with(|stack| {
        stack.borrow_mut().push(scope as Arc<dyn Any + Send + Sync>);
    });
    SeedGuard { active: true }
}

/// Seed tensor and stream index for the next random draw, if a seed scope is active.
pub fn next_seed_draw<B: PortableBackend + 'static>() -> Option<(Tensor<B>, u64)> {
    SEED_STACK.with(|stack| {
        let stack = stack.borrow();
        for entry in stack.iter().rev() {
            if let Ok(scope) = entry.clone().downcast::<SeedScope<B>>() {
                let stream = scope.next_stream.fetch_add(1, Ordering::Relaxed);
                return Some((scope.seed.clone(), stream));
            }
        }
        None
    })
}
