//! Specializer that traces a function straight into the native graph builder.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::PortableBackend;
use crate::env;
use crate::ops::graph::{ComputationBuilder, Op};
use crate::tensor::Tensor;
use crate::tree::{Arg, CallArgs, FlattenedInputFunc, TreeLayout};

use super::{Specialized, Specializer};

/// Wraps a function over graph nodes so it can be called with concrete tensors.
///
/// Each specialization opens a fresh builder, binds one parameter per flat leaf, runs the
/// function once and freezes the resulting tuple. The produced callable hands the frozen
/// computation to the backend (or records a `call` when a trace is active).
pub struct NativeCallable<B, F> {
    backend: Arc<B>,
    name: String,
    func: Arc<F>,
}

impl<B, F> NativeCallable<B, F>
where
    B: PortableBackend + 'static,
    F: Fn(CallArgs<Op>) -> Result<Arg<Op>> + Send + Sync + 'static,
{
    pub fn new(backend: Arc<B>, name: impl Into<String>, func: Arc<F>) -> Self {
        NativeCallable {
            backend,
            name: name.into(),
            func,
        }
    }

    pub fn func(&self) -> &Arc<F> {
        &self.func
    }

    /// Traces the function for `layout` with parameters of the given leaves' shapes.
    pub fn build_computation(
        &self,
        layout: &TreeLayout,
        leaves: &[Tensor<B>],
    ) -> Result<(Computation, TreeLayout)> {
        let builder = ComputationBuilder::new(self.name.as_str());
        let params = leaves
            .iter()
            .enumerate()
            .map(|(index, leaf)| builder.param(index, leaf.shape().clone()))
            .collect::<Result<Vec<_>>>()?;
        let func = Arc::clone(&self.func);
        let flat = FlattenedInputFunc::with_input_layout(
            move |call: CallArgs<Op>| func(call),
            layout.clone(),
        );
        let outputs = flat.flat_call(params)?;
        ensure!(
            outputs.iter().all(|op| op.builder().same_builder(&builder)),
            "'{}' returned nodes that belong to another builder",
            self.name
        );
        let root = Op::tuple(&outputs, Some(&builder))?;
        let computation = builder
            .build(&root)
            .with_context(|| format!("failed to build computation for '{}'", self.name))?;
        Ok((computation, flat.output_layout()?))
    }
}

impl<B, F> Specializer<Tensor<B>> for NativeCallable<B, F>
where
    B: PortableBackend + 'static,
    F: Fn(CallArgs<Op>) -> Result<Arg<Op>> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn specialize(
        &self,
        layout: &TreeLayout,
        leaves: &[Tensor<B>],
    ) -> Result<Specialized<Tensor<B>>> {
        let (computation, output) = self.build_computation(layout, leaves)?;
        if env::dump_computations_enabled() {
            tracing::info!(function = %self.name, "specialized computation:\n{computation}");
        }
        let backend = Arc::clone(&self.backend);
        Ok(Specialized {
            callable: Arc::new(move |inputs: &[Tensor<B>]| {
                Tensor::apply_computation(&backend, &computation, inputs)
            }),
            output,
        })
    }
}
