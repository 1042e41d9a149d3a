//! Specializer that goes through an external staged compiler and a serialized module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::{PortableBackend, Shape};
use crate::env;
use crate::ops::graph::{ComputationBuilder, Op};
use crate::tensor::Tensor;
use crate::tree::{Arg, CallArgs, FlattenedInputFunc, StaticLeaf, TreeLayout};

use super::{Leaf, Specialized, Specializer};

/// A compiler with its own tracer type that can lower a flat function to portable bytes.
pub trait StagedCompiler: Send + Sync + 'static {
    type Tracer: Leaf;
    type Lowered;

    /// Token identifying the compiler's tracing context; part of the dispatch key.
    fn trace_context(&self) -> u64;

    /// Maps a static leaf into the compiler's own vocabulary before the function sees it.
    fn translate_static(&self, leaf: &StaticLeaf) -> StaticLeaf {
        leaf.clone()
    }

    /// Runs `f` once over tracers of the given shapes and returns the lowered program.
    fn lower(
        &self,
        name: &str,
        leaves: &[Shape],
        f: &mut dyn FnMut(Vec<Self::Tracer>) -> Result<Vec<Self::Tracer>>,
    ) -> Result<Self::Lowered>;

    fn serialize(&self, lowered: &Self::Lowered) -> Result<Vec<u8>>;
}

static STAGED_CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Staged compiler backed by a private graph builder and the bincode module format.
#[derive(Debug, Clone)]
pub struct BuilderStagedCompiler {
    context: u64,
}

impl BuilderStagedCompiler {
    pub fn new() -> Self {
        BuilderStagedCompiler {
            context: STAGED_CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Compiler instances created with the same context share dispatch entries.
    pub fn with_context(context: u64) -> Self {
        BuilderStagedCompiler { context }
    }
}

impl Default for BuilderStagedCompiler {
    fn default() -> Self {
        BuilderStagedCompiler::new()
    }
}

impl StagedCompiler for BuilderStagedCompiler {
    type Tracer = Op;
    type Lowered = Computation;

    fn trace_context(&self) -> u64 {
        self.context
    }

    fn lower(
        &self,
        name: &str,
        leaves: &[Shape],
        f: &mut dyn FnMut(Vec<Op>) -> Result<Vec<Op>>,
    ) -> Result<Computation> {
        let builder = ComputationBuilder::new(name);
        let params = leaves
            .iter()
            .enumerate()
            .map(|(index, shape)| builder.param(index, shape.clone()))
            .collect::<Result<Vec<_>>>()?;
        let outputs = f(params)?;
        let root = Op::tuple(&outputs, Some(&builder))?;
        builder.build(&root)
    }

    fn serialize(&self, lowered: &Computation) -> Result<Vec<u8>> {
        Ok(lowered.to_module_proto()?)
    }
}

pub struct StagedCallable<B, C, F> {
    backend: Arc<B>,
    compiler: Arc<C>,
    name: String,
    func: Arc<F>,
}

impl<B, C, F> StagedCallable<B, C, F>
where
    B: PortableBackend + 'static,
    C: StagedCompiler,
    F: Fn(CallArgs<C::Tracer>) -> Result<Arg<C::Tracer>> + Send + Sync + 'static,
{
    pub fn new(backend: Arc<B>, compiler: Arc<C>, name: impl Into<String>, func: Arc<F>) -> Self {
        StagedCallable {
            backend,
            compiler,
            name: name.into(),
            func,
        }
    }

    pub fn compiler(&self) -> &Arc<C> {
        &self.compiler
    }

    /// Lowers through the staged compiler and imports the serialized module.
    pub fn build_computation(
        &self,
        layout: &TreeLayout,
        leaves: &[Tensor<B>],
    ) -> Result<(Computation, TreeLayout)> {
        let translated = TreeLayout {
            structure: layout.structure.clone(),
            leaves: layout
                .leaves
                .iter()
                .map(|leaf| leaf.as_ref().map(|value| self.compiler.translate_static(value)))
                .collect(),
        };
        let func = Arc::clone(&self.func);
        let flat = FlattenedInputFunc::with_input_layout(
            move |call: CallArgs<C::Tracer>| func(call),
            translated,
        );
        let shapes: Vec<Shape> = leaves.iter().map(|leaf| leaf.shape().clone()).collect();
        let lowered = self
            .compiler
            .lower(&self.name, &shapes, &mut |tracers| flat.flat_call(tracers))
            .with_context(|| format!("staged compiler failed to lower '{}'", self.name))?;
        let bytes = self.compiler.serialize(&lowered)?;
        let computation = Computation::import_module_proto(&self.name, &bytes)
            .with_context(|| format!("failed to import lowered module for '{}'", self.name))?;
        ensure!(
            computation.num_parameters() == leaves.len(),
            "lowered module for '{}' takes {} parameters, expected {}",
            self.name,
            computation.num_parameters(),
            leaves.len()
        );
        Ok((computation, flat.output_layout()?))
    }
}

impl<B, C, F> Specializer<Tensor<B>> for StagedCallable<B, C, F>
where
    B: PortableBackend + 'static,
    C: StagedCompiler,
    F: Fn(CallArgs<C::Tracer>) -> Result<Arg<C::Tracer>> + Send + Sync + 'static,
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
        tracing::debug!(
            function = %self.name,
            fingerprint = computation.fingerprint(),
            "imported staged module"
        );
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
