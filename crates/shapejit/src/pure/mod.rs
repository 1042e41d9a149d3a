//! Pure-function wrapper: record a tensor function once per signature, replay it afterwards.
//!
//! Recording runs the function against placeholders inside a fresh [`Trace`]. Every trace
//! parameter is either one of those placeholders (a positional input of the recording) or a
//! tensor the function captured from its environment (a hoisted value). Replaying feeds the
//! current arguments into the first kind and the captured tensors into the second.
//!
//! The function must be pure apart from reading captured tensors; side effects run only while
//! recording.

mod module;
mod seeded;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::{PortableBackend, Shape};
use crate::cache::{CompiledCallableWithCache, Specialized, Specializer};
use crate::env;
use crate::tensor::{with_trace, Tensor, Trace};
use crate::tree::{flatten, flatten_call, Arg, CallArgs, TreeLayout};

pub use module::{Module, PureModule};
pub use seeded::{make_pure_with_seed, SeededPureFunction, RNG_SEED_KWARG};

pub type PureFn<B> = Arc<dyn Fn(CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> + Send + Sync>;

/// A frozen recording plus the bookkeeping needed to feed it again.
pub struct RecordedComputation<B: PortableBackend + 'static> {
    pub computation: Computation,
    pub input_layout: TreeLayout,
    pub output_layout: TreeLayout,
    /// Parameter slot to position in the flattened call arguments.
    pub slot_to_flat_index: BTreeMap<usize, usize>,
    /// Parameter slot to the captured tensor it stands for.
    pub slot_to_hoisted: BTreeMap<usize, Tensor<B>>,
    input_shapes: Vec<Shape>,
}

impl<B: PortableBackend + 'static> RecordedComputation<B> {
    pub fn num_hoisted(&self) -> usize {
        self.slot_to_hoisted.len()
    }

    pub fn input_shapes(&self) -> &[Shape] {
        &self.input_shapes
    }

    /// Computation inputs for the flat call leaves `leaves`, ordered by slot.
    fn inputs_for(&self, leaves: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        ensure!(
            leaves.len() == self.input_shapes.len(),
            "recording of '{}' takes {} tensors, got {}",
            self.computation.name(),
            self.input_shapes.len(),
            leaves.len()
        );
        for (index, (leaf, expected)) in leaves.iter().zip(&self.input_shapes).enumerate() {
            ensure!(
                leaf.shape() == expected,
                "argument {index} of '{}' has shape {}, recorded with {expected}",
                self.computation.name(),
                leaf.shape()
            );
        }
        (0..self.computation.num_parameters())
            .map(|slot| {
                if let Some(index) = self.slot_to_flat_index.get(&slot) {
                    Ok(leaves[*index].clone())
                } else if let Some(hoisted) = self.slot_to_hoisted.get(&slot) {
                    Ok(hoisted.clone())
                } else {
                    bail!("parameter slot {slot} of '{}' has no source", self.computation.name())
                }
            })
            .collect()
    }

    /// Runs the recording on flat leaves, returning flat outputs.
    pub fn replay_flat(&self, backend: &Arc<B>, leaves: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        let inputs = self.inputs_for(leaves)?;
        Tensor::apply_computation(backend, &self.computation, &inputs)
    }
}

pub struct PureRecorder<B: PortableBackend + 'static> {
    backend: Arc<B>,
    name: String,
    func: PureFn<B>,
}

impl<B: PortableBackend + 'static> Clone for PureRecorder<B> {
    fn clone(&self) -> Self {
        PureRecorder {
            backend: Arc::clone(&self.backend),
            name: self.name.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<B: PortableBackend + 'static> PureRecorder<B> {
    pub fn new(backend: Arc<B>, name: impl Into<String>, func: PureFn<B>) -> Self {
        PureRecorder {
            backend,
            name: name.into(),
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Traces the function against placeholders shaped like `sample`.
    pub fn record(&self, sample: &CallArgs<Tensor<B>>) -> Result<RecordedComputation<B>> {
        let (leaves, input_layout) = flatten_call(sample);
        let trace = Trace::new(Arc::clone(&self.backend), &self.name);
        let placeholders: Vec<Tensor<B>> = leaves
            .iter()
            .map(|leaf| Tensor::placeholder(Arc::clone(&self.backend), leaf.shape().clone()))
            .collect();
        for placeholder in &placeholders {
            trace.bind_placeholder(placeholder)?;
        }
        let call = input_layout.unflatten_call(placeholders.clone())?;
        let result = with_trace(Arc::clone(&trace), || (self.func)(call))
            .with_context(|| format!("failed to trace pure function '{}'", self.name))?;
        let (outputs, output_layout) = flatten(&result);
        let (computation, params) = trace.finish(&outputs)?;

        let flat_positions: BTreeMap<u64, usize> = placeholders
            .iter()
            .enumerate()
            .map(|(index, placeholder)| (placeholder.id(), index))
            .collect();
        let mut slot_to_flat_index = BTreeMap::new();
        let mut slot_to_hoisted = BTreeMap::new();
        for param in params {
            if let Some(index) = flat_positions.get(&param.tensor.id()) {
                slot_to_flat_index.insert(param.slot, *index);
            } else if param.tensor.is_placeholder() {
                bail!(
                    "pure function '{}' captured {} which is not one of its arguments",
                    self.name,
                    param.tensor.describe()
                );
            } else {
                slot_to_hoisted.insert(param.slot, param.tensor);
            }
        }
        ensure!(
            slot_to_flat_index.len() + slot_to_hoisted.len() == computation.num_parameters()
                && slot_to_flat_index.keys().all(|slot| !slot_to_hoisted.contains_key(slot)),
            "parameter slots of '{}' are not partitioned between arguments and hoisted values",
            self.name
        );
        tracing::debug!(
            function = %self.name,
            inputs = leaves.len(),
            hoisted = slot_to_hoisted.len(),
            outputs = outputs.len(),
            "recorded pure function"
        );
        if env::dump_computations_enabled() {
            tracing::info!(function = %self.name, "recorded computation:\n{computation}");
        }
        Ok(RecordedComputation {
            computation,
            input_layout,
            output_layout,
            slot_to_flat_index,
            slot_to_hoisted,
            input_shapes: leaves.iter().map(|leaf| leaf.shape().clone()).collect(),
        })
    }

    /// Runs `recorded` on `call`, which must have the recorded structure and leaf shapes.
    pub fn replay(
        &self,
        recorded: &RecordedComputation<B>,
        call: &CallArgs<Tensor<B>>,
    ) -> Result<Arg<Tensor<B>>> {
        let (leaves, layout) = flatten_call(call);
        recorded.input_layout.ensure_matches(&layout)?;
        let outputs = recorded.replay_flat(&self.backend, &leaves)?;
        Ok(recorded.output_layout.unflatten(outputs)?)
    }
}

struct PureSpecializer<B: PortableBackend + 'static> {
    recorder: PureRecorder<B>,
}

impl<B: PortableBackend + 'static> Specializer<Tensor<B>> for PureSpecializer<B> {
    fn name(&self) -> &str {
        self.recorder.name()
    }

    fn specialize(
        &self,
        layout: &TreeLayout,
        leaves: &[Tensor<B>],
    ) -> Result<Specialized<Tensor<B>>> {
        let sample = layout.unflatten_call(leaves.to_vec())?;
        let recorded = Arc::new(self.recorder.record(&sample)?);
        let output = recorded.output_layout.clone();
        let backend = Arc::clone(&self.recorder.backend);
        Ok(Specialized {
            callable: Arc::new(move |inputs: &[Tensor<B>]| recorded.replay_flat(&backend, inputs)),
            output,
        })
    }
}

/// A function traced once per signature and replayed on later calls.
pub struct PureFunction<B: PortableBackend + 'static> {
    cache: CompiledCallableWithCache<Tensor<B>, PureSpecializer<B>>,
}

impl<B: PortableBackend + 'static> PureFunction<B> {
    pub fn call(&self, call: &CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> {
        self.cache.invoke(call)
    }

    /// Positional tensors in, flat tensor outputs back.
    pub fn call_tensors(&self, inputs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        let result = self.call(&CallArgs::tensors(inputs.iter().cloned()))?;
        Ok(flatten(&result).0)
    }

    /// Number of recordings made so far.
    pub fn recordings(&self) -> usize {
        self.cache.specialization_count()
    }

    pub fn cached_signatures(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

pub fn make_pure<B, F>(backend: Arc<B>, name: impl Into<String>, func: F) -> PureFunction<B>
where
    B: PortableBackend + 'static,
    F: Fn(CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> + Send + Sync + 'static,
{
    let recorder = PureRecorder::new(backend, name, Arc::new(func));
    PureFunction {
        cache: CompiledCallableWithCache::new(PureSpecializer { recorder }),
    }
}
