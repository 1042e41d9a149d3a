use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};

use crate::backend::spec::{DType, PortableBackend, Shape};
use crate::tensor::{push_seed_scope, Tensor};
use crate::tree::{Arg, CallArgs, StaticLeaf};

use super::{make_pure, PureFunction};

/// Keyword argument carrying the seed of a [`SeededPureFunction`] call.
pub const RNG_SEED_KWARG: &str = "rng_seed";

/// Pure function whose random draws depend only on the `rng_seed` keyword argument.
///
/// The seed travels as the first tensor input of the underlying recording, so calls with
/// different seeds share one recording and calls with equal seeds produce equal results.
pub struct SeededPureFunction<B: PortableBackend + 'static> {
    backend: Arc<B>,
    name: String,
    inner: PureFunction<B>,
}

impl<B: PortableBackend + 'static> SeededPureFunction<B> {
    pub fn call(&self, call: &CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> {
        let mut call = call.clone();
        let seed = call
            .kwargs
            .remove(RNG_SEED_KWARG)
            .ok_or_else(|| {
                anyhow!(
                    "'{}' requires the keyword argument '{RNG_SEED_KWARG}'",
                    self.name
                )
            })?;
        let seed = self.seed_tensor(seed)?;
        call.args.insert(0, Arg::Tensor(seed));
        self.inner.call(&call)
    }

    fn seed_tensor(&self, seed: Arg<Tensor<B>>) -> Result<Tensor<B>> {
        match seed {
            Arg::Static(StaticLeaf::Int(value)) => {
                ensure!(
                    (0..=i64::from(u32::MAX)).contains(&value),
                    "rng seed {value} does not fit in u32"
                );
                Tensor::scalar_u32(Arc::clone(&self.backend), value as u32)
            }
            Arg::Tensor(tensor) => {
                ensure!(
                    tensor.shape().rank() == 0,
                    "rng seed tensor must be a scalar, got {}",
                    tensor.shape()
                );
                if *tensor.shape() == Shape::scalar(DType::U32) {
                    Ok(tensor)
                } else {
                    tensor.cast(DType::U32)
                }
            }
            other => bail!("rng seed must be an integer or a scalar tensor, got {other:?}"),
        }
    }

    pub fn recordings(&self) -> usize {
        self.inner.recordings()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

pub fn make_pure_with_seed<B, F>(
    backend: Arc<B>,
    name: impl Into<String>,
    func: F,
) -> SeededPureFunction<B>
where
    B: PortableBackend + 'static,
    F: Fn(CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> + Send + Sync + 'static,
{
    let name = name.into();
    let seeded_name = name.clone();
    let inner = make_pure(Arc::clone(&backend), name.clone(), move |mut call: CallArgs<Tensor<B>>| {
        ensure!(!call.args.is_empty(), "'{seeded_name}' lost its seed argument");
        let seed = call
            .args
            .remove(0)
            .into_tensor()
            .ok_or_else(|| anyhow!("'{seeded_name}' expects its seed as a tensor"))?;
        let _scope = push_seed_scope(seed);
        func(call)
    });
    SeededPureFunction { backend, name, inner }
}
