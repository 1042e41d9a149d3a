use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::backend::spec::PortableBackend;
use crate::tensor::Tensor;
use crate::tree::{Arg, CallArgs};

use super::{make_pure, PureFunction};

/// A stateful layer whose forward pass can be expressed over explicit state.
pub trait Module<B: PortableBackend + 'static>: Send + Sync + 'static {
    fn named_parameters(&self) -> BTreeMap<String, Tensor<B>>;

    fn named_buffers(&self) -> BTreeMap<String, Tensor<B>> {
        BTreeMap::new()
    }

    /// Forward pass reading parameters and buffers from the given maps instead of `self`.
    fn functional_forward(
        &self,
        parameters: &BTreeMap<String, Tensor<B>>,
        buffers: &BTreeMap<String, Tensor<B>>,
        call: CallArgs<Tensor<B>>,
    ) -> Result<Arg<Tensor<B>>>;
}

/// Module forward pass recorded as a pure function.
///
/// Parameters and buffers are passed as two leading dict arguments on every call, so updated
/// values flow into the recording instead of being captured once.
pub struct PureModule<B: PortableBackend + 'static, M> {
    module: Arc<M>,
    inner: PureFunction<B>,
}

fn into_state<B: PortableBackend + 'static>(
    arg: Arg<Tensor<B>>,
    what: &str,
) -> Result<BTreeMap<String, Tensor<B>>> {
    let entries = arg
        .into_dict()
        .ok_or_else(|| anyhow!("module {what} must be passed as a dict"))?;
    entries
        .into_iter()
        .map(|(name, value)| {
            value
                .into_tensor()
                .map(|tensor| (name.clone(), tensor))
                .ok_or_else(|| anyhow!("module {what} '{name}' is not a tensor"))
        })
        .collect()
}

fn as_dict<B: PortableBackend + 'static>(state: BTreeMap<String, Tensor<B>>) -> Arg<Tensor<B>> {
    Arg::Dict(state.into_iter().map(|(name, tensor)| (name, Arg::Tensor(tensor))).collect())
}

impl<B, M> PureModule<B, M>
where
    B: PortableBackend + 'static,
    M: Module<B>,
{
    pub fn new(backend: Arc<B>, name: impl Into<String>, module: Arc<M>) -> Self {
        let forward_module = Arc::clone(&module);
        let inner = make_pure(backend, name, move |mut call: CallArgs<Tensor<B>>| {
            anyhow::ensure!(call.args.len() >= 2, "module call lost its state arguments");
            let mut rest = call.args.split_off(2);
            let buffers = into_state(call.args.pop().unwrap_or_else(Arg::none), "buffers")?;
            let parameters = into_state(call.args.pop().unwrap_or_else(Arg::none), "parameters")?;
            std::mem::swap(&mut call.args, &mut rest);
            forward_module.functional_forward(&parameters, &buffers, call)
        });
        PureModule { module, inner }
    }

    pub fn module(&self) -> &Arc<M> {
        &self.module
    }

    pub fn forward(&self, call: &CallArgs<Tensor<B>>) -> Result<Arg<Tensor<B>>> {
        let mut args = Vec::with_capacity(call.args.len() + 2);
        args.push(as_dict(self.module.named_parameters()));
        args.push(as_dict(self.module.named_buffers()));
        args.extend(call.args.iter().cloned());
        self.inner.call(&CallArgs {
            args,
            kwargs: call.kwargs.clone(),
        })
    }

    pub fn recordings(&self) -> usize {
        self.inner.recordings()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}
