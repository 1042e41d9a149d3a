use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use shapejit::backend::computation::Computation;
use shapejit::backend::spec::{BackendResult, DType, PortableBackend, Shape, TensorLiteral};
use shapejit::pure::{
    make_pure, make_pure_with_seed, Module, PureFn, PureModule, PureRecorder, RNG_SEED_KWARG,
};
use shapejit::tensor::{Tensor, TensorReadError};
use shapejit::tree::{Arg, CallArgs, FlattenError};
use shapejit_backend_ref_cpu::CpuPortableBackend;

type CpuHandle = <CpuPortableBackend as PortableBackend>::TensorHandle;

struct CountingBackend {
    inner: CpuPortableBackend,
    invokes: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Self {
        CountingBackend {
            inner: CpuPortableBackend::new(),
            invokes: AtomicUsize::new(0),
        }
    }

    fn invokes(&self) -> usize {
        self.invokes.load(Ordering::SeqCst)
    }
}

impl PortableBackend for CountingBackend {
    type TensorHandle = CpuHandle;

    fn backend_name(&self) -> &str {
        "cpu-counting"
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn invoke(
        &self,
        name: &str,
        computation: &Computation,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(name, computation, inputs)
    }
}

type T = Tensor<CountingBackend>;

fn tensor(backend: &Arc<CountingBackend>, sizes: &[usize], data: &[f32]) -> Result<T> {
    Tensor::from_vec(Arc::clone(backend), sizes, data)
}

fn first_tensor(call: &CallArgs<T>) -> Result<T> {
    call.tensor(0).cloned().ok_or_else(|| anyhow!("expected a tensor argument"))
}

fn only_tensor(result: Arg<T>) -> Result<T> {
    result.into_tensor().ok_or_else(|| anyhow!("expected a tensor result"))
}

#[test]
fn identity_specializes_per_input_shape() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let identity = make_pure(Arc::clone(&backend), "identity", |call: CallArgs<T>| {
        Ok(Arg::Tensor(first_tensor(&call)?))
    });

    let small = tensor(&backend, &[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
    let large = tensor(&backend, &[3, 3], &[0.5; 9])?;
    let out_small = only_tensor(identity.call(&CallArgs::tensors([small]))?)?;
    let out_large = only_tensor(identity.call(&CallArgs::tensors([large]))?)?;
    assert_eq!(out_small.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(out_large.shape().sizes(), &[3, 3]);
    assert_eq!(identity.recordings(), 2);
    assert_eq!(identity.cached_signatures(), 2);

    let func: PureFn<CountingBackend> =
        Arc::new(|call: CallArgs<T>| Ok(Arg::Tensor(first_tensor(&call)?)));
    let recorder = PureRecorder::new(Arc::clone(&backend), "identity", func);
    let small = recorder.record(&CallArgs::tensors([Tensor::zeros(
        Arc::clone(&backend),
        Shape::array(DType::F32, vec![2, 2]),
    )?]))?;
    let large = recorder.record(&CallArgs::tensors([Tensor::zeros(
        Arc::clone(&backend),
        Shape::array(DType::F32, vec![3, 3]),
    )?]))?;
    assert_ne!(small.computation.fingerprint(), large.computation.fingerprint());
    assert_eq!(small.num_hoisted(), 0);
    Ok(())
}

#[test]
fn matching_signature_replays_without_recording() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let traced = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&traced);
    let square = make_pure(Arc::clone(&backend), "square", move |call: CallArgs<T>| {
        counter.fetch_add(1, Ordering::SeqCst);
        let x = first_tensor(&call)?;
        Ok(Arg::Tensor(x.mul(&x)?))
    });

    let a = tensor(&backend, &[3], &[1.0, 2.0, 3.0])?;
    let b = tensor(&backend, &[3], &[4.0, 5.0, 6.0])?;
    let before = backend.invokes();
    let first = only_tensor(square.call(&CallArgs::tensors([a]))?)?;
    let second = only_tensor(square.call(&CallArgs::tensors([b]))?)?;
    assert_eq!(first.to_vec::<f32>()?, vec![1.0, 4.0, 9.0]);
    assert_eq!(second.to_vec::<f32>()?, vec![16.0, 25.0, 36.0]);
    assert_eq!(traced.load(Ordering::SeqCst), 1);
    assert_eq!(square.recordings(), 1);
    assert_eq!(backend.invokes() - before, 2);
    Ok(())
}

#[test]
fn captured_tensors_are_hoisted_into_replays() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let bias = tensor(&backend, &[2], &[10.0, 20.0])?;
    let captured = bias.clone();
    let func: PureFn<CountingBackend> = Arc::new(move |call: CallArgs<T>| {
        let x = first_tensor(&call)?;
        Ok(Arg::Tensor(x.add(&captured)?))
    });
    let recorder = PureRecorder::new(Arc::clone(&backend), "add_bias", func);

    let sample = CallArgs::tensors([tensor(&backend, &[2], &[0.0, 0.0])?]);
    let recorded = recorder.record(&sample)?;
    assert_eq!(recorded.num_hoisted(), 1);
    assert_eq!(recorded.slot_to_flat_index.len(), 1);
    let hoisted = recorded.slot_to_hoisted.values().next().expect("one hoisted value");
    assert_eq!(hoisted.id(), bias.id());
    for slot in 0..recorded.computation.num_parameters() {
        assert!(
            recorded.slot_to_flat_index.contains_key(&slot)
                != recorded.slot_to_hoisted.contains_key(&slot)
        );
    }

    let input = CallArgs::tensors([tensor(&backend, &[2], &[1.0, 2.0])?]);
    let result = only_tensor(recorder.replay(&recorded, &input)?)?;
    assert_eq!(result.to_vec::<f32>()?, vec![11.0, 22.0]);
    Ok(())
}

#[test]
fn replay_rejects_a_different_structure() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let func: PureFn<CountingBackend> =
        Arc::new(|call: CallArgs<T>| Ok(Arg::Tensor(first_tensor(&call)?.neg()?)));
    let recorder = PureRecorder::new(Arc::clone(&backend), "neg", func);
    let x = tensor(&backend, &[2], &[1.0, 2.0])?;
    let recorded = recorder.record(&CallArgs::tensors([x.clone()]))?;

    let extra = CallArgs::new(vec![Arg::Tensor(x.clone()), Arg::int(1)]);
    let err = recorder.replay(&recorded, &extra).expect_err("structure differs");
    assert!(matches!(
        err.downcast_ref::<FlattenError>(),
        Some(FlattenError::StructureMismatch { .. })
    ));

    let wrong_shape = CallArgs::tensors([tensor(&backend, &[3], &[1.0, 2.0, 3.0])?]);
    assert!(recorder.replay(&recorded, &wrong_shape).is_err());
    Ok(())
}

#[test]
fn nested_pure_functions_compose() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let scale = tensor(&backend, &[2], &[2.0, 3.0])?;
    let inner = Arc::new(make_pure(Arc::clone(&backend), "inner", move |call: CallArgs<T>| {
        Ok(Arg::Tensor(first_tensor(&call)?.mul(&scale)?))
    }));
    let inner_handle = Arc::clone(&inner);
    let outer = make_pure(Arc::clone(&backend), "outer", move |call: CallArgs<T>| {
        let x = first_tensor(&call)?;
        let scaled = only_tensor(inner_handle.call(&CallArgs::tensors([x.clone()]))?)?;
        Ok(Arg::Tensor(scaled.add(&x)?))
    });

    let before = backend.invokes();
    let first = only_tensor(outer.call(&CallArgs::tensors([tensor(
        &backend,
        &[2],
        &[1.0, 1.0],
    )?]))?)?;
    let second = only_tensor(outer.call(&CallArgs::tensors([tensor(
        &backend,
        &[2],
        &[2.0, -1.0],
    )?]))?)?;
    assert_eq!(first.to_vec::<f32>()?, vec![3.0, 4.0]);
    assert_eq!(second.to_vec::<f32>()?, vec![6.0, -4.0]);
    assert_eq!(outer.recordings(), 1);
    assert_eq!(inner.recordings(), 1);
    // One backend run per outer call; the inner function only ever ran as a nested call.
    assert_eq!(backend.invokes() - before, 2);
    Ok(())
}

#[test]
fn seeded_function_depends_only_on_seed() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let noisy = make_pure_with_seed(Arc::clone(&backend), "noisy", |call: CallArgs<T>| {
        let x = first_tensor(&call)?;
        let first = x.rand_uniform_like()?;
        let second = x.rand_uniform_like()?;
        Ok(Arg::Tuple(vec![Arg::Tensor(x.add(&first)?), Arg::Tensor(second)]))
    });
    let x = tensor(&backend, &[4], &[0.0; 4])?;
    let draw = |seed: i64| -> Result<(Vec<f32>, Vec<f32>)> {
        let call = CallArgs::tensors([x.clone()]).with_kwarg(RNG_SEED_KWARG, Arg::int(seed));
        let mut parts = noisy
            .call(&call)?
            .into_sequence()
            .ok_or_else(|| anyhow!("expected a tuple"))?;
        let second = only_tensor(parts.remove(1))?.to_vec::<f32>()?;
        let first = only_tensor(parts.remove(0))?.to_vec::<f32>()?;
        Ok((first, second))
    };

    let (a1, a2) = draw(7)?;
    let (b1, b2) = draw(7)?;
    let (c1, _) = draw(8)?;
    assert_eq!(a1, b1);
    assert_eq!(a2, b2);
    assert_ne!(a1, a2, "separate draws use separate streams");
    assert_ne!(a1, c1);
    assert!(a1.iter().all(|value| (0.0..1.0).contains(value)));
    assert_eq!(noisy.recordings(), 1);

    let err = noisy
        .call(&CallArgs::tensors([x.clone()]))
        .expect_err("seed keyword is required");
    assert!(format!("{err:#}").contains(RNG_SEED_KWARG));
    assert!(noisy
        .call(&CallArgs::tensors([x]).with_kwarg(RNG_SEED_KWARG, Arg::int(-1)))
        .is_err());
    Ok(())
}

struct Affine {
    weight: Mutex<T>,
    bias: T,
}

impl Module<CountingBackend> for Affine {
    fn named_parameters(&self) -> BTreeMap<String, T> {
        let mut params = BTreeMap::new();
        params.insert("weight".to_string(), self.weight.lock().unwrap().clone());
        params
    }

    fn named_buffers(&self) -> BTreeMap<String, T> {
        let mut buffers = BTreeMap::new();
        buffers.insert("bias".to_string(), self.bias.clone());
        buffers
    }

    fn functional_forward(
        &self,
        parameters: &BTreeMap<String, T>,
        buffers: &BTreeMap<String, T>,
        call: CallArgs<T>,
    ) -> Result<Arg<T>> {
        let x = first_tensor(&call)?;
        let weight = parameters.get("weight").ok_or_else(|| anyhow!("weight missing"))?;
        let bias = buffers.get("bias").ok_or_else(|| anyhow!("bias missing"))?;
        let projected = x.matmul(weight)?;
        Ok(Arg::Tensor(projected.add(&bias.broadcast_to(projected.shape().sizes())?)?))
    }
}

#[test]
fn module_forward_reads_current_parameters() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let module = Arc::new(Affine {
        weight: Mutex::new(tensor(&backend, &[2, 2], &[1.0, 0.0, 0.0, 1.0])?),
        bias: tensor(&backend, &[2], &[0.5, -0.5])?,
    });
    let pure = PureModule::new(Arc::clone(&backend), "affine", Arc::clone(&module));
    let x = tensor(&backend, &[1, 2], &[2.0, 3.0])?;

    let out = only_tensor(pure.forward(&CallArgs::tensors([x.clone()]))?)?;
    assert_eq!(out.to_vec::<f32>()?, vec![2.5, 2.5]);

    *module.weight.lock().unwrap() = tensor(&backend, &[2, 2], &[2.0, 0.0, 0.0, 2.0])?;
    let out = only_tensor(pure.forward(&CallArgs::tensors([x]))?)?;
    assert_eq!(out.to_vec::<f32>()?, vec![4.5, 5.5]);
    assert_eq!(pure.recordings(), 1);
    Ok(())
}

#[test]
fn placeholders_and_traced_tensors_cannot_be_read() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let placeholder: T =
        Tensor::placeholder(Arc::clone(&backend), Shape::array(DType::F32, vec![2]));
    let err = placeholder.to_vec::<f32>().expect_err("placeholders have no value");
    assert!(matches!(
        err.downcast_ref::<TensorReadError>(),
        Some(TensorReadError::Placeholder { .. })
    ));

    let peek = make_pure(Arc::clone(&backend), "peek", |call: CallArgs<T>| {
        let x = first_tensor(&call)?;
        x.to_vec::<f32>()?;
        Ok(Arg::Tensor(x))
    });
    let err = peek
        .call(&CallArgs::tensors([tensor(&backend, &[1], &[1.0])?]))
        .expect_err("reading while recording fails");
    assert!(err.chain().any(|cause| matches!(
        cause.downcast_ref::<TensorReadError>(),
        Some(TensorReadError::Placeholder { .. }) | Some(TensorReadError::Traced { .. })
    )));
    Ok(())
}

#[test]
fn foreign_placeholders_are_rejected() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let stray: T = Tensor::placeholder(Arc::clone(&backend), Shape::array(DType::F32, vec![2]));
    let leaky = make_pure(Arc::clone(&backend), "leaky", move |call: CallArgs<T>| {
        Ok(Arg::Tensor(first_tensor(&call)?.add(&stray)?))
    });
    let err = leaky
        .call(&CallArgs::tensors([tensor(&backend, &[2], &[1.0, 2.0])?]))
        .expect_err("stray placeholder must not be captured");
    assert!(format!("{err:#}").contains("placeholder"));
    Ok(())
}
