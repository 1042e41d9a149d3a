use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use shapejit::backend::computation::Computation;
use shapejit::backend::hashing::override_hash;
use shapejit::backend::spec::{BackendResult, DType, PortableBackend, Shape, TensorLiteral};
use shapejit::cache::{
    cached_computation_count, call_native, call_staged, clear_dispatch_cache, dispatch_cache_len,
    BuilderStagedCompiler, CompiledCallableWithCache, NativeCallable, StagedCallable,
};
use shapejit::ops::graph::Op;
use shapejit::profiling;
use shapejit::tensor::Tensor;
use shapejit::tree::{Arg, CallArgs, StaticLeaf};
use shapejit_backend_ref_cpu::CpuPortableBackend;

static TEST_MUTEX: Mutex<()> = Mutex::new(());

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

fn matrix(
    backend: &Arc<CountingBackend>,
    size: usize,
    start: f32,
) -> Result<Tensor<CountingBackend>> {
    let data: Vec<f32> = (0..size * size).map(|i| start + i as f32).collect();
    Tensor::from_vec(Arc::clone(backend), &[size, size], &data)
}

fn scaled_sum(call: CallArgs<Op>) -> Result<Arg<Op>> {
    let x = call.tensor(0).ok_or_else(|| anyhow::anyhow!("x missing"))?;
    let y = call.tensor(1).ok_or_else(|| anyhow::anyhow!("y missing"))?;
    let factor = match call.args.get(2).and_then(Arg::as_static) {
        Some(StaticLeaf::Int(value)) => *value as f64,
        _ => 1.0,
    };
    let scale = x.scalar_like(factor)?.broadcast(x.sizes())?;
    Ok(Arg::Tensor(x.add(y)?.mul(&scale)?))
}

fn doubled(call: CallArgs<Op>) -> Result<Arg<Op>> {
    let x = call.tensor(0).ok_or_else(|| anyhow::anyhow!("x missing"))?;
    Ok(Arg::Tuple(vec![Arg::Tensor(x.add(x)?), Arg::str("doubled")]))
}

fn negated(call: CallArgs<Op>) -> Result<Arg<Op>> {
    let x = call.tensor(0).ok_or_else(|| anyhow::anyhow!("x missing"))?;
    Ok(Arg::Tuple(vec![Arg::Tensor(x.neg()?), Arg::str("negated")]))
}

type OpFn = fn(CallArgs<Op>) -> Result<Arg<Op>>;

#[test]
fn repeated_signature_specializes_once() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let cache = CompiledCallableWithCache::new(NativeCallable::new(
        Arc::clone(&backend),
        "scaled_sum",
        Arc::new(scaled_sum as OpFn),
    ));
    let x = matrix(&backend, 2, 1.0)?;
    let y = matrix(&backend, 2, 0.0)?;
    let call = CallArgs::new(vec![Arg::Tensor(x.clone()), Arg::Tensor(y.clone()), Arg::int(2)]);

    let first = cache.invoke(&call)?;
    let second = cache.invoke(&call)?;
    assert_eq!(cache.specialization_count(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(backend.invokes(), 2);

    let first = first.into_tensor().expect("tensor result").to_vec::<f32>()?;
    let second = second.into_tensor().expect("tensor result").to_vec::<f32>()?;
    assert_eq!(first, vec![2.0, 6.0, 10.0, 14.0]);
    assert_eq!(first, second);

    let tripled = CallArgs::new(vec![Arg::Tensor(x), Arg::Tensor(y), Arg::int(3)]);
    let third = cache.invoke(&tripled)?.into_tensor().expect("tensor result");
    assert_eq!(third.to_vec::<f32>()?, vec![3.0, 9.0, 15.0, 21.0]);
    assert_eq!(cache.specialization_count(), 2);
    Ok(())
}

#[test]
fn new_shapes_specialize_new_computations() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let native =
        NativeCallable::new(Arc::clone(&backend), "scaled_sum", Arc::new(scaled_sum as OpFn));

    let small = CallArgs::tensors([matrix(&backend, 2, 0.0)?, matrix(&backend, 2, 0.0)?]);
    let large = CallArgs::tensors([matrix(&backend, 3, 0.0)?, matrix(&backend, 3, 0.0)?]);
    let (small_leaves, small_layout) = shapejit::tree::flatten_call(&small);
    let (large_leaves, large_layout) = shapejit::tree::flatten_call(&large);
    let (small_computation, _) = native.build_computation(&small_layout, &small_leaves)?;
    let (large_computation, _) = native.build_computation(&large_layout, &large_leaves)?;
    assert_ne!(small_computation.fingerprint(), large_computation.fingerprint());
    assert_eq!(small_computation.parameters()[0], Shape::array(DType::F32, vec![2, 2]));
    assert_eq!(large_computation.parameters()[0], Shape::array(DType::F32, vec![3, 3]));

    let cache = CompiledCallableWithCache::new(native);
    cache.invoke(&small)?;
    cache.invoke(&large)?;
    cache.invoke(&small)?;
    assert_eq!(cache.specialization_count(), 2);
    assert_eq!(cache.len(), 2);

    cache.clear();
    assert!(cache.is_empty());
    cache.invoke(&small)?;
    assert_eq!(cache.specialization_count(), 3);
    Ok(())
}

#[test]
fn cache_events_track_hits_and_misses() -> Result<()> {
    let _guard = TEST_MUTEX.lock().unwrap();
    let backend = Arc::new(CountingBackend::new());
    let cache = CompiledCallableWithCache::new(NativeCallable::new(
        Arc::clone(&backend),
        "events",
        Arc::new(doubled as OpFn),
    ));
    let call = CallArgs::tensors([matrix(&backend, 2, 0.0)?]);
    let misses = profiling::cache_event_count("miss");
    let hits = profiling::cache_event_count("hit");
    cache.invoke(&call)?;
    cache.invoke(&call)?;
    cache.invoke(&call)?;
    assert!(profiling::cache_event_count("miss") > misses);
    assert!(profiling::cache_event_count("hit") >= hits + 2);
    Ok(())
}

#[test]
fn static_result_leaves_survive_unflatten() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let cache = CompiledCallableWithCache::new(NativeCallable::new(
        Arc::clone(&backend),
        "doubled",
        Arc::new(doubled as OpFn),
    ));
    let result = cache.invoke(&CallArgs::tensors([matrix(&backend, 2, 1.0)?]))?;
    let mut parts = result.into_sequence().expect("tuple result");
    let label = parts.pop().and_then(|part| part.as_static().cloned());
    assert_eq!(label, Some(StaticLeaf::Str("doubled".to_string())));
    let tensor = parts.pop().and_then(Arg::into_tensor).expect("tensor leaf");
    assert_eq!(tensor.to_vec::<f32>()?, vec![2.0, 4.0, 6.0, 8.0]);
    Ok(())
}

#[test]
fn override_hash_shares_one_dispatch_entry() -> Result<()> {
    let _guard = TEST_MUTEX.lock().unwrap();
    let backend = Arc::new(CountingBackend::new());
    let label = override_hash("shared-kernel");
    let x = CallArgs::tensors([matrix(&backend, 2, 1.0)?]);
    let before = cached_computation_count();

    let first = Arc::new(doubled as OpFn);
    let second = Arc::new(negated as OpFn);
    let a = call_native(&backend, "doubled", &first, Some(label), &x)?;
    let b = call_native(&backend, "negated", &second, Some(label), &x)?;
    assert_eq!(cached_computation_count(), before + 1);

    // The second function reuses the computation specialized for the first.
    let mut parts = b.into_sequence().expect("tuple result");
    let label = parts.pop().and_then(|part| part.as_static().cloned());
    assert_eq!(label, Some(StaticLeaf::Str("doubled".to_string())));
    let shared = parts.remove(0).into_tensor().expect("tensor leaf").to_vec::<f32>()?;
    let original = a
        .into_sequence()
        .and_then(|mut parts| parts.remove(0).into_tensor())
        .expect("tensor leaf")
        .to_vec::<f32>()?;
    assert_eq!(shared, original);
    assert_eq!(shared, vec![2.0, 4.0, 6.0, 8.0]);

    let c = call_native(&backend, "negated", &second, None, &x)?;
    let values = c
        .into_sequence()
        .and_then(|mut parts| parts.remove(0).into_tensor())
        .expect("tensor leaf")
        .to_vec::<f32>()?;
    assert_eq!(values, vec![-1.0, -2.0, -3.0, -4.0]);
    assert_eq!(cached_computation_count(), before + 2);
    Ok(())
}

#[test]
fn staged_adapter_round_trips_through_module_bytes() -> Result<()> {
    let backend = Arc::new(CountingBackend::new());
    let compiler = Arc::new(BuilderStagedCompiler::new());
    let staged = StagedCallable::new(
        Arc::clone(&backend),
        Arc::clone(&compiler),
        "staged_sum",
        Arc::new(scaled_sum as OpFn),
    );
    let call = CallArgs::new(vec![
        Arg::Tensor(matrix(&backend, 2, 1.0)?),
        Arg::Tensor(matrix(&backend, 2, 1.0)?),
        Arg::int(1),
    ]);
    let (leaves, layout) = shapejit::tree::flatten_call(&call);
    let (computation, _) = staged.build_computation(&layout, &leaves)?;
    assert_eq!(computation.name(), "staged_sum");
    assert_eq!(computation.num_parameters(), 2);

    let cache = CompiledCallableWithCache::new(staged);
    let result = cache.invoke(&call)?.into_tensor().expect("tensor result");
    assert_eq!(result.to_vec::<f32>()?, vec![2.0, 4.0, 6.0, 8.0]);
    cache.invoke(&call)?;
    assert_eq!(cache.specialization_count(), 1);
    Ok(())
}

#[test]
fn staged_dispatch_is_keyed_by_compiler_context() -> Result<()> {
    let _guard = TEST_MUTEX.lock().unwrap();
    let backend = Arc::new(CountingBackend::new());
    let func = Arc::new(doubled as OpFn);
    let x = CallArgs::tensors([matrix(&backend, 2, 0.0)?]);
    let before = cached_computation_count();

    let context = 0x5eed_0001;
    let first = Arc::new(BuilderStagedCompiler::with_context(context));
    let second = Arc::new(BuilderStagedCompiler::with_context(context));
    call_staged(&backend, &first, "doubled", &func, None, &x)?;
    call_staged(&backend, &second, "doubled", &func, None, &x)?;
    assert_eq!(cached_computation_count(), before + 1);

    let other = Arc::new(BuilderStagedCompiler::new());
    call_staged(&backend, &other, "doubled", &func, None, &x)?;
    assert_eq!(cached_computation_count(), before + 2);
    Ok(())
}

#[test]
fn staged_dispatch_runs_on_the_calling_backend() -> Result<()> {
    let _guard = TEST_MUTEX.lock().unwrap();
    let first_backend = Arc::new(CountingBackend::new());
    let second_backend = Arc::new(CountingBackend::new());
    let compiler = Arc::new(BuilderStagedCompiler::new());
    let func = Arc::new(doubled as OpFn);

    let x1 = CallArgs::tensors([matrix(&first_backend, 2, 0.0)?]);
    let x2 = CallArgs::tensors([matrix(&second_backend, 2, 1.0)?]);
    call_staged(&first_backend, &compiler, "doubled", &func, None, &x1)?;
    let result = call_staged(&second_backend, &compiler, "doubled", &func, None, &x2)?;

    assert_eq!(first_backend.invokes(), 1);
    assert_eq!(second_backend.invokes(), 1);
    let values = result
        .into_sequence()
        .and_then(|mut parts| parts.remove(0).into_tensor())
        .expect("tensor leaf")
        .to_vec::<f32>()?;
    assert_eq!(values, vec![2.0, 4.0, 6.0, 8.0]);
    Ok(())
}

#[test]
fn clearing_dispatch_cache_forces_respecialization() -> Result<()> {
    let _guard = TEST_MUTEX.lock().unwrap();
    let backend = Arc::new(CountingBackend::new());
    let func = Arc::new(negated as OpFn);
    let x = CallArgs::tensors([matrix(&backend, 2, 0.0)?]);

    clear_dispatch_cache();
    assert_eq!(dispatch_cache_len(), 0);
    assert_eq!(cached_computation_count(), 0);

    call_native(&backend, "negated", &func, None, &x)?;
    call_native(&backend, "negated", &func, None, &x)?;
    assert_eq!(dispatch_cache_len(), 1);
    assert_eq!(cached_computation_count(), 1);

    clear_dispatch_cache();
    assert_eq!(dispatch_cache_len(), 0);
    assert_eq!(cached_computation_count(), 0);

    let misses = profiling::cache_event_count("miss");
    call_native(&backend, "negated", &func, None, &x)?;
    assert_eq!(dispatch_cache_len(), 1);
    assert_eq!(cached_computation_count(), 1);
    assert!(profiling::cache_event_count("miss") > misses);
    Ok(())
}
