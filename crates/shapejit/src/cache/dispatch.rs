//! Process-wide registry of specialization caches, one per wrapped function.
//!
//! A function is identified either by a caller-chosen override hash or by the address of the
//! `Arc` holding it; the registry entry keeps that `Arc` alive, so the address stays unique
//! while the entry exists. Entries are further keyed by the backend they run on and, for the
//! staged adapter, by the compiler's tracing context.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;

use crate::backend::spec::PortableBackend;
use crate::ops::graph::Op;
use crate::tensor::Tensor;
use crate::tree::{Arg, CallArgs};

use super::native::NativeCallable;
use super::staged::{StagedCallable, StagedCompiler};
use super::{CompiledCallableWithCache, Leaf, Specializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionIdentity {
    Override(u64),
    Address(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub adapter: &'static str,
    pub identity: FunctionIdentity,
    pub backend: usize,
    pub context: u64,
}

trait DispatchEntry: Send + Sync {
    fn cached_signatures(&self) -> usize;
    fn clear(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T, S> DispatchEntry for CompiledCallableWithCache<T, S>
where
    T: Leaf + 'static,
    S: Specializer<T> + 'static,
{
    fn cached_signatures(&self) -> usize {
        self.len()
    }

    fn clear(&self) {
        CompiledCallableWithCache::clear(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static DISPATCH: Lazy<Mutex<HashMap<DispatchKey, Arc<dyn DispatchEntry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn identity_of<F>(func: &Arc<F>, override_hash: Option<u64>) -> FunctionIdentity {
    match override_hash {
        Some(hash) => FunctionIdentity::Override(hash),
        None => FunctionIdentity::Address(Arc::as_ptr(func) as *const () as usize),
    }
}

fn backend_address<B>(backend: &Arc<B>) -> usize {
    Arc::as_ptr(backend) as *const () as usize
}

fn entry_for<T, S>(
    key: DispatchKey,
    create: impl FnOnce() -> S,
) -> Result<Arc<CompiledCallableWithCache<T, S>>>
where
    T: Leaf + 'static,
    S: Specializer<T> + 'static,
{
    let mut map = DISPATCH.lock().expect("dispatch cache poisoned");
    let entry = match map.get(&key) {
        Some(entry) => Arc::clone(entry),
        None => {
            let entry: Arc<dyn DispatchEntry> =
                Arc::new(CompiledCallableWithCache::<T, S>::new(create()));
            map.insert(key, Arc::clone(&entry));
            entry
        }
    };
    entry
        .into_any()
        .downcast::<CompiledCallableWithCache<T, S>>()
        .map_err(|_| anyhow!("dispatch entry {key:?} was registered for a different function type"))
}

/// Calls `func` through its shared native-builder cache.
pub fn call_native<B, F>(
    backend: &Arc<B>,
    name: &str,
    func: &Arc<F>,
    override_hash: Option<u64>,
    call: &CallArgs<Tensor<B>>,
) -> Result<Arg<Tensor<B>>>
where
    B: PortableBackend + 'static,
    F: Fn(CallArgs<Op>) -> Result<Arg<Op>> + Send + Sync + 'static,
{
    let key = DispatchKey {
        adapter: "native",
        identity: identity_of(func, override_hash),
        backend: backend_address(backend),
        context: 0,
    };
    let cache = entry_for::<Tensor<B>, _>(key, || {
        NativeCallable::new(Arc::clone(backend), name, Arc::clone(func))
    })?;
    cache.invoke(call)
}

/// Calls `func` through its shared staged-compiler cache.
pub fn call_staged<B, C, F>(
    backend: &Arc<B>,
    compiler: &Arc<C>,
    name: &str,
    func: &Arc<F>,
    override_hash: Option<u64>,
    call: &CallArgs<Tensor<B>>,
) -> Result<Arg<Tensor<B>>>
where
    B: PortableBackend + 'static,
    C: StagedCompiler,
    F: Fn(CallArgs<C::Tracer>) -> Result<Arg<C::Tracer>> + Send + Sync + 'static,
{
    let key = DispatchKey {
        adapter: "staged",
        identity: identity_of(func, override_hash),
        backend: backend_address(backend),
        context: compiler.trace_context(),
    };
    let cache = entry_for::<Tensor<B>, _>(key, || {
        StagedCallable::new(Arc::clone(backend), Arc::clone(compiler), name, Arc::clone(func))
    })?;
    cache.invoke(call)
}

/// Total number of specializations held across all registered functions.
pub fn cached_computation_count() -> usize {
    DISPATCH
        .lock()
        .expect("dispatch cache poisoned")
        .values()
        .map(|entry| entry.cached_signatures())
        .sum()
}

/// Number of registered functions.
pub fn dispatch_cache_len() -> usize {
    DISPATCH.lock().expect("dispatch cache poisoned").len()
}

pub fn clear_dispatch_cache() {
    let entries: Vec<_> = DISPATCH
        .lock()
        .expect("dispatch cache poisoned")
        .drain()
        .map(|(_, entry)| entry)
        .collect();
    for entry in entries {
        entry.clear();
    }
}
