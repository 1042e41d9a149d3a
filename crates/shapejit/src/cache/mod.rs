//! Shape-specialized compilation cache.
//!
//! [`CompiledCallableWithCache`] flattens each call, derives a [`Signature`] from the leaf
//! shapes, the static leaves and the tree structure, and asks its [`Specializer`] for a
//! callable the first time a signature is seen. Later calls with an equal signature reuse
//! the stored callable without tracing again.

pub mod dispatch;
pub mod native;
pub mod staged;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::backend::spec::{PortableBackend, Shape};
use crate::ops::graph::Op;
use crate::profiling;
use crate::tensor::Tensor;
use crate::tree::{flatten_call, Arg, CallArgs, StaticLeaf, TreeDef, TreeLayout};

pub use dispatch::{
    cached_computation_count, call_native, call_staged, clear_dispatch_cache, dispatch_cache_len,
    DispatchKey, FunctionIdentity,
};
pub use native::NativeCallable;
pub use staged::{BuilderStagedCompiler, StagedCallable, StagedCompiler};

/// A flat leaf whose abstract value (shape and dtype) keys the cache.
pub trait Leaf: Clone {
    fn abstract_shape(&self) -> Shape;
}

impl<B: PortableBackend + 'static> Leaf for Tensor<B> {
    fn abstract_shape(&self) -> Shape {
        self.shape().clone()
    }
}

impl Leaf for Op {
    fn abstract_shape(&self) -> Shape {
        self.shape().clone()
    }
}

impl Leaf for Shape {
    fn abstract_shape(&self) -> Shape {
        self.clone()
    }
}

/// Cache key: abstract leaves plus everything about the call that is not a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub leaves: Vec<Shape>,
    pub statics: Vec<Option<StaticLeaf>>,
    pub structure: TreeDef,
}

impl Signature {
    pub fn new<T: Leaf>(layout: &TreeLayout, leaves: &[T]) -> Self {
        Signature {
            leaves: leaves.iter().map(Leaf::abstract_shape).collect(),
            statics: layout.leaves.clone(),
            structure: layout.structure.clone(),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (index, shape) in self.leaves.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{shape}")?;
        }
        f.write_str(")")
    }
}

pub type FlatCallable<T> = Arc<dyn Fn(&[T]) -> Result<Vec<T>> + Send + Sync>;

/// Result of specializing a function for one signature.
pub struct Specialized<T> {
    pub callable: FlatCallable<T>,
    pub output: TreeLayout,
}

impl<T> Clone for Specialized<T> {
    fn clone(&self) -> Self {
        Specialized {
            callable: Arc::clone(&self.callable),
            output: self.output.clone(),
        }
    }
}

/// Produces a flat callable for one input layout and set of concrete leaves.
pub trait Specializer<T>: Send + Sync {
    fn name(&self) -> &str;

    fn specialize(&self, layout: &TreeLayout, leaves: &[T]) -> Result<Specialized<T>>;
}

pub struct CompiledCallableWithCache<T, S> {
    specializer: S,
    entries: Mutex<HashMap<Signature, Specialized<T>>>,
    specializations: AtomicUsize,
}

impl<T, S> CompiledCallableWithCache<T, S>
where
    T: Leaf,
    S: Specializer<T>,
{
    pub fn new(specializer: S) -> Self {
        CompiledCallableWithCache {
            specializer,
            entries: Mutex::new(HashMap::new()),
            specializations: AtomicUsize::new(0),
        }
    }

    pub fn specializer(&self) -> &S {
        &self.specializer
    }

    pub fn invoke(&self, call: &CallArgs<T>) -> Result<Arg<T>> {
        let (leaves, layout) = flatten_call(call);
        let signature = Signature::new(&layout, &leaves);
        let entry = self.lookup_or_specialize(signature, &layout, &leaves)?;
        let outputs = (entry.callable)(&leaves)
            .with_context(|| format!("running specialized '{}' failed", self.specializer.name()))?;
        Ok(entry.output.unflatten(outputs)?)
    }

    fn lookup_or_specialize(
        &self,
        signature: Signature,
        layout: &TreeLayout,
        leaves: &[T],
    ) -> Result<Specialized<T>> {
        if let Some(found) = self.entries.lock().expect("cache map poisoned").get(&signature) {
            profiling::cache_event("hit");
            return Ok(found.clone());
        }
        profiling::cache_event("miss");
        tracing::debug!(
            function = self.specializer.name(),
            signature = %signature,
            "specializing for new signature"
        );
        let specialized = {
            let _scope = profiling::compile_scope("specialize");
            self.specializer
                .specialize(layout, leaves)
                .with_context(|| {
                    format!(
                        "failed to specialize '{}' for {signature}",
                        self.specializer.name()
                    )
                })?
        };
        self.specializations.fetch_add(1, Ordering::SeqCst);
        profiling::cache_event("specialize");
        self.entries
            .lock()
            .expect("cache map poisoned")
            .insert(signature, specialized.clone());
        Ok(specialized)
    }

    /// Number of times the specializer ran, including duplicated work from races.
    pub fn specialization_count(&self) -> usize {
        self.specializations.load(Ordering::SeqCst)
    }

    /// Number of cached signatures.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache map poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::DType;

    struct Echo;

    impl Specializer<Shape> for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn specialize(&self, layout: &TreeLayout, _leaves: &[Shape]) -> Result<Specialized<Shape>> {
            let output = layout.clone();
            Ok(Specialized {
                callable: Arc::new(|leaves: &[Shape]| Ok(leaves.to_vec())),
                output,
            })
        }
    }

    #[test]
    fn signature_tracks_static_leaves() {
        let cache = CompiledCallableWithCache::new(Echo);
        let f32_2 = Shape::array(DType::F32, vec![2]);
        let first = CallArgs::new(vec![Arg::Tensor(f32_2.clone()), Arg::int(1)]);
        let second = CallArgs::new(vec![Arg::Tensor(f32_2.clone()), Arg::int(2)]);
        cache.invoke(&first).unwrap();
        cache.invoke(&first).unwrap();
        cache.invoke(&second).unwrap();
        assert_eq!(cache.specialization_count(), 2);
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    struct Failing;

    impl Specializer<Shape> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn specialize(&self, layout: &TreeLayout, _leaves: &[Shape]) -> Result<Specialized<Shape>> {
            Ok(Specialized {
                callable: Arc::new(|_: &[Shape]| -> Result<Vec<Shape>> {
                    anyhow::bail!("device lost")
                }),
                output: layout.clone(),
            })
        }
    }

    #[test]
    fn execution_failures_are_not_reported_as_specialization() {
        let cache = CompiledCallableWithCache::new(Failing);
        let call = CallArgs::tensors([Shape::array(DType::F32, vec![2])]);
        let err = cache.invoke(&call).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("running specialized 'failing' failed"), "{message}");
        assert!(message.contains("device lost"), "{message}");
        assert_eq!(cache.specialization_count(), 1);
    }
}
