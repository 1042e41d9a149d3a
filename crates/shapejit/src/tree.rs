//! Nested call arguments and their flat tensor-leaf encoding.
//!
//! [`flatten_call`] walks positional arguments first and keyword arguments second (in key
//! order), depth first, collecting tensor leaves into a flat vector. Everything else about
//! the tree, including every non-tensor leaf value, lands in a [`TreeLayout`] that can
//! rebuild the same tree around a new set of leaves of any type.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use anyhow::Result;
use thiserror::Error;

use crate::backend::spec::DType;

/// Non-tensor leaf value. Part of the cache key, so it compares and hashes by value.
#[derive(Debug, Clone)]
pub enum StaticLeaf {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DType(DType),
}

impl PartialEq for StaticLeaf {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StaticLeaf::None, StaticLeaf::None) => true,
            (StaticLeaf::Bool(a), StaticLeaf::Bool(b)) => a == b,
            (StaticLeaf::Int(a), StaticLeaf::Int(b)) => a == b,
            (StaticLeaf::Float(a), StaticLeaf::Float(b)) => a.to_bits() == b.to_bits(),
            (StaticLeaf::Str(a), StaticLeaf::Str(b)) => a == b,
            (StaticLeaf::DType(a), StaticLeaf::DType(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StaticLeaf {}

impl Hash for StaticLeaf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            StaticLeaf::None => {}
            StaticLeaf::Bool(value) => value.hash(state),
            StaticLeaf::Int(value) => value.hash(state),
            StaticLeaf::Float(value) => value.to_bits().hash(state),
            StaticLeaf::Str(value) => value.hash(state),
            StaticLeaf::DType(value) => value.hash(state),
        }
    }
}

impl fmt::Display for StaticLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticLeaf::None => f.write_str("None"),
            StaticLeaf::Bool(value) => write!(f, "{value}"),
            StaticLeaf::Int(value) => write!(f, "{value}"),
            StaticLeaf::Float(value) => write!(f, "{value:?}"),
            StaticLeaf::Str(value) => write!(f, "{value:?}"),
            StaticLeaf::DType(value) => write!(f, "{value}"),
        }
    }
}

/// A nested argument or result value with tensor leaves of type `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<T> {
    Tensor(T),
    Static(StaticLeaf),
    Tuple(Vec<Arg<T>>),
    List(Vec<Arg<T>>),
    Dict(BTreeMap<String, Arg<T>>),
}

impl<T> Arg<T> {
    pub fn int(value: i64) -> Self {
        Arg::Static(StaticLeaf::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Arg::Static(StaticLeaf::Float(value))
    }

    pub fn bool(value: bool) -> Self {
        Arg::Static(StaticLeaf::Bool(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Arg::Static(StaticLeaf::Str(value.into()))
    }

    pub fn none() -> Self {
        Arg::Static(StaticLeaf::None)
    }

    pub fn as_tensor(&self) -> Option<&T> {
        match self {
            Arg::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<T> {
        match self {
            Arg::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_static(&self) -> Option<&StaticLeaf> {
        match self {
            Arg::Static(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Elements of a tuple or list.
    pub fn into_sequence(self) -> Option<Vec<Arg<T>>> {
        match self {
            Arg::Tuple(items) | Arg::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<BTreeMap<String, Arg<T>>> {
        match self {
            Arg::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Tensor leaves in traversal order.
    pub fn tensors(&self) -> Vec<&T> {
        let mut out = Vec::new();
        collect_tensors(self, &mut out);
        out
    }
}

fn collect_tensors<'a, T>(arg: &'a Arg<T>, out: &mut Vec<&'a T>) {
    match arg {
        Arg::Tensor(tensor) => out.push(tensor),
        Arg::Static(_) => {}
        Arg::Tuple(items) | Arg::List(items) => {
            for item in items {
                collect_tensors(item, out);
            }
        }
        Arg::Dict(entries) => {
            for value in entries.values() {
                collect_tensors(value, out);
            }
        }
    }
}

impl<T> From<StaticLeaf> for Arg<T> {
    fn from(leaf: StaticLeaf) -> Self {
        Arg::Static(leaf)
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<T> {
    pub args: Vec<Arg<T>>,
    pub kwargs: BTreeMap<String, Arg<T>>,
}

impl<T> Default for CallArgs<T> {
    fn default() -> Self {
        CallArgs {
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }
}

impl<T> CallArgs<T> {
    pub fn new(args: Vec<Arg<T>>) -> Self {
        CallArgs {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    /// Positional tensors only.
    pub fn tensors(tensors: impl IntoIterator<Item = T>) -> Self {
        CallArgs::new(tensors.into_iter().map(Arg::Tensor).collect())
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Arg<T>) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Positional argument `index` as a tensor, if it is one.
    pub fn tensor(&self, index: usize) -> Option<&T> {
        self.args.get(index).and_then(Arg::as_tensor)
    }
}

/// Structure of a nested value with its leaves erased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TreeDef {
    Leaf,
    Tuple(Vec<TreeDef>),
    List(Vec<TreeDef>),
    Dict(Vec<(String, TreeDef)>),
}

impl TreeDef {
    pub fn num_leaves(&self) -> usize {
        match self {
            TreeDef::Leaf => 1,
            TreeDef::Tuple(items) | TreeDef::List(items) => {
                items.iter().map(TreeDef::num_leaves).sum()
            }
            TreeDef::Dict(entries) => entries.iter().map(|(_, def)| def.num_leaves()).sum(),
        }
    }
}

impl fmt::Display for TreeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeDef::Leaf => f.write_str("*"),
            TreeDef::Tuple(items) => {
                f.write_str("(")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            TreeDef::List(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            TreeDef::Dict(entries) => {
                f.write_str("{")?;
                for (index, (key, item)) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Descriptor produced by flattening: the tree structure plus every leaf in traversal
/// order, with `None` standing in for tensor positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeLayout {
    pub structure: TreeDef,
    pub leaves: Vec<Option<StaticLeaf>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlattenError {
    #[error("argument structure {found} does not match the recorded structure {expected}")]
    StructureMismatch { expected: String, found: String },
    #[error("{stage} called before the {missing} layout was recorded")]
    NotPreprocessed {
        stage: &'static str,
        missing: &'static str,
    },
    #[error("layout expects {expected} tensor leaves, got {found}")]
    LeafCount { expected: usize, found: usize },
}

impl TreeLayout {
    pub fn num_tensors(&self) -> usize {
        self.leaves.iter().filter(|leaf| leaf.is_none()).count()
    }

    /// Non-tensor leaves in traversal order, with the tensor sentinel preserved.
    pub fn statics(&self) -> &[Option<StaticLeaf>] {
        &self.leaves
    }

    /// Rebuilds a single nested value around `tensors`.
    pub fn unflatten<U>(&self, tensors: Vec<U>) -> Result<Arg<U>, FlattenError> {
        let expected = self.num_tensors();
        if tensors.len() != expected {
            return Err(FlattenError::LeafCount {
                expected,
                found: tensors.len(),
            });
        }
        let mut leaves = self.leaves.iter();
        let mut tensors = tensors.into_iter();
        let value = rebuild(&self.structure, &mut leaves, &mut tensors);
        value.ok_or_else(|| self.mismatch())
    }

    /// Rebuilds call arguments recorded by [`flatten_call`].
    pub fn unflatten_call<U>(&self, tensors: Vec<U>) -> Result<CallArgs<U>, FlattenError> {
        let call = self.unflatten(tensors)?;
        let mut parts = call.into_sequence().ok_or_else(|| self.mismatch())?;
        if parts.len() != 2 {
            return Err(self.mismatch());
        }
        let kwargs = parts.pop().and_then(Arg::into_dict);
        let args = parts.pop().and_then(Arg::into_sequence);
        match (args, kwargs) {
            (Some(args), Some(kwargs)) => Ok(CallArgs { args, kwargs }),
            _ => Err(self.mismatch()),
        }
    }

    /// Fails with [`FlattenError::StructureMismatch`] unless `other` equals `self`.
    pub fn ensure_matches(&self, other: &TreeLayout) -> Result<(), FlattenError> {
        if self == other {
            Ok(())
        } else {
            Err(FlattenError::StructureMismatch {
                expected: self.describe(),
                found: other.describe(),
            })
        }
    }

    /// Structure with static leaves spelled out and tensors shown as `*`.
    pub fn describe(&self) -> String {
        let statics: Vec<String> = self
            .leaves
            .iter()
            .map(|leaf| match leaf {
                Some(value) => value.to_string(),
                None => "*".to_string(),
            })
            .collect();
        format!("{} with leaves [{}]", self.structure, statics.join(", "))
    }

    fn mismatch(&self) -> FlattenError {
        FlattenError::StructureMismatch {
            expected: self.describe(),
            found: "malformed layout".to_string(),
        }
    }
}

fn rebuild<'a, U>(
    def: &TreeDef,
    leaves: &mut impl Iterator<Item = &'a Option<StaticLeaf>>,
    tensors: &mut impl Iterator<Item = U>,
) -> Option<Arg<U>> {
    match def {
        TreeDef::Leaf => match leaves.next()? {
            Some(value) => Some(Arg::Static(value.clone())),
            None => tensors.next().map(Arg::Tensor),
        },
        TreeDef::Tuple(items) => items
            .iter()
            .map(|item| rebuild(item, leaves, tensors))
            .collect::<Option<Vec<_>>>()
            .map(Arg::Tuple),
        TreeDef::List(items) => items
            .iter()
            .map(|item| rebuild(item, leaves, tensors))
            .collect::<Option<Vec<_>>>()
            .map(Arg::List),
        TreeDef::Dict(entries) => entries
            .iter()
            .map(|(key, item)| rebuild(item, leaves, tensors).map(|value| (key.clone(), value)))
            .collect::<Option<BTreeMap<_, _>>>()
            .map(Arg::Dict),
    }
}

/// Flattens one nested value into its tensor leaves and layout.
pub fn flatten<T: Clone>(value: &Arg<T>) -> (Vec<T>, TreeLayout) {
    let mut tensors = Vec::new();
    let mut leaves = Vec::new();
    let structure = walk(value, &mut tensors, &mut leaves);
    (tensors, TreeLayout { structure, leaves })
}

/// Flattens call arguments as the pair `(args, kwargs)`.
pub fn flatten_call<T: Clone>(call: &CallArgs<T>) -> (Vec<T>, TreeLayout) {
    let mut tensors = Vec::new();
    let mut leaves = Vec::new();
    let args = call
        .args
        .iter()
        .map(|arg| walk(arg, &mut tensors, &mut leaves))
        .collect();
    let kwargs = call
        .kwargs
        .iter()
        .map(|(key, value)| (key.clone(), walk(value, &mut tensors, &mut leaves)))
        .collect();
    let structure = TreeDef::Tuple(vec![TreeDef::Tuple(args), TreeDef::Dict(kwargs)]);
    (tensors, TreeLayout { structure, leaves })
}

fn walk<T: Clone>(
    arg: &Arg<T>,
    tensors: &mut Vec<T>,
    leaves: &mut Vec<Option<StaticLeaf>>,
) -> TreeDef {
    match arg {
        Arg::Tensor(tensor) => {
            tensors.push(tensor.clone());
            leaves.push(None);
            TreeDef::Leaf
        }
        Arg::Static(value) => {
            leaves.push(Some(value.clone()));
            TreeDef::Leaf
        }
        Arg::Tuple(items) => TreeDef::Tuple(
            items
                .iter()
                .map(|item| walk(item, tensors, leaves))
                .collect(),
        ),
        Arg::List(items) => TreeDef::List(
            items
                .iter()
                .map(|item| walk(item, tensors, leaves))
                .collect(),
        ),
        Arg::Dict(entries) => TreeDef::Dict(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), walk(value, tensors, leaves)))
                .collect(),
        ),
    }
}

/// A nested-argument function exposed through a flat tensor interface.
///
/// `preprocess` flattens the caller's arguments and records their layout; `flat_call`
/// rebuilds the arguments around a flat leaf vector (of any leaf type the function accepts),
/// calls the function and flattens its result; `postprocess` rebuilds the result from flat
/// outputs. The first result layout observed is kept and later results must match it.
pub struct FlattenedInputFunc<F> {
    func: F,
    input: Mutex<Option<TreeLayout>>,
    output: Mutex<Option<TreeLayout>>,
}

impl<F> FlattenedInputFunc<F> {
    pub fn new(func: F) -> Self {
        FlattenedInputFunc {
            func,
            input: Mutex::new(None),
            output: Mutex::new(None),
        }
    }

    /// Starts from an input layout computed elsewhere (e.g. by the specialization cache).
    pub fn with_input_layout(func: F, layout: TreeLayout) -> Self {
        FlattenedInputFunc {
            func,
            input: Mutex::new(Some(layout)),
            output: Mutex::new(None),
        }
    }

    pub fn preprocess<T: Clone>(&self, call: &CallArgs<T>) -> Vec<T> {
        let (tensors, layout) = flatten_call(call);
        *self.input.lock().expect("input layout poisoned") = Some(layout);
        tensors
    }

    pub fn input_layout(&self) -> Option<TreeLayout> {
        self.input.lock().expect("input layout poisoned").clone()
    }

    pub fn output_layout(&self) -> Result<TreeLayout, FlattenError> {
        self.output
            .lock()
            .expect("output layout poisoned")
            .clone()
            .ok_or(FlattenError::NotPreprocessed {
                stage: "output_layout",
                missing: "output",
            })
    }

    pub fn flat_call<L>(&self, flat: Vec<L>) -> Result<Vec<L>>
    where
        L: Clone,
        F: Fn(CallArgs<L>) -> Result<Arg<L>>,
    {
        let input = self
            .input_layout()
            .ok_or(FlattenError::NotPreprocessed {
                stage: "flat_call",
                missing: "input",
            })?;
        let call = input.unflatten_call(flat)?;
        let result = (self.func)(call)?;
        let (outputs, layout) = flatten(&result);
        let mut recorded = self.output.lock().expect("output layout poisoned");
        match recorded.as_ref() {
            Some(expected) => expected.ensure_matches(&layout)?,
            None => *recorded = Some(layout),
        }
        Ok(outputs)
    }

    pub fn postprocess<T>(&self, flat: Vec<T>) -> Result<Arg<T>> {
        let output = self
            .output
            .lock()
            .expect("output layout poisoned")
            .clone()
            .ok_or(FlattenError::NotPreprocessed {
                stage: "postprocess",
                missing: "output",
            })?;
        Ok(output.unflatten(flat)?)
    }
}
