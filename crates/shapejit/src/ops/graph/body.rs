//! Bodies of higher-order operations: frozen computations or callables traced on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::Shape;

use super::builder::ComputationBuilder;
use super::op::Op;

/// What a traced callable returns: one node, or several nodes packed into a tuple.
pub enum BodyOutput {
    Node(Op),
    Nodes(Vec<Op>),
}

impl From<Op> for BodyOutput {
    fn from(op: Op) -> Self {
        BodyOutput::Node(op)
    }
}

impl From<Vec<Op>> for BodyOutput {
    fn from(ops: Vec<Op>) -> Self {
        BodyOutput::Nodes(ops)
    }
}

type BodyFn = dyn Fn(&[Op]) -> Result<BodyOutput> + Send + Sync;

/// Body argument of `reduce`, `while_loop`, `conditional`, `map`, `sort`, ...
///
/// A deferred body is traced into a [`Computation`] the first time it is resolved against a
/// given list of parameter shapes; later resolutions with the same shapes reuse that
/// computation. Clones share the memo.
#[derive(Clone)]
pub enum Body {
    Frozen(Computation),
    Deferred(DeferredBody),
}

#[derive(Clone)]
pub struct DeferredBody {
    name: Arc<str>,
    func: Arc<BodyFn>,
    memo: Arc<Mutex<HashMap<Vec<Shape>, Computation>>>,
    traces: Arc<AtomicUsize>,
}

impl Body {
    pub fn deferred<F, R>(name: &str, func: F) -> Self
    where
        F: Fn(&[Op]) -> Result<R> + Send + Sync + 'static,
        R: Into<BodyOutput>,
    {
        Body::Deferred(DeferredBody {
            name: Arc::from(name),
            func: Arc::new(move |params: &[Op]| -> Result<BodyOutput> {
                func(params).map(Into::into)
            }),
            memo: Arc::new(Mutex::new(HashMap::new())),
            traces: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Deferred body whose callable receives a single tuple parameter already unpacked.
    pub fn unpacked<F, R>(name: &str, func: F) -> Self
    where
        F: Fn(&[Op]) -> Result<R> + Send + Sync + 'static,
        R: Into<BodyOutput>,
    {
        Body::deferred(name, wrap_function(func))
    }

    /// Returns the computation for `params`, tracing a deferred body on first use.
    pub fn resolve(&self, params: &[Shape]) -> Result<Computation> {
        match self {
            Body::Frozen(computation) => Ok(computation.clone()),
            Body::Deferred(deferred) => deferred.resolve(params),
        }
    }

    /// Number of traces performed so far; always zero for frozen bodies.
    pub fn trace_count(&self) -> usize {
        match self {
            Body::Frozen(_) => 0,
            Body::Deferred(deferred) => deferred.traces.load(Ordering::SeqCst),
        }
    }
}

impl From<Computation> for Body {
    fn from(computation: Computation) -> Self {
        Body::Frozen(computation)
    }
}

impl DeferredBody {
    fn resolve(&self, params: &[Shape]) -> Result<Computation> {
        let key = params.to_vec();
        if let Some(found) = self
            .memo
            .lock()
            .expect("body memo poisoned")
            .get(&key)
            .cloned()
        {
            return Ok(found);
        }
        let computation = Computation::trace(&self.name, params, |args| (self.func)(args))
            .with_context(|| format!("failed to trace body '{}'", self.name))?;
        self.traces.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(body = %self.name, params = params.len(), "traced deferred body");
        self.memo
            .lock()
            .expect("body memo poisoned")
            .insert(key, computation.clone());
        Ok(computation)
    }
}

impl Computation {
    /// Traces `func` against fresh parameters of the given shapes and freezes the result.
    pub fn trace<F, R>(name: &str, params: &[Shape], func: F) -> Result<Computation>
    where
        F: FnOnce(&[Op]) -> Result<R>,
        R: Into<BodyOutput>,
    {
        let builder = ComputationBuilder::new(name);
        let args = params
            .iter()
            .enumerate()
            .map(|(index, shape)| builder.param(index, shape.clone()))
            .collect::<Result<Vec<_>>>()?;
        let output: BodyOutput = func(&args)?.into();
        let root = match output {
            BodyOutput::Node(op) => op,
            BodyOutput::Nodes(ops) => Op::tuple(&ops, Some(&builder))?,
        };
        builder.build(&root)
    }
}

/// Adapts a callable written against unpacked arguments.
///
/// A single tuple-shaped parameter is split into its elements before `func` runs; a
/// multi-value result is packed back into a tuple node.
pub fn wrap_function<F, R>(func: F) -> impl Fn(&[Op]) -> Result<BodyOutput> + Send + Sync + 'static
where
    F: Fn(&[Op]) -> Result<R> + Send + Sync + 'static,
    R: Into<BodyOutput>,
{
    move |params: &[Op]| {
        let output = match params {
            [single] if single.shape().is_tuple() => func(&single.tuple_elements()?)?,
            _ => func(params)?,
        };
        Ok(output.into())
    }
}

/// While loop over a list of state values carried as one tuple.
///
/// `condition` and `body` see the unpacked state; `body` returns the next state values.
/// The result is the final state tuple.
pub fn mkwhile<C, B>(initial: &[Op], condition: C, body: B) -> Result<Op>
where
    C: Fn(&[Op]) -> Result<Op> + Send + Sync + 'static,
    B: Fn(&[Op]) -> Result<Vec<Op>> + Send + Sync + 'static,
{
    let state = Op::tuple(initial, None)?;
    let condition = Body::unpacked("mkwhile_condition", condition);
    let body = Body::unpacked("mkwhile_body", body);
    state.while_loop(&condition, &body)
}

/// Conditional over `operands` shared by both branches as one tuple.
pub fn mkconditional<T, F, R>(
    operands: &[Op],
    predicate: &Op,
    on_true: T,
    on_false: F,
) -> Result<Op>
where
    T: Fn(&[Op]) -> Result<R> + Send + Sync + 'static,
    F: Fn(&[Op]) -> Result<R> + Send + Sync + 'static,
    R: Into<BodyOutput>,
{
    let inputs = Op::tuple(operands, Some(predicate.builder()))?;
    let on_true = Body::unpacked("mkconditional_true", on_true);
    let on_false = Body::unpacked("mkconditional_false", on_false);
    predicate.conditional(&inputs, &on_true, &inputs, &on_false)
}
