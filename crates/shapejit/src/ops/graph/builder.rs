//! Scoped graph-construction context that owns every node created through it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context, Result};

use crate::backend::computation::{Computation, ComputationData, Instruction};
use crate::backend::spec::{Operation, Shape, ValueId};

use super::infer::infer_shape;
use super::op::Op;
use super::state::{BuilderState, ParameterRecord};

/// Handle to a mutable graph. Clones refer to the same graph.
///
/// Nodes are appended through [`ComputationBuilder::emit`] (or the [`Op`] methods built on
/// top of it) and frozen into a [`Computation`] by [`ComputationBuilder::build`]. Building
/// does not consume the builder, so one graph may be frozen at several roots.
#[derive(Clone)]
pub struct ComputationBuilder {
    inner: Arc<Mutex<BuilderState>>,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ComputationBuilder {
            inner: Arc::new(Mutex::new(BuilderState::new(name.into()))),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().expect("computation builder poisoned").name.clone()
    }

    pub fn same_builder(&self, other: &ComputationBuilder) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of recorded instructions, parameters included.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("computation builder poisoned")
            .instructions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declares parameter slot `index` with the given shape.
    pub fn param(&self, index: usize, shape: Shape) -> Result<Op> {
        let mut state = self.inner.lock().expect("computation builder poisoned");
        ensure!(
            !state.parameters.contains_key(&index),
            "parameter {index} already declared in builder '{}'",
            state.name
        );
        let id = state.allocate_value();
        state.instructions.push(Instruction {
            id,
            op: Operation::Parameter { index },
            operands: Vec::new(),
            shape: shape.clone(),
        });
        state.parameters.insert(
            index,
            ParameterRecord {
                value: id,
                shape: shape.clone(),
            },
        );
        Ok(Op::new(self.clone(), id, shape))
    }

    /// Records `op` over `operands`, inferring the result shape.
    pub fn emit(&self, op: Operation, operands: &[&Op]) -> Result<Op> {
        for operand in operands {
            ensure!(
                operand.builder().same_builder(self),
                "operand {} of {} belongs to builder '{}', not '{}'",
                operand.id(),
                op.name(),
                operand.builder().name(),
                self.name()
            );
        }
        let shapes: Vec<&Shape> = operands.iter().map(|operand| operand.shape()).collect();
        let shape = infer_shape(&op, &shapes).with_context(|| {
            let rendered = shapes
                .iter()
                .map(|shape| shape.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("failed to build {} over ({rendered})", op.name())
        })?;

        let mut state = self.inner.lock().expect("computation builder poisoned");
        let id = state.allocate_value();
        state.instructions.push(Instruction {
            id,
            op,
            operands: operands.iter().map(|operand| operand.id()).collect(),
            shape: shape.clone(),
        });
        drop(state);
        Ok(Op::new(self.clone(), id, shape))
    }

    /// Freezes the sub-graph reachable from `root` under the builder's name.
    pub fn build(&self, root: &Op) -> Result<Computation> {
        let name = self.name();
        self.build_named(root, &name)
    }

    pub fn build_named(&self, root: &Op, name: &str) -> Result<Computation> {
        ensure!(
            root.builder().same_builder(self),
            "root {} does not belong to builder '{}'",
            root.id(),
            self.name()
        );
        let state = self.inner.lock().expect("computation builder poisoned");

        let mut parameters = Vec::with_capacity(state.parameters.len());
        let mut parameter_ids = Vec::with_capacity(state.parameters.len());
        for (expected, (index, record)) in state.parameters.iter().enumerate() {
            ensure!(
                *index == expected,
                "builder '{}' declares parameter {index} but parameter {expected} is missing",
                state.name
            );
            parameters.push(record.shape.clone());
            parameter_ids.push(record.value);
        }

        let live = live_values(&state.instructions, root.id());
        let body: Vec<Instruction> = state
            .instructions
            .iter()
            .filter(|instruction| {
                live.contains(&instruction.id)
                    || matches!(instruction.op, Operation::Parameter { .. })
            })
            .cloned()
            .collect();

        Ok(Computation::from_data(ComputationData {
            name: name.to_string(),
            parameters,
            parameter_ids,
            body,
            root: root.id(),
            root_shape: root.shape().clone(),
        }))
    }
}

/// Values the root transitively depends on.
fn live_values(instructions: &[Instruction], root: ValueId) -> HashSet<ValueId> {
    let mut live = HashSet::new();
    live.insert(root);
    for instruction in instructions.iter().rev() {
        if live.contains(&instruction.id) {
            live.extend(instruction.operands.iter().copied());
        }
    }
    live
}

impl std::fmt::Debug for ComputationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationBuilder")
            .field("name", &self.name())
            .field("instructions", &self.len())
            .finish()
    }
}
