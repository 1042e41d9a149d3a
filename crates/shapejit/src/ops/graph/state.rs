//! Internal bookkeeping shared by [`ComputationBuilder`](super::ComputationBuilder) handles.

use std::collections::BTreeMap;

use crate::backend::computation::Instruction;
use crate::backend::spec::{Shape, ValueId};

/// Mutable graph storage guarded by the builder mutex.
/// Records instructions in emission order and the parameter declared for each slot.
pub(super) struct BuilderState {
    pub(super) name: String,
    pub(super) next_value: u32,
    pub(super) instructions: Vec<Instruction>,
    pub(super) parameters: BTreeMap<usize, ParameterRecord>,
}

impl BuilderState {
    pub(super) fn new(name: String) -> Self {
        BuilderState {
            name,
            next_value: 0,
            instructions: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub(super) fn allocate_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }
}

pub(super) struct ParameterRecord {
    pub(super) value: ValueId,
    pub(super) shape: Shape,
}
