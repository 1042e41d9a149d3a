use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hashing::fnv1a_hash;
use super::spec::{Operation, Shape, ValueId};

/// Version tag written into every serialized computation module.
pub const MODULE_FORMAT_VERSION: u32 = 1;

/// One node of a frozen graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationData {
    pub name: String,
    pub parameters: Vec<Shape>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub root: ValueId,
    pub root_shape: Shape,
}

/// A frozen, named sub-graph with fixed parameter shapes and a single root.
///
/// Cloning is cheap; clones share the same instruction list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Computation {
    inner: Arc<ComputationData>,
}

#[derive(Debug, Error)]
pub enum ComputationSerdeError {
    #[error("failed to serialize computation to json: {0}")]
    JsonEncode(#[source] serde_json::Error),
    #[error("failed to parse computation json: {0}")]
    JsonDecode(#[source] serde_json::Error),
    #[error("failed to encode computation module: {0}")]
    BincodeEncode(#[source] bincode::Error),
    #[error("failed to decode computation module: {0}")]
    BincodeDecode(#[source] bincode::Error),
    #[error("unsupported computation module version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("malformed computation module: {0}")]
    Malformed(String),
}

#[derive(Serialize, Deserialize)]
struct ComputationProto {
    version: u32,
    computation: Computation,
}

impl Computation {
    pub(crate) fn from_data(data: ComputationData) -> Self {
        Computation {
            inner: Arc::new(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parameters(&self) -> &[Shape] {
        &self.inner.parameters
    }

    pub fn parameter_ids(&self) -> &[ValueId] {
        &self.inner.parameter_ids
    }

    pub fn num_parameters(&self) -> usize {
        self.inner.parameters.len()
    }

    pub fn body(&self) -> &[Instruction] {
        &self.inner.body
    }

    pub fn root(&self) -> ValueId {
        self.inner.root
    }

    pub fn root_shape(&self) -> &Shape {
        &self.inner.root_shape
    }

    /// Shapes of the flat results a backend returns for this computation.
    pub fn result_shapes(&self) -> Vec<Shape> {
        match &self.inner.root_shape {
            Shape::Tuple(elements) => elements.clone(),
            shape => vec![shape.clone()],
        }
    }

    pub fn ptr_eq(&self, other: &Computation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable structural fingerprint of the serialized module.
    pub fn fingerprint(&self) -> u64 {
        match bincode::serialize(self.inner.as_ref()) {
            Ok(bytes) => fnv1a_hash(&bytes),
            Err(_) => 0,
        }
    }

    /// Serializes the computation into the portable module format accepted by
    /// [`Computation::import_module_proto`].
    pub fn to_module_proto(&self) -> Result<Vec<u8>, ComputationSerdeError> {
        let proto = ComputationProto {
            version: MODULE_FORMAT_VERSION,
            computation: self.clone(),
        };
        bincode::serialize(&proto).map_err(ComputationSerdeError::BincodeEncode)
    }

    /// Re-imports a serialized module as a native computation named `name`.
    pub fn import_module_proto(name: &str, bytes: &[u8]) -> Result<Self, ComputationSerdeError> {
        let proto: ComputationProto =
            bincode::deserialize(bytes).map_err(ComputationSerdeError::BincodeDecode)?;
        if proto.version != MODULE_FORMAT_VERSION {
            return Err(ComputationSerdeError::Version {
                found: proto.version,
                expected: MODULE_FORMAT_VERSION,
            });
        }
        let mut data = Arc::unwrap_or_clone(proto.computation.inner);
        validate(&data).map_err(ComputationSerdeError::Malformed)?;
        data.name = name.to_string();
        Ok(Computation::from_data(data))
    }

    pub fn to_json_string(&self) -> Result<String, ComputationSerdeError> {
        serde_json::to_string_pretty(self).map_err(ComputationSerdeError::JsonEncode)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ComputationSerdeError> {
        let computation: Computation =
            serde_json::from_str(json).map_err(ComputationSerdeError::JsonDecode)?;
        validate(&computation.inner).map_err(ComputationSerdeError::Malformed)?;
        Ok(computation)
    }
}

/// Checks the structural invariants a freshly built computation satisfies.
fn validate(data: &ComputationData) -> Result<(), String> {
    if data.parameters.len() != data.parameter_ids.len() {
        return Err(format!(
            "{} parameter shapes but {} parameter ids",
            data.parameters.len(),
            data.parameter_ids.len()
        ));
    }
    let mut defined = std::collections::HashSet::new();
    for instruction in &data.body {
        for operand in &instruction.operands {
            if !defined.contains(operand) {
                return Err(format!(
                    "instruction {} uses {} before definition",
                    instruction.id, operand
                ));
            }
        }
        if !defined.insert(instruction.id) {
            return Err(format!("value {} defined twice", instruction.id));
        }
    }
    for id in &data.parameter_ids {
        if !defined.contains(id) {
            return Err(format!("parameter {id} has no defining instruction"));
        }
    }
    let root = data
        .body
        .iter()
        .find(|instruction| instruction.id == data.root)
        .ok_or_else(|| format!("root {} is not defined", data.root))?;
    if root.shape != data.root_shape {
        return Err(format!(
            "root shape {} does not match declared {}",
            root.shape, data.root_shape
        ));
    }
    Ok(())
}

impl fmt::Display for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_computation(self, 0, f)
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    f.write_str(line)?;
    f.write_str("\n")
}

fn fmt_computation(
    computation: &Computation,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let params = computation
        .parameter_ids()
        .iter()
        .zip(computation.parameters())
        .map(|(id, shape)| format!("{id}: {shape}"))
        .collect::<Vec<_>>()
        .join(", ");
    write_line(
        f,
        indent,
        &format!(
            "computation @{}({}) -> {} {{",
            computation.name(),
            params,
            computation.root_shape()
        ),
    )?;
    for instruction in computation.body() {
        if matches!(instruction.op, Operation::Parameter { .. }) {
            continue;
        }
        let operands = instruction
            .operands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write_line(
            f,
            indent + 1,
            &format!(
                "{}: {} = {}({})",
                instruction.id,
                instruction.shape,
                instruction.op.name(),
                operands
            ),
        )?;
        for nested in instruction.op.subcomputations() {
            fmt_computation(nested, indent + 2, f)?;
        }
    }
    write_line(f, indent + 1, &format!("return {}", computation.root()))?;
    write_line(f, indent, "}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::DType;

    fn sample() -> Computation {
        let shape = Shape::array(DType::F32, vec![2, 3]);
        Computation::trace("sample", &[shape.clone(), shape], |params| {
            params[0].add(&params[1])?.exp()
        })
        .expect("sample computation builds")
    }

    #[test]
    fn module_proto_round_trip_renames() {
        let computation = sample();
        let bytes = computation.to_module_proto().unwrap();
        let imported = Computation::import_module_proto("renamed", &bytes).unwrap();
        assert_eq!(imported.name(), "renamed");
        assert_eq!(imported.body(), computation.body());
        assert_eq!(imported.parameters(), computation.parameters());
    }

    #[test]
    fn module_proto_rejects_other_versions() {
        let proto = ComputationProto {
            version: MODULE_FORMAT_VERSION + 1,
            computation: sample(),
        };
        let bytes = bincode::serialize(&proto).unwrap();
        let err = Computation::import_module_proto("future", &bytes).unwrap_err();
        assert!(matches!(
            err,
            ComputationSerdeError::Version { found, expected }
                if found == MODULE_FORMAT_VERSION + 1 && expected == MODULE_FORMAT_VERSION
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = Computation::import_module_proto("garbage", &[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ComputationSerdeError::BincodeDecode(_)));
    }

    #[test]
    fn json_round_trip_keeps_structure() {
        let computation = sample();
        let json = computation.to_json_string().unwrap();
        let parsed = Computation::from_json_str(&json).unwrap();
        assert_eq!(parsed, computation);
        assert_eq!(parsed.fingerprint(), computation.fingerprint());
        assert!(computation.to_string().contains("computation @sample"));
    }

    #[test]
    fn json_with_dangling_root_is_malformed() {
        let mut data = ComputationData::clone(&sample().inner);
        data.root = ValueId(data.root.0 + 1000);
        let json = serde_json::to_string(&data).unwrap();
        let err = Computation::from_json_str(&json).unwrap_err();
        assert!(matches!(err, ComputationSerdeError::Malformed(_)));
    }
}
