use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::computation::Computation;

/// Enumerates scalar element types understood by the graph builder and every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Pred,
    S8,
    S16,
    S32,
    S64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    C64,
    C128,
}

impl DType {
    /// Returns `true` when the dtype is any signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DType::S8 | DType::S16 | DType::S32 | DType::S64)
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, DType::U8 | DType::U16 | DType::U32 | DType::U64)
    }

    /// Returns `true` when the dtype is a real floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::C64 | DType::C128)
    }

    /// Storage size of one element in bytes. Predicates occupy a full byte.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Pred | DType::S8 | DType::U8 => 1,
            DType::S16 | DType::U16 | DType::F16 | DType::Bf16 => 2,
            DType::S32 | DType::U32 | DType::F32 => 4,
            DType::S64 | DType::U64 | DType::F64 | DType::C64 => 8,
            DType::C128 => 16,
        }
    }

    /// Element type of the real and imaginary parts of a complex dtype.
    pub fn complex_component(self) -> Option<DType> {
        match self {
            DType::C64 => Some(DType::F32),
            DType::C128 => Some(DType::F64),
            _ => None,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            DType::Pred => "pred",
            DType::S8 => "s8",
            DType::S16 => "s16",
            DType::S32 => "s32",
            DType::S64 => "s64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::C64 => "c64",
            DType::C128 => "c128",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Dense array layout: element type, extents and optional runtime-size markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayShape {
    dtype: DType,
    dims: Vec<usize>,
    dynamic_dims: Option<Vec<bool>>,
}

/// Shape of a graph value: a dense array or an ordered tuple of child shapes.
///
/// Accessors that only make sense for one variant (`rank`, `sizes`, `tuple_size`, ...) panic
/// when called on the other one. Callers that cannot rule out a tuple should check
/// [`Shape::is_tuple`] first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    Array(ArrayShape),
    Tuple(Vec<Shape>),
}

impl Shape {
    /// Creates an array shape. `dynamic_dims`, when given, must have one entry per dimension.
    pub fn create(
        dtype: DType,
        sizes: impl Into<Vec<usize>>,
        dynamic_dims: Option<Vec<bool>>,
    ) -> Shape {
        let dims = sizes.into();
        if let Some(dynamic) = &dynamic_dims {
            assert_eq!(
                dynamic.len(),
                dims.len(),
                "dynamic_dims length {} does not match rank {}",
                dynamic.len(),
                dims.len()
            );
        }
        let dynamic_dims = dynamic_dims.filter(|dynamic| dynamic.iter().any(|d| *d));
        Shape::Array(ArrayShape {
            dtype,
            dims,
            dynamic_dims,
        })
    }

    pub fn array(dtype: DType, sizes: impl Into<Vec<usize>>) -> Shape {
        Shape::create(dtype, sizes, None)
    }

    pub fn scalar(dtype: DType) -> Shape {
        Shape::create(dtype, Vec::new(), None)
    }

    pub fn tuple(elements: impl Into<Vec<Shape>>) -> Shape {
        Shape::Tuple(elements.into())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_elements().len()
    }

    pub fn tuple_element(&self, index: usize) -> &Shape {
        let elements = self.tuple_elements();
        assert!(
            index < elements.len(),
            "tuple element {index} out of range for {self}"
        );
        &elements[index]
    }

    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array(_) => panic!("tuple accessor called on array shape {self}"),
        }
    }

    pub fn rank(&self) -> usize {
        self.array_shape().dims.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.array_shape().dims
    }

    pub fn dynamic_dims(&self) -> Option<&[bool]> {
        self.array_shape().dynamic_dims.as_deref()
    }

    pub fn is_dynamic_dim(&self, dim: usize) -> bool {
        self.dynamic_dims()
            .map(|dynamic| dynamic[dim])
            .unwrap_or(false)
    }

    pub fn dtype(&self) -> DType {
        self.array_shape().dtype
    }

    /// Same element type, rank zero.
    pub fn as_scalar(&self) -> Shape {
        Shape::scalar(self.dtype())
    }

    pub fn is_scalar(&self) -> bool {
        !self.is_tuple() && self.rank() == 0
    }

    pub fn element_count(&self) -> usize {
        self.sizes().iter().product()
    }

    /// Byte length of a dense row-major buffer holding this array.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype().size_in_bytes()
    }

    pub fn with_dtype(&self, dtype: DType) -> Shape {
        let array = self.array_shape();
        Shape::Array(ArrayShape {
            dtype,
            dims: array.dims.clone(),
            dynamic_dims: array.dynamic_dims.clone(),
        })
    }

    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Shape::Array(array) => Some(array),
            Shape::Tuple(_) => None,
        }
    }

    fn array_shape(&self) -> &ArrayShape {
        match self {
            Shape::Array(array) => array,
            Shape::Tuple(_) => panic!("array accessor called on tuple shape {self}"),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array(array) => {
                write!(f, "{}[", array.dtype)?;
                for (index, dim) in array.dims.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    let dynamic = array
                        .dynamic_dims
                        .as_ref()
                        .map(|dynamic| dynamic[index])
                        .unwrap_or(false);
                    if dynamic {
                        write!(f, "<={dim}")?;
                    } else {
                        write!(f, "{dim}")?;
                    }
                }
                f.write_str("]")
            }
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (index, element) in elements.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Host-resident literal tensor data in row-major little-endian layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLiteral {
    pub shape: Shape,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(shape: Shape, bytes: Arc<[u8]>) -> BackendResult<Self> {
        if shape.is_tuple() {
            return Err(BackendError::execution("literals must have array shapes"));
        }
        if bytes.len() != shape.byte_len() {
            return Err(BackendError::execution(format!(
                "literal for {shape} expects {} bytes, got {}",
                shape.byte_len(),
                bytes.len()
            )));
        }
        Ok(TensorLiteral { shape, bytes })
    }
}

/// Graph-local identifier of one instruction result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Sign,
    Exp,
    Expm1,
    Log,
    Log1p,
    Sqrt,
    Rsqrt,
    Cbrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Erf,
    Erfc,
    ErfInv,
    Floor,
    Ceil,
    Round,
    IsFinite,
    Logistic,
    Clz,
    Real,
    Imag,
    Conj,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
            UnaryOp::Abs => "abs",
            UnaryOp::Sign => "sign",
            UnaryOp::Exp => "exp",
            UnaryOp::Expm1 => "expm1",
            UnaryOp::Log => "log",
            UnaryOp::Log1p => "log1p",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Cbrt => "cbrt",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Asin => "asin",
            UnaryOp::Acos => "acos",
            UnaryOp::Atan => "atan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Erf => "erf",
            UnaryOp::Erfc => "erfc",
            UnaryOp::ErfInv => "erf_inv",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Round => "round",
            UnaryOp::IsFinite => "is_finite",
            UnaryOp::Logistic => "logistic",
            UnaryOp::Clz => "clz",
            UnaryOp::Real => "real",
            UnaryOp::Imag => "imag",
            UnaryOp::Conj => "conj",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Max,
    Min,
    Atan2,
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRightLogical,
    ShiftRightArithmetic,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::Pow => "pow",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::ShiftLeft => "shift_left",
            BinaryOp::ShiftRightLogical => "shift_right_logical",
            BinaryOp::ShiftRightArithmetic => "shift_right_arithmetic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    pub fn name(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "eq",
            ComparisonOp::Ne => "ne",
            ComparisonOp::Lt => "lt",
            ComparisonOp::Le => "le",
            ComparisonOp::Gt => "gt",
            ComparisonOp::Ge => "ge",
        }
    }
}

/// Reshape attributes. `dimensions` permutes the operand before the row-major reshape and
/// `inferred_dimension` marks the output dimension whose size is only known at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub sizes: Vec<usize>,
    pub dimensions: Option<Vec<usize>>,
    pub inferred_dimension: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceSpec {
    pub start: Vec<usize>,
    pub limit: Vec<usize>,
    pub strides: Vec<usize>,
}

/// Padding of one dimension: edge padding may be negative, interior padding may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadDim {
    pub low: i64,
    pub high: i64,
    pub interior: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatherSpec {
    pub offset_dims: Vec<usize>,
    pub collapsed_slice_dims: Vec<usize>,
    pub start_index_map: Vec<usize>,
    pub index_vector_dim: usize,
    pub slice_sizes: Vec<usize>,
    pub indices_are_sorted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScatterSpec {
    pub update_window_dims: Vec<usize>,
    pub inserted_window_dims: Vec<usize>,
    pub scatter_dims_to_operand_dims: Vec<usize>,
    pub index_vector_dim: usize,
    pub indices_are_sorted: bool,
    pub unique_indices: bool,
}

/// Logical roles of input, kernel and output dimensions in a convolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDimensionNumbers {
    pub input_batch_dimension: usize,
    pub input_feature_dimension: usize,
    pub input_spatial_dimensions: Vec<usize>,
    pub kernel_output_feature_dimension: usize,
    pub kernel_input_feature_dimension: usize,
    pub kernel_spatial_dimensions: Vec<usize>,
    pub output_batch_dimension: usize,
    pub output_feature_dimension: usize,
    pub output_spatial_dimensions: Vec<usize>,
}

impl ConvDimensionNumbers {
    /// `NCHW` input, `OIHW` kernel and `NCHW` output for `spatial_rank` spatial dimensions.
    pub fn channels_first(spatial_rank: usize) -> Self {
        let spatial: Vec<usize> = (2..2 + spatial_rank).collect();
        ConvDimensionNumbers {
            input_batch_dimension: 0,
            input_feature_dimension: 1,
            input_spatial_dimensions: spatial.clone(),
            kernel_output_feature_dimension: 0,
            kernel_input_feature_dimension: 1,
            kernel_spatial_dimensions: spatial.clone(),
            output_batch_dimension: 0,
            output_feature_dimension: 1,
            output_spatial_dimensions: spatial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvSpec {
    pub window_strides: Vec<usize>,
    pub padding: Vec<(i64, i64)>,
    pub lhs_dilation: Vec<usize>,
    pub rhs_dilation: Vec<usize>,
    pub dimension_numbers: ConvDimensionNumbers,
    pub feature_group_count: usize,
    pub batch_group_count: usize,
}

/// Sliding-window geometry shared by reduce-window, select-and-scatter and pooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpec {
    pub dimensions: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding: Vec<(i64, i64)>,
}

/// Positions of the batch, feature and spatial dimensions of a pooled tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFormat {
    pub batch_dimension: usize,
    pub feature_dimension: usize,
    pub spatial_dimensions: Vec<usize>,
}

impl DataFormat {
    pub fn nchw(spatial_rank: usize) -> Self {
        DataFormat {
            batch_dimension: 0,
            feature_dimension: 1,
            spatial_dimensions: (2..2 + spatial_rank).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransposeKind {
    NoTranspose,
    Transpose,
    Adjoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriangularSolveSpec {
    pub left_side: bool,
    pub lower: bool,
    pub unit_diagonal: bool,
    pub transpose_a: TransposeKind,
}

/// Operation vocabulary of the graph IR. Higher-order variants embed their frozen bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Parameter { index: usize },
    Constant(TensorLiteral),
    Iota { shape: Shape, dimension: usize },
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(ComparisonOp),
    Select,
    Clamp,
    Convert { dtype: DType },
    BitcastConvert { dtype: DType },
    Reshape(ReshapeSpec),
    DynamicReshape { sizes: Vec<usize>, dynamic: Vec<bool> },
    Broadcast { sizes: Vec<usize> },
    BroadcastInDim { sizes: Vec<usize>, dimensions: Vec<usize> },
    Transpose { permutation: Vec<usize> },
    Rev { dimensions: Vec<usize> },
    Slice(SliceSpec),
    DynamicSlice { sizes: Vec<usize> },
    DynamicUpdateSlice,
    Pad { config: Vec<PadDim> },
    ConcatInDim { dimension: usize },
    Dot,
    Gather(GatherSpec),
    Scatter { spec: ScatterSpec, body: Computation },
    Convolution(ConvSpec),
    Reduce { dimensions: Vec<usize>, body: Computation },
    ReduceWindow { window: WindowSpec, body: Computation },
    SelectAndScatter {
        window: WindowSpec,
        select: Computation,
        scatter: Computation,
    },
    MaxPool { window: WindowSpec, format: DataFormat },
    TriangularSolve(TriangularSolveSpec),
    Tuple,
    GetTupleElement { index: usize },
    Call { computation: Computation },
    Conditional {
        true_branch: Computation,
        false_branch: Computation,
    },
    While {
        condition: Computation,
        body: Computation,
    },
    Map { dimensions: Vec<usize>, body: Computation },
    Sort {
        dimension: usize,
        is_stable: bool,
        comparator: Computation,
    },
    GetDimensionSize { dimension: usize },
    SetDimensionSize { dimension: usize },
    RngUniform { shape: Shape, stream: u64 },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Parameter { .. } => "parameter",
            Operation::Constant(_) => "constant",
            Operation::Iota { .. } => "iota",
            Operation::Unary(op) => op.name(),
            Operation::Binary(op) => op.name(),
            Operation::Compare(op) => op.name(),
            Operation::Select => "select",
            Operation::Clamp => "clamp",
            Operation::Convert { .. } => "convert",
            Operation::BitcastConvert { .. } => "bitcast_convert",
            Operation::Reshape(_) => "reshape",
            Operation::DynamicReshape { .. } => "dynamic_reshape",
            Operation::Broadcast { .. } => "broadcast",
            Operation::BroadcastInDim { .. } => "broadcast_in_dim",
            Operation::Transpose { .. } => "transpose",
            Operation::Rev { .. } => "rev",
            Operation::Slice(_) => "slice",
            Operation::DynamicSlice { .. } => "dynamic_slice",
            Operation::DynamicUpdateSlice => "dynamic_update_slice",
            Operation::Pad { .. } => "pad",
            Operation::ConcatInDim { .. } => "concatenate",
            Operation::Dot => "dot",
            Operation::Gather(_) => "gather",
            Operation::Scatter { .. } => "scatter",
            Operation::Convolution(_) => "convolution",
            Operation::Reduce { .. } => "reduce",
            Operation::ReduceWindow { .. } => "reduce_window",
            Operation::SelectAndScatter { .. } => "select_and_scatter",
            Operation::MaxPool { .. } => "max_pool",
            Operation::TriangularSolve(_) => "triangular_solve",
            Operation::Tuple => "tuple",
            Operation::GetTupleElement { .. } => "get_tuple_element",
            Operation::Call { .. } => "call",
            Operation::Conditional { .. } => "conditional",
            Operation::While { .. } => "while",
            Operation::Map { .. } => "map",
            Operation::Sort { .. } => "sort",
            Operation::GetDimensionSize { .. } => "get_dimension_size",
            Operation::SetDimensionSize { .. } => "set_dimension_size",
            Operation::RngUniform { .. } => "rng_uniform",
        }
    }

    /// Nested computations referenced by this operation, in declaration order.
    pub fn subcomputations(&self) -> Vec<&Computation> {
        match self {
            Operation::Scatter { body, .. }
            | Operation::Reduce { body, .. }
            | Operation::ReduceWindow { body, .. }
            | Operation::Map { body, .. } => vec![body],
            Operation::SelectAndScatter {
                select, scatter, ..
            } => vec![select, scatter],
            Operation::Call { computation } => vec![computation],
            Operation::Conditional {
                true_branch,
                false_branch,
            } => vec![true_branch, false_branch],
            Operation::While { condition, body } => vec![condition, body],
            Operation::Sort { comparator, .. } => vec![comparator],
            _ => Vec::new(),
        }
    }
}

/// Errors surfaced by backends while materializing or executing computations.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Executor boundary: owns device buffers and runs frozen computations.
///
/// Graph construction happens entirely on the host side of this trait; a backend only ever
/// sees finished [`Computation`]s. `invoke` receives one handle per computation parameter and
/// returns one handle per element of a tuple-shaped root (or a single handle otherwise).
pub trait PortableBackend: Send + Sync + 'static {
    type TensorHandle: Clone + Send + Sync + 'static;

    fn backend_name(&self) -> &str;

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle>;

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    fn invoke(
        &self,
        name: &str,
        computation: &Computation,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
