//! Graph nodes and the construction vocabulary exposed on them.
//!
//! Every method records one operation into the builder that owns `self` and returns the new
//! node; inputs are never modified. Shape errors surface as `Err` from the method that
//! introduced them. Higher-order operations take a [`Body`], which is either a frozen
//! [`Computation`] or a callable traced on demand.

use anyhow::{ensure, Result};

use crate::backend::computation::Computation;
use crate::backend::spec::{
    BinaryOp, ComparisonOp, ConvDimensionNumbers, ConvSpec, DType, DataFormat, GatherSpec,
    Operation, PadDim, ReshapeSpec, ScatterSpec, Shape, SliceSpec, TensorLiteral,
    TriangularSolveSpec, UnaryOp, ValueId, WindowSpec,
};

use super::body::Body;
use super::builder::ComputationBuilder;

/// Handle to one node of a [`ComputationBuilder`] graph.
#[derive(Clone)]
pub struct Op {
    builder: ComputationBuilder,
    id: ValueId,
    shape: Shape,
}

/// Edge padding policy for windowed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Padding {
    /// No padding; windows that do not fit are dropped.
    Valid,
    /// Pads so that `output = ceil(input / stride)`, splitting odd amounts towards the high edge.
    Same,
    Explicit(Vec<(i64, i64)>),
}

impl Padding {
    /// Resolves the policy into explicit `(low, high)` pairs for the given geometry.
    pub fn resolve(
        &self,
        sizes: &[usize],
        window: &[usize],
        strides: &[usize],
    ) -> Result<Vec<(i64, i64)>> {
        ensure!(
            sizes.len() == window.len() && sizes.len() == strides.len(),
            "padding geometry mismatch: {} sizes, {} window dims, {} strides",
            sizes.len(),
            window.len(),
            strides.len()
        );
        match self {
            Padding::Valid => Ok(vec![(0, 0); sizes.len()]),
            Padding::Same => sizes
                .iter()
                .zip(window)
                .zip(strides)
                .map(|((size, window), stride)| {
                    ensure!(*stride > 0, "window stride must be positive");
                    let output = size.div_ceil(*stride);
                    let needed = (output.saturating_sub(1) * stride + window) as i64 - *size as i64;
                    let total = needed.max(0);
                    Ok((total / 2, total - total / 2))
                })
                .collect(),
            Padding::Explicit(pairs) => {
                ensure!(
                    pairs.len() == sizes.len(),
                    "explicit padding has {} pairs for {} dimensions",
                    pairs.len(),
                    sizes.len()
                );
                Ok(pairs.clone())
            }
        }
    }
}

macro_rules! unary_ops {
    ($($(#[$meta:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self) -> Result<Op> {
                self.emit(Operation::Unary(UnaryOp::$op), &[])
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(&self, other: &Op) -> Result<Op> {
                self.emit(Operation::Binary(BinaryOp::$op), &[other])
            }
        )*
    };
}

macro_rules! comparison_ops {
    ($($name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $name(&self, other: &Op) -> Result<Op> {
                self.emit(Operation::Compare(ComparisonOp::$op), &[other])
            }
        )*
    };
}

impl Op {
    pub(crate) fn new(builder: ComputationBuilder, id: ValueId, shape: Shape) -> Self {
        Op { builder, id, shape }
    }

    pub fn builder(&self) -> &ComputationBuilder {
        &self.builder
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn sizes(&self) -> &[usize] {
        self.shape.sizes()
    }

    fn emit(&self, op: Operation, others: &[&Op]) -> Result<Op> {
        let mut operands = Vec::with_capacity(others.len() + 1);
        operands.push(self);
        operands.extend_from_slice(others);
        self.builder.emit(op, &operands)
    }

    binary_ops!(
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        rem => Rem,
        pow => Pow,
        max => Max,
        min => Min,
        atan2 => Atan2,
        and => And,
        or => Or,
        xor => Xor,
        shift_left => ShiftLeft,
        shift_right_logical => ShiftRightLogical,
        shift_right_arithmetic => ShiftRightArithmetic,
    );

    comparison_ops!(
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
    );

    unary_ops!(
        neg => Neg,
        /// Logical not for predicates, bitwise not for integers.
        not => Not,
        abs => Abs,
        sign => Sign,
        exp => Exp,
        expm1 => Expm1,
        log => Log,
        log1p => Log1p,
        sqrt => Sqrt,
        rsqrt => Rsqrt,
        cbrt => Cbrt,
        sin => Sin,
        cos => Cos,
        tan => Tan,
        asin => Asin,
        acos => Acos,
        atan => Atan,
        sinh => Sinh,
        cosh => Cosh,
        tanh => Tanh,
        erf => Erf,
        erfc => Erfc,
        erf_inv => ErfInv,
        floor => Floor,
        ceil => Ceil,
        round => Round,
        is_finite => IsFinite,
        logistic => Logistic,
        clz => Clz,
        real => Real,
        imag => Imag,
        conj => Conj,
    );

    /// Vector/matrix product over rank-1 and rank-2 operands.
    pub fn dot(&self, other: &Op) -> Result<Op> {
        self.emit(Operation::Dot, &[other])
    }

    pub fn reshape(&self, sizes: &[usize]) -> Result<Op> {
        self.reshape_with(sizes, None, None)
    }

    /// Reshape after permuting by `dimensions`, optionally marking one output dimension as
    /// runtime-sized.
    pub fn reshape_with(
        &self,
        sizes: &[usize],
        dimensions: Option<&[usize]>,
        inferred_dimension: Option<usize>,
    ) -> Result<Op> {
        self.emit(
            Operation::Reshape(ReshapeSpec {
                sizes: sizes.to_vec(),
                dimensions: dimensions.map(<[usize]>::to_vec),
                inferred_dimension,
            }),
            &[],
        )
    }

    /// Reshape whose output extents are bounded by `sizes` and supplied at runtime by
    /// `dim_sizes` (one integer scalar per output dimension).
    pub fn dynamic_reshape(
        &self,
        dim_sizes: &[Op],
        sizes: &[usize],
        dynamic: &[bool],
    ) -> Result<Op> {
        let operands: Vec<&Op> = dim_sizes.iter().collect();
        self.emit(
            Operation::DynamicReshape {
                sizes: sizes.to_vec(),
                dynamic: dynamic.to_vec(),
            },
            &operands,
        )
    }

    /// Prepends `sizes` as new leading dimensions.
    pub fn broadcast(&self, sizes: &[usize]) -> Result<Op> {
        self.emit(
            Operation::Broadcast {
                sizes: sizes.to_vec(),
            },
            &[],
        )
    }

    pub fn broadcast_in_dim(&self, sizes: &[usize], dimensions: &[usize]) -> Result<Op> {
        self.emit(
            Operation::BroadcastInDim {
                sizes: sizes.to_vec(),
                dimensions: dimensions.to_vec(),
            },
            &[],
        )
    }

    pub fn transpose(&self, permutation: &[usize]) -> Result<Op> {
        self.emit(
            Operation::Transpose {
                permutation: permutation.to_vec(),
            },
            &[],
        )
    }

    pub fn rev(&self, dimensions: &[usize]) -> Result<Op> {
        self.emit(
            Operation::Rev {
                dimensions: dimensions.to_vec(),
            },
            &[],
        )
    }

    pub fn slice(&self, start: &[usize], limit: &[usize], strides: Option<&[usize]>) -> Result<Op> {
        let strides = strides
            .map(<[usize]>::to_vec)
            .unwrap_or_else(|| vec![1; start.len()]);
        self.emit(
            Operation::Slice(SliceSpec {
                start: start.to_vec(),
                limit: limit.to_vec(),
                strides,
            }),
            &[],
        )
    }

    /// Slices a single dimension, keeping every other dimension whole.
    pub fn slice_in_dim(
        &self,
        start: usize,
        limit: usize,
        stride: usize,
        dimension: usize,
    ) -> Result<Op> {
        ensure!(
            dimension < self.rank(),
            "slice_in_dim dimension {dimension} out of range for {}",
            self.shape
        );
        let mut starts = vec![0; self.rank()];
        let mut limits = self.sizes().to_vec();
        let mut strides = vec![1; self.rank()];
        starts[dimension] = start;
        limits[dimension] = limit;
        strides[dimension] = stride;
        self.slice(&starts, &limits, Some(&strides))
    }

    pub fn dynamic_slice(&self, start_indices: &[Op], sizes: &[usize]) -> Result<Op> {
        let operands: Vec<&Op> = start_indices.iter().collect();
        self.emit(
            Operation::DynamicSlice {
                sizes: sizes.to_vec(),
            },
            &operands,
        )
    }

    pub fn dynamic_update_slice(&self, update: &Op, start_indices: &[Op]) -> Result<Op> {
        let mut operands: Vec<&Op> = vec![update];
        operands.extend(start_indices.iter());
        self.emit(Operation::DynamicUpdateSlice, &operands)
    }

    pub fn pad(&self, padding_value: &Op, config: &[PadDim]) -> Result<Op> {
        self.emit(
            Operation::Pad {
                config: config.to_vec(),
            },
            &[padding_value],
        )
    }

    pub fn gather(&self, indices: &Op, spec: GatherSpec) -> Result<Op> {
        self.emit(Operation::Gather(spec), &[indices])
    }

    /// Combines `updates` into `self` at `indices` using the scalar reduction `body`.
    pub fn scatter(
        &self,
        indices: &Op,
        updates: &Op,
        body: &Body,
        spec: ScatterSpec,
    ) -> Result<Op> {
        let scalar = self.shape.as_scalar();
        let body = body.resolve(&[scalar.clone(), scalar])?;
        self.emit(Operation::Scatter { spec, body }, &[indices, updates])
    }

    /// Channels-first convolution with a padding policy and unit dilation.
    pub fn conv(
        &self,
        kernel: &Op,
        window_strides: &[usize],
        padding: &Padding,
        feature_group_count: usize,
        batch_group_count: usize,
    ) -> Result<Op> {
        let numbers = ConvDimensionNumbers::channels_first(window_strides.len());
        self.conv_with_general_dimensions(
            kernel,
            window_strides,
            padding,
            numbers,
            feature_group_count,
            batch_group_count,
        )
    }

    /// Channels-first convolution with explicit padding and dilation.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_with_general_padding(
        &self,
        kernel: &Op,
        window_strides: &[usize],
        padding: &[(i64, i64)],
        lhs_dilation: &[usize],
        rhs_dilation: &[usize],
        feature_group_count: usize,
        batch_group_count: usize,
    ) -> Result<Op> {
        self.conv_general(
            kernel,
            window_strides,
            padding,
            lhs_dilation,
            rhs_dilation,
            ConvDimensionNumbers::channels_first(window_strides.len()),
            feature_group_count,
            batch_group_count,
        )
    }

    /// Convolution with arbitrary dimension numbers and a padding policy.
    pub fn conv_with_general_dimensions(
        &self,
        kernel: &Op,
        window_strides: &[usize],
        padding: &Padding,
        dimension_numbers: ConvDimensionNumbers,
        feature_group_count: usize,
        batch_group_count: usize,
    ) -> Result<Op> {
        ensure!(
            !self.shape.is_tuple() && !kernel.shape.is_tuple(),
            "convolution operands must be arrays"
        );
        let spatial: Vec<usize> = dimension_numbers
            .input_spatial_dimensions
            .iter()
            .map(|axis| self.sizes().get(*axis).copied().unwrap_or(0))
            .collect();
        let window: Vec<usize> = dimension_numbers
            .kernel_spatial_dimensions
            .iter()
            .map(|axis| kernel.sizes().get(*axis).copied().unwrap_or(0))
            .collect();
        let padding = padding.resolve(&spatial, &window, window_strides)?;
        let ones = vec![1; window_strides.len()];
        self.conv_general(
            kernel,
            window_strides,
            &padding,
            &ones,
            &ones,
            dimension_numbers,
            feature_group_count,
            batch_group_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv_general(
        &self,
        kernel: &Op,
        window_strides: &[usize],
        padding: &[(i64, i64)],
        lhs_dilation: &[usize],
        rhs_dilation: &[usize],
        dimension_numbers: ConvDimensionNumbers,
        feature_group_count: usize,
        batch_group_count: usize,
    ) -> Result<Op> {
        self.conv_general_dilated(
            kernel,
            ConvSpec {
                window_strides: window_strides.to_vec(),
                padding: padding.to_vec(),
                lhs_dilation: lhs_dilation.to_vec(),
                rhs_dilation: rhs_dilation.to_vec(),
                dimension_numbers,
                feature_group_count,
                batch_group_count,
            },
        )
    }

    /// Fully general convolution; every other convolution method lowers to this one.
    pub fn conv_general_dilated(&self, kernel: &Op, spec: ConvSpec) -> Result<Op> {
        self.emit(Operation::Convolution(spec), &[kernel])
    }

    /// Reduces `dimensions` with the scalar reduction `body`, starting from `init`.
    pub fn reduce(&self, init: &Op, body: &Body, dimensions: &[usize]) -> Result<Op> {
        let scalar = self.shape.as_scalar();
        let body = body.resolve(&[scalar.clone(), scalar])?;
        self.emit(
            Operation::Reduce {
                dimensions: dimensions.to_vec(),
                body,
            },
            &[init],
        )
    }

    pub fn reduce_all(&self, init: &Op, body: &Body) -> Result<Op> {
        let dimensions: Vec<usize> = (0..self.rank()).collect();
        self.reduce(init, body, &dimensions)
    }

    pub fn reduce_window(
        &self,
        init: &Op,
        body: &Body,
        window_dimensions: &[usize],
        window_strides: &[usize],
        padding: &Padding,
    ) -> Result<Op> {
        let window = self.window(window_dimensions, window_strides, padding)?;
        let scalar = self.shape.as_scalar();
        let body = body.resolve(&[scalar.clone(), scalar])?;
        self.emit(Operation::ReduceWindow { window, body }, &[init])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select_and_scatter(
        &self,
        source: &Op,
        init: &Op,
        select: &Body,
        scatter: &Body,
        window_dimensions: &[usize],
        window_strides: &[usize],
        padding: &Padding,
    ) -> Result<Op> {
        let window = self.window(window_dimensions, window_strides, padding)?;
        self.select_and_scatter_window(source, init, select, scatter, window)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select_and_scatter_with_general_padding(
        &self,
        source: &Op,
        init: &Op,
        select: &Body,
        scatter: &Body,
        window_dimensions: &[usize],
        window_strides: &[usize],
        padding: &[(i64, i64)],
    ) -> Result<Op> {
        let window = WindowSpec {
            dimensions: window_dimensions.to_vec(),
            strides: window_strides.to_vec(),
            padding: padding.to_vec(),
        };
        self.select_and_scatter_window(source, init, select, scatter, window)
    }

    fn select_and_scatter_window(
        &self,
        source: &Op,
        init: &Op,
        select: &Body,
        scatter: &Body,
        window: WindowSpec,
    ) -> Result<Op> {
        let scalar = self.shape.as_scalar();
        let select = select.resolve(&[scalar.clone(), scalar.clone()])?;
        let scatter = scatter.resolve(&[scalar.clone(), scalar])?;
        self.emit(
            Operation::SelectAndScatter {
                window,
                select,
                scatter,
            },
            &[source, init],
        )
    }

    /// Max pooling over the spatial dimensions named by `format`.
    pub fn max_pool(
        &self,
        kernel_size: &[usize],
        stride: &[usize],
        padding: &Padding,
        format: DataFormat,
    ) -> Result<Op> {
        ensure!(
            kernel_size.len() == format.spatial_dimensions.len()
                && stride.len() == format.spatial_dimensions.len(),
            "max_pool kernel and stride need one entry per spatial dimension"
        );
        let mut dimensions = vec![1; self.rank()];
        let mut strides = vec![1; self.rank()];
        for (index, axis) in format.spatial_dimensions.iter().enumerate() {
            ensure!(*axis < self.rank(), "max_pool spatial axis {axis} out of range");
            dimensions[*axis] = kernel_size[index];
            strides[*axis] = stride[index];
        }
        let window = self.window(&dimensions, &strides, padding)?;
        self.emit(Operation::MaxPool { window, format }, &[])
    }

    fn window(
        &self,
        dimensions: &[usize],
        strides: &[usize],
        padding: &Padding,
    ) -> Result<WindowSpec> {
        let padding = padding.resolve(self.sizes(), dimensions, strides)?;
        Ok(WindowSpec {
            dimensions: dimensions.to_vec(),
            strides: strides.to_vec(),
            padding,
        })
    }

    /// `self` is the predicate.
    pub fn select(&self, on_true: &Op, on_false: &Op) -> Result<Op> {
        self.emit(Operation::Select, &[on_true, on_false])
    }

    pub fn clamp(&self, min: &Op, max: &Op) -> Result<Op> {
        self.emit(Operation::Clamp, &[min, max])
    }

    /// Element type conversion.
    pub fn cast(&self, dtype: DType) -> Result<Op> {
        self.emit(Operation::Convert { dtype }, &[])
    }

    /// Reinterprets the element bits as `dtype` (same width).
    pub fn bitcast(&self, dtype: DType) -> Result<Op> {
        self.emit(Operation::BitcastConvert { dtype }, &[])
    }

    /// Solves `op(a) x = b` (or `x op(a) = b`) with `self` as `a`.
    pub fn triangular_solve(&self, b: &Op, spec: TriangularSolveSpec) -> Result<Op> {
        self.emit(Operation::TriangularSolve(spec), &[b])
    }

    pub fn get_tuple_element(&self, index: usize) -> Result<Op> {
        self.emit(Operation::GetTupleElement { index }, &[])
    }

    /// Splits a tuple-shaped node into its elements.
    pub fn tuple_elements(&self) -> Result<Vec<Op>> {
        ensure!(self.shape.is_tuple(), "expected a tuple, got {}", self.shape);
        (0..self.shape.tuple_size())
            .map(|index| self.get_tuple_element(index))
            .collect()
    }

    pub fn get_dimension_size(&self, dimension: usize) -> Result<Op> {
        self.emit(Operation::GetDimensionSize { dimension }, &[])
    }

    pub fn set_dimension_size(&self, size: &Op, dimension: usize) -> Result<Op> {
        self.emit(Operation::SetDimensionSize { dimension }, &[size])
    }

    /// `self` is the predicate; each branch is traced against the shape of its own operand.
    pub fn conditional(
        &self,
        true_operand: &Op,
        true_body: &Body,
        false_operand: &Op,
        false_body: &Body,
    ) -> Result<Op> {
        let true_branch = true_body.resolve(&[true_operand.shape.clone()])?;
        let false_branch = false_body.resolve(&[false_operand.shape.clone()])?;
        self.emit(
            Operation::Conditional {
                true_branch,
                false_branch,
            },
            &[true_operand, false_operand],
        )
    }

    /// Loops while `condition` holds, threading `self` through `body`.
    pub fn while_loop(&self, condition: &Body, body: &Body) -> Result<Op> {
        let state = [self.shape.clone()];
        let condition = condition.resolve(&state)?;
        let body = body.resolve(&state)?;
        self.emit(Operation::While { condition, body }, &[])
    }

    /// Uniform `[0, 1)` samples of `shape`, drawn from the stream `stream` of seed `self`.
    pub fn rng_uniform(&self, shape: Shape, stream: u64) -> Result<Op> {
        self.emit(Operation::RngUniform { shape, stream }, &[])
    }

    /// Scalar constant of `self`'s element type.
    pub fn scalar_like(&self, value: f64) -> Result<Op> {
        Op::scalar(&self.builder, value, self.dtype())
    }

    pub fn zeros_like(&self) -> Result<Op> {
        self.scalar_like(0.0)?.broadcast(self.sizes())
    }

    pub fn ones_like(&self) -> Result<Op> {
        self.scalar_like(1.0)?.broadcast(self.sizes())
    }

    pub fn constant(builder: &ComputationBuilder, literal: TensorLiteral) -> Result<Op> {
        builder.emit(Operation::Constant(literal), &[])
    }

    pub fn scalar(builder: &ComputationBuilder, value: f64, dtype: DType) -> Result<Op> {
        Op::constant(builder, TensorLiteral::scalar(dtype, value))
    }

    pub fn zero(builder: &ComputationBuilder, dtype: DType) -> Result<Op> {
        Op::scalar(builder, 0.0, dtype)
    }

    pub fn one(builder: &ComputationBuilder, dtype: DType) -> Result<Op> {
        Op::scalar(builder, 1.0, dtype)
    }

    pub fn iota(builder: &ComputationBuilder, shape: Shape, dimension: usize) -> Result<Op> {
        builder.emit(Operation::Iota { shape, dimension }, &[])
    }

    pub fn tuple(ops: &[Op], builder: Option<&ComputationBuilder>) -> Result<Op> {
        let builder = derive_builder(ops, builder);
        builder.emit(Operation::Tuple, &ops.iter().collect::<Vec<_>>())
    }

    pub fn concat_in_dim(
        ops: &[Op],
        dimension: usize,
        builder: Option<&ComputationBuilder>,
    ) -> Result<Op> {
        let builder = derive_builder(ops, builder);
        builder.emit(
            Operation::ConcatInDim { dimension },
            &ops.iter().collect::<Vec<_>>(),
        )
    }

    pub fn call(
        computation: &Computation,
        ops: &[Op],
        builder: Option<&ComputationBuilder>,
    ) -> Result<Op> {
        let builder = derive_builder(ops, builder);
        builder.emit(
            Operation::Call {
                computation: computation.clone(),
            },
            &ops.iter().collect::<Vec<_>>(),
        )
    }

    /// Sorts `ops` along `dimension`. Without a comparator, sorts ascending by the first
    /// operand.
    pub fn sort(
        ops: &[Op],
        comparator: Option<&Body>,
        dimension: usize,
        is_stable: bool,
        builder: Option<&ComputationBuilder>,
    ) -> Result<Op> {
        let builder = derive_builder(ops, builder);
        let params: Vec<Shape> = ops
            .iter()
            .flat_map(|op| [op.shape.as_scalar(), op.shape.as_scalar()])
            .collect();
        let comparator = match comparator {
            Some(body) => body.resolve(&params)?,
            None => Computation::trace("sort_comparator", &params, |args| args[0].lt(&args[1]))?,
        };
        builder.emit(
            Operation::Sort {
                dimension,
                is_stable,
                comparator,
            },
            &ops.iter().collect::<Vec<_>>(),
        )
    }

    /// Applies the scalar computation `body` elementwise across `ops`.
    pub fn map(
        ops: &[Op],
        body: &Body,
        dimensions: &[usize],
        builder: Option<&ComputationBuilder>,
    ) -> Result<Op> {
        let builder = derive_builder(ops, builder);
        let params: Vec<Shape> = ops.iter().map(|op| op.shape.as_scalar()).collect();
        let body = body.resolve(&params)?;
        builder.emit(
            Operation::Map {
                dimensions: dimensions.to_vec(),
                body,
            },
            &ops.iter().collect::<Vec<_>>(),
        )
    }
}

/// Picks the explicit builder, or the first operand's.
///
/// Panics when neither is available: a node cannot exist outside a builder.
fn derive_builder(ops: &[Op], builder: Option<&ComputationBuilder>) -> ComputationBuilder {
    match (builder, ops.first()) {
        (Some(builder), _) => builder.clone(),
        (None, Some(first)) => first.builder.clone(),
        (None, None) => panic!("operation over an empty operand list needs an explicit builder"),
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Op({}: {})", self.id, self.shape)
    }
}
