//! Local shape inference for every [`Operation`] the builder can record.
//!
//! Inference runs at emission time so shape-incompatible operand combinations are rejected
//! before a computation is ever frozen.

use std::collections::HashSet;

use anyhow::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::backend::computation::Computation;
use crate::backend::spec::{
    BinaryOp, ConvSpec, DType, GatherSpec, Operation, PadDim, ReshapeSpec, Shape, SliceSpec,
    TriangularSolveSpec, UnaryOp, WindowSpec,
};

type Dims = SmallVec<[usize; 6]>;

pub(crate) fn infer_shape(op: &Operation, operands: &[&Shape]) -> Result<Shape> {
    match op {
        Operation::Parameter { .. } => {
            bail!("parameters are declared through ComputationBuilder::param")
        }
        Operation::Constant(literal) => {
            arity(op, operands, 0)?;
            Ok(literal.shape.clone())
        }
        Operation::Iota { shape, dimension } => {
            arity(op, operands, 0)?;
            ensure!(!shape.is_tuple(), "iota requires an array shape");
            ensure!(
                *dimension < shape.rank(),
                "iota dimension {dimension} out of range for {shape}"
            );
            Ok(shape.clone())
        }
        Operation::Unary(unary) => {
            arity(op, operands, 1)?;
            infer_unary(*unary, array(operands[0], "operand")?)
        }
        Operation::Binary(binary) => {
            arity(op, operands, 2)?;
            infer_binary(*binary, operands[0], operands[1])
        }
        Operation::Compare(_) => {
            arity(op, operands, 2)?;
            let lhs = array(operands[0], "lhs")?;
            let rhs = array(operands[1], "rhs")?;
            same_dtype(lhs, rhs)?;
            Ok(broadcast_scalar(lhs, rhs)?.with_dtype(DType::Pred))
        }
        Operation::Select => {
            arity(op, operands, 3)?;
            let pred = array(operands[0], "predicate")?;
            let on_true = array(operands[1], "on_true")?;
            let on_false = array(operands[2], "on_false")?;
            ensure!(pred.dtype() == DType::Pred, "select predicate must be pred, got {pred}");
            same_array(on_true, on_false)?;
            ensure!(
                pred.rank() == 0 || pred.sizes() == on_true.sizes(),
                "select predicate {pred} does not match branches {on_true}"
            );
            Ok(on_true.clone())
        }
        Operation::Clamp => {
            arity(op, operands, 3)?;
            let operand = array(operands[0], "operand")?;
            for bound in [operands[1], operands[2]] {
                let bound = array(bound, "bound")?;
                same_dtype(operand, bound)?;
                ensure!(
                    bound.rank() == 0 || bound.sizes() == operand.sizes(),
                    "clamp bound {bound} must be scalar or match {operand}"
                );
            }
            Ok(operand.clone())
        }
        Operation::Convert { dtype } => {
            arity(op, operands, 1)?;
            Ok(array(operands[0], "operand")?.with_dtype(*dtype))
        }
        Operation::BitcastConvert { dtype } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            ensure!(
                operand.dtype().size_in_bytes() == dtype.size_in_bytes(),
                "bitcast from {} to {dtype} changes the element width",
                operand.dtype()
            );
            Ok(operand.with_dtype(*dtype))
        }
        Operation::Reshape(spec) => {
            arity(op, operands, 1)?;
            infer_reshape(spec, array(operands[0], "operand")?)
        }
        Operation::DynamicReshape { sizes, dynamic } => {
            ensure!(
                operands.len() == sizes.len() + 1,
                "dynamic_reshape expects one size operand per output dimension"
            );
            ensure!(
                sizes.len() == dynamic.len(),
                "dynamic_reshape sizes and dynamic markers differ in length"
            );
            let operand = array(operands[0], "operand")?;
            for size in &operands[1..] {
                integer_scalar(size, "dimension size")?;
            }
            Ok(Shape::create(
                operand.dtype(),
                sizes.clone(),
                Some(dynamic.clone()),
            ))
        }
        Operation::Broadcast { sizes } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            let mut dims = sizes.clone();
            dims.extend_from_slice(operand.sizes());
            Ok(Shape::array(operand.dtype(), dims))
        }
        Operation::BroadcastInDim { sizes, dimensions } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            ensure!(
                dimensions.len() == operand.rank(),
                "broadcast_in_dim needs {} dimensions, got {}",
                operand.rank(),
                dimensions.len()
            );
            unique_axes(dimensions, sizes.len(), "broadcast_in_dim")?;
            for (axis, target) in dimensions.iter().enumerate() {
                let extent = operand.sizes()[axis];
                ensure!(
                    extent == 1 || extent == sizes[*target],
                    "cannot broadcast dimension {axis} of {operand} to size {}",
                    sizes[*target]
                );
            }
            Ok(Shape::array(operand.dtype(), sizes.clone()))
        }
        Operation::Transpose { permutation } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            permutation_of(permutation, operand.rank(), "transpose")?;
            let dims: Vec<usize> = permutation.iter().map(|axis| operand.sizes()[*axis]).collect();
            Ok(Shape::array(operand.dtype(), dims))
        }
        Operation::Rev { dimensions } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            unique_axes(dimensions, operand.rank(), "rev")?;
            Ok(operand.clone())
        }
        Operation::Slice(spec) => {
            arity(op, operands, 1)?;
            infer_slice(spec, array(operands[0], "operand")?)
        }
        Operation::DynamicSlice { sizes } => {
            ensure!(!operands.is_empty(), "dynamic_slice requires an operand");
            let operand = array(operands[0], "operand")?;
            ensure!(
                operands.len() == operand.rank() + 1 && sizes.len() == operand.rank(),
                "dynamic_slice needs one start index and size per dimension of {operand}"
            );
            for start in &operands[1..] {
                integer_scalar(start, "start index")?;
            }
            for (axis, (size, extent)) in sizes.iter().zip(operand.sizes()).enumerate() {
                ensure!(
                    size <= extent,
                    "dynamic_slice size {size} exceeds dimension {axis} of {operand}"
                );
            }
            Ok(Shape::array(operand.dtype(), sizes.clone()))
        }
        Operation::DynamicUpdateSlice => {
            ensure!(operands.len() >= 2, "dynamic_update_slice requires operand and update");
            let operand = array(operands[0], "operand")?;
            let update = array(operands[1], "update")?;
            same_dtype(operand, update)?;
            ensure!(
                update.rank() == operand.rank() && operands.len() == operand.rank() + 2,
                "dynamic_update_slice needs a rank-{} update and one start per dimension",
                operand.rank()
            );
            for start in &operands[2..] {
                integer_scalar(start, "start index")?;
            }
            for (extent, size) in operand.sizes().iter().zip(update.sizes()) {
                ensure!(size <= extent, "update {update} does not fit into {operand}");
            }
            Ok(operand.clone())
        }
        Operation::Pad { config } => {
            arity(op, operands, 2)?;
            infer_pad(config, array(operands[0], "operand")?, array(operands[1], "padding value")?)
        }
        Operation::ConcatInDim { dimension } => infer_concat(*dimension, operands),
        Operation::Dot => {
            arity(op, operands, 2)?;
            infer_dot(array(operands[0], "lhs")?, array(operands[1], "rhs")?)
        }
        Operation::Gather(spec) => {
            arity(op, operands, 2)?;
            infer_gather(spec, array(operands[0], "operand")?, array(operands[1], "indices")?)
        }
        Operation::Scatter { spec, body } => {
            arity(op, operands, 3)?;
            let operand = array(operands[0], "operand")?;
            let indices = array(operands[1], "indices")?;
            let updates = array(operands[2], "updates")?;
            ensure!(indices.dtype().is_integer(), "scatter indices must be integers");
            same_dtype(operand, updates)?;
            ensure!(
                spec.update_window_dims.len() + spec.inserted_window_dims.len() == operand.rank(),
                "scatter window dims do not cover the rank of {operand}"
            );
            scalar_reducer(body, operand.dtype(), "scatter")?;
            Ok(operand.clone())
        }
        Operation::Convolution(spec) => {
            arity(op, operands, 2)?;
            infer_convolution(spec, array(operands[0], "input")?, array(operands[1], "kernel")?)
        }
        Operation::Reduce { dimensions, body } => {
            arity(op, operands, 2)?;
            let operand = array(operands[0], "operand")?;
            let init = array(operands[1], "init")?;
            ensure!(
                init.rank() == 0 && init.dtype() == operand.dtype(),
                "reduce init must be a {} scalar, got {init}",
                operand.dtype()
            );
            unique_axes(dimensions, operand.rank(), "reduce")?;
            scalar_reducer(body, operand.dtype(), "reduce")?;
            let mut dims = Vec::new();
            let mut dynamic = Vec::new();
            for axis in 0..operand.rank() {
                if !dimensions.contains(&axis) {
                    dims.push(operand.sizes()[axis]);
                    dynamic.push(operand.is_dynamic_dim(axis));
                }
            }
            Ok(Shape::create(operand.dtype(), dims, Some(dynamic)))
        }
        Operation::ReduceWindow { window, body } => {
            arity(op, operands, 2)?;
            let operand = array(operands[0], "operand")?;
            let init = array(operands[1], "init")?;
            ensure!(
                init.rank() == 0 && init.dtype() == operand.dtype(),
                "reduce_window init must be a {} scalar",
                operand.dtype()
            );
            scalar_reducer(body, operand.dtype(), "reduce_window")?;
            let dims = windowed_dims(operand.sizes(), window)?;
            Ok(Shape::array(operand.dtype(), dims.to_vec()))
        }
        Operation::SelectAndScatter {
            window,
            select,
            scatter,
        } => {
            arity(op, operands, 3)?;
            let operand = array(operands[0], "operand")?;
            let source = array(operands[1], "source")?;
            let init = array(operands[2], "init")?;
            same_dtype(operand, source)?;
            ensure!(init.rank() == 0, "select_and_scatter init must be scalar");
            let scalar = operand.as_scalar();
            let root = body_root(select, &[scalar.clone(), scalar], "select_and_scatter select")?;
            ensure!(
                *root == Shape::scalar(DType::Pred),
                "select computation must return pred[], got {root}"
            );
            scalar_reducer(scatter, operand.dtype(), "select_and_scatter scatter")?;
            let windowed = windowed_dims(operand.sizes(), window)?;
            ensure!(
                source.sizes() == windowed.as_slice(),
                "source {source} does not match windowed operand dims {windowed:?}"
            );
            Ok(operand.clone())
        }
        Operation::MaxPool { window, format } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            ensure!(
                format.spatial_dimensions.len() + 2 == operand.rank(),
                "max_pool format does not match rank of {operand}"
            );
            let dims = windowed_dims(operand.sizes(), window)?;
            Ok(Shape::array(operand.dtype(), dims.to_vec()))
        }
        Operation::TriangularSolve(spec) => {
            arity(op, operands, 2)?;
            infer_triangular_solve(spec, array(operands[0], "a")?, array(operands[1], "b")?)
        }
        Operation::Tuple => Ok(Shape::tuple(
            operands.iter().map(|shape| (*shape).clone()).collect::<Vec<_>>(),
        )),
        Operation::GetTupleElement { index } => {
            arity(op, operands, 1)?;
            let tuple = operands[0];
            ensure!(tuple.is_tuple(), "get_tuple_element requires a tuple, got {tuple}");
            ensure!(
                *index < tuple.tuple_size(),
                "tuple index {index} out of range for {tuple}"
            );
            Ok(tuple.tuple_element(*index).clone())
        }
        Operation::Call { computation } => {
            let params: Vec<Shape> = operands.iter().map(|shape| (*shape).clone()).collect();
            Ok(body_root(computation, &params, "call")?.clone())
        }
        Operation::Conditional {
            true_branch,
            false_branch,
        } => {
            arity(op, operands, 3)?;
            ensure!(
                *operands[0] == Shape::scalar(DType::Pred),
                "conditional predicate must be pred[], got {}",
                operands[0]
            );
            let on_true = body_root(true_branch, &[operands[1].clone()], "true branch")?;
            let on_false = body_root(false_branch, &[operands[2].clone()], "false branch")?;
            ensure!(
                on_true == on_false,
                "conditional branches return {on_true} and {on_false}"
            );
            Ok(on_true.clone())
        }
        Operation::While { condition, body } => {
            arity(op, operands, 1)?;
            let state = operands[0].clone();
            let predicate = body_root(condition, &[state.clone()], "while condition")?;
            ensure!(
                *predicate == Shape::scalar(DType::Pred),
                "while condition must return pred[], got {predicate}"
            );
            let next = body_root(body, &[state.clone()], "while body")?;
            ensure!(
                *next == state,
                "while body returns {next} but the loop carries {state}"
            );
            Ok(state)
        }
        Operation::Map { dimensions, body } => {
            ensure!(!operands.is_empty(), "map requires at least one operand");
            let first = array(operands[0], "operand")?;
            let mut params = Vec::with_capacity(operands.len());
            for operand in operands {
                let operand = array(operand, "operand")?;
                ensure!(
                    operand.sizes() == first.sizes(),
                    "map operands {first} and {operand} differ in shape"
                );
                params.push(operand.as_scalar());
            }
            unique_axes(dimensions, first.rank(), "map")?;
            let root = body_root(body, &params, "map")?;
            ensure!(root.is_scalar(), "map computation must return a scalar, got {root}");
            Ok(first.with_dtype(root.dtype()))
        }
        Operation::Sort {
            dimension,
            comparator,
            ..
        } => {
            ensure!(!operands.is_empty(), "sort requires at least one operand");
            let first = array(operands[0], "operand")?;
            ensure!(
                *dimension < first.rank(),
                "sort dimension {dimension} out of range for {first}"
            );
            let mut params = Vec::with_capacity(operands.len() * 2);
            for operand in operands {
                let operand = array(operand, "operand")?;
                ensure!(
                    operand.sizes() == first.sizes(),
                    "sort operands {first} and {operand} differ in shape"
                );
                params.push(operand.as_scalar());
                params.push(operand.as_scalar());
            }
            let root = body_root(comparator, &params, "sort comparator")?;
            ensure!(
                *root == Shape::scalar(DType::Pred),
                "sort comparator must return pred[], got {root}"
            );
            if operands.len() == 1 {
                Ok(first.clone())
            } else {
                Ok(Shape::tuple(
                    operands.iter().map(|shape| (*shape).clone()).collect::<Vec<_>>(),
                ))
            }
        }
        Operation::GetDimensionSize { dimension } => {
            arity(op, operands, 1)?;
            let operand = array(operands[0], "operand")?;
            ensure!(
                *dimension < operand.rank(),
                "dimension {dimension} out of range for {operand}"
            );
            Ok(Shape::scalar(DType::S32))
        }
        Operation::SetDimensionSize { dimension } => {
            arity(op, operands, 2)?;
            let operand = array(operands[0], "operand")?;
            integer_scalar(operands[1], "dimension size")?;
            ensure!(
                *dimension < operand.rank(),
                "dimension {dimension} out of range for {operand}"
            );
            let dynamic = (0..operand.rank())
                .map(|axis| axis == *dimension || operand.is_dynamic_dim(axis))
                .collect();
            Ok(Shape::create(
                operand.dtype(),
                operand.sizes().to_vec(),
                Some(dynamic),
            ))
        }
        Operation::RngUniform { shape, .. } => {
            arity(op, operands, 1)?;
            ensure!(
                *operands[0] == Shape::scalar(DType::U32),
                "rng seed must be u32[], got {}",
                operands[0]
            );
            ensure!(
                !shape.is_tuple() && shape.dtype().is_float(),
                "rng_uniform produces floating-point arrays, got {shape}"
            );
            Ok(shape.clone())
        }
    }
}

fn arity(op: &Operation, operands: &[&Shape], expected: usize) -> Result<()> {
    ensure!(
        operands.len() == expected,
        "{} expects {expected} operands, got {}",
        op.name(),
        operands.len()
    );
    Ok(())
}

fn array<'a>(shape: &'a Shape, role: &str) -> Result<&'a Shape> {
    ensure!(!shape.is_tuple(), "{role} must be an array, got tuple {shape}");
    Ok(shape)
}

fn same_dtype(lhs: &Shape, rhs: &Shape) -> Result<()> {
    ensure!(
        lhs.dtype() == rhs.dtype(),
        "element types differ: {} vs {}",
        lhs.dtype(),
        rhs.dtype()
    );
    Ok(())
}

fn same_array(lhs: &Shape, rhs: &Shape) -> Result<()> {
    same_dtype(lhs, rhs)?;
    ensure!(lhs.sizes() == rhs.sizes(), "shapes differ: {lhs} vs {rhs}");
    Ok(())
}

fn integer_scalar(shape: &Shape, role: &str) -> Result<()> {
    ensure!(
        shape.is_scalar() && shape.dtype().is_integer(),
        "{role} must be an integer scalar, got {shape}"
    );
    Ok(())
}

fn unique_axes(axes: &[usize], rank: usize, what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(axes.len());
    for axis in axes {
        ensure!(*axis < rank, "{what} axis {axis} out of range for rank {rank}");
        ensure!(seen.insert(*axis), "{what} axis {axis} repeated");
    }
    Ok(())
}

fn permutation_of(axes: &[usize], rank: usize, what: &str) -> Result<()> {
    ensure!(
        axes.len() == rank,
        "{what} permutation {axes:?} does not cover rank {rank}"
    );
    unique_axes(axes, rank, what)
}

/// Equal shapes, or one side scalar.
fn broadcast_scalar(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    if lhs.sizes() == rhs.sizes() {
        return Ok(lhs.clone());
    }
    if lhs.rank() == 0 {
        return Ok(rhs.clone());
    }
    if rhs.rank() == 0 {
        return Ok(lhs.clone());
    }
    bail!("incompatible operand shapes {lhs} and {rhs}")
}

fn infer_unary(op: UnaryOp, operand: &Shape) -> Result<Shape> {
    let dtype = operand.dtype();
    match op {
        UnaryOp::Not => ensure!(
            dtype == DType::Pred || dtype.is_integer(),
            "not requires pred or integer operands, got {operand}"
        ),
        UnaryOp::Clz => ensure!(dtype.is_integer(), "clz requires integers, got {operand}"),
        UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Sign => ensure!(
            dtype != DType::Pred,
            "{} is undefined for pred operands",
            op.name()
        ),
        UnaryOp::Real | UnaryOp::Imag | UnaryOp::Conj => ensure!(
            dtype.is_float() || dtype.is_complex(),
            "{} requires float or complex operands, got {operand}",
            op.name()
        ),
        _ => ensure!(
            dtype.is_float() || dtype.is_complex(),
            "{} requires floating-point operands, got {operand}",
            op.name()
        ),
    }
    match op {
        UnaryOp::IsFinite => Ok(operand.with_dtype(DType::Pred)),
        UnaryOp::Real | UnaryOp::Imag | UnaryOp::Abs => Ok(dtype
            .complex_component()
            .map(|component| operand.with_dtype(component))
            .unwrap_or_else(|| operand.clone())),
        _ => Ok(operand.clone()),
    }
}

fn infer_binary(op: BinaryOp, lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    let lhs = array(lhs, "lhs")?;
    let rhs = array(rhs, "rhs")?;
    same_dtype(lhs, rhs)?;
    let dtype = lhs.dtype();
    match op {
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => ensure!(
            dtype == DType::Pred || dtype.is_integer(),
            "{} requires pred or integer operands",
            op.name()
        ),
        BinaryOp::ShiftLeft | BinaryOp::ShiftRightLogical | BinaryOp::ShiftRightArithmetic => {
            ensure!(dtype.is_integer(), "{} requires integer operands", op.name())
        }
        BinaryOp::Atan2 => ensure!(dtype.is_float(), "atan2 requires floating-point operands"),
        _ => ensure!(dtype != DType::Pred, "{} is undefined for pred operands", op.name()),
    }
    broadcast_scalar(lhs, rhs)
}

fn infer_reshape(spec: &ReshapeSpec, operand: &Shape) -> Result<Shape> {
    if let Some(dimensions) = &spec.dimensions {
        permutation_of(dimensions, operand.rank(), "reshape")?;
    }
    let target: usize = spec.sizes.iter().product();
    ensure!(
        target == operand.element_count(),
        "cannot reshape {operand} ({} elements) to {:?}",
        operand.element_count(),
        spec.sizes
    );
    let dynamic = match spec.inferred_dimension {
        Some(axis) => {
            ensure!(
                axis < spec.sizes.len(),
                "inferred dimension {axis} out of range for {:?}",
                spec.sizes
            );
            Some((0..spec.sizes.len()).map(|dim| dim == axis).collect())
        }
        None => None,
    };
    Ok(Shape::create(operand.dtype(), spec.sizes.clone(), dynamic))
}

fn infer_slice(spec: &SliceSpec, operand: &Shape) -> Result<Shape> {
    let rank = operand.rank();
    ensure!(
        spec.start.len() == rank && spec.limit.len() == rank && spec.strides.len() == rank,
        "slice bounds must have one entry per dimension of {operand}"
    );
    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let (start, limit, stride) = (spec.start[axis], spec.limit[axis], spec.strides[axis]);
        ensure!(stride > 0, "slice stride must be positive on axis {axis}");
        ensure!(
            start <= limit && limit <= operand.sizes()[axis],
            "slice [{start}, {limit}) out of bounds on axis {axis} of {operand}"
        );
        dims.push((limit - start).div_ceil(stride));
    }
    Ok(Shape::array(operand.dtype(), dims))
}

fn infer_pad(config: &[PadDim], operand: &Shape, value: &Shape) -> Result<Shape> {
    ensure!(
        config.len() == operand.rank(),
        "pad config needs one entry per dimension of {operand}"
    );
    ensure!(
        value.rank() == 0 && value.dtype() == operand.dtype(),
        "padding value must be a {} scalar, got {value}",
        operand.dtype()
    );
    let mut dims = Vec::with_capacity(config.len());
    for (axis, (pad, extent)) in config.iter().zip(operand.sizes()).enumerate() {
        let extent = *extent as i64;
        let interior = if extent > 0 {
            (extent - 1) * pad.interior as i64
        } else {
            0
        };
        let padded = pad.low + pad.high + extent + interior;
        ensure!(padded >= 0, "padding produces negative size on axis {axis}");
        dims.push(padded as usize);
    }
    Ok(Shape::array(operand.dtype(), dims))
}

fn infer_concat(dimension: usize, operands: &[&Shape]) -> Result<Shape> {
    ensure!(!operands.is_empty(), "concatenate requires at least one operand");
    let first = array(operands[0], "operand")?;
    ensure!(
        dimension < first.rank(),
        "concatenate dimension {dimension} out of range for {first}"
    );
    let mut dims = first.sizes().to_vec();
    for operand in &operands[1..] {
        let operand = array(operand, "operand")?;
        same_dtype(first, operand)?;
        ensure!(
            operand.rank() == first.rank(),
            "concatenate operands {first} and {operand} differ in rank"
        );
        for axis in 0..first.rank() {
            if axis != dimension {
                ensure!(
                    operand.sizes()[axis] == first.sizes()[axis],
                    "concatenate operands {first} and {operand} differ on axis {axis}"
                );
            }
        }
        dims[dimension] += operand.sizes()[dimension];
    }
    Ok(Shape::array(first.dtype(), dims))
}

fn infer_dot(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    same_dtype(lhs, rhs)?;
    let contract = |left: usize, right: usize| -> Result<()> {
        ensure!(
            left == right,
            "dot contracting dimensions differ: {lhs} vs {rhs}"
        );
        Ok(())
    };
    let dims = match (lhs.sizes(), rhs.sizes()) {
        ([k], [k2]) => {
            contract(*k, *k2)?;
            Vec::new()
        }
        ([m, k], [k2]) => {
            contract(*k, *k2)?;
            vec![*m]
        }
        ([k], [k2, n]) => {
            contract(*k, *k2)?;
            vec![*n]
        }
        ([m, k], [k2, n]) => {
            contract(*k, *k2)?;
            vec![*m, *n]
        }
        _ => bail!("dot supports rank-1 and rank-2 operands, got {lhs} and {rhs}"),
    };
    Ok(Shape::array(lhs.dtype(), dims))
}

fn infer_gather(spec: &GatherSpec, operand: &Shape, indices: &Shape) -> Result<Shape> {
    ensure!(indices.dtype().is_integer(), "gather indices must be integers, got {indices}");
    ensure!(
        spec.slice_sizes.len() == operand.rank(),
        "gather slice_sizes must have one entry per dimension of {operand}"
    );
    ensure!(
        spec.index_vector_dim <= indices.rank(),
        "index_vector_dim {} out of range for {indices}",
        spec.index_vector_dim
    );
    let index_width = if spec.index_vector_dim == indices.rank() {
        1
    } else {
        indices.sizes()[spec.index_vector_dim]
    };
    ensure!(
        spec.start_index_map.len() == index_width,
        "start_index_map has {} entries but index vectors have {index_width}",
        spec.start_index_map.len()
    );
    unique_axes(&spec.start_index_map, operand.rank(), "gather start_index_map")?;
    unique_axes(&spec.collapsed_slice_dims, operand.rank(), "gather collapsed_slice_dims")?;
    for (axis, (size, extent)) in spec.slice_sizes.iter().zip(operand.sizes()).enumerate() {
        ensure!(
            size <= extent,
            "gather slice size {size} exceeds axis {axis} of {operand}"
        );
        if spec.collapsed_slice_dims.contains(&axis) {
            ensure!(*size <= 1, "collapsed gather dimension {axis} must have slice size 1");
        }
    }

    let batch: Dims = indices
        .sizes()
        .iter()
        .enumerate()
        .filter(|(axis, _)| *axis != spec.index_vector_dim)
        .map(|(_, size)| *size)
        .collect();
    let offsets: Dims = spec
        .slice_sizes
        .iter()
        .enumerate()
        .filter(|(axis, _)| !spec.collapsed_slice_dims.contains(axis))
        .map(|(_, size)| *size)
        .collect();
    ensure!(
        spec.offset_dims.len() == offsets.len(),
        "gather offset_dims has {} entries but {} slice dimensions remain",
        spec.offset_dims.len(),
        offsets.len()
    );
    let rank = batch.len() + offsets.len();
    unique_axes(&spec.offset_dims, rank, "gather offset_dims")?;

    let mut batch_iter = batch.iter();
    let mut offset_iter = offsets.iter();
    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let next = if spec.offset_dims.contains(&axis) {
            offset_iter.next()
        } else {
            batch_iter.next()
        };
        match next {
            Some(size) => dims.push(*size),
            None => bail!("gather dimension numbers are inconsistent with {indices}"),
        }
    }
    Ok(Shape::array(operand.dtype(), dims))
}

fn infer_convolution(spec: &ConvSpec, input: &Shape, kernel: &Shape) -> Result<Shape> {
    same_dtype(input, kernel)?;
    let numbers = &spec.dimension_numbers;
    let spatial = numbers.input_spatial_dimensions.len();
    ensure!(
        input.rank() == spatial + 2 && kernel.rank() == spatial + 2,
        "convolution operands {input} and {kernel} do not have rank {}",
        spatial + 2
    );
    ensure!(
        numbers.kernel_spatial_dimensions.len() == spatial
            && numbers.output_spatial_dimensions.len() == spatial,
        "convolution dimension numbers disagree on the spatial rank"
    );
    ensure!(
        spec.window_strides.len() == spatial
            && spec.padding.len() == spatial
            && spec.lhs_dilation.len() == spatial
            && spec.rhs_dilation.len() == spatial,
        "convolution window attributes must have {spatial} entries"
    );
    ensure!(
        spec.feature_group_count >= 1 && spec.batch_group_count >= 1,
        "group counts must be positive"
    );

    let batch = input.sizes()[numbers.input_batch_dimension];
    let in_features = input.sizes()[numbers.input_feature_dimension];
    let kernel_in = kernel.sizes()[numbers.kernel_input_feature_dimension];
    let kernel_out = kernel.sizes()[numbers.kernel_output_feature_dimension];
    ensure!(
        in_features == kernel_in * spec.feature_group_count,
        "input features {in_features} do not match kernel input features {kernel_in} x {} groups",
        spec.feature_group_count
    );
    ensure!(
        kernel_out % spec.feature_group_count == 0,
        "kernel output features {kernel_out} not divisible by feature_group_count"
    );
    ensure!(
        batch % spec.batch_group_count == 0,
        "batch {batch} not divisible by batch_group_count"
    );

    let mut dims = vec![0usize; spatial + 2];
    dims[numbers.output_batch_dimension] = batch / spec.batch_group_count;
    dims[numbers.output_feature_dimension] = kernel_out;
    for index in 0..spatial {
        let extent = input.sizes()[numbers.input_spatial_dimensions[index]];
        let window = kernel.sizes()[numbers.kernel_spatial_dimensions[index]];
        let dilated_input = dilate(extent, spec.lhs_dilation[index]);
        let dilated_window = dilate(window, spec.rhs_dilation[index]);
        dims[numbers.output_spatial_dimensions[index]] = window_output(
            dilated_input,
            dilated_window,
            spec.window_strides[index],
            spec.padding[index],
        )?;
    }
    Ok(Shape::array(input.dtype(), dims))
}

fn dilate(extent: usize, dilation: usize) -> usize {
    if extent == 0 {
        0
    } else {
        (extent - 1) * dilation.max(1) + 1
    }
}

fn window_output(
    extent: usize,
    window: usize,
    stride: usize,
    padding: (i64, i64),
) -> Result<usize> {
    ensure!(stride > 0, "window stride must be positive");
    ensure!(window > 0, "window size must be positive");
    let padded = extent as i64 + padding.0 + padding.1;
    if padded < window as i64 {
        return Ok(0);
    }
    Ok(((padded - window as i64) / stride as i64 + 1) as usize)
}

pub(crate) fn windowed_dims(sizes: &[usize], window: &WindowSpec) -> Result<Dims> {
    ensure!(
        window.dimensions.len() == sizes.len()
            && window.strides.len() == sizes.len()
            && window.padding.len() == sizes.len(),
        "window attributes must have {} entries",
        sizes.len()
    );
    sizes
        .iter()
        .enumerate()
        .map(|(axis, extent)| {
            window_output(
                *extent,
                window.dimensions[axis],
                window.strides[axis],
                window.padding[axis],
            )
        })
        .collect()
}

fn infer_triangular_solve(spec: &TriangularSolveSpec, a: &Shape, b: &Shape) -> Result<Shape> {
    same_dtype(a, b)?;
    ensure!(a.rank() >= 2, "triangular_solve requires a matrix, got {a}");
    ensure!(a.rank() == b.rank(), "triangular_solve operands {a} and {b} differ in rank");
    let rank = a.rank();
    let m = a.sizes()[rank - 1];
    ensure!(a.sizes()[rank - 2] == m, "triangular_solve matrix {a} is not square");
    ensure!(
        a.sizes()[..rank - 2] == b.sizes()[..rank - 2],
        "triangular_solve batch dimensions differ: {a} vs {b}"
    );
    let solved = if spec.left_side {
        b.sizes()[rank - 2]
    } else {
        b.sizes()[rank - 1]
    };
    ensure!(solved == m, "triangular_solve rhs {b} does not match {a}");
    Ok(b.clone())
}

fn body_root<'a>(body: &'a Computation, params: &[Shape], what: &str) -> Result<&'a Shape> {
    ensure!(
        body.parameters() == params,
        "{what} computation '{}' takes {:?} but is applied to {:?}",
        body.name(),
        body.parameters()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        params.iter().map(ToString::to_string).collect::<Vec<_>>()
    );
    Ok(body.root_shape())
}

fn scalar_reducer(body: &Computation, dtype: DType, what: &str) -> Result<()> {
    let scalar = Shape::scalar(dtype);
    let root = body_root(body, &[scalar.clone(), scalar.clone()], what)?;
    ensure!(
        *root == scalar,
        "{what} computation must return {scalar}, got {root}"
    );
    Ok(())
}
