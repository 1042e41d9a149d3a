//! Instruction-by-instruction evaluation of frozen computations.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shapejit::backend::computation::Computation;
use shapejit::backend::spec::{
    BackendError, BackendResult, BinaryOp, ComparisonOp, ConvSpec, DType, GatherSpec, Operation,
    PadDim, ScatterSpec, Shape, SliceSpec, TransposeKind, TriangularSolveSpec, UnaryOp, ValueId,
    WindowSpec,
};
use shapejit::backend::Instruction;
use smallvec::SmallVec;

use crate::cpu::{literal_to_tensor, normalize, tensor_to_literal, CpuKernelInterceptor, CpuTensor};

type Index = SmallVec<[usize; 6]>;

/// Runtime value of one instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Tensor(CpuTensor),
    Tuple(Vec<Value>),
}

impl Value {
    fn tensor(&self, what: &str) -> BackendResult<&CpuTensor> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            Value::Tuple(_) => Err(BackendError::execution(format!(
                "{what} must be a tensor, got a tuple"
            ))),
        }
    }
}

pub(crate) fn evaluate(
    interceptor: &dyn CpuKernelInterceptor,
    computation: &Computation,
    args: Vec<Value>,
) -> BackendResult<Value> {
    if args.len() != computation.num_parameters() {
        return Err(BackendError::execution(format!(
            "'{}' takes {} arguments, got {}",
            computation.name(),
            computation.num_parameters(),
            args.len()
        )));
    }
    let mut values: HashMap<ValueId, Value> = HashMap::with_capacity(computation.body().len());
    for (index, instruction) in computation.body().iter().enumerate() {
        let value = if let Operation::Parameter { index: slot } = instruction.op {
            args.get(slot)
                .cloned()
                .ok_or_else(|| BackendError::execution(format!("parameter {slot} missing")))?
        } else {
            let inputs = instruction
                .operands
                .iter()
                .map(|id| {
                    values
                        .get(id)
                        .cloned()
                        .ok_or_else(|| BackendError::execution(format!("operand {id} missing")))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            let result = match interceptor.try_execute(instruction, &inputs) {
                Some(result) => result,
                None => execute(interceptor, instruction, &inputs),
            };
            result.map_err(|err| augment_error(err, computation, index, instruction))?
        };
        values.insert(instruction.id, value);
    }
    values
        .remove(&computation.root())
        .ok_or_else(|| {
            BackendError::execution(format!(
                "root of '{}' was never computed",
                computation.name()
            ))
        })
}

fn augment_error(
    err: BackendError,
    computation: &Computation,
    index: usize,
    instruction: &Instruction,
) -> BackendError {
    match err {
        BackendError::Execution { message } => BackendError::execution(format!(
            "{}[{index}] {} = {}: {message}",
            computation.name(),
            instruction.id,
            instruction.op.name()
        )),
        other => other,
    }
}

fn call_scalars(
    interceptor: &dyn CpuKernelInterceptor,
    body: &Computation,
    scalars: &[(DType, f64)],
) -> BackendResult<Value> {
    let args = scalars
        .iter()
        .map(|(dtype, value)| Value::Tensor(CpuTensor::scalar(*dtype, *value)))
        .collect();
    evaluate(interceptor, body, args)
}

fn scalar_result(value: Value) -> BackendResult<f64> {
    let tensor = value.tensor("scalar body result")?;
    tensor
        .data
        .first()
        .copied()
        .ok_or_else(|| BackendError::execution("empty scalar body result"))
}

/// Evaluates a two-argument scalar body.
fn apply_binary_body(
    interceptor: &dyn CpuKernelInterceptor,
    body: &Computation,
    dtype: DType,
    lhs: f64,
    rhs: f64,
) -> BackendResult<f64> {
    scalar_result(call_scalars(interceptor, body, &[(dtype, lhs), (dtype, rhs)])?)
}

fn output_tensor(shape: &Shape, data: Vec<f64>) -> BackendResult<Value> {
    let dtype = shape.dtype();
    let data = data.into_iter().map(|value| normalize(dtype, value)).collect();
    Ok(Value::Tensor(CpuTensor::new(shape.clone(), data)?))
}

fn execute(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[Value],
) -> BackendResult<Value> {
    let shape = &instruction.shape;
    let operand = |index: usize| operand_at(inputs, index);
    match &instruction.op {
        Operation::Parameter { .. } => {
            Err(BackendError::execution("parameters are bound by the caller"))
        }
        Operation::Constant(literal) => Ok(Value::Tensor(literal_to_tensor(literal)?)),
        Operation::Iota { shape, dimension } => {
            let sizes = shape.sizes();
            let data = (0..shape.element_count())
                .map(|flat| unravel(flat, sizes)[*dimension] as f64)
                .collect();
            output_tensor(shape, data)
        }
        Operation::Unary(op) => {
            let input = operand(0)?;
            let dtype = input.dtype();
            let data = input
                .data
                .iter()
                .map(|value| unary(*op, dtype, *value))
                .collect::<BackendResult<Vec<_>>>()?;
            output_tensor(shape, data)
        }
        Operation::Binary(op) => {
            let (lhs, rhs) = (operand(0)?, operand(1)?);
            let dtype = lhs.dtype();
            let data =
                zip_broadcast(lhs, rhs, shape.element_count(), |a, b| binary(*op, dtype, a, b));
            output_tensor(shape, data)
        }
        Operation::Compare(op) => {
            let (lhs, rhs) = (operand(0)?, operand(1)?);
            let data = zip_broadcast(lhs, rhs, shape.element_count(), |a, b| compare(*op, a, b));
            output_tensor(shape, data)
        }
        Operation::Select => {
            let (pred, on_true, on_false) = (operand(0)?, operand(1)?, operand(2)?);
            let data = (0..shape.element_count())
                .map(|i| {
                    if element(pred, i) != 0.0 {
                        element(on_true, i)
                    } else {
                        element(on_false, i)
                    }
                })
                .collect();
            output_tensor(shape, data)
        }
        Operation::Clamp => {
            let (input, low, high) = (operand(0)?, operand(1)?, operand(2)?);
            let data = (0..shape.element_count())
                .map(|i| input.data[i].max(element(low, i)).min(element(high, i)))
                .collect();
            output_tensor(shape, data)
        }
        Operation::Convert { .. } => output_tensor(shape, operand(0)?.data.to_vec()),
        Operation::BitcastConvert { dtype } => {
            let input = operand(0)?;
            if input.dtype().size_in_bytes() != dtype.size_in_bytes() {
                return Err(BackendError::unimplemented(
                    "bitcast_convert",
                    "only same-width bitcasts are supported",
                ));
            }
            let literal = tensor_to_literal(input)?;
            let reinterpreted =
                shapejit::backend::spec::TensorLiteral::new(shape.clone(), literal.bytes)?;
            Ok(Value::Tensor(literal_to_tensor(&reinterpreted)?))
        }
        Operation::Reshape(spec) => {
            let input = operand(0)?;
            let data = match &spec.dimensions {
                Some(permutation) => transpose_data(input, permutation),
                None => input.data.to_vec(),
            };
            output_tensor(shape, data)
        }
        Operation::DynamicReshape { .. } | Operation::SetDimensionSize { .. } => {
            output_tensor(shape, operand(0)?.data.to_vec())
        }
        Operation::Broadcast { sizes } => {
            let input = operand(0)?;
            let dimensions: Vec<usize> = (sizes.len()..sizes.len() + input.shape.rank()).collect();
            output_tensor(shape, broadcast_in_dim(input, shape.sizes(), &dimensions))
        }
        Operation::BroadcastInDim { dimensions, .. } => {
            let input = operand(0)?;
            output_tensor(shape, broadcast_in_dim(input, shape.sizes(), dimensions))
        }
        Operation::Transpose { permutation } => {
            output_tensor(shape, transpose_data(operand(0)?, permutation))
        }
        Operation::Rev { dimensions } => {
            let input = operand(0)?;
            let sizes = input.sizes();
            let data = (0..shape.element_count())
                .map(|flat| {
                    let mut index = unravel(flat, sizes);
                    for axis in dimensions {
                        index[*axis] = sizes[*axis] - 1 - index[*axis];
                    }
                    input.data[ravel(&index, sizes)]
                })
                .collect();
            output_tensor(shape, data)
        }
        Operation::Slice(spec) => output_tensor(shape, slice(operand(0)?, shape.sizes(), spec)),
        Operation::DynamicSlice { sizes } => {
            let input = operand(0)?;
            let starts = clamped_starts(input.sizes(), sizes, &inputs[1..])?;
            let data = (0..shape.element_count())
                .map(|flat| {
                    let index = unravel(flat, sizes);
                    let source: Index = index.iter().zip(&starts).map(|(i, s)| i + s).collect();
                    input.data[ravel(&source, input.sizes())]
                })
                .collect();
            output_tensor(shape, data)
        }
        Operation::DynamicUpdateSlice => {
            let (input, update) = (operand(0)?, operand(1)?);
            let starts = clamped_starts(input.sizes(), update.sizes(), &inputs[2..])?;
            let mut data = input.data.to_vec();
            for flat in 0..update.data.len() {
                let index = unravel(flat, update.sizes());
                let target: Index = index.iter().zip(&starts).map(|(i, s)| i + s).collect();
                data[ravel(&target, input.sizes())] = update.data[flat];
            }
            output_tensor(shape, data)
        }
        Operation::Pad { config } => output_tensor(
            shape,
            pad(operand(0)?, operand(1)?.data[0], shape.sizes(), config),
        ),
        Operation::ConcatInDim { dimension } => {
            let parts = (0..inputs.len()).map(operand).collect::<BackendResult<Vec<_>>>()?;
            output_tensor(shape, concat(&parts, *dimension, shape.sizes()))
        }
        Operation::Dot => output_tensor(shape, dot(operand(0)?, operand(1)?)),
        Operation::Gather(spec) => {
            output_tensor(shape, gather(operand(0)?, operand(1)?, spec, shape.sizes())?)
        }
        Operation::Scatter { spec, body } => {
            let data = scatter(interceptor, operand(0)?, operand(1)?, operand(2)?, spec, body)?;
            output_tensor(shape, data)
        }
        Operation::Convolution(spec) => output_tensor(
            shape,
            convolution(operand(0)?, operand(1)?, spec, shape.sizes())?,
        ),
        Operation::Reduce { dimensions, body } => {
            let (input, init) = (operand(0)?, operand(1)?.data[0]);
            let data = reduce(interceptor, input, init, dimensions, body, shape.sizes())?;
            output_tensor(shape, data)
        }
        Operation::ReduceWindow { window, body } => {
            let (input, init) = (operand(0)?, operand(1)?.data[0]);
            let dtype = input.dtype();
            let data = windowed(input, window, shape.sizes(), init, |acc, x| {
                apply_binary_body(interceptor, body, dtype, acc, x)
            })?;
            output_tensor(shape, data)
        }
        Operation::MaxPool { window, .. } => {
            let input = operand(0)?;
            let data = windowed(input, window, shape.sizes(), f64::NEG_INFINITY, |acc, x| {
                Ok(acc.max(x))
            })?;
            output_tensor(shape, data)
        }
        Operation::SelectAndScatter { window, select, scatter } => {
            let (input, source, init) = (operand(0)?, operand(1)?, operand(2)?.data[0]);
            let data =
                select_and_scatter(interceptor, input, source, init, window, select, scatter)?;
            output_tensor(shape, data)
        }
        Operation::TriangularSolve(spec) => {
            output_tensor(shape, triangular_solve(operand(0)?, operand(1)?, spec)?)
        }
        Operation::Tuple => Ok(Value::Tuple(inputs.to_vec())),
        Operation::GetTupleElement { index } => match inputs.first() {
            Some(Value::Tuple(elements)) => elements
                .get(*index)
                .cloned()
                .ok_or_else(|| BackendError::execution(format!("tuple has no element {index}"))),
            _ => Err(BackendError::execution("get_tuple_element expects a tuple operand")),
        },
        Operation::Call { computation } => evaluate(interceptor, computation, inputs.to_vec()),
        Operation::Conditional { true_branch, false_branch } => {
            let predicate = operand(0)?.data[0] != 0.0;
            let (branch, argument) = if predicate {
                (true_branch, &inputs[1])
            } else {
                (false_branch, &inputs[2])
            };
            evaluate(interceptor, branch, vec![argument.clone()])
        }
        Operation::While { condition, body } => {
            let mut state = inputs
                .first()
                .cloned()
                .ok_or_else(|| BackendError::execution("while expects an initial state"))?;
            while scalar_result(evaluate(interceptor, condition, vec![state.clone()])?)? != 0.0 {
                state = evaluate(interceptor, body, vec![state])?;
            }
            Ok(state)
        }
        Operation::Map { body, .. } => {
            let operands = (0..inputs.len()).map(operand).collect::<BackendResult<Vec<_>>>()?;
            let data = (0..shape.element_count())
                .map(|i| {
                    let scalars: Vec<(DType, f64)> =
                        operands.iter().map(|t| (t.dtype(), t.data[i])).collect();
                    scalar_result(call_scalars(interceptor, body, &scalars)?)
                })
                .collect::<BackendResult<Vec<_>>>()?;
            output_tensor(shape, data)
        }
        Operation::Sort { dimension, comparator, .. } => {
            let operands = (0..inputs.len()).map(operand).collect::<BackendResult<Vec<_>>>()?;
            sort(interceptor, &operands, *dimension, comparator, shape)
        }
        Operation::GetDimensionSize { dimension } => {
            let size = operand(0)?.sizes()[*dimension];
            output_tensor(shape, vec![size as f64])
        }
        Operation::RngUniform { shape: _, stream } => {
            let seed = operand(0)?.data[0] as u64;
            let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ stream);
            let dtype = shape.dtype();
            let data = (0..shape.element_count())
                .map(|_| loop {
                    let value = normalize(dtype, rng.gen::<f64>());
                    if value < 1.0 {
                        break value;
                    }
                })
                .collect();
            output_tensor(shape, data)
        }
    }
}

fn operand_at(inputs: &[Value], index: usize) -> BackendResult<&CpuTensor> {
    inputs
        .get(index)
        .ok_or_else(|| BackendError::execution(format!("missing operand {index}")))?
        .tensor("operand")
}

fn element(tensor: &CpuTensor, index: usize) -> f64 {
    if tensor.data.len() == 1 {
        tensor.data[0]
    } else {
        tensor.data[index]
    }
}

fn zip_broadcast(
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    count: usize,
    f: impl Fn(f64, f64) -> f64,
) -> Vec<f64> {
    (0..count).map(|i| f(element(lhs, i), element(rhs, i))).collect()
}

fn strides(sizes: &[usize]) -> Index {
    let mut strides: Index = SmallVec::from_elem(1, sizes.len());
    for axis in (0..sizes.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * sizes[axis + 1];
    }
    strides
}

fn unravel(mut flat: usize, sizes: &[usize]) -> Index {
    let mut index: Index = SmallVec::from_elem(0, sizes.len());
    for axis in (0..sizes.len()).rev() {
        let size = sizes[axis].max(1);
        index[axis] = flat % size;
        flat /= size;
    }
    index
}

fn ravel(index: &[usize], sizes: &[usize]) -> usize {
    index
        .iter()
        .zip(strides(sizes).iter())
        .map(|(i, stride)| i * stride)
        .sum()
}

fn int_width(dtype: DType) -> u32 {
    (dtype.size_in_bytes() * 8) as u32
}

/// Two's complement view of an integer element; `normalize` wraps results back to width.
fn as_bits(_dtype: DType, value: f64) -> i64 {
    if value >= 0.0 {
        value as u64 as i64
    } else {
        value as i64
    }
}

fn erf(x: f64) -> f64 {
    // Abramowitz and Stegun 7.1.26.
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let inner = 1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * inner));
    sign * (1.0 - poly * (-x * x).exp())
}

fn unary(op: UnaryOp, dtype: DType, v: f64) -> BackendResult<f64> {
    let bool_to = |flag: bool| if flag { 1.0 } else { 0.0 };
    Ok(match op {
        UnaryOp::Neg => -v,
        UnaryOp::Not => {
            if dtype == DType::Pred {
                bool_to(v == 0.0)
            } else {
                !(v as i64) as f64
            }
        }
        UnaryOp::Abs => v.abs(),
        UnaryOp::Sign => {
            if v == 0.0 || v.is_nan() {
                v
            } else {
                v.signum()
            }
        }
        UnaryOp::Exp => v.exp(),
        UnaryOp::Expm1 => v.exp_m1(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Log1p => v.ln_1p(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Rsqrt => 1.0 / v.sqrt(),
        UnaryOp::Cbrt => v.cbrt(),
        UnaryOp::Sin => v.sin(),
        UnaryOp::Cos => v.cos(),
        UnaryOp::Tan => v.tan(),
        UnaryOp::Asin => v.asin(),
        UnaryOp::Acos => v.acos(),
        UnaryOp::Atan => v.atan(),
        UnaryOp::Sinh => v.sinh(),
        UnaryOp::Cosh => v.cosh(),
        UnaryOp::Tanh => v.tanh(),
        UnaryOp::Erf => erf(v),
        UnaryOp::Erfc => 1.0 - erf(v),
        UnaryOp::ErfInv => {
            return Err(BackendError::unimplemented(
                "erf_inv",
                "not available in the reference backend",
            ))
        }
        UnaryOp::Floor => v.floor(),
        UnaryOp::Ceil => v.ceil(),
        UnaryOp::Round => v.round(),
        UnaryOp::IsFinite => bool_to(v.is_finite()),
        UnaryOp::Logistic => 1.0 / (1.0 + (-v).exp()),
        UnaryOp::Clz => {
            let width = int_width(dtype);
            let bits = (as_bits(dtype, v) as u64) & (u64::MAX >> (64 - width));
            (bits.leading_zeros() - (64 - width)) as f64
        }
        UnaryOp::Real | UnaryOp::Conj => v,
        UnaryOp::Imag => 0.0,
    })
}

fn binary(op: BinaryOp, dtype: DType, a: f64, b: f64) -> f64 {
    let integer = dtype.is_integer();
    let pred = dtype == DType::Pred;
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => {
            if integer {
                (a as i64).wrapping_mul(b as i64) as f64
            } else {
                a * b
            }
        }
        BinaryOp::Div => {
            if integer {
                if b == 0.0 {
                    -1.0
                } else {
                    (a as i64).wrapping_div(b as i64) as f64
                }
            } else {
                a / b
            }
        }
        BinaryOp::Rem => {
            if integer {
                if b == 0.0 {
                    a
                } else {
                    (a as i64).wrapping_rem(b as i64) as f64
                }
            } else {
                a % b
            }
        }
        BinaryOp::Pow => {
            if integer {
                if b < 0.0 {
                    if a == 1.0 {
                        1.0
                    } else {
                        0.0
                    }
                } else {
                    (a as i64).wrapping_pow(b as u32) as f64
                }
            } else {
                a.powf(b)
            }
        }
        BinaryOp::Max => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.max(b)
            }
        }
        BinaryOp::Min => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.min(b)
            }
        }
        BinaryOp::Atan2 => a.atan2(b),
        BinaryOp::And if pred => f64::from(u8::from(a != 0.0 && b != 0.0)),
        BinaryOp::Or if pred => f64::from(u8::from(a != 0.0 || b != 0.0)),
        BinaryOp::Xor if pred => f64::from(u8::from((a != 0.0) != (b != 0.0))),
        BinaryOp::And => (as_bits(dtype, a) & as_bits(dtype, b)) as f64,
        BinaryOp::Or => (as_bits(dtype, a) | as_bits(dtype, b)) as f64,
        BinaryOp::Xor => (as_bits(dtype, a) ^ as_bits(dtype, b)) as f64,
        BinaryOp::ShiftLeft => {
            let width = int_width(dtype);
            if b < 0.0 || b >= f64::from(width) {
                0.0
            } else {
                (as_bits(dtype, a).wrapping_shl(b as u32)) as f64
            }
        }
        BinaryOp::ShiftRightLogical => {
            let width = int_width(dtype);
            if b < 0.0 || b >= f64::from(width) {
                0.0
            } else {
                let mask = u64::MAX >> (64 - width);
                (((as_bits(dtype, a) as u64) & mask) >> (b as u32)) as f64
            }
        }
        BinaryOp::ShiftRightArithmetic => {
            let width = int_width(dtype);
            let bits = as_bits(dtype, a);
            if b < 0.0 || b >= f64::from(width) {
                if bits < 0 {
                    -1.0
                } else {
                    0.0
                }
            } else {
                (bits >> (b as u32)) as f64
            }
        }
    }
}

fn compare(op: ComparisonOp, a: f64, b: f64) -> f64 {
    let holds = match op {
        ComparisonOp::Eq => a == b,
        ComparisonOp::Ne => a != b,
        ComparisonOp::Lt => a < b,
        ComparisonOp::Le => a <= b,
        ComparisonOp::Gt => a > b,
        ComparisonOp::Ge => a >= b,
    };
    if holds {
        1.0
    } else {
        0.0
    }
}

fn transpose_data(input: &CpuTensor, permutation: &[usize]) -> Vec<f64> {
    let sizes = input.sizes();
    let out_sizes: Vec<usize> = permutation.iter().map(|axis| sizes[*axis]).collect();
    (0..input.data.len())
        .map(|flat| {
            let out_index = unravel(flat, &out_sizes);
            let mut source: Index = SmallVec::from_elem(0, sizes.len());
            for (out_axis, in_axis) in permutation.iter().enumerate() {
                source[*in_axis] = out_index[out_axis];
            }
            input.data[ravel(&source, sizes)]
        })
        .collect()
}

fn broadcast_in_dim(input: &CpuTensor, out_sizes: &[usize], dimensions: &[usize]) -> Vec<f64> {
    let in_sizes = input.sizes();
    let count: usize = out_sizes.iter().product();
    (0..count)
        .map(|flat| {
            let out_index = unravel(flat, out_sizes);
            let source: Index = dimensions
                .iter()
                .enumerate()
                .map(|(axis, target)| if in_sizes[axis] == 1 { 0 } else { out_index[*target] })
                .collect();
            input.data[ravel(&source, in_sizes)]
        })
        .collect()
}

fn slice(input: &CpuTensor, out_sizes: &[usize], spec: &SliceSpec) -> Vec<f64> {
    let count: usize = out_sizes.iter().product();
    (0..count)
        .map(|flat| {
            let index = unravel(flat, out_sizes);
            let source: Index = index
                .iter()
                .enumerate()
                .map(|(axis, i)| spec.start[axis] + i * spec.strides[axis])
                .collect();
            input.data[ravel(&source, input.sizes())]
        })
        .collect()
}

fn clamped_starts(operand: &[usize], window: &[usize], starts: &[Value]) -> BackendResult<Index> {
    operand
        .iter()
        .zip(window)
        .zip(starts)
        .map(|((extent, size), start)| {
            let start = start.tensor("start index")?.data[0];
            let max = (extent - size) as f64;
            Ok(start.clamp(0.0, max) as usize)
        })
        .collect()
}

fn pad(input: &CpuTensor, value: f64, out_sizes: &[usize], config: &[PadDim]) -> Vec<f64> {
    let count: usize = out_sizes.iter().product();
    let mut data = vec![value; count];
    let in_sizes = input.sizes();
    'elements: for flat in 0..input.data.len() {
        let index = unravel(flat, in_sizes);
        let mut target: Index = SmallVec::with_capacity(index.len());
        for (axis, i) in index.iter().enumerate() {
            let dim = config[axis];
            let position = dim.low + (*i as i64) * (dim.interior as i64 + 1);
            if position < 0 || position >= out_sizes[axis] as i64 {
                continue 'elements;
            }
            target.push(position as usize);
        }
        data[ravel(&target, out_sizes)] = input.data[flat];
    }
    data
}

fn concat(parts: &[&CpuTensor], dimension: usize, out_sizes: &[usize]) -> Vec<f64> {
    let count: usize = out_sizes.iter().product();
    let mut data = vec![0.0; count];
    let mut offset = 0;
    for part in parts {
        for flat in 0..part.data.len() {
            let mut index = unravel(flat, part.sizes());
            index[dimension] += offset;
            data[ravel(&index, out_sizes)] = part.data[flat];
        }
        offset += part.sizes()[dimension];
    }
    data
}

fn dot(lhs: &CpuTensor, rhs: &CpuTensor) -> Vec<f64> {
    let (m, k) = match lhs.sizes() {
        [k] => (1, *k),
        [m, k] => (*m, *k),
        _ => (0, 0),
    };
    let n = match rhs.sizes() {
        [_] => 1,
        [_, n] => *n,
        _ => 0,
    };
    let mut out = vec![0.0; m * n];
    for row in 0..m {
        for col in 0..n {
            out[row * n + col] = (0..k)
                .map(|i| lhs.data[row * k + i] * rhs.data[i * n + col])
                .sum();
        }
    }
    out
}

/// Position of the index vector for batch position `batch` inside `indices`.
fn index_vector(
    indices: &CpuTensor,
    index_vector_dim: usize,
    batch: &[usize],
    len: usize,
) -> Vec<i64> {
    let sizes = indices.sizes();
    if index_vector_dim == sizes.len() {
        return vec![indices.data[ravel(batch, sizes)] as i64];
    }
    (0..len)
        .map(|component| {
            let mut position: Index = SmallVec::with_capacity(sizes.len());
            position.extend_from_slice(&batch[..index_vector_dim]);
            position.push(component);
            position.extend_from_slice(&batch[index_vector_dim..]);
            indices.data[ravel(&position, sizes)] as i64
        })
        .collect()
}

fn gather(
    operand: &CpuTensor,
    indices: &CpuTensor,
    spec: &GatherSpec,
    out_sizes: &[usize],
) -> BackendResult<Vec<f64>> {
    let operand_sizes = operand.sizes();
    let batch_dims: Vec<usize> = (0..out_sizes.len())
        .filter(|d| !spec.offset_dims.contains(d))
        .collect();
    let window_operand_dims: Vec<usize> = (0..operand_sizes.len())
        .filter(|d| !spec.collapsed_slice_dims.contains(d))
        .collect();
    let count: usize = out_sizes.iter().product();
    (0..count)
        .map(|flat| {
            let out_index = unravel(flat, out_sizes);
            let batch: Vec<usize> = batch_dims.iter().map(|d| out_index[*d]).collect();
            let starts =
                index_vector(indices, spec.index_vector_dim, &batch, spec.start_index_map.len());
            let mut source: Index = SmallVec::from_elem(0, operand_sizes.len());
            for (component, axis) in spec.start_index_map.iter().enumerate() {
                let max = (operand_sizes[*axis] - spec.slice_sizes[*axis]) as i64;
                source[*axis] = starts[component].clamp(0, max) as usize;
            }
            for (offset_dim, axis) in spec.offset_dims.iter().zip(&window_operand_dims) {
                source[*axis] += out_index[*offset_dim];
            }
            Ok(operand.data[ravel(&source, operand_sizes)])
        })
        .collect()
}

fn scatter(
    interceptor: &dyn CpuKernelInterceptor,
    operand: &CpuTensor,
    indices: &CpuTensor,
    updates: &CpuTensor,
    spec: &ScatterSpec,
    body: &Computation,
) -> BackendResult<Vec<f64>> {
    let operand_sizes = operand.sizes();
    let update_sizes = updates.sizes();
    let dtype = operand.dtype();
    let scatter_dims: Vec<usize> = (0..update_sizes.len())
        .filter(|d| !spec.update_window_dims.contains(d))
        .collect();
    let window_operand_dims: Vec<usize> = (0..operand_sizes.len())
        .filter(|d| !spec.inserted_window_dims.contains(d))
        .collect();
    let mut data = operand.data.to_vec();
    'updates: for flat in 0..updates.data.len() {
        let update_index = unravel(flat, update_sizes);
        let batch: Vec<usize> = scatter_dims.iter().map(|d| update_index[*d]).collect();
        let starts = index_vector(
            indices,
            spec.index_vector_dim,
            &batch,
            spec.scatter_dims_to_operand_dims.len(),
        );
        let mut target = vec![0i64; operand_sizes.len()];
        for (component, axis) in spec.scatter_dims_to_operand_dims.iter().enumerate() {
            target[*axis] = starts[component];
        }
        for (window_dim, axis) in spec.update_window_dims.iter().zip(&window_operand_dims) {
            target[*axis] += update_index[*window_dim] as i64;
        }
        let mut position: Index = SmallVec::with_capacity(target.len());
        for (axis, value) in target.iter().enumerate() {
            if *value < 0 || *value >= operand_sizes[axis] as i64 {
                continue 'updates;
            }
            position.push(*value as usize);
        }
        let slot = ravel(&position, operand_sizes);
        data[slot] = apply_binary_body(interceptor, body, dtype, data[slot], updates.data[flat])?;
    }
    Ok(data)
}

fn convolution(
    input: &CpuTensor,
    kernel: &CpuTensor,
    spec: &ConvSpec,
    out_sizes: &[usize],
) -> BackendResult<Vec<f64>> {
    if spec.batch_group_count != 1 {
        return Err(BackendError::unimplemented(
            "convolution",
            "batch_group_count > 1 is not supported by the reference backend",
        ));
    }
    let dims = &spec.dimension_numbers;
    let in_sizes = input.sizes();
    let kernel_sizes = kernel.sizes();
    let groups = spec.feature_group_count.max(1);
    let kernel_in = kernel_sizes[dims.kernel_input_feature_dimension];
    let out_features = out_sizes[dims.output_feature_dimension];
    let per_group = (out_features / groups).max(1);
    let kernel_spatial: Vec<usize> = dims
        .kernel_spatial_dimensions
        .iter()
        .map(|d| kernel_sizes[*d])
        .collect();
    let window_count: usize = kernel_spatial.iter().product();
    let count: usize = out_sizes.iter().product();

    (0..count)
        .map(|flat| {
            let out_index = unravel(flat, out_sizes);
            let batch = out_index[dims.output_batch_dimension];
            let feature = out_index[dims.output_feature_dimension];
            let group = feature / per_group;
            let mut acc = 0.0;
            for window in 0..window_count {
                let offsets = unravel(window, &kernel_spatial);
                let mut in_index: Index = SmallVec::from_elem(0, in_sizes.len());
                let mut k_index: Index = SmallVec::from_elem(0, kernel_sizes.len());
                in_index[dims.input_batch_dimension] = batch;
                k_index[dims.kernel_output_feature_dimension] = feature;
                let mut inside = true;
                for (s, offset) in offsets.iter().enumerate() {
                    let out_pos = out_index[dims.output_spatial_dimensions[s]] as i64;
                    let dilated = out_pos * spec.window_strides[s] as i64
                        + (*offset * spec.rhs_dilation[s]) as i64
                        - spec.padding[s].0;
                    let lhs_dilation = spec.lhs_dilation[s] as i64;
                    if dilated < 0 || dilated % lhs_dilation != 0 {
                        inside = false;
                        break;
                    }
                    let position = dilated / lhs_dilation;
                    let axis = dims.input_spatial_dimensions[s];
                    if position >= in_sizes[axis] as i64 {
                        inside = false;
                        break;
                    }
                    in_index[axis] = position as usize;
                    k_index[dims.kernel_spatial_dimensions[s]] = *offset;
                }
                if !inside {
                    continue;
                }
                for kf in 0..kernel_in {
                    in_index[dims.input_feature_dimension] = group * kernel_in + kf;
                    k_index[dims.kernel_input_feature_dimension] = kf;
                    acc += input.data[ravel(&in_index, in_sizes)]
                        * kernel.data[ravel(&k_index, kernel_sizes)];
                }
            }
            Ok(acc)
        })
        .collect()
}

fn reduce(
    interceptor: &dyn CpuKernelInterceptor,
    input: &CpuTensor,
    init: f64,
    dimensions: &[usize],
    body: &Computation,
    out_sizes: &[usize],
) -> BackendResult<Vec<f64>> {
    let dtype = input.dtype();
    let in_sizes = input.sizes();
    let kept: Vec<usize> = (0..in_sizes.len()).filter(|d| !dimensions.contains(d)).collect();
    let count: usize = out_sizes.iter().product();
    let mut acc = vec![init; count];
    for flat in 0..input.data.len() {
        let index = unravel(flat, in_sizes);
        let out: Index = kept.iter().map(|d| index[*d]).collect();
        let slot = ravel(&out, out_sizes);
        acc[slot] = apply_binary_body(interceptor, body, dtype, acc[slot], input.data[flat])?;
    }
    Ok(acc)
}

/// Folds every window of `input`; padded positions contribute `init`.
fn windowed(
    input: &CpuTensor,
    window: &WindowSpec,
    out_sizes: &[usize],
    init: f64,
    mut fold: impl FnMut(f64, f64) -> BackendResult<f64>,
) -> BackendResult<Vec<f64>> {
    let in_sizes = input.sizes();
    let window_count: usize = window.dimensions.iter().product();
    let count: usize = out_sizes.iter().product();
    let mut out = Vec::with_capacity(count);
    for flat in 0..count {
        let out_index = unravel(flat, out_sizes);
        let mut acc = init;
        for offset in 0..window_count {
            let offsets = unravel(offset, &window.dimensions);
            let value = window_position(&out_index, &offsets, window, in_sizes)
                .map(|position| input.data[ravel(&position, in_sizes)])
                .unwrap_or(init);
            acc = fold(acc, value)?;
        }
        out.push(acc);
    }
    Ok(out)
}

fn window_position(
    out_index: &[usize],
    offsets: &[usize],
    window: &WindowSpec,
    in_sizes: &[usize],
) -> Option<Index> {
    let mut position: Index = SmallVec::with_capacity(in_sizes.len());
    for axis in 0..in_sizes.len() {
        let p = (out_index[axis] * window.strides[axis] + offsets[axis]) as i64
            - window.padding[axis].0;
        if p < 0 || p >= in_sizes[axis] as i64 {
            return None;
        }
        position.push(p as usize);
    }
    Some(position)
}

fn select_and_scatter(
    interceptor: &dyn CpuKernelInterceptor,
    input: &CpuTensor,
    source: &CpuTensor,
    init: f64,
    window: &WindowSpec,
    select: &Computation,
    scatter: &Computation,
) -> BackendResult<Vec<f64>> {
    let dtype = input.dtype();
    let in_sizes = input.sizes();
    let window_count: usize = window.dimensions.iter().product();
    let mut out = vec![init; input.data.len()];
    for flat in 0..source.data.len() {
        let out_index = unravel(flat, source.sizes());
        let mut chosen: Option<usize> = None;
        for offset in 0..window_count {
            let offsets = unravel(offset, &window.dimensions);
            let Some(position) = window_position(&out_index, &offsets, window, in_sizes) else {
                continue;
            };
            let candidate = ravel(&position, in_sizes);
            chosen = match chosen {
                None => Some(candidate),
                Some(current) => {
                    let keep = scalar_result(call_scalars(
                        interceptor,
                        select,
                        &[(dtype, input.data[current]), (dtype, input.data[candidate])],
                    )?)?;
                    if keep != 0.0 {
                        Some(current)
                    } else {
                        Some(candidate)
                    }
                }
            };
        }
        if let Some(slot) = chosen {
            out[slot] =
                apply_binary_body(interceptor, scatter, dtype, out[slot], source.data[flat])?;
        }
    }
    Ok(out)
}

fn triangular_solve(
    a: &CpuTensor,
    b: &CpuTensor,
    spec: &TriangularSolveSpec,
) -> BackendResult<Vec<f64>> {
    let a_sizes = a.sizes();
    let b_sizes = b.sizes();
    let rank = a_sizes.len();
    let n = a_sizes[rank - 1];
    let (rows, cols) = (b_sizes[rank - 2], b_sizes[rank - 1]);
    let batches: usize = a_sizes[..rank - 2].iter().product();
    let transposed = spec.transpose_a != TransposeKind::NoTranspose;
    let mut out = vec![0.0; b.data.len()];
    for batch in 0..batches {
        let a_base = batch * n * n;
        let b_base = batch * rows * cols;
        let entry = |row: usize, col: usize| -> f64 {
            let (r, c) = if transposed { (col, row) } else { (row, col) };
            let in_triangle = if spec.lower { c <= r } else { c >= r };
            if r == c && spec.unit_diagonal {
                1.0
            } else if in_triangle {
                a.data[a_base + r * n + c]
            } else {
                0.0
            }
        };
        let effective_lower = spec.lower != transposed;
        if spec.left_side {
            // op(a) x = b, one column at a time.
            for col in 0..cols {
                let order: Vec<usize> = if effective_lower {
                    (0..n).collect()
                } else {
                    (0..n).rev().collect()
                };
                for &row in &order {
                    let mut sum = b.data[b_base + row * cols + col];
                    for k in 0..n {
                        if k != row {
                            sum -= entry(row, k) * out[b_base + k * cols + col];
                        }
                    }
                    out[b_base + row * cols + col] = sum / entry(row, row);
                }
            }
        } else {
            // x op(a) = b, one row at a time.
            for row in 0..rows {
                let order: Vec<usize> = if effective_lower {
                    (0..n).rev().collect()
                } else {
                    (0..n).collect()
                };
                for &col in &order {
                    let mut sum = b.data[b_base + row * cols + col];
                    for k in 0..n {
                        if k != col {
                            sum -= out[b_base + row * cols + k] * entry(k, col);
                        }
                    }
                    out[b_base + row * cols + col] = sum / entry(col, col);
                }
            }
        }
    }
    Ok(out)
}

fn sort(
    interceptor: &dyn CpuKernelInterceptor,
    operands: &[&CpuTensor],
    dimension: usize,
    comparator: &Computation,
    shape: &Shape,
) -> BackendResult<Value> {
    let sizes = operands[0].sizes().to_vec();
    let extent = sizes[dimension];
    let stride = strides(&sizes)[dimension];
    let mut outputs: Vec<Vec<f64>> = operands.iter().map(|t| t.data.to_vec()).collect();
    let failure: RefCell<Option<BackendError>> = RefCell::new(None);
    let less = |i: usize, j: usize| -> bool {
        if failure.borrow().is_some() {
            return false;
        }
        let scalars: Vec<(DType, f64)> = operands
            .iter()
            .flat_map(|t| [(t.dtype(), t.data[i]), (t.dtype(), t.data[j])])
            .collect();
        match call_scalars(interceptor, comparator, &scalars).and_then(scalar_result) {
            Ok(value) => value != 0.0,
            Err(err) => {
                *failure.borrow_mut() = Some(err);
                false
            }
        }
    };
    let total: usize = sizes.iter().product();
    for base in 0..total {
        if unravel(base, &sizes)[dimension] != 0 {
            continue;
        }
        let positions: Vec<usize> = (0..extent).map(|k| base + k * stride).collect();
        let mut order = positions.clone();
        order.sort_by(|i, j| {
            if less(*i, *j) {
                Ordering::Less
            } else if less(*j, *i) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });
        for (target, source) in positions.iter().zip(&order) {
            for (output, operand) in outputs.iter_mut().zip(operands) {
                output[*target] = operand.data[*source];
            }
        }
    }
    if let Some(err) = failure.into_inner() {
        return Err(err);
    }
    let values = outputs
        .into_iter()
        .zip(operands)
        .map(|(data, operand)| Ok(Value::Tensor(CpuTensor::new(operand.shape.clone(), data)?)))
        .collect::<BackendResult<Vec<_>>>()?;
    if shape.is_tuple() {
        Ok(Value::Tuple(values))
    } else {
        values
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::execution("sort produced no output"))
    }
}
