use std::sync::Arc;

use half::{bf16, f16};
use shapejit::backend::computation::Computation;
use shapejit::backend::literal::Element;
use shapejit::backend::spec::{
    BackendError, BackendResult, DType, PortableBackend, Shape, TensorLiteral,
};

use crate::interp::{self, Value};

/// Host tensor with every element widened to `f64`.
///
/// Values are kept normalized to the tensor's dtype: integers are wrapped to their width,
/// predicates are `0.0`/`1.0` and narrow floats carry their rounded value.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuTensor {
    pub shape: Shape,
    pub data: Arc<[f64]>,
}

impl CpuTensor {
    pub fn new(shape: Shape, data: Vec<f64>) -> BackendResult<Self> {
        if shape.is_tuple() {
            return Err(BackendError::execution(format!(
                "cpu tensors cannot have tuple shape {shape}"
            )));
        }
        if shape.element_count() != data.len() {
            return Err(BackendError::execution(format!(
                "{shape} holds {} elements, got {}",
                shape.element_count(),
                data.len()
            )));
        }
        Ok(CpuTensor {
            shape,
            data: Arc::from(data),
        })
    }

    pub fn scalar(dtype: DType, value: f64) -> Self {
        CpuTensor {
            shape: Shape::scalar(dtype),
            data: Arc::from(vec![normalize(dtype, value)]),
        }
    }

    pub fn dtype(&self) -> DType {
        self.shape.dtype()
    }

    pub fn sizes(&self) -> &[usize] {
        self.shape.sizes()
    }
}

fn wrap_int(value: f64) -> i64 {
    if value.is_nan() {
        0
    } else {
        value.trunc() as i64
    }
}

/// Rounds or wraps `value` into the value set of `dtype`.
pub(crate) fn normalize(dtype: DType, value: f64) -> f64 {
    match dtype {
        DType::Pred => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        DType::S8 => wrap_int(value) as i8 as f64,
        DType::S16 => wrap_int(value) as i16 as f64,
        DType::S32 => wrap_int(value) as i32 as f64,
        DType::S64 => wrap_int(value) as f64,
        DType::U8 => wrap_int(value) as u8 as f64,
        DType::U16 => wrap_int(value) as u16 as f64,
        DType::U32 => wrap_int(value) as u32 as f64,
        DType::U64 => {
            if value >= 0.0 {
                value.trunc() as u64 as f64
            } else {
                wrap_int(value) as u64 as f64
            }
        }
        DType::F16 => f16::from_f64(value).to_f64(),
        DType::Bf16 => bf16::from_f64(value).to_f64(),
        DType::F32 => value as f32 as f64,
        DType::F64 | DType::C64 | DType::C128 => value,
    }
}

fn decode<E: Element>(
    literal: &TensorLiteral,
    widen: impl Fn(E) -> f64,
) -> BackendResult<Vec<f64>> {
    Ok(literal.to_elements::<E>()?.into_iter().map(widen).collect())
}

pub(crate) fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = match literal.shape.dtype() {
        DType::Pred => decode::<bool>(literal, |v| if v { 1.0 } else { 0.0 })?,
        DType::S8 => decode::<i8>(literal, f64::from)?,
        DType::S16 => decode::<i16>(literal, f64::from)?,
        DType::S32 => decode::<i32>(literal, f64::from)?,
        DType::S64 => decode::<i64>(literal, |v| v as f64)?,
        DType::U8 => decode::<u8>(literal, f64::from)?,
        DType::U16 => decode::<u16>(literal, f64::from)?,
        DType::U32 => decode::<u32>(literal, f64::from)?,
        DType::U64 => decode::<u64>(literal, |v| v as f64)?,
        DType::F16 => decode::<f16>(literal, f16::to_f64)?,
        DType::Bf16 => decode::<bf16>(literal, bf16::to_f64)?,
        DType::F32 => decode::<f32>(literal, f64::from)?,
        DType::F64 => decode::<f64>(literal, |v| v)?,
        dtype @ (DType::C64 | DType::C128) => {
            return Err(BackendError::unimplemented(
                "materialize",
                format!("{dtype} tensors are not supported by the reference backend"),
            ))
        }
    };
    CpuTensor::new(literal.shape.clone(), data)
}

fn encode<E: Element>(values: &[f64], narrow: impl Fn(f64) -> E) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * E::DTYPE.size_in_bytes());
    for value in values {
        narrow(*value).write_le(&mut bytes);
    }
    bytes
}

pub(crate) fn tensor_to_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    let values = tensor.data.as_ref();
    let bytes = match tensor.dtype() {
        DType::Pred => encode::<bool>(values, |v| v != 0.0),
        DType::S8 => encode::<i8>(values, |v| v as i8),
        DType::S16 => encode::<i16>(values, |v| v as i16),
        DType::S32 => encode::<i32>(values, |v| v as i32),
        DType::S64 => encode::<i64>(values, |v| v as i64),
        DType::U8 => encode::<u8>(values, |v| v as u8),
        DType::U16 => encode::<u16>(values, |v| v as u16),
        DType::U32 => encode::<u32>(values, |v| v as u32),
        DType::U64 => encode::<u64>(values, |v| v as u64),
        DType::F16 => encode::<f16>(values, f16::from_f64),
        DType::Bf16 => encode::<bf16>(values, bf16::from_f64),
        DType::F32 => encode::<f32>(values, |v| v as f32),
        DType::F64 => encode::<f64>(values, |v| v),
        dtype @ (DType::C64 | DType::C128) => {
            return Err(BackendError::unimplemented(
                "to_literal",
                format!("{dtype} tensors are not supported by the reference backend"),
            ))
        }
    };
    TensorLiteral::new(tensor.shape.clone(), Arc::from(bytes))
}

/// Hook that may take over evaluation of individual instructions.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        instruction: &shapejit::backend::Instruction,
        inputs: &[Value],
    ) -> Option<BackendResult<Value>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _instruction: &shapejit::backend::Instruction,
        _inputs: &[Value],
    ) -> Option<BackendResult<Value>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor + 'static> PortableBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-reference"
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        literal_to_tensor(&literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        tensor_to_literal(tensor)
    }

    fn invoke(
        &self,
        name: &str,
        computation: &Computation,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        if computation.num_parameters() != inputs.len() {
            return Err(BackendError::execution(format!(
                "'{name}' takes {} inputs, got {}",
                computation.num_parameters(),
                inputs.len()
            )));
        }
        for (index, (expected, input)) in computation.parameters().iter().zip(inputs).enumerate() {
            if expected.dtype() != input.dtype() || expected.sizes() != input.sizes() {
                return Err(BackendError::execution(format!(
                    "input {index} of '{name}' has shape {}, expected {expected}",
                    input.shape
                )));
            }
        }
        tracing::trace!(computation = name, instructions = computation.body().len(), "cpu invoke");
        let args: Vec<Value> = inputs.iter().cloned().map(Value::Tensor).collect();
        let root = interp::evaluate(self.interceptor.as_ref(), computation, args)?;
        match root {
            Value::Tensor(tensor) => Ok(vec![tensor]),
            Value::Tuple(elements) => elements
                .into_iter()
                .map(|element| match element {
                    Value::Tensor(tensor) => Ok(tensor),
                    Value::Tuple(_) => Err(BackendError::execution(format!(
                        "'{name}' returns a nested tuple, which cannot be flattened into handles"
                    ))),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapejit::backend::spec::{BinaryOp, Operation};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn add_computation() -> Computation {
        let shape = Shape::array(DType::S8, vec![3]);
        Computation::trace("add", &[shape.clone(), shape], |params| {
            params[0].add(&params[1])
        })
        .unwrap()
    }

    #[test]
    fn integer_results_wrap_to_their_width() {
        let backend = CpuPortableBackend::new();
        let lhs = backend
            .materialize(TensorLiteral::from_elements(&[3], &[100i8, -100, 1]).unwrap())
            .unwrap();
        let rhs = backend
            .materialize(TensorLiteral::from_elements(&[3], &[100i8, -100, 2]).unwrap())
            .unwrap();
        let outputs = backend.invoke("add", &add_computation(), &[lhs, rhs]).unwrap();
        let literal = backend.to_literal(&outputs[0]).unwrap();
        assert_eq!(literal.to_elements::<i8>().unwrap(), vec![-56, 56, 3]);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let backend = CpuPortableBackend::new();
        let wrong = CpuTensor::new(Shape::array(DType::S8, vec![2]), vec![0.0, 0.0]).unwrap();
        let err = backend.invoke("add", &add_computation(), &[wrong.clone(), wrong]).unwrap_err();
        assert!(err.to_string().contains("input 0"));
    }

    struct AddOverride {
        hits: AtomicUsize,
    }

    impl CpuKernelInterceptor for AddOverride {
        fn try_execute(
            &self,
            instruction: &shapejit::backend::Instruction,
            _inputs: &[Value],
        ) -> Option<BackendResult<Value>> {
            if !matches!(instruction.op, Operation::Binary(BinaryOp::Add)) {
                return None;
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            let zeros = vec![0.0; instruction.shape.element_count()];
            Some(CpuTensor::new(instruction.shape.clone(), zeros).map(Value::Tensor))
        }
    }

    #[test]
    fn interceptor_runs_before_the_interpreter() {
        let backend = GenericCpuBackend::with_interceptor(AddOverride {
            hits: AtomicUsize::new(0),
        });
        let input = CpuTensor::new(Shape::array(DType::S8, vec![3]), vec![1.0, 2.0, 3.0]).unwrap();
        let outputs = backend.invoke("add", &add_computation(), &[input.clone(), input]).unwrap();
        assert_eq!(outputs[0].data.as_ref(), &[0.0, 0.0, 0.0]);
        assert_eq!(backend.interceptor().hits.load(Ordering::SeqCst), 1);
    }
}
