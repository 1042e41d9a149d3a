//! Conversions between typed host slices and [`TensorLiteral`] byte buffers.

use std::sync::Arc;

use half::{bf16, f16};

use super::spec::{BackendError, BackendResult, DType, Shape, TensorLiteral};

/// Host scalar types that map one-to-one onto a [`DType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);

    /// Decodes one element from exactly `DTYPE.size_in_bytes()` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(
    i8 => S8,
    i16 => S16,
    i32 => S32,
    i64 => S64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f16 => F16,
    bf16 => Bf16,
    f32 => F32,
    f64 => F64,
);

impl Element for bool {
    const DTYPE: DType = DType::Pred;

    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl TensorLiteral {
    pub fn from_elements<E: Element>(sizes: &[usize], data: &[E]) -> BackendResult<Self> {
        let shape = Shape::array(E::DTYPE, sizes.to_vec());
        if shape.element_count() != data.len() {
            return Err(BackendError::execution(format!(
                "{shape} holds {} elements, got {}",
                shape.element_count(),
                data.len()
            )));
        }
        let mut bytes = Vec::with_capacity(shape.byte_len());
        for value in data {
            value.write_le(&mut bytes);
        }
        TensorLiteral::new(shape, Arc::from(bytes))
    }

    pub fn to_elements<E: Element>(&self) -> BackendResult<Vec<E>> {
        let dtype = self.shape.dtype();
        if dtype != E::DTYPE {
            return Err(BackendError::execution(format!(
                "literal holds {dtype} elements, requested {}",
                E::DTYPE
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(dtype.size_in_bytes())
            .map(E::read_le)
            .collect())
    }

    /// Rank-0 literal holding `value` converted to `dtype`.
    ///
    /// Complex dtypes receive `value` as the real part with a zero imaginary part.
    pub fn scalar(dtype: DType, value: f64) -> Self {
        let mut bytes = Vec::with_capacity(dtype.size_in_bytes());
        match dtype {
            DType::Pred => (value != 0.0).write_le(&mut bytes),
            DType::S8 => (value as i8).write_le(&mut bytes),
            DType::S16 => (value as i16).write_le(&mut bytes),
            DType::S32 => (value as i32).write_le(&mut bytes),
            DType::S64 => (value as i64).write_le(&mut bytes),
            DType::U8 => (value as u8).write_le(&mut bytes),
            DType::U16 => (value as u16).write_le(&mut bytes),
            DType::U32 => (value as u32).write_le(&mut bytes),
            DType::U64 => (value as u64).write_le(&mut bytes),
            DType::F16 => f16::from_f64(value).write_le(&mut bytes),
            DType::Bf16 => bf16::from_f64(value).write_le(&mut bytes),
            DType::F32 => (value as f32).write_le(&mut bytes),
            DType::F64 => value.write_le(&mut bytes),
            DType::C64 => {
                (value as f32).write_le(&mut bytes);
                0f32.write_le(&mut bytes);
            }
            DType::C128 => {
                value.write_le(&mut bytes);
                0f64.write_le(&mut bytes);
            }
        }
        TensorLiteral {
            shape: Shape::scalar(dtype),
            bytes: Arc::from(bytes),
        }
    }
}
