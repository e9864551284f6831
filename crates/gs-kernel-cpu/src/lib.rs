#![forbid(unsafe_code)]

use std::fmt;

use gs_core::{Buffer, DType, Element, TensorCompatError, TensorMeta, ensure_compatible};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Incompatible(TensorCompatError),
    ShapeMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    BufferDTypeMismatch {
        side: &'static str,
        meta: DType,
        buffer: DType,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incompatible(error) => write!(f, "incompatible tensors: {error}"),
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::BufferDTypeMismatch { side, meta, buffer } => write!(
                f,
                "buffer dtype mismatch on {side}: meta={meta:?}, buffer={buffer:?}"
            ),
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<TensorCompatError> for KernelError {
    fn from(value: TensorCompatError) -> Self {
        Self::Incompatible(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn eval<T: Element>(self, lhs: T, rhs: T) -> T {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Square,
    Sqrt,
}

impl UnaryOp {
    fn eval<T: Element>(self, value: T) -> T {
        match self {
            Self::Square => value * value,
            Self::Sqrt => value.sqrt(),
        }
    }
}

/// Tensor-with-scalar ops. The scalar is converted to the tensor's element
/// type before the op runs, so an `F32` tensor sees an `f32` scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    Mul,
    Add,
}

impl ScalarOp {
    fn eval<T: Element>(self, value: T, scalar: T) -> T {
        match self {
            Self::Mul => value * scalar,
            Self::Add => value + scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    SumSquares,
    AllFinite,
}

fn ensure_meta_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), KernelError> {
    ensure_compatible(lhs, rhs)?;

    if lhs.shape() != rhs.shape() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }

    Ok(())
}

fn ensure_buffer_matches(
    buffer: &Buffer,
    meta: &TensorMeta,
    side: &'static str,
) -> Result<(), KernelError> {
    if buffer.dtype() != meta.dtype() {
        return Err(KernelError::BufferDTypeMismatch {
            side,
            meta: meta.dtype(),
            buffer: buffer.dtype(),
        });
    }
    let needed = meta.numel();
    if buffer.len() < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: buffer.len(),
        });
    }
    Ok(())
}

fn zip_map<T: Element>(lhs: &[T], rhs: &[T], numel: usize, op: BinaryOp) -> Vec<T> {
    lhs[..numel]
        .iter()
        .zip(rhs[..numel].iter())
        .map(|(left, right)| op.eval(*left, *right))
        .collect()
}

pub fn binary_contiguous(
    op: BinaryOp,
    lhs: &Buffer,
    rhs: &Buffer,
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Buffer, KernelError> {
    ensure_meta_compatible(lhs_meta, rhs_meta)?;
    ensure_buffer_matches(lhs, lhs_meta, "lhs")?;
    ensure_buffer_matches(rhs, rhs_meta, "rhs")?;

    let numel = lhs_meta.numel();
    match (lhs, rhs) {
        (Buffer::F32(left), Buffer::F32(right)) => {
            Ok(Buffer::F32(zip_map(left, right, numel, op)))
        }
        (Buffer::F64(left), Buffer::F64(right)) => {
            Ok(Buffer::F64(zip_map(left, right, numel, op)))
        }
        // Both buffers were checked against metas of equal dtype above.
        _ => Err(KernelError::Incompatible(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        })),
    }
}

pub fn unary_contiguous(
    op: UnaryOp,
    input: &Buffer,
    meta: &TensorMeta,
) -> Result<Buffer, KernelError> {
    ensure_buffer_matches(input, meta, "input")?;
    let numel = meta.numel();
    Ok(match input {
        Buffer::F32(values) => Buffer::F32(values[..numel].iter().map(|v| op.eval(*v)).collect()),
        Buffer::F64(values) => Buffer::F64(values[..numel].iter().map(|v| op.eval(*v)).collect()),
    })
}

fn scalar_map<T: Element>(values: &[T], scalar: f64, op: ScalarOp) -> Vec<T> {
    let scalar = T::from_f64(scalar);
    values.iter().map(|v| op.eval(*v, scalar)).collect()
}

pub fn scalar_contiguous(
    op: ScalarOp,
    input: &Buffer,
    meta: &TensorMeta,
    scalar: f64,
) -> Result<Buffer, KernelError> {
    ensure_buffer_matches(input, meta, "input")?;
    let numel = meta.numel();
    Ok(match input {
        Buffer::F32(values) => Buffer::F32(scalar_map(&values[..numel], scalar, op)),
        Buffer::F64(values) => Buffer::F64(scalar_map(&values[..numel], scalar, op)),
    })
}

fn reduce_values<T: Element>(values: &[T], op: ReduceOp) -> f64 {
    match op {
        ReduceOp::SumSquares => values
            .iter()
            .map(|v| {
                let v = v.to_f64();
                v * v
            })
            .sum(),
        ReduceOp::AllFinite => {
            if values.iter().all(|v| v.is_finite()) {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Reduces the buffer to a single `f64`; `AllFinite` yields 1.0 or 0.0.
pub fn reduce_contiguous(
    op: ReduceOp,
    input: &Buffer,
    meta: &TensorMeta,
) -> Result<f64, KernelError> {
    ensure_buffer_matches(input, meta, "input")?;
    let numel = meta.numel();
    Ok(match input {
        Buffer::F32(values) => reduce_values(&values[..numel], op),
        Buffer::F64(values) => reduce_values(&values[..numel], op),
    })
}
