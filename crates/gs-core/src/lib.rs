#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Where a tensor's buffer lives.
///
/// `Accelerator` carries the ordinal of the device inside its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Accelerator(u16),
}

impl Device {
    #[must_use]
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator(ordinal) => write!(f, "accel:{ordinal}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Strict,
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl TensorMeta {
    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        Self {
            shape,
            dtype,
            device,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Element count; a rank-0 shape holds one element.
    ///
    /// Saturates on overflow. Callers that allocate should go through
    /// [`TensorMeta::checked_numel`] first.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Element count, or `None` when the shape's product overflows `usize`.
    #[must_use]
    pub fn checked_numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs}, rhs={rhs}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Fixed-width float element stored in a [`Buffer`].
pub trait Element:
    Copy
    + PartialEq
    + fmt::Debug
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + sealed::Sealed
    + 'static
{
    const DTYPE: DType;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn sqrt(self) -> Self;
    fn is_finite(self) -> bool;

    fn view(buffer: &Buffer) -> Option<&[Self]>;
    fn wrap(values: Vec<Self>) -> Buffer;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    fn is_finite(self) -> bool {
        f32::is_finite(self)
    }

    fn view(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F32(values) => Some(values),
            Buffer::F64(_) => None,
        }
    }

    fn wrap(values: Vec<Self>) -> Buffer {
        Buffer::F32(values)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }

    fn view(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F64(values) => Some(values),
            Buffer::F32(_) => None,
        }
    }

    fn wrap(values: Vec<Self>) -> Buffer {
        Buffer::F64(values)
    }
}

/// Flat, contiguous, typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    #[must_use]
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    #[must_use]
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        T::wrap(values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

}
