#![forbid(unsafe_code)]

use std::fmt;

use gs_core::{Buffer, DType, Device, Element, TensorMeta};
use gs_device::{DeviceError, Storage};
use gs_dispatch::{
    BinaryOp, DispatchError, DispatchKey, ReduceOp, ScalarOp, UnaryOp,
    dispatch_binary, dispatch_reduce, dispatch_scalar, dispatch_unary,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DeviceMismatch {
        expected: Device,
        actual: Device,
    },
    DTypeMismatch {
        expected: DType,
        actual: DType,
    },
    NotHostResident {
        device: Device,
    },
    /// The shape's element count or byte size does not fit in memory.
    ShapeTooLarge {
        shape: Vec<usize>,
    },
    Device(DeviceError),
    Dispatch(DispatchError),
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { expected, actual } => {
                write!(f, "shape mismatch: expected={expected:?}, actual={actual:?}")
            }
            Self::DeviceMismatch { expected, actual } => {
                write!(f, "device mismatch: expected={expected}, actual={actual}")
            }
            Self::DTypeMismatch { expected, actual } => {
                write!(f, "dtype mismatch: expected={expected:?}, actual={actual:?}")
            }
            Self::NotHostResident { device } => {
                write!(f, "tensor is resident on {device}; call to_host() before reading")
            }
            Self::ShapeTooLarge { shape } => {
                write!(f, "shape {shape:?} is too large to allocate")
            }
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
        }
    }
}

impl std::error::Error for TensorError {}

impl From<DeviceError> for TensorError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::NotHostResident { device } => Self::NotHostResident { device },
            DeviceError::Mismatch { expected, actual } => Self::DeviceMismatch { expected, actual },
            other => Self::Device(other),
        }
    }
}

impl From<DispatchError> for TensorError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Device(error) => Self::from(error),
            other => Self::Dispatch(other),
        }
    }
}

/// Dense, contiguous N-dimensional array with a device placement.
///
/// Every elementwise op checks shape, dtype and device up front and then
/// routes to the backend named by the device tag; no operand is ever reshaped
/// or moved implicitly. `Clone` is a deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    meta: TensorMeta,
    storage: Storage,
    version: u64,
}

impl Tensor {
    /// Zero-filled `F32` tensor on the host.
    pub fn new(shape: impl Into<Vec<usize>>) -> Result<Self, TensorError> {
        Self::zeros(shape, DType::F32, Device::Cpu)
    }

    /// Zero-filled tensor. Shapes whose element count or byte size overflows
    /// are rejected before anything is allocated.
    pub fn zeros(
        shape: impl Into<Vec<usize>>,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorError> {
        let meta = TensorMeta::from_shape(shape.into(), dtype, device);
        let numel = allocatable_numel(&meta).ok_or_else(|| TensorError::ShapeTooLarge {
            shape: meta.shape().to_vec(),
        })?;
        let storage = Storage::zeros(device, dtype, numel)?;
        Ok(Self {
            meta,
            storage,
            version: 0,
        })
    }

    pub fn zeros_like(other: &Self) -> Result<Self, TensorError> {
        Self::zeros(other.shape().to_vec(), other.dtype(), other.device())
    }

    pub fn from_host<T: Element>(
        shape: impl Into<Vec<usize>>,
        values: &[T],
        device: Device,
    ) -> Result<Self, TensorError> {
        let mut tensor = Self::zeros(shape, T::DTYPE, device)?;
        tensor.copy_from_host(values)?;
        tensor.version = 0;
        Ok(tensor)
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.meta.device()
    }

    #[must_use]
    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey::for_device(self.device())
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.meta.numel()
    }

    /// Bumped on every in-place mutation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn is_host_resident(&self) -> bool {
        self.device().is_host()
    }

    /// Overwrites every element from a flat host slice. `values.len()` must
    /// equal the element count implied by the shape.
    pub fn copy_from_host<T: Element>(&mut self, values: &[T]) -> Result<(), TensorError> {
        if T::DTYPE != self.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: T::DTYPE,
            });
        }
        if values.len() != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: vec![values.len()],
            });
        }
        self.storage.write_from_host(Buffer::from_vec(values.to_vec()))?;
        self.bump_version();
        Ok(())
    }

    /// Overwrites this tensor's contents with `src`, which must share shape,
    /// dtype and device.
    pub fn copy_from(&mut self, src: &Self) -> Result<(), TensorError> {
        self.ensure_same_layout(src)?;
        self.storage = src.storage.clone();
        self.bump_version();
        Ok(())
    }

    pub fn data<T: Element>(&self) -> Result<&[T], TensorError> {
        let buffer = self.storage.host_view()?;
        buffer
            .as_slice::<T>()
            .ok_or(TensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: T::DTYPE,
            })
    }

    /// Moves the buffer into host memory. Other tensors, including clones,
    /// keep their own placement.
    pub fn to_host(&mut self) -> Result<(), TensorError> {
        self.to_device(Device::Cpu)
    }

    pub fn to_device(&mut self, device: Device) -> Result<(), TensorError> {
        if self.device() == device {
            return Ok(());
        }
        self.storage = self.storage.clone().transfer(device)?;
        self.meta = self.meta.clone().with_device(device);
        Ok(())
    }

    pub fn add(&self, rhs: &Self) -> Result<Self, TensorError> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self, TensorError> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self, TensorError> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self, TensorError> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn square(&self) -> Result<Self, TensorError> {
        self.unary(UnaryOp::Square)
    }

    pub fn sqrt(&self) -> Result<Self, TensorError> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn mul_scalar(&self, scalar: f64) -> Result<Self, TensorError> {
        self.scalar(ScalarOp::Mul, scalar)
    }

    pub fn add_scalar(&self, scalar: f64) -> Result<Self, TensorError> {
        self.scalar(ScalarOp::Add, scalar)
    }

    pub fn add_(&mut self, rhs: &Self) -> Result<(), TensorError> {
        let out = self.binary(BinaryOp::Add, rhs)?;
        self.commit(out);
        Ok(())
    }

    pub fn sub_(&mut self, rhs: &Self) -> Result<(), TensorError> {
        let out = self.binary(BinaryOp::Sub, rhs)?;
        self.commit(out);
        Ok(())
    }

    pub fn mul_(&mut self, rhs: &Self) -> Result<(), TensorError> {
        let out = self.binary(BinaryOp::Mul, rhs)?;
        self.commit(out);
        Ok(())
    }

    pub fn div_(&mut self, rhs: &Self) -> Result<(), TensorError> {
        let out = self.binary(BinaryOp::Div, rhs)?;
        self.commit(out);
        Ok(())
    }

    pub fn mul_scalar_(&mut self, scalar: f64) -> Result<(), TensorError> {
        let out = self.scalar(ScalarOp::Mul, scalar)?;
        self.commit(out);
        Ok(())
    }

    pub fn add_scalar_(&mut self, scalar: f64) -> Result<(), TensorError> {
        let out = self.scalar(ScalarOp::Add, scalar)?;
        self.commit(out);
        Ok(())
    }

    /// Sum of squared elements, accumulated in `f64`.
    pub fn sum_squares(&self) -> Result<f64, TensorError> {
        Ok(dispatch_reduce(
            ReduceOp::SumSquares,
            &self.storage,
            &self.meta,
        )?)
    }

    pub fn all_finite(&self) -> Result<bool, TensorError> {
        let flag = dispatch_reduce(ReduceOp::AllFinite, &self.storage, &self.meta)?;
        Ok(flag != 0.0)
    }

    /// Checks that `other` can take part in an elementwise op with `self`.
    pub fn ensure_same_layout(&self, other: &Self) -> Result<(), TensorError> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }
        if self.device() != other.device() {
            return Err(TensorError::DeviceMismatch {
                expected: self.device(),
                actual: other.device(),
            });
        }
        if self.dtype() != other.dtype() {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: other.dtype(),
            });
        }
        Ok(())
    }

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self, TensorError> {
        self.ensure_same_layout(rhs)?;
        let storage = dispatch_binary(op, &self.storage, &rhs.storage, &self.meta, &rhs.meta)?;
        Ok(self.derive(storage))
    }

    fn unary(&self, op: UnaryOp) -> Result<Self, TensorError> {
        let storage = dispatch_unary(op, &self.storage, &self.meta)?;
        Ok(self.derive(storage))
    }

    fn scalar(&self, op: ScalarOp, scalar: f64) -> Result<Self, TensorError> {
        let storage = dispatch_scalar(op, &self.storage, &self.meta, scalar)?;
        Ok(self.derive(storage))
    }

    /// A fresh tensor with this layout over an op's output storage.
    fn derive(&self, storage: Storage) -> Self {
        Self {
            meta: self.meta.clone(),
            storage,
            version: 0,
        }
    }

    fn commit(&mut self, out: Self) {
        self.storage = out.storage;
        self.bump_version();
    }

    fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }
}

fn allocatable_numel(meta: &TensorMeta) -> Option<usize> {
    let numel = meta.checked_numel()?;
    let bytes = numel.checked_mul(meta.dtype().size_bytes())?;
    (bytes <= isize::MAX.unsigned_abs()).then_some(numel)
}
