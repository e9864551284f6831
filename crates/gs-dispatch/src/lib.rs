#![forbid(unsafe_code)]

use std::fmt;

use gs_core::{Device, TensorMeta};
use gs_device::{DeviceError, DeviceGuard, Storage, ensure_same_device};
use gs_kernel_cpu::{
    KernelError, binary_contiguous, reduce_contiguous, scalar_contiguous, unary_contiguous,
};

pub use gs_kernel_cpu::{BinaryOp, ReduceOp, ScalarOp, UnaryOp};

/// Backend selected for an op, derived from the operands' device tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKey {
    Cpu,
    Accelerator,
}

impl DispatchKey {
    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Accelerator(_) => Self::Accelerator,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Accelerator => "accelerator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Kernel(KernelError),
    Device(DeviceError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(error) => write!(f, "kernel dispatch failure: {error}"),
            Self::Device(error) => write!(f, "device dispatch failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

impl From<DeviceError> for DispatchError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

fn ensure_resident(storage: &Storage, meta: &TensorMeta) -> Result<(), DispatchError> {
    DeviceGuard::new(meta.device()).ensure_storage_device(storage)?;
    Ok(())
}

pub fn dispatch_binary(
    op: BinaryOp,
    lhs: &Storage,
    rhs: &Storage,
    lhs_meta: &TensorMeta,
    rhs_meta: &TensorMeta,
) -> Result<Storage, DispatchError> {
    ensure_same_device(lhs_meta, rhs_meta)?;
    ensure_resident(lhs, lhs_meta)?;
    ensure_resident(rhs, rhs_meta)?;

    match (lhs, rhs) {
        (Storage::Host(left), Storage::Host(right)) => Ok(Storage::Host(binary_contiguous(
            op, left, right, lhs_meta, rhs_meta,
        )?)),
        (Storage::Accelerator(left), Storage::Accelerator(right)) => {
            Ok(Storage::Accelerator(left.launch_binary(right, |l, r| {
                binary_contiguous(op, l, r, lhs_meta, rhs_meta).map_err(DispatchError::from)
            })?))
        }
        (left, right) => Err(DeviceError::Mismatch {
            expected: left.device(),
            actual: right.device(),
        }
        .into()),
    }
}

pub fn dispatch_unary(
    op: UnaryOp,
    input: &Storage,
    meta: &TensorMeta,
) -> Result<Storage, DispatchError> {
    ensure_resident(input, meta)?;
    Ok(match input {
        Storage::Host(buffer) => Storage::Host(unary_contiguous(op, buffer, meta)?),
        Storage::Accelerator(buffer) => Storage::Accelerator(
            buffer.launch_unary(|b| unary_contiguous(op, b, meta).map_err(DispatchError::from))?,
        ),
    })
}

pub fn dispatch_scalar(
    op: ScalarOp,
    input: &Storage,
    meta: &TensorMeta,
    scalar: f64,
) -> Result<Storage, DispatchError> {
    ensure_resident(input, meta)?;
    Ok(match input {
        Storage::Host(buffer) => Storage::Host(scalar_contiguous(op, buffer, meta, scalar)?),
        Storage::Accelerator(buffer) => Storage::Accelerator(buffer.launch_unary(|b| {
            scalar_contiguous(op, b, meta, scalar).map_err(DispatchError::from)
        })?),
    })
}

pub fn dispatch_reduce(
    op: ReduceOp,
    input: &Storage,
    meta: &TensorMeta,
) -> Result<f64, DispatchError> {
    ensure_resident(input, meta)?;
    match input {
        Storage::Host(buffer) => Ok(reduce_contiguous(op, buffer, meta)?),
        Storage::Accelerator(buffer) => {
            buffer.launch_reduce(|b| reduce_contiguous(op, b, meta).map_err(DispatchError::from))
        }
    }
}

#[cfg(test)]
mod tests {
    use gs_core::{Buffer, DType, Device, TensorMeta};
    use gs_device::{DeviceError, Storage};
    use gs_kernel_cpu::KernelError;

    use super::{
        BinaryOp, DispatchError, DispatchKey, ReduceOp, ScalarOp, UnaryOp,
        dispatch_binary, dispatch_reduce, dispatch_scalar, dispatch_unary,
    };

    const ACCEL: Device = Device::Accelerator(0);

    fn host_f32(values: Vec<f32>) -> (Storage, TensorMeta) {
        let meta = TensorMeta::from_shape(vec![values.len()], DType::F32, Device::Cpu);
        (Storage::Host(Buffer::from_vec(values)), meta)
    }

    fn on_accel(storage: Storage, meta: TensorMeta) -> (Storage, TensorMeta) {
        (
            storage.transfer(ACCEL).expect("upload"),
            meta.with_device(ACCEL),
        )
    }

    #[test]
    fn key_follows_device_tag() {
        assert_eq!(DispatchKey::for_device(Device::Cpu), DispatchKey::Cpu);
        assert_eq!(
            DispatchKey::for_device(Device::Accelerator(7)),
            DispatchKey::Accelerator
        );
    }

    #[test]
    fn host_binary_routes_to_cpu_kernel() {
        let (lhs, meta) = host_f32(vec![1.0, 2.0]);
        let (rhs, _) = host_f32(vec![3.0, 4.0]);

        let storage = dispatch_binary(BinaryOp::Add, &lhs, &rhs, &meta, &meta).expect("add");
        assert_eq!(storage, Storage::Host(Buffer::from_vec(vec![4.0f32, 6.0])));
    }

    #[test]
    fn accelerator_binary_stays_on_device() {
        let (lhs, meta) = host_f32(vec![8.0, 9.0]);
        let (rhs, _) = host_f32(vec![2.0, 3.0]);
        let (lhs, accel_meta) = on_accel(lhs, meta.clone());
        let (rhs, _) = on_accel(rhs, meta);

        let storage =
            dispatch_binary(BinaryOp::Div, &lhs, &rhs, &accel_meta, &accel_meta).expect("div");
        assert_eq!(storage.device(), ACCEL);
        assert!(storage.host_view().is_err());
        assert_eq!(
            storage.transfer(Device::Cpu).expect("download"),
            Storage::Host(Buffer::from_vec(vec![4.0f32, 3.0]))
        );
    }

    #[test]
    fn cross_device_operands_fail_closed() {
        let (lhs, meta) = host_f32(vec![1.0, 2.0]);
        let (rhs, accel_meta) = on_accel(lhs.clone(), meta.clone());

        let err = dispatch_binary(BinaryOp::Mul, &lhs, &rhs, &meta, &accel_meta)
            .expect_err("cross-device dispatch must fail");
        assert!(matches!(
            err,
            DispatchError::Device(DeviceError::Mismatch {
                expected: Device::Cpu,
                actual: Device::Accelerator(0)
            })
        ));
    }

    #[test]
    fn storage_that_disagrees_with_meta_is_rejected() {
        let (storage, meta) = host_f32(vec![1.0]);
        let lying_meta = meta.with_device(ACCEL);
        let err = dispatch_unary(UnaryOp::Sqrt, &storage, &lying_meta)
            .expect_err("residency drift must fail");
        assert!(matches!(err, DispatchError::Device(DeviceError::Mismatch { .. })));
    }

    #[test]
    fn kernel_errors_surface_through_dispatch() {
        let (lhs, lhs_meta) = host_f32(vec![1.0, 2.0]);
        let (rhs, rhs_meta) = host_f32(vec![1.0, 2.0, 3.0]);
        let err = dispatch_binary(BinaryOp::Sub, &lhs, &rhs, &lhs_meta, &rhs_meta)
            .expect_err("shape mismatch must fail");
        assert!(matches!(
            err,
            DispatchError::Kernel(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn unary_scalar_and_reduce_agree_across_backends() {
        let (host, meta) = host_f32(vec![1.0, 4.0, 9.0]);
        let (device, accel_meta) = on_accel(host.clone(), meta.clone());

        let host_sqrt = dispatch_unary(UnaryOp::Sqrt, &host, &meta).expect("host sqrt");
        let accel_sqrt = dispatch_unary(UnaryOp::Sqrt, &device, &accel_meta).expect("accel sqrt");
        assert_eq!(
            accel_sqrt.transfer(Device::Cpu).expect("download"),
            host_sqrt
        );

        let host_scaled =
            dispatch_scalar(ScalarOp::Mul, &host, &meta, 0.5).expect("host mul_scalar");
        let accel_scaled =
            dispatch_scalar(ScalarOp::Mul, &device, &accel_meta, 0.5).expect("accel mul_scalar");
        assert_eq!(
            accel_scaled.transfer(Device::Cpu).expect("download"),
            host_scaled
        );

        let host_sum = dispatch_reduce(ReduceOp::SumSquares, &host, &meta).expect("host reduce");
        let accel_sum =
            dispatch_reduce(ReduceOp::SumSquares, &device, &accel_meta).expect("accel reduce");
        assert_eq!(host_sum, 98.0);
        assert_eq!(accel_sum, host_sum);
    }
}
