#![forbid(unsafe_code)]

use std::fmt;

use gs_core::{Buffer, DType, Device, TensorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
    NotHostResident { device: Device },
    NotAnAccelerator { device: Device },
    TransferDTypeMismatch { expected: DType, actual: DType },
    TransferLengthMismatch { expected: usize, actual: usize },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected}, got {actual}")
            }
            Self::NotHostResident { device } => {
                write!(f, "buffer is resident on {device}; transfer it to the host first")
            }
            Self::NotAnAccelerator { device } => {
                write!(f, "{device} is not an accelerator device")
            }
            Self::TransferDTypeMismatch { expected, actual } => write!(
                f,
                "transfer dtype mismatch: expected {expected:?}, got {actual:?}"
            ),
            Self::TransferLengthMismatch { expected, actual } => write!(
                f,
                "transfer length mismatch: expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for DeviceError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn ensure_storage_device(&self, storage: &Storage) -> Result<(), DeviceError> {
        self.ensure(storage.device())
    }

    fn ensure(&self, actual: Device) -> Result<(), DeviceError> {
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }
}

pub fn ensure_same_device(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<Device, DeviceError> {
    let lhs_device = lhs.device();
    let rhs_device = rhs.device();
    if lhs_device != rhs_device {
        return Err(DeviceError::Mismatch {
            expected: lhs_device,
            actual: rhs_device,
        });
    }
    Ok(lhs_device)
}

/// Memory owned by an accelerator.
///
/// The contents are only reachable through kernel launches and explicit
/// downloads. Launches execute synchronously; when a launch returns its output
/// is committed on the same device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffer {
    device: Device,
    memory: Buffer,
}

impl DeviceBuffer {
    pub fn upload(device: Device, host: Buffer) -> Result<Self, DeviceError> {
        if device.is_host() {
            return Err(DeviceError::NotAnAccelerator { device });
        }
        Ok(Self {
            device,
            memory: host,
        })
    }

    pub fn zeros(device: Device, dtype: DType, len: usize) -> Result<Self, DeviceError> {
        Self::upload(device, Buffer::zeros(dtype, len))
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.memory.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Copies the device contents into a fresh host buffer.
    #[must_use]
    pub fn download(&self) -> Buffer {
        self.memory.clone()
    }

    /// Overwrites the device contents from a host buffer of the same dtype and length.
    pub fn write_from_host(&mut self, host: Buffer) -> Result<(), DeviceError> {
        ensure_transfer_shape(&self.memory, &host)?;
        self.memory = host;
        Ok(())
    }

    pub fn launch_unary<E>(
        &self,
        kernel: impl FnOnce(&Buffer) -> Result<Buffer, E>,
    ) -> Result<Self, E> {
        let memory = kernel(&self.memory)?;
        Ok(Self {
            device: self.device,
            memory,
        })
    }

    pub fn launch_binary<E>(
        &self,
        rhs: &Self,
        kernel: impl FnOnce(&Buffer, &Buffer) -> Result<Buffer, E>,
    ) -> Result<Self, E>
    where
        E: From<DeviceError>,
    {
        if rhs.device != self.device {
            return Err(E::from(DeviceError::Mismatch {
                expected: self.device,
                actual: rhs.device,
            }));
        }
        let memory = kernel(&self.memory, &rhs.memory)?;
        Ok(Self {
            device: self.device,
            memory,
        })
    }

    /// Runs a reduction on the device and reads the scalar result back.
    pub fn launch_reduce<R, E>(&self, kernel: impl FnOnce(&Buffer) -> Result<R, E>) -> Result<R, E> {
        kernel(&self.memory)
    }
}

fn ensure_transfer_shape(current: &Buffer, incoming: &Buffer) -> Result<(), DeviceError> {
    if current.dtype() != incoming.dtype() {
        return Err(DeviceError::TransferDTypeMismatch {
            expected: current.dtype(),
            actual: incoming.dtype(),
        });
    }
    if current.len() != incoming.len() {
        return Err(DeviceError::TransferLengthMismatch {
            expected: current.len(),
            actual: incoming.len(),
        });
    }
    Ok(())
}

/// A tensor buffer together with its residency.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Host(Buffer),
    Accelerator(DeviceBuffer),
}

impl Storage {
    pub fn zeros(device: Device, dtype: DType, len: usize) -> Result<Self, DeviceError> {
        if device.is_host() {
            return Ok(Self::Host(Buffer::zeros(dtype, len)));
        }
        Ok(Self::Accelerator(DeviceBuffer::zeros(device, dtype, len)?))
    }

    #[must_use]
    pub fn device(&self) -> Device {
        match self {
            Self::Host(_) => Device::Cpu,
            Self::Accelerator(buffer) => buffer.device(),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Host(buffer) => buffer.dtype(),
            Self::Accelerator(buffer) => buffer.dtype(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Host(buffer) => buffer.len(),
            Self::Accelerator(buffer) => buffer.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn host_view(&self) -> Result<&Buffer, DeviceError> {
        match self {
            Self::Host(buffer) => Ok(buffer),
            Self::Accelerator(buffer) => Err(DeviceError::NotHostResident {
                device: buffer.device(),
            }),
        }
    }

    /// Overwrites the contents from host memory, uploading when the storage
    /// is accelerator-resident.
    pub fn write_from_host(&mut self, host: Buffer) -> Result<(), DeviceError> {
        match self {
            Self::Host(current) => {
                ensure_transfer_shape(current, &host)?;
                *current = host;
                Ok(())
            }
            Self::Accelerator(buffer) => buffer.write_from_host(host),
        }
    }

    /// Moves the storage to `target`. Accelerator-to-accelerator moves are
    /// staged through host memory.
    pub fn transfer(self, target: Device) -> Result<Self, DeviceError> {
        if self.device() == target {
            return Ok(self);
        }
        let staged = match self {
            Self::Host(buffer) => buffer,
            Self::Accelerator(buffer) => buffer.download(),
        };
        if target.is_host() {
            return Ok(Self::Host(staged));
        }
        Ok(Self::Accelerator(DeviceBuffer::upload(target, staged)?))
    }
}
