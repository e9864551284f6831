#![forbid(unsafe_code)]

mod adagrad;
mod conf;
mod engine;
mod rmsprop;
mod sgd;
mod state;

use std::fmt;

use gs_core::{DType, Device, ExecutionMode};
use gs_runtime::{EvidenceEntry, EvidenceLedger};
use gs_tensor::{Tensor, TensorError};

pub use adagrad::AdaGrad;
pub use conf::{OptimizerConf, OptimizerKind, ParamSpec};
pub use rmsprop::RmsProp;
pub use sgd::Sgd;
pub use state::ParamStates;

#[derive(Debug, Clone, PartialEq)]
pub enum OptimError {
    Unconfigured {
        optimizer: &'static str,
    },
    InvalidConfig {
        reason: &'static str,
    },
    InvalidLearningRate {
        lr: f64,
    },
    ShapeMismatch {
        param: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    DeviceMismatch {
        param: String,
        expected: Device,
        actual: Device,
    },
    DTypeMismatch {
        param: String,
        expected: DType,
        actual: DType,
    },
    NonFiniteGradient {
        param: String,
    },
    ConfigDecode {
        diagnostic: String,
    },
    UnknownOptimizer {
        name: String,
    },
    Tensor(TensorError),
}

impl fmt::Display for OptimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured { optimizer } => {
                write!(f, "{optimizer} used before setup")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid optimizer config: {reason}"),
            Self::InvalidLearningRate { lr } => {
                write!(f, "learning rate must be finite and non-negative, got {lr}")
            }
            Self::ShapeMismatch {
                param,
                expected,
                actual,
            } => write!(
                f,
                "shape mismatch for '{param}': expected={expected:?}, actual={actual:?}"
            ),
            Self::DeviceMismatch {
                param,
                expected,
                actual,
            } => write!(
                f,
                "device mismatch for '{param}': expected={expected}, actual={actual}"
            ),
            Self::DTypeMismatch {
                param,
                expected,
                actual,
            } => write!(
                f,
                "dtype mismatch for '{param}': expected={expected:?}, actual={actual:?}"
            ),
            Self::NonFiniteGradient { param } => {
                write!(f, "non-finite gradient for '{param}'")
            }
            Self::ConfigDecode { diagnostic } => {
                write!(f, "optimizer config decode failed: {diagnostic}")
            }
            Self::UnknownOptimizer { name } => write!(f, "unknown optimizer '{name}'"),
            Self::Tensor(error) => write!(f, "tensor failure: {error}"),
        }
    }
}

impl std::error::Error for OptimError {}

impl From<TensorError> for OptimError {
    fn from(value: TensorError) -> Self {
        Self::Tensor(value)
    }
}

/// Trait for per-parameter-id optimizers.
///
/// Callers configure once with [`Optimizer::setup`], optionally attach
/// [`ParamSpec`] multipliers, then call [`Optimizer::apply`] once per
/// parameter per training step. State is keyed by the parameter id string.
pub trait Optimizer {
    fn name(&self) -> &'static str;

    /// Install hyperparameters. Calling it again replaces the configuration
    /// and keeps every accumulated state entry.
    fn setup(&mut self, conf: OptimizerConf) -> Result<(), OptimError>;

    fn conf(&self) -> Option<&OptimizerConf>;

    /// Attach learning-rate and decay multipliers to one parameter id.
    fn register(&mut self, param: &str, spec: ParamSpec) -> Result<(), OptimError>;

    /// Update `value` in place from `grad` for the parameter named `param`.
    ///
    /// `grad` and `value` must agree in shape, dtype and device. On error,
    /// neither `value` nor the optimizer state for `param` is modified.
    fn apply(
        &mut self,
        step: u64,
        lr: f64,
        param: &str,
        grad: &Tensor,
        value: &mut Tensor,
    ) -> Result<(), OptimError>;

    /// The per-parameter accumulator, if one has been allocated.
    fn state(&self, param: &str) -> Option<&Tensor>;

    fn set_mode(&mut self, mode: ExecutionMode);

    fn mode(&self) -> ExecutionMode;

    fn ledger(&self) -> &EvidenceLedger;

    /// Mutable access for resizing or clearing the bounded ledger.
    fn ledger_mut(&mut self) -> &mut EvidenceLedger;

    /// Takes every held ledger entry, leaving the ledger empty.
    fn drain_ledger(&mut self) -> Vec<EvidenceEntry> {
        self.ledger_mut().drain()
    }

    fn is_configured(&self) -> bool {
        self.conf().is_some()
    }
}

/// Constructs and configures an optimizer by kind.
pub fn build_optimizer(
    kind: OptimizerKind,
    conf: OptimizerConf,
    mode: ExecutionMode,
) -> Result<Box<dyn Optimizer + Send>, OptimError> {
    let mut optimizer: Box<dyn Optimizer + Send> = match kind {
        OptimizerKind::Sgd => Box::new(Sgd::with_mode(mode)),
        OptimizerKind::AdaGrad => Box::new(AdaGrad::with_mode(mode)),
        OptimizerKind::RmsProp => Box::new(RmsProp::with_mode(mode)),
    };
    optimizer.setup(conf)?;
    Ok(optimizer)
}
