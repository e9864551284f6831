use gs_core::ExecutionMode;
use gs_runtime::EvidenceLedger;
use gs_tensor::Tensor;

use crate::engine::{Applied, OptimizerCore};
use crate::state::ParamStates;
use crate::{OptimError, Optimizer, OptimizerConf, ParamSpec};

/// Stochastic gradient descent with optional momentum.
///
/// With `momentum == 0` the update is `value -= lr * grad` and no state is
/// kept. Otherwise a velocity tensor is kept per parameter id:
/// `velocity = velocity * momentum + lr * grad; value -= velocity`.
#[derive(Debug, Clone)]
pub struct Sgd {
    core: OptimizerCore,
    velocity: ParamStates,
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new()
    }
}

impl Sgd {
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Strict)
    }

    #[must_use]
    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            core: OptimizerCore::new("sgd", mode),
            velocity: ParamStates::new("velocity"),
        }
    }

    #[must_use]
    pub fn velocity(&self, param: &str) -> Option<&Tensor> {
        self.velocity.get(param)
    }

    fn try_apply(
        &mut self,
        lr: f64,
        param: &str,
        grad: &Tensor,
        value: &mut Tensor,
    ) -> Result<Applied, OptimError> {
        let Some(prepared) = self.core.prepare(lr, param, grad, value)? else {
            return Ok(Applied::Frozen);
        };
        let scaled = prepared.grad.mul_scalar(prepared.lr)?;
        let momentum = prepared.conf.momentum;

        if momentum == 0.0 {
            let updated = value.sub(&scaled)?;
            value.copy_from(&updated)?;
            return Ok(Applied::Updated {
                state_allocated: None,
            });
        }

        let velocity = self
            .velocity
            .current(param, value)?
            .mul_scalar(momentum)?
            .add(&scaled)?;
        let updated = value.sub(&velocity)?;

        value.copy_from(&updated)?;
        let allocated = self.velocity.commit(param, velocity);
        Ok(Applied::Updated {
            state_allocated: allocated.then_some(self.velocity.slot()),
        })
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn setup(&mut self, conf: OptimizerConf) -> Result<(), OptimError> {
        self.core.setup(conf, self.velocity.len())
    }

    fn conf(&self) -> Option<&OptimizerConf> {
        self.core.conf()
    }

    fn register(&mut self, param: &str, spec: ParamSpec) -> Result<(), OptimError> {
        self.core.register(param, spec)
    }

    fn apply(
        &mut self,
        step: u64,
        lr: f64,
        param: &str,
        grad: &Tensor,
        value: &mut Tensor,
    ) -> Result<(), OptimError> {
        let outcome = self.try_apply(lr, param, grad, value);
        self.core.finish(step, lr, param, value, outcome)
    }

    fn state(&self, param: &str) -> Option<&Tensor> {
        self.velocity(param)
    }

    fn set_mode(&mut self, mode: ExecutionMode) {
        self.core.set_mode(mode);
    }

    fn mode(&self) -> ExecutionMode {
        self.core.runtime().mode()
    }

    fn ledger(&self) -> &EvidenceLedger {
        self.core.runtime().ledger()
    }

    fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        self.core.runtime_mut().ledger_mut()
    }
}
