use gs_core::ExecutionMode;
use gs_runtime::EvidenceLedger;
use gs_tensor::Tensor;

use crate::engine::{Applied, OptimizerCore};
use crate::state::ParamStates;
use crate::{OptimError, Optimizer, OptimizerConf, ParamSpec};

/// AdaGrad: `history += grad^2; value -= lr * grad / sqrt(history + delta)`.
#[derive(Debug, Clone)]
pub struct AdaGrad {
    core: OptimizerCore,
    history: ParamStates,
}

impl Default for AdaGrad {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaGrad {
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Strict)
    }

    #[must_use]
    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            core: OptimizerCore::new("adagrad", mode),
            history: ParamStates::new("history"),
        }
    }

    #[must_use]
    pub fn history(&self, param: &str) -> Option<&Tensor> {
        self.history.get(param)
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
        let grad = prepared.grad.as_ref();

        let history = self.history.current(param, value)?.add(&grad.square()?)?;
        let update = grad
            .div(&history.add_scalar(prepared.conf.delta)?.sqrt()?)?
            .mul_scalar(prepared.lr)?;
        let updated = value.sub(&update)?;

        value.copy_from(&updated)?;
        let allocated = self.history.commit(param, history);
        Ok(Applied::Updated {
            state_allocated: allocated.then_some(self.history.slot()),
        })
    }
}

impl Optimizer for AdaGrad {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn setup(&mut self, conf: OptimizerConf) -> Result<(), OptimError> {
        self.core.setup(conf, self.history.len())
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
        self.history(param)
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
