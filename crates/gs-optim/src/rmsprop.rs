use gs_core::ExecutionMode;
use gs_runtime::EvidenceLedger;
use gs_tensor::Tensor;

use crate::engine::{Applied, OptimizerCore};
use crate::state::ParamStates;
use crate::{OptimError, Optimizer, OptimizerConf, ParamSpec};

/// RMSProp: scales each gradient by a decaying root-mean-square of its
/// history.
///
/// Per parameter id it keeps one `history` tensor and applies
///
/// ```text
/// history = history * rho + grad^2 * (1 - rho)
/// value   = value - lr * grad / sqrt(history + delta)
/// ```
///
/// on whichever backend the value lives on. `history` starts at zero on the
/// first apply for an id. An apply that fails leaves both `value` and
/// `history` untouched.
#[derive(Debug, Clone)]
pub struct RmsProp {
    core: OptimizerCore,
    history: ParamStates,
}

impl Default for RmsProp {
    fn default() -> Self {
        Self::new()
    }
}

impl RmsProp {
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Strict)
    }

    #[must_use]
    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            core: OptimizerCore::new("rmsprop", mode),
            history: ParamStates::new("history"),
        }
    }

    /// Running mean of squared gradients for `param`, if it has been updated.
    #[must_use]
    pub fn history(&self, param: &str) -> Option<&Tensor> {
        self.history.get(param)
    }

    #[must_use]
    pub fn states(&self) -> &ParamStates {
        &self.history
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
        let OptimizerConf { rho, delta, .. } = prepared.conf;

        let previous = self.history.current(param, value)?;
        let history = previous
            .mul_scalar(rho)?
            .add(&grad.square()?.mul_scalar(1.0 - rho)?)?;
        let update = grad
            .div(&history.add_scalar(delta)?.sqrt()?)?
            .mul_scalar(prepared.lr)?;
        let updated = value.sub(&update)?;

        value.copy_from(&updated)?;
        let allocated = self.history.commit(param, history);
        Ok(Applied::Updated {
            state_allocated: allocated.then_some(self.history.slot()),
        })
    }
}

impl Optimizer for RmsProp {
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

#[cfg(test)]
mod tests {
    use gs_core::{Device, ExecutionMode};
    use gs_runtime::EvidenceKind;
    use gs_tensor::Tensor;

    use super::RmsProp;
    use crate::{OptimError, Optimizer, OptimizerConf, ParamSpec};

    fn host(shape: Vec<usize>, values: &[f32]) -> Tensor {
        Tensor::from_host(shape, values, Device::Cpu).expect("host tensor")
    }

    fn configured() -> RmsProp {
        let mut opt = RmsProp::new();
        opt.setup(OptimizerConf::default()).expect("setup");
        opt
    }

    #[test]
    fn first_step_matches_closed_form() {
        let mut opt = configured();
        let grad = host(vec![2], &[0.5, -0.25]);
        let mut value = host(vec![2], &[1.0, 1.0]);

        opt.apply(0, 0.01, "w", &grad, &mut value).expect("apply");

        let history = opt.history("w").expect("history allocated");
        let h = history.data::<f32>().expect("host history");
        let v = value.data::<f32>().expect("host value");
        for (i, g) in [0.5f32, -0.25].into_iter().enumerate() {
            let expected_h = g * g * (1.0 - 0.9f32);
            assert!((h[i] - expected_h).abs() < 1e-6);
            let expected_v = 1.0 - 0.01 * g / (expected_h + 1e-8).sqrt();
            assert!((v[i] - expected_v).abs() < 1e-5, "{} vs {}", v[i], expected_v);
        }
        assert_eq!(value.version(), 1);
    }

    #[test]
    fn zero_gradient_leaves_value_unchanged() {
        let mut opt = configured();
        let grad = host(vec![3], &[0.0, 0.0, 0.0]);
        let mut value = host(vec![3], &[1.0, 2.0, 3.0]);
        opt.apply(0, 0.1, "w", &grad, &mut value).expect("apply");
        assert_eq!(value.data::<f32>().expect("host"), &[1.0, 2.0, 3.0]);
        assert_eq!(
            opt.history("w").expect("history").data::<f32>().expect("host"),
            &[0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn apply_before_setup_is_rejected_without_side_effects() {
        let mut opt = RmsProp::new();
        let grad = host(vec![1], &[1.0]);
        let mut value = host(vec![1], &[1.0]);
        let err = opt
            .apply(0, 0.1, "w", &grad, &mut value)
            .expect_err("unconfigured");
        assert_eq!(err, OptimError::Unconfigured { optimizer: "rmsprop" });
        assert!(opt.history("w").is_none());
        assert_eq!(value.version(), 0);
        assert_eq!(opt.ledger().entries_of(EvidenceKind::Rejection).count(), 1);
    }

    #[test]
    fn setup_twice_keeps_history() {
        let mut opt = configured();
        let grad = host(vec![1], &[1.0]);
        let mut value = host(vec![1], &[0.0]);
        opt.apply(0, 0.1, "w", &grad, &mut value).expect("apply");
        let before = opt.history("w").cloned().expect("history");

        opt.setup(OptimizerConf::default().rho(0.5)).expect("re-setup");
        assert_eq!(opt.conf().map(|conf| conf.rho), Some(0.5));
        assert_eq!(opt.history("w"), Some(&before));
        assert!(
            opt.ledger()
                .entries_of(EvidenceKind::Policy)
                .any(|entry| entry.summary.contains("reconfigured"))
        );
    }

    #[test]
    fn frozen_param_is_not_touched() {
        let mut opt = configured();
        opt.register("w", ParamSpec::default().lr_mult(0.0))
            .expect("register");
        let grad = host(vec![1], &[1.0]);
        let mut value = host(vec![1], &[5.0]);
        opt.apply(0, 0.1, "w", &grad, &mut value).expect("apply");
        assert_eq!(value.data::<f32>().expect("host"), &[5.0]);
        assert_eq!(value.version(), 0);
        assert!(opt.state("w").is_none());
    }

    #[test]
    fn ledger_tracks_allocation_and_updates() {
        let mut opt = RmsProp::with_mode(ExecutionMode::Hardened);
        opt.setup(OptimizerConf::default()).expect("setup");
        let grad = Tensor::from_host(vec![2], &[0.1f32, 0.2], Device::Accelerator(0))
            .expect("device grad");
        let mut value = Tensor::zeros_like(&grad).expect("device value");

        opt.apply(0, 0.1, "w", &grad, &mut value).expect("step 0");
        opt.apply(1, 0.1, "w", &grad, &mut value).expect("step 1");

        let ledger = opt.ledger();
        assert_eq!(ledger.entries_of(EvidenceKind::State).count(), 1);
        let updates: Vec<_> = ledger.entries_of(EvidenceKind::Update).collect();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].summary.contains("step=1 param=w"));
        assert!(updates[1].summary.contains("backend=accelerator"));
        assert_eq!(opt.mode(), ExecutionMode::Hardened);
    }
}
