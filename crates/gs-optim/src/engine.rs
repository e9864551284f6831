use std::borrow::Cow;
use std::collections::BTreeMap;

use gs_core::ExecutionMode;
use gs_runtime::{EvidenceKind, RuntimeContext};
use gs_tensor::Tensor;

use crate::state::ensure_matches;
use crate::{OptimError, OptimizerConf, ParamSpec};

/// Gradient after the regularizer and constraint stages, with the
/// per-parameter learning rate already folded in.
pub(crate) struct Prepared<'g> {
    pub conf: OptimizerConf,
    pub lr: f64,
    pub grad: Cow<'g, Tensor>,
}

pub(crate) enum Applied {
    Updated { state_allocated: Option<&'static str> },
    Frozen,
}

/// Configuration, per-parameter specs and evidence shared by every optimizer.
#[derive(Debug, Clone)]
pub(crate) struct OptimizerCore {
    name: &'static str,
    conf: Option<OptimizerConf>,
    specs: BTreeMap<String, ParamSpec>,
    runtime: RuntimeContext,
}

impl OptimizerCore {
    pub fn new(name: &'static str, mode: ExecutionMode) -> Self {
        Self {
            name,
            conf: None,
            specs: BTreeMap::new(),
            runtime: RuntimeContext::new(mode),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn conf(&self) -> Option<&OptimizerConf> {
        self.conf.as_ref()
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut RuntimeContext {
        &mut self.runtime
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    pub fn param_spec(&self, param: &str) -> ParamSpec {
        self.specs.get(param).copied().unwrap_or_default()
    }

    pub fn setup(&mut self, conf: OptimizerConf, live_states: usize) -> Result<(), OptimError> {
        if let Err(error) = conf.validate() {
            self.runtime
                .record_rejection(&format!("{}.setup", self.name), &error);
            return Err(error);
        }
        let verb = if self.conf.is_some() {
            "reconfigured"
        } else {
            "configured"
        };
        self.conf = Some(conf);
        self.runtime.record(
            EvidenceKind::Policy,
            format!(
                "{} {verb} {conf}; {live_states} existing state entries kept",
                self.name
            ),
        );
        Ok(())
    }

    pub fn register(&mut self, param: &str, spec: ParamSpec) -> Result<(), OptimError> {
        if let Err(error) = spec.validate() {
            self.runtime
                .record_rejection(&format!("{}.register param={param}", self.name), &error);
            return Err(error);
        }
        self.specs.insert(param.to_string(), spec);
        self.runtime.record(
            EvidenceKind::Policy,
            format!(
                "{} registered param={param} lr_mult={} decay_mult={}",
                self.name, spec.lr_mult, spec.decay_mult
            ),
        );
        Ok(())
    }

    /// Validates one apply request and runs the shared gradient pipeline:
    /// L2 regularization, then norm clipping, then the per-parameter learning
    /// rate. Returns `None` when the parameter is frozen (`lr_mult == 0`).
    pub fn prepare<'g>(
        &self,
        lr: f64,
        param: &str,
        grad: &'g Tensor,
        value: &Tensor,
    ) -> Result<Option<Prepared<'g>>, OptimError> {
        let conf = self.conf.ok_or(OptimError::Unconfigured {
            optimizer: self.name,
        })?;
        if !lr.is_finite() || lr < 0.0 {
            return Err(OptimError::InvalidLearningRate { lr });
        }
        ensure_matches(param, value, grad)?;
        if self.runtime.mode() == ExecutionMode::Hardened && !grad.all_finite()? {
            return Err(OptimError::NonFiniteGradient {
                param: param.to_string(),
            });
        }

        let spec = self.param_spec(param);
        if spec.lr_mult == 0.0 {
            return Ok(None);
        }

        let mut grad = Cow::Borrowed(grad);
        let decay = conf.weight_decay * spec.decay_mult;
        if decay > 0.0 {
            grad = Cow::Owned(grad.add(&value.mul_scalar(decay)?)?);
        }
        if let Some(threshold) = conf.clip_norm {
            let norm = grad.sum_squares()?.sqrt();
            if norm > threshold {
                grad = Cow::Owned(grad.mul_scalar(threshold / norm)?);
            }
        }

        Ok(Some(Prepared {
            conf,
            lr: lr * spec.lr_mult,
            grad,
        }))
    }

    /// Records the outcome of an apply in the ledger and passes it through.
    pub fn finish(
        &mut self,
        step: u64,
        lr: f64,
        param: &str,
        value: &Tensor,
        outcome: Result<Applied, OptimError>,
    ) -> Result<(), OptimError> {
        match outcome {
            Ok(Applied::Updated { state_allocated }) => {
                if let Some(slot) = state_allocated {
                    self.runtime.record(
                        EvidenceKind::State,
                        format!(
                            "{} allocated {slot} param={param} shape={:?} dtype={:?} device={}",
                            self.name,
                            value.shape(),
                            value.dtype(),
                            value.device()
                        ),
                    );
                }
                self.runtime.record(
                    EvidenceKind::Update,
                    format!(
                        "{} step={step} param={param} lr={lr} backend={} version={}",
                        self.name,
                        value.dispatch_key().name(),
                        value.version()
                    ),
                );
                Ok(())
            }
            Ok(Applied::Frozen) => {
                self.runtime.record(
                    EvidenceKind::Update,
                    format!("{} step={step} param={param} skipped: lr_mult=0", self.name),
                );
                Ok(())
            }
            Err(error) => {
                self.runtime.record_rejection(
                    &format!("{}.apply step={step} param={param}", self.name),
                    &error,
                );
                Err(error)
            }
        }
    }
}
