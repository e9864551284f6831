use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OptimError;

/// Hyperparameters shared by the optimizer family.
///
/// Each variant reads the fields it needs: `rho` and `delta` drive RMSProp,
/// `delta` also drives AdaGrad, `momentum` drives SGD. `weight_decay` and
/// `clip_norm` apply to every variant before its update rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OptimizerConf {
    pub rho: f64,
    pub delta: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub clip_norm: Option<f64>,
}

impl Default for OptimizerConf {
    fn default() -> Self {
        Self {
            rho: 0.9,
            delta: 1e-8,
            momentum: 0.0,
            weight_decay: 0.0,
            clip_norm: None,
        }
    }
}

impl OptimizerConf {
    /// Set the decay factor of the squared-gradient running average (default: 0.9).
    #[must_use]
    pub fn rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    /// Set the constant added before the square root (default: 1e-8).
    #[must_use]
    pub fn delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    /// Set momentum factor (default: 0.0).
    #[must_use]
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Set L2 weight decay coefficient (default: 0.0).
    #[must_use]
    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Rescale gradients whose L2 norm exceeds `threshold` (default: off).
    #[must_use]
    pub fn clip_norm(mut self, threshold: f64) -> Self {
        self.clip_norm = Some(threshold);
        self
    }

    pub fn validate(&self) -> Result<(), OptimError> {
        if !self.rho.is_finite() || !(0.0..1.0).contains(&self.rho) {
            return Err(OptimError::InvalidConfig {
                reason: "rho must be finite and in [0, 1)",
            });
        }
        if !self.delta.is_finite() || self.delta <= 0.0 {
            return Err(OptimError::InvalidConfig {
                reason: "delta must be finite and > 0",
            });
        }
        if !self.momentum.is_finite() || self.momentum < 0.0 {
            return Err(OptimError::InvalidConfig {
                reason: "momentum must be finite and non-negative",
            });
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(OptimError::InvalidConfig {
                reason: "weight_decay must be finite and non-negative",
            });
        }
        if let Some(threshold) = self.clip_norm {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(OptimError::InvalidConfig {
                    reason: "clip_norm must be finite and > 0",
                });
            }
        }
        Ok(())
    }

    /// Decodes a JSON object; absent fields take their defaults and unknown
    /// fields are rejected.
    pub fn from_json(input: &str) -> Result<Self, OptimError> {
        let conf: Self = serde_json::from_str(input).map_err(|error| OptimError::ConfigDecode {
            diagnostic: error.to_string(),
        })?;
        conf.validate()?;
        Ok(conf)
    }
}

impl fmt::Display for OptimizerConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rho={} delta={} momentum={} weight_decay={}",
            self.rho, self.delta, self.momentum, self.weight_decay
        )?;
        match self.clip_norm {
            Some(threshold) => write!(f, " clip_norm={threshold}"),
            None => write!(f, " clip_norm=none"),
        }
    }
}

/// Per-parameter multipliers applied on top of the shared configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParamSpec {
    pub lr_mult: f64,
    pub decay_mult: f64,
}

impl Default for ParamSpec {
    fn default() -> Self {
        Self {
            lr_mult: 1.0,
            decay_mult: 1.0,
        }
    }
}

impl ParamSpec {
    #[must_use]
    pub fn lr_mult(mut self, lr_mult: f64) -> Self {
        self.lr_mult = lr_mult;
        self
    }

    #[must_use]
    pub fn decay_mult(mut self, decay_mult: f64) -> Self {
        self.decay_mult = decay_mult;
        self
    }

    pub fn validate(&self) -> Result<(), OptimError> {
        if !self.lr_mult.is_finite() || self.lr_mult < 0.0 {
            return Err(OptimError::InvalidConfig {
                reason: "lr_mult must be finite and non-negative",
            });
        }
        if !self.decay_mult.is_finite() || self.decay_mult < 0.0 {
            return Err(OptimError::InvalidConfig {
                reason: "decay_mult must be finite and non-negative",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerKind {
    #[serde(rename = "sgd")]
    Sgd,
    #[serde(rename = "adagrad")]
    AdaGrad,
    #[serde(rename = "rmsprop")]
    RmsProp,
}

impl OptimizerKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::AdaGrad => "adagrad",
            Self::RmsProp => "rmsprop",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = OptimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adagrad" => Ok(Self::AdaGrad),
            "rmsprop" => Ok(Self::RmsProp),
            _ => Err(OptimError::UnknownOptimizer {
                name: s.to_string(),
            }),
        }
    }
}
