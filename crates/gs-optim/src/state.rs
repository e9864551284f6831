use std::borrow::Cow;
use std::collections::BTreeMap;

use gs_tensor::Tensor;

use crate::OptimError;

/// Per-parameter accumulator tensors, keyed by parameter id.
///
/// Entries are created on first sight of an id and live as long as the
/// owning optimizer. An entry always has the shape, dtype and device of the
/// value last applied under its id.
#[derive(Debug, Clone, Default)]
pub struct ParamStates {
    slot: &'static str,
    entries: BTreeMap<String, Tensor>,
}

impl ParamStates {
    #[must_use]
    pub fn new(slot: &'static str) -> Self {
        Self {
            slot,
            entries: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn slot(&self) -> &'static str {
        self.slot
    }

    #[must_use]
    pub fn get(&self, param: &str) -> Option<&Tensor> {
        self.entries.get(param)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The accumulator for `param`, or zeros shaped like `like` when the id
    /// has not been seen yet.
    pub(crate) fn current(&self, param: &str, like: &Tensor) -> Result<Cow<'_, Tensor>, OptimError> {
        match self.entries.get(param) {
            Some(existing) => {
                ensure_matches(param, like, existing)?;
                Ok(Cow::Borrowed(existing))
            }
            None => Ok(Cow::Owned(Tensor::zeros_like(like)?)),
        }
    }

    /// Stores the new accumulator; returns true when the entry was created.
    pub(crate) fn commit(&mut self, param: &str, state: Tensor) -> bool {
        self.entries.insert(param.to_string(), state).is_none()
    }
}

pub(crate) fn ensure_matches(
    param: &str,
    expected: &Tensor,
    actual: &Tensor,
) -> Result<(), OptimError> {
    if expected.shape() != actual.shape() {
        return Err(OptimError::ShapeMismatch {
            param: param.to_string(),
            expected: expected.shape().to_vec(),
            actual: actual.shape().to_vec(),
        });
    }
    if expected.device() != actual.device() {
        return Err(OptimError::DeviceMismatch {
            param: param.to_string(),
            expected: expected.device(),
            actual: actual.device(),
        });
    }
    if expected.dtype() != actual.dtype() {
        return Err(OptimError::DTypeMismatch {
            param: param.to_string(),
            expected: expected.dtype(),
            actual: actual.dtype(),
        });
    }
    Ok(())
}
