//! Bounded box spaces shared by observations and actions

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{RLError, Result};

/// Box space: every component lies in `[low[i], high[i]]`
///
/// The space is stored flat; `shape` describes how consumers should view it.
/// Both the observation and the action spaces of the reach task are boxes, and
/// the box is what checkpoints persist so that the exporter can rebuild the
/// input signature without touching the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxSpace {
    /// Lower bounds
    pub low: Vec<f32>,
    /// Upper bounds
    pub high: Vec<f32>,
    /// Shape of values in this space
    pub shape: Vec<usize>,
}

impl BoxSpace {
    /// Create a new box space, validating bounds against the shape
    pub fn new(low: Vec<f32>, high: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let total_size: usize = shape.iter().product();
        if low.len() != total_size {
            return Err(RLError::DimensionMismatch {
                expected: total_size,
                actual: low.len(),
            });
        }
        if high.len() != total_size {
            return Err(RLError::DimensionMismatch {
                expected: total_size,
                actual: high.len(),
            });
        }
        if let Some(i) = low.iter().zip(&high).position(|(l, h)| l > h) {
            return Err(RLError::Config(format!(
                "box bound {i}: low {} exceeds high {}",
                low[i], high[i]
            )));
        }
        Ok(Self { low, high, shape })
    }

    /// Box with the same scalar bounds on every component
    #[must_use]
    pub fn uniform(low: f32, high: f32, shape: Vec<usize>) -> Self {
        let total_size: usize = shape.iter().product();
        Self {
            low: vec![low; total_size],
            high: vec![high; total_size],
            shape,
        }
    }

    /// Shape of values in this space
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of scalar components
    #[must_use]
    pub fn flat_dim(&self) -> usize {
        self.low.len()
    }

    /// Sample a value uniformly from the space
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f32> {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(l, h)| rng.gen_range(*l..=*h))
            .collect()
    }

    /// Check if a value is valid within this space
    #[must_use]
    pub fn contains(&self, value: &[f32]) -> bool {
        value.len() == self.low.len()
            && value
                .iter()
                .zip(&self.low)
                .zip(&self.high)
                .all(|((x, l), h)| x >= l && x <= h)
    }

    /// Clamp each component of `value` into the box
    #[must_use]
    pub fn clip(&self, value: &[f32]) -> Vec<f32> {
        value
            .iter()
            .zip(&self.low)
            .zip(&self.high)
            .map(|((x, l), h)| x.clamp(*l, *h))
            .collect()
    }

    /// Fail with [`RLError::DimensionMismatch`] unless `len` matches the flat dimension
    pub fn check_dim(&self, len: usize) -> Result<()> {
        if len == self.flat_dim() {
            Ok(())
        } else {
            Err(RLError::DimensionMismatch {
                expected: self.flat_dim(),
                actual: len,
            })
        }
    }
}
