//! Observation representations

use serde::{Deserialize, Serialize};

/// Vector observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorObservation {
    /// The observation data
    pub data: Vec<f32>,
}

impl VectorObservation {
    /// Wrap raw observation values
    #[must_use]
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Borrow the values
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Convert observation to a feature vector
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    /// Get the shape of the observation
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        vec![self.data.len()]
    }
}

impl From<Vec<f32>> for VectorObservation {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}
