//! Action representations

use serde::{Deserialize, Serialize};

/// Continuous action (e.g., for continuous control)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousAction(pub Vec<f32>);

impl ContinuousAction {
    /// Borrow the action components
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Convert action to a vector representation
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.0.clone()
    }

    /// Number of action components
    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<f32>> for ContinuousAction {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}
