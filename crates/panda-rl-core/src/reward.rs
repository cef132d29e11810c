//! Reward signals and goal-distance reward shapes

use serde::{Deserialize, Serialize};

/// Reward signal from the environment
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Reward(pub f32);

impl Reward {
    /// Create a new reward
    #[must_use]
    pub fn new(value: f32) -> Self {
        Self(value)
    }

    /// Get the reward value
    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl From<f32> for Reward {
    fn from(value: f32) -> Self {
        Self(value)
    }
}

impl From<Reward> for f32 {
    fn from(reward: Reward) -> Self {
        reward.0
    }
}

impl std::ops::Add for Reward {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self(self.0 + other.0)
    }
}

/// How a goal-conditioned task turns the achieved/desired distance into a reward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardType {
    /// `-1` until the goal is within the threshold, `0` afterwards
    #[default]
    Sparse,
    /// Negative euclidean distance to the goal
    Dense,
}

impl RewardType {
    /// Compute the reward for a given goal distance
    #[must_use]
    pub fn reward(self, distance: f32, threshold: f32) -> Reward {
        match self {
            Self::Sparse => {
                if distance > threshold {
                    Reward(-1.0)
                } else {
                    Reward(0.0)
                }
            }
            Self::Dense => Reward(-distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_reward_is_zero_inside_threshold() {
        assert_eq!(RewardType::Sparse.reward(0.01, 0.05), Reward(0.0));
        assert_eq!(RewardType::Sparse.reward(0.2, 0.05), Reward(-1.0));
    }

    #[test]
    fn dense_reward_is_negative_distance() {
        assert_eq!(RewardType::Dense.reward(0.25, 0.05), Reward(-0.25));
    }
}
