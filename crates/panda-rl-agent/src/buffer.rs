//! On-policy rollout storage with generalized advantage estimation

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

/// Transitions from `buffer_size` vectorized steps over `n_envs` environments
///
/// Row `step * n_envs + env` holds the transition of environment `env` at
/// rollout step `step`.
#[derive(Debug, Clone)]
pub struct RolloutBuffer {
    buffer_size: usize,
    n_envs: usize,
    gamma: f32,
    gae_lambda: f32,
    observations: Array2<f32>,
    actions: Array2<f32>,
    rewards: Array1<f32>,
    episode_starts: Array1<f32>,
    values: Array1<f32>,
    log_probs: Array1<f32>,
    advantages: Array1<f32>,
    returns: Array1<f32>,
    pos: usize,
}

/// Minibatch drawn from a full buffer
#[derive(Debug, Clone)]
pub struct RolloutBatch {
    /// Observations, `(batch, obs_dim)`
    pub observations: Array2<f32>,
    /// Actions as sampled, `(batch, act_dim)`
    pub actions: Array2<f32>,
    /// Value estimates at collection time
    pub old_values: Array1<f32>,
    /// Log-probabilities at collection time
    pub old_log_probs: Array1<f32>,
    /// GAE advantages
    pub advantages: Array1<f32>,
    /// Value targets
    pub returns: Array1<f32>,
}

impl RolloutBatch {
    /// Number of transitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    /// Whether the batch holds no transitions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }
}

impl RolloutBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new(
        buffer_size: usize,
        n_envs: usize,
        obs_dim: usize,
        act_dim: usize,
        gamma: f32,
        gae_lambda: f32,
    ) -> Self {
        let total = buffer_size * n_envs;
        Self {
            buffer_size,
            n_envs,
            gamma,
            gae_lambda,
            observations: Array2::zeros((total, obs_dim)),
            actions: Array2::zeros((total, act_dim)),
            rewards: Array1::zeros(total),
            episode_starts: Array1::zeros(total),
            values: Array1::zeros(total),
            log_probs: Array1::zeros(total),
            advantages: Array1::zeros(total),
            returns: Array1::zeros(total),
            pos: 0,
        }
    }

    /// Forget stored transitions
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Whether every step slot is filled
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pos == self.buffer_size
    }

    /// Stored transitions, counted across environments
    #[must_use]
    pub fn len(&self) -> usize {
        self.pos * self.n_envs
    }

    /// Whether nothing has been stored since the last reset
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Value estimates of the stored transitions
    #[must_use]
    pub fn values(&self) -> ArrayView1<'_, f32> {
        self.values.slice(ndarray::s![..self.len()])
    }

    /// Value targets of the stored transitions
    #[must_use]
    pub fn returns(&self) -> ArrayView1<'_, f32> {
        self.returns.slice(ndarray::s![..self.len()])
    }

    /// Store one vectorized step
    ///
    /// `episode_starts[i]` tells whether `obs` row `i` is the first
    /// observation of an episode.
    pub fn add(
        &mut self,
        obs: &ArrayView2<f32>,
        actions: &ArrayView2<f32>,
        rewards: &ArrayView1<f32>,
        episode_starts: &[bool],
        values: &ArrayView1<f32>,
        log_probs: &ArrayView1<f32>,
    ) -> Result<()> {
        ensure!(!self.is_full(), "rollout buffer is full");
        ensure!(
            obs.nrows() == self.n_envs
                && actions.nrows() == self.n_envs
                && rewards.len() == self.n_envs
                && episode_starts.len() == self.n_envs
                && values.len() == self.n_envs
                && log_probs.len() == self.n_envs,
            "every rollout field needs one entry per environment ({})",
            self.n_envs
        );

        let start = self.pos * self.n_envs;
        for i in 0..self.n_envs {
            let row = start + i;
            self.observations.row_mut(row).assign(&obs.row(i));
            self.actions.row_mut(row).assign(&actions.row(i));
            self.rewards[row] = rewards[i];
            self.episode_starts[row] = if episode_starts[i] { 1.0 } else { 0.0 };
            self.values[row] = values[i];
            self.log_probs[row] = log_probs[i];
        }
        self.pos += 1;
        Ok(())
    }

    /// Fill advantages and returns once the buffer is full
    ///
    /// `last_values` are the value estimates of the observations following the
    /// last stored step and `dones` whether those observations start a new
    /// episode.
    pub fn compute_returns_and_advantage(&mut self, last_values: &ArrayView1<f32>, dones: &[bool]) -> Result<()> {
        ensure!(self.is_full(), "advantages need a full rollout buffer");
        ensure!(
            last_values.len() == self.n_envs && dones.len() == self.n_envs,
            "bootstrap values need one entry per environment ({})",
            self.n_envs
        );

        let n = self.n_envs;
        let mut last_gae = vec![0.0f32; n];
        for step in (0..self.buffer_size).rev() {
            for env in 0..n {
                let row = step * n + env;
                let (next_non_terminal, next_value) = if step == self.buffer_size - 1 {
                    (if dones[env] { 0.0 } else { 1.0 }, last_values[env])
                } else {
                    let next = row + n;
                    (1.0 - self.episode_starts[next], self.values[next])
                };
                let delta = self.rewards[row] + self.gamma * next_value * next_non_terminal
                    - self.values[row];
                last_gae[env] =
                    delta + self.gamma * self.gae_lambda * next_non_terminal * last_gae[env];
                self.advantages[row] = last_gae[env];
            }
        }
        self.returns = &self.advantages + &self.values;
        Ok(())
    }

    /// Shuffle the stored transitions and split them into minibatches
    ///
    /// The last minibatch is smaller when `batch_size` does not divide the
    /// number of transitions.
    pub fn minibatches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<RolloutBatch> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| self.gather(chunk))
            .collect()
    }

    fn gather(&self, indices: &[usize]) -> RolloutBatch {
        RolloutBatch {
            observations: self.observations.select(Axis(0), indices),
            actions: self.actions.select(Axis(0), indices),
            old_values: self.values.select(Axis(0), indices),
            old_log_probs: self.log_probs.select(Axis(0), indices),
            advantages: self.advantages.select(Axis(0), indices),
            returns: self.returns.select(Axis(0), indices),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fill(buffer: &mut RolloutBuffer, rewards: &[[f32; 2]], starts: &[[bool; 2]], values: &[[f32; 2]]) {
        for ((r, s), v) in rewards.iter().zip(starts).zip(values) {
            buffer
                .add(
                    &Array2::zeros((2, 1)).view(),
                    &Array2::zeros((2, 1)).view(),
                    &ArrayView1::from(&r[..]),
                    &s[..],
                    &ArrayView1::from(&v[..]),
                    &Array1::zeros(2).view(),
                )
                .unwrap();
        }
    }

    #[test]
    fn gae_with_lambda_one_is_discounted_return_minus_value() {
        let mut buffer = RolloutBuffer::new(3, 2, 1, 1, 0.5, 1.0);
        fill(
            &mut buffer,
            &[[1.0, 0.0], [2.0, 0.0], [3.0, 4.0]],
            &[[true, true], [false, false], [false, false]],
            &[[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]],
        );
        buffer
            .compute_returns_and_advantage(&array![2.0, 0.0].view(), &[false, true])
            .unwrap();

        // env 0: 1 + 0.5 * (2 + 0.5 * (3 + 0.5 * 2))
        assert_relative_eq!(buffer.returns()[0], 3.0);
        // env 1 ends its episode after the last step, no bootstrap
        assert_relative_eq!(buffer.returns()[1], 1.0);
        assert_relative_eq!(buffer.returns()[5], 4.0);
    }

    #[test]
    fn episode_start_cuts_the_advantage_chain() {
        let mut buffer = RolloutBuffer::new(2, 1, 1, 1, 0.99, 0.95);
        let mut one = |r: f32, start: bool, v: f32| {
            buffer
                .add(
                    &Array2::zeros((1, 1)).view(),
                    &Array2::zeros((1, 1)).view(),
                    &array![r].view(),
                    &[start],
                    &array![v].view(),
                    &array![0.0].view(),
                )
                .unwrap();
        };
        one(1.0, true, 0.5);
        one(10.0, true, 0.0);
        buffer
            .compute_returns_and_advantage(&array![100.0].view(), &[false])
            .unwrap();

        // The first transition ended its episode, so nothing leaks back from step 2
        assert_relative_eq!(buffer.returns()[0], 1.0);
        assert_relative_eq!(buffer.returns()[1], 10.0 + 0.99 * 100.0, epsilon = 1e-4);
    }

    #[test]
    fn minibatches_cover_every_transition_once() {
        let mut buffer = RolloutBuffer::new(5, 2, 1, 1, 0.99, 0.95);
        for step in 0..5 {
            let obs = array![[step as f32 * 2.0], [step as f32 * 2.0 + 1.0]];
            buffer
                .add(
                    &obs.view(),
                    &Array2::zeros((2, 1)).view(),
                    &Array1::zeros(2).view(),
                    &[false, false],
                    &Array1::zeros(2).view(),
                    &Array1::zeros(2).view(),
                )
                .unwrap();
        }
        buffer
            .compute_returns_and_advantage(&Array1::zeros(2).view(), &[false, false])
            .unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let batches = buffer.minibatches(4, &mut rng);
        assert_eq!(batches.iter().map(RolloutBatch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        let mut seen: Vec<f32> = batches
            .iter()
            .flat_map(|b| b.observations.column(0).to_vec())
            .collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn add_refuses_overflow_and_bad_widths() {
        let mut buffer = RolloutBuffer::new(1, 2, 1, 1, 0.99, 0.95);
        let bad = buffer.add(
            &Array2::zeros((3, 1)).view(),
            &Array2::zeros((2, 1)).view(),
            &Array1::zeros(2).view(),
            &[false, false],
            &Array1::zeros(2).view(),
            &Array1::zeros(2).view(),
        );
        assert!(bad.is_err());
        fill(&mut buffer, &[[0.0, 0.0]], &[[false, false]], &[[0.0, 0.0]]);
        assert!(buffer.is_full());
        assert!(buffer
            .add(
                &Array2::zeros((2, 1)).view(),
                &Array2::zeros((2, 1)).view(),
                &Array1::zeros(2).view(),
                &[false, false],
                &Array1::zeros(2).view(),
                &Array1::zeros(2).view(),
            )
            .is_err());
    }
}
