//! Adam optimizer over flat parameter vectors

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Adam with bias correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    /// Step size
    pub lr: f32,
    /// First-moment decay
    pub beta1: f32,
    /// Second-moment decay
    pub beta2: f32,
    /// Denominator term
    pub eps: f32,
    /// First moments
    momentum: Vec<f32>,
    /// Second moments
    velocity: Vec<f32>,
    /// Steps taken
    t: u64,
}

impl Adam {
    /// Optimizer for `n_params` parameters
    #[must_use]
    pub fn new(n_params: usize, lr: f32, eps: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps,
            momentum: vec![0.0; n_params],
            velocity: vec![0.0; n_params],
            t: 0,
        }
    }

    /// Number of parameters this optimizer tracks
    #[must_use]
    pub fn len(&self) -> usize {
        self.momentum.len()
    }

    /// Whether no parameters are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.momentum.is_empty()
    }

    /// Steps taken so far
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Apply one update in place
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) -> Result<()> {
        ensure!(
            params.len() == self.len() && grads.len() == self.len(),
            "optimizer tracks {} parameters, got {} parameters and {} gradients",
            self.len(),
            params.len(),
            grads.len()
        );

        self.t += 1;
        let t = self.t.min(i32::MAX as u64) as i32;
        let bias_c1 = 1.0 - self.beta1.powi(t);
        let bias_c2 = 1.0 - self.beta2.powi(t);
        let step_size = self.lr / bias_c1;
        let bias_c2_sqrt = bias_c2.sqrt();

        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grads)
            .zip(&mut self.momentum)
            .zip(&mut self.velocity)
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let denom = v.sqrt() / bias_c2_sqrt + self.eps;
            *p -= step_size * *m / denom;
        }
        Ok(())
    }
}

/// Scale `grads` so their global L2 norm is at most `max_norm`; returns the norm before clipping
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let total = grads.iter().map(|g| g * g).sum::<f32>().sqrt();
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            *g *= coef;
        }
    }
    total
}
