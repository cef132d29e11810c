//! Actor-critic policy with a diagonal Gaussian action distribution
//!
//! The network is split the way the export path needs it: an
//! [`MlpExtractor`] with separate policy and value branches, a linear
//! `action_net` producing the action mean, a linear `value_net` producing the
//! state value, and a state-independent `log_std`.

use std::f32::consts::PI;

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::nn::{Linear, Mlp};
use panda_rl_core::RLError;

/// Hidden layer sizes of the two extractor branches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetArch {
    /// Policy branch widths
    pub pi: Vec<usize>,
    /// Value branch widths
    pub vf: Vec<usize>,
}

impl Default for NetArch {
    fn default() -> Self {
        Self {
            pi: vec![64, 64],
            vf: vec![64, 64],
        }
    }
}

/// Feature extractor holding the policy and value latent branches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpExtractor {
    /// Observation → policy latent
    pub policy_net: Mlp,
    /// Observation → value latent
    pub value_net: Mlp,
    /// Observation width
    pub input_dim: usize,
}

impl MlpExtractor {
    /// Build both branches with orthogonal weights of gain `√2`
    pub fn new<R: Rng + ?Sized>(input_dim: usize, arch: &NetArch, rng: &mut R) -> Self {
        let gain = std::f32::consts::SQRT_2;
        Self {
            policy_net: Mlp::new(input_dim, &arch.pi, gain, rng),
            value_net: Mlp::new(input_dim, &arch.vf, gain, rng),
            input_dim,
        }
    }

    /// Policy latent width
    #[must_use]
    pub fn latent_dim_pi(&self) -> usize {
        self.policy_net.output_dim(self.input_dim)
    }

    /// Value latent width
    #[must_use]
    pub fn latent_dim_vf(&self) -> usize {
        self.value_net.output_dim(self.input_dim)
    }

    /// Split into `(policy_net, value_net)`
    #[must_use]
    pub fn into_branches(self) -> (Mlp, Mlp) {
        (self.policy_net, self.value_net)
    }

    fn zeros_like(&self) -> Self {
        Self {
            policy_net: self.policy_net.zeros_like(),
            value_net: self.value_net.zeros_like(),
            input_dim: self.input_dim,
        }
    }
}

/// Actor-critic policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorCriticPolicy {
    /// Shared feature extractor
    pub extractor: MlpExtractor,
    /// Policy latent → action mean
    pub action_net: Linear,
    /// Value latent → state value
    pub value_net: Linear,
    /// Per-dimension log standard deviation
    pub log_std: Array1<f32>,
}

/// Activations kept by [`ActorCriticPolicy::evaluate_actions`] for backprop
#[derive(Debug, Clone)]
pub struct ForwardCache {
    pi_acts: Vec<Array2<f32>>,
    vf_acts: Vec<Array2<f32>>,
    /// Action means, `(batch, act_dim)`
    pub mean: Array2<f32>,
    /// State values, `(batch,)`
    pub values: Array1<f32>,
}

impl ActorCriticPolicy {
    /// Freshly initialised policy
    pub fn new<R: Rng + ?Sized>(
        obs_dim: usize,
        act_dim: usize,
        arch: &NetArch,
        log_std_init: f32,
        rng: &mut R,
    ) -> Self {
        let extractor = MlpExtractor::new(obs_dim, arch, rng);
        let action_net = Linear::orthogonal(extractor.latent_dim_pi(), act_dim, 0.01, rng);
        let value_net = Linear::orthogonal(extractor.latent_dim_vf(), 1, 1.0, rng);
        Self {
            extractor,
            action_net,
            value_net,
            log_std: Array1::from_elem(act_dim, log_std_init),
        }
    }

    /// Observation width
    #[must_use]
    pub fn obs_dim(&self) -> usize {
        self.extractor.input_dim
    }

    /// Action width
    #[must_use]
    pub fn act_dim(&self) -> usize {
        self.action_net.out_features()
    }

    fn check_obs(&self, obs: &ArrayView2<f32>) -> Result<()> {
        if obs.ncols() != self.obs_dim() {
            return Err(RLError::DimensionMismatch {
                expected: self.obs_dim(),
                actual: obs.ncols(),
            }
            .into());
        }
        Ok(())
    }

    /// Action means for a batch of observations
    pub fn action_mean(&self, obs: &ArrayView2<f32>) -> Result<Array2<f32>> {
        self.check_obs(obs)?;
        let latent = self.extractor.policy_net.forward(obs);
        Ok(self.action_net.forward(&latent.view()))
    }

    /// State values for a batch of observations
    pub fn predict_values(&self, obs: &ArrayView2<f32>) -> Result<Array1<f32>> {
        self.check_obs(obs)?;
        let latent = self.extractor.value_net.forward(obs);
        Ok(self.value_net.forward(&latent.view()).column(0).to_owned())
    }

    /// Sample actions, returning `(actions, values, log_probs)`
    pub fn sample<R: Rng + ?Sized>(
        &self,
        obs: &ArrayView2<f32>,
        rng: &mut R,
    ) -> Result<(Array2<f32>, Array1<f32>, Array1<f32>)> {
        let mean = self.action_mean(obs)?;
        let values = self.predict_values(obs)?;
        let std = self.log_std.mapv(f32::exp);
        let noise = Array2::<f32>::from_shape_simple_fn(mean.raw_dim(), || rng.sample(StandardNormal));
        let actions = &mean + &(noise * &std);
        let log_probs = gaussian_log_prob(&mean.view(), &self.log_std.view(), &actions.view());
        Ok((actions, values, log_probs))
    }

    /// Forward pass for a batch of stored actions
    ///
    /// Returns the log-probabilities of `actions` under the current policy
    /// along with the cache needed by [`ActorCriticPolicy::backward`].
    pub fn evaluate_actions(
        &self,
        obs: &ArrayView2<f32>,
        actions: &ArrayView2<f32>,
    ) -> Result<(Array1<f32>, ForwardCache)> {
        self.check_obs(obs)?;
        if actions.ncols() != self.act_dim() {
            bail!(RLError::DimensionMismatch {
                expected: self.act_dim(),
                actual: actions.ncols(),
            });
        }
        if actions.nrows() != obs.nrows() {
            bail!(RLError::DimensionMismatch {
                expected: obs.nrows(),
                actual: actions.nrows(),
            });
        }
        let pi_acts = self.extractor.policy_net.forward_cached(obs);
        let vf_acts = self.extractor.value_net.forward_cached(obs);
        let mean = self.action_net.forward(&pi_acts[pi_acts.len() - 1].view());
        let values = self
            .value_net
            .forward(&vf_acts[vf_acts.len() - 1].view())
            .column(0)
            .to_owned();
        let log_probs = gaussian_log_prob(&mean.view(), &self.log_std.view(), actions);
        Ok((
            log_probs,
            ForwardCache {
                pi_acts,
                vf_acts,
                mean,
                values,
            },
        ))
    }

    /// Backpropagate loss gradients w.r.t. the action mean and the values
    ///
    /// `grad_log_std` is passed through unchanged into the returned gradient.
    #[must_use]
    pub fn backward(
        &self,
        cache: &ForwardCache,
        grad_mean: &Array2<f32>,
        grad_values: &Array1<f32>,
        grad_log_std: Array1<f32>,
    ) -> ActorCriticPolicy {
        let mut grads = self.zeros_like();

        let latent_pi = &cache.pi_acts[cache.pi_acts.len() - 1];
        let d_latent_pi = self
            .action_net
            .backward(&latent_pi.view(), &grad_mean.view(), &mut grads.action_net);
        self.extractor
            .policy_net
            .backward(&cache.pi_acts, d_latent_pi, &mut grads.extractor.policy_net);

        let latent_vf = &cache.vf_acts[cache.vf_acts.len() - 1];
        let dv = grad_values.view().insert_axis(Axis(1));
        let d_latent_vf = self
            .value_net
            .backward(&latent_vf.view(), &dv, &mut grads.value_net);
        self.extractor
            .value_net
            .backward(&cache.vf_acts, d_latent_vf, &mut grads.extractor.value_net);

        grads.log_std = grad_log_std;
        grads
    }

    /// Same topology with every parameter zeroed
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            extractor: self.extractor.zeros_like(),
            action_net: Linear::zeros(self.action_net.in_features(), self.action_net.out_features()),
            value_net: Linear::zeros(self.value_net.in_features(), self.value_net.out_features()),
            log_std: Array1::zeros(self.log_std.len()),
        }
    }

    fn tensors(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut out = Vec::new();
        for mlp in [&self.extractor.policy_net, &self.extractor.value_net] {
            for layer in &mlp.layers {
                out.push(layer.weight.view().into_dyn());
                out.push(layer.bias.view().into_dyn());
            }
        }
        for layer in [&self.action_net, &self.value_net] {
            out.push(layer.weight.view().into_dyn());
            out.push(layer.bias.view().into_dyn());
        }
        out.push(self.log_std.view().into_dyn());
        out
    }

    fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        let mut out = Vec::new();
        for mlp in [&mut self.extractor.policy_net, &mut self.extractor.value_net] {
            for layer in &mut mlp.layers {
                out.push(layer.weight.view_mut().into_dyn());
                out.push(layer.bias.view_mut().into_dyn());
            }
        }
        for layer in [&mut self.action_net, &mut self.value_net] {
            out.push(layer.weight.view_mut().into_dyn());
            out.push(layer.bias.view_mut().into_dyn());
        }
        out.push(self.log_std.view_mut().into_dyn());
        out
    }

    /// Total number of trainable scalars
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.tensors().iter().map(ArrayViewD::len).sum()
    }

    /// All parameters flattened in a fixed order
    #[must_use]
    pub fn parameters(&self) -> Vec<f32> {
        let mut params = Vec::with_capacity(self.num_parameters());
        for tensor in self.tensors() {
            params.extend(tensor.iter().copied());
        }
        params
    }

    /// Overwrite every parameter from a flat vector produced by [`Self::parameters`]
    pub fn set_parameters(&mut self, params: &[f32]) -> Result<()> {
        let expected = self.num_parameters();
        if params.len() != expected {
            bail!(RLError::DimensionMismatch {
                expected,
                actual: params.len(),
            });
        }
        let mut offset = 0;
        for mut tensor in self.tensors_mut() {
            for (dst, src) in tensor.iter_mut().zip(&params[offset..]) {
                *dst = *src;
            }
            offset += tensor.len();
        }
        Ok(())
    }
}

/// Log-density of `actions` under `N(mean, exp(log_std)²)`, summed over dimensions
#[must_use]
pub fn gaussian_log_prob(
    mean: &ArrayView2<f32>,
    log_std: &ArrayView1<f32>,
    actions: &ArrayView2<f32>,
) -> Array1<f32> {
    let half_log_2pi = 0.5 * (2.0 * PI).ln();
    let mut out = Array1::zeros(mean.nrows());
    Zip::from(&mut out)
        .and(mean.rows())
        .and(actions.rows())
        .for_each(|lp, mu, a| {
            *lp = mu
                .iter()
                .zip(a.iter())
                .zip(log_std.iter())
                .map(|((m, x), ls)| {
                    let z = (x - m) / ls.exp();
                    -0.5 * z * z - ls - half_log_2pi
                })
                .sum();
        });
    out
}

/// Entropy of a diagonal Gaussian, summed over dimensions
#[must_use]
pub fn gaussian_entropy(log_std: &ArrayView1<f32>) -> f32 {
    let half_log_2pi_e = 0.5 + 0.5 * (2.0 * PI).ln();
    log_std.iter().map(|ls| half_log_2pi_e + ls).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> ActorCriticPolicy {
        let mut rng = StdRng::seed_from_u64(0);
        ActorCriticPolicy::new(12, 3, &NetArch::default(), 0.0, &mut rng)
    }

    #[test]
    fn parameter_count_matches_architecture() {
        let p = policy();
        let extractor = 2 * (12 * 64 + 64 + 64 * 64 + 64);
        let heads = (64 * 3 + 3) + (64 + 1);
        assert_eq!(p.num_parameters(), extractor + heads + 3);
        assert_eq!(p.parameters().len(), p.num_parameters());
    }

    #[test]
    fn set_parameters_round_trips() {
        let mut p = policy();
        let params: Vec<f32> = (0..p.num_parameters()).map(|i| i as f32 * 1e-4).collect();
        p.set_parameters(&params).unwrap();
        assert_eq!(p.parameters(), params);
        assert!(p.set_parameters(&params[1..]).is_err());
    }

    #[test]
    fn rejects_wrong_observation_width() {
        let p = policy();
        let err = p.action_mean(&Array2::zeros((1, 6)).view()).unwrap_err();
        let err = err.downcast::<RLError>().unwrap();
        assert!(matches!(err, RLError::DimensionMismatch { expected: 12, actual: 6 }));
    }

    #[test]
    fn action_head_starts_near_zero() {
        let p = policy();
        let obs = Array2::from_elem((4, 12), 0.5);
        let mean = p.action_mean(&obs.view()).unwrap();
        assert!(mean.iter().all(|m| m.abs() < 0.1));
    }

    #[test]
    fn log_prob_of_mean_under_unit_std() {
        let mean = array![[0.0f32, 1.0]];
        let log_std = array![0.0f32, 0.0];
        let lp = gaussian_log_prob(&mean.view(), &log_std.view(), &mean.view());
        assert_relative_eq!(lp[0], -(2.0 * PI).ln(), epsilon = 1e-6);
    }

    #[test]
    fn entropy_grows_with_log_std() {
        let narrow = gaussian_entropy(&array![0.0f32, 0.0, 0.0].view());
        let wide = gaussian_entropy(&array![1.0f32, 1.0, 1.0].view());
        assert_relative_eq!(wide - narrow, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn samples_have_batch_shape_and_finite_log_probs() {
        let p = policy();
        let mut rng = StdRng::seed_from_u64(5);
        let obs = Array2::zeros((4, 12));
        let (actions, values, log_probs) = p.sample(&obs.view(), &mut rng).unwrap();
        assert_eq!(actions.dim(), (4, 3));
        assert_eq!(values.len(), 4);
        assert!(log_probs.iter().all(|lp| lp.is_finite()));
    }
}
