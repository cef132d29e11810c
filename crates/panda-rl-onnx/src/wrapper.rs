//! Inference-only view of a trained actor-critic policy

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use panda_rl_agent::{ActorCriticPolicy, Linear, Mlp, MlpExtractor};
use panda_rl_core::RLError;

use crate::tracer::{Backend, Eager};

/// Observation → deterministic action mean
///
/// Built from the extractor, action head and value head of a trained policy.
/// The value head and the extractor's value branch are consumed and dropped
/// on construction, so nothing evaluated or traced through this type can
/// reach them. The state-independent `log_std` is not part of inference
/// either.
#[derive(Debug, Clone, PartialEq)]
pub struct InferencePolicy {
    policy_net: Mlp,
    action_net: Linear,
    obs_dim: usize,
}

impl InferencePolicy {
    /// Keep the policy path of `extractor` and `action_net`, discard `value_net`
    pub fn from_parts(extractor: MlpExtractor, action_net: Linear, value_net: Linear) -> Result<Self> {
        let obs_dim = extractor.input_dim;
        let latent_dim = extractor.latent_dim_pi();
        let (policy_net, value_branch) = extractor.into_branches();
        debug!(
            dropped_value_parameters = value_branch.layers.len() + 1,
            value_out = value_net.out_features(),
            "building inference policy without the value path"
        );
        drop(value_branch);
        drop(value_net);

        if action_net.in_features() != latent_dim {
            bail!(RLError::Export(format!(
                "action head expects {} features but the policy branch produces {latent_dim}",
                action_net.in_features()
            )));
        }
        Ok(Self {
            policy_net,
            action_net,
            obs_dim,
        })
    }

    /// Split a trained policy and keep only its action path
    pub fn from_policy(policy: ActorCriticPolicy) -> Result<Self> {
        Self::from_parts(policy.extractor, policy.action_net, policy.value_net)
    }

    /// Observation width
    #[must_use]
    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    /// Action width
    #[must_use]
    pub fn act_dim(&self) -> usize {
        self.action_net.out_features()
    }

    /// Dotted names of every parameter, in forward order
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for k in 0..self.policy_net.layers.len() {
            names.push(format!("{}.weight", policy_scope(2 * k)));
            names.push(format!("{}.bias", policy_scope(2 * k)));
        }
        names.push("action_net.weight".to_string());
        names.push("action_net.bias".to_string());
        names
    }

    /// The forward pass, evaluated by `backend`
    ///
    /// Layer `k` of the policy branch is scoped `extractor.policy_net.{2k}`
    /// and its activation `extractor.policy_net.{2k+1}`, mirroring a
    /// sequential container of alternating linear and tanh modules.
    pub fn forward_with<B: Backend>(&self, backend: &mut B, x: B::Value) -> Result<B::Value> {
        let mut h = x;
        for (k, layer) in self.policy_net.layers.iter().enumerate() {
            h = backend.linear(&policy_scope(2 * k), layer, h)?;
            h = backend.tanh(&policy_scope(2 * k + 1), h)?;
        }
        backend.linear("action_net", &self.action_net, h)
    }

    /// Eager forward pass for a `(batch, obs_dim)` batch
    pub fn forward(&self, obs: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if obs.ncols() != self.obs_dim {
            bail!(RLError::DimensionMismatch {
                expected: self.obs_dim,
                actual: obs.ncols(),
            });
        }
        self.forward_with(&mut Eager, obs.to_owned())
    }
}

fn policy_scope(index: usize) -> String {
    format!("extractor.policy_net.{index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use panda_rl_agent::NetArch;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn trained_like() -> ActorCriticPolicy {
        let mut rng = StdRng::seed_from_u64(21);
        let mut policy = ActorCriticPolicy::new(12, 3, &NetArch::default(), -0.5, &mut rng);
        // Larger action head than the 0.01-gain init so outputs are not all ~0
        policy.action_net = Linear::orthogonal(64, 3, 1.0, &mut rng);
        policy
    }

    #[test]
    fn forward_matches_the_policy_mean() {
        let policy = trained_like();
        let obs = Array2::from_shape_fn((5, 12), |(i, j)| ((i * 12 + j) as f32).sin());
        let expected = policy.action_mean(&obs.view()).unwrap();
        let wrapper = InferencePolicy::from_policy(policy).unwrap();
        let actual = wrapper.forward(&obs.view()).unwrap();
        for (a, e) in actual.iter().zip(expected.iter()) {
            approx::assert_relative_eq!(*a, *e, epsilon = 1e-6);
        }
    }

    #[test]
    fn forward_is_deterministic() {
        let wrapper = InferencePolicy::from_policy(trained_like()).unwrap();
        let obs = Array2::from_elem((2, 12), 0.3);
        assert_eq!(
            wrapper.forward(&obs.view()).unwrap(),
            wrapper.forward(&obs.view()).unwrap()
        );
    }

    #[test]
    fn any_batch_size_is_accepted() {
        let wrapper = InferencePolicy::from_policy(trained_like()).unwrap();
        for batch in [1, 4, 17] {
            let out = wrapper.forward(&Array2::zeros((batch, 12)).view()).unwrap();
            assert_eq!(out.dim(), (batch, 3));
        }
    }

    #[test]
    fn wrong_observation_width_is_an_error() {
        let wrapper = InferencePolicy::from_policy(trained_like()).unwrap();
        let err = wrapper.forward(&Array2::zeros((1, 7)).view()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RLError>(),
            Some(RLError::DimensionMismatch { expected: 12, actual: 7 })
        ));
    }

    #[test]
    fn value_parameters_are_not_kept() {
        let wrapper = InferencePolicy::from_policy(trained_like()).unwrap();
        let names = wrapper.parameter_names();
        assert_eq!(names.len(), 6);
        assert!(names.iter().all(|n| !n.contains("value")));
    }

    #[test]
    fn mismatched_action_head_is_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let policy = ActorCriticPolicy::new(12, 3, &NetArch::default(), 0.0, &mut rng);
        let bad_head = Linear::orthogonal(32, 3, 1.0, &mut rng);
        let err = InferencePolicy::from_parts(policy.extractor, bad_head, policy.value_net).unwrap_err();
        assert!(matches!(err.downcast_ref::<RLError>(), Some(RLError::Export(_))));
    }
}
