//! Dense layers with hand-derived backpropagation
//!
//! Weights are stored `(out_features, in_features)` and applied as
//! `x · Wᵀ + b`, the layout ONNX `Gemm(transB = 1)` expects.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Fully connected layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// Weight matrix, `(out_features, in_features)`
    pub weight: Array2<f32>,
    /// Bias vector, `(out_features,)`
    pub bias: Array1<f32>,
}

impl Linear {
    /// Orthogonally initialised layer with zero bias
    pub fn orthogonal<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        gain: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: orthogonal(out_features, in_features, gain, rng),
            bias: Array1::zeros(out_features),
        }
    }

    /// Layer with every parameter set to zero
    #[must_use]
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// Input width
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output width
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// `x · Wᵀ + b` for a `(batch, in_features)` input
    #[must_use]
    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Accumulate parameter gradients into `grads` and return the input gradient
    pub fn backward(
        &self,
        x: &ArrayView2<f32>,
        grad_out: &ArrayView2<f32>,
        grads: &mut Linear,
    ) -> Array2<f32> {
        grads.weight += &grad_out.t().dot(x);
        grads.bias += &grad_out.sum_axis(Axis(0));
        grad_out.dot(&self.weight)
    }
}

/// Stack of [`Linear`] layers, each followed by `tanh`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    /// Hidden layers in application order
    pub layers: Vec<Linear>,
}

impl Mlp {
    /// Build `input_dim → hidden[0] → … → hidden[n-1]` with orthogonal weights
    pub fn new<R: Rng + ?Sized>(input_dim: usize, hidden: &[usize], gain: f32, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut prev = input_dim;
        for &width in hidden {
            layers.push(Linear::orthogonal(prev, width, gain, rng));
            prev = width;
        }
        Self { layers }
    }

    /// Same topology with zeroed parameters
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .map(|l| Linear::zeros(l.in_features(), l.out_features()))
                .collect(),
        }
    }

    /// Width of the produced latent, or `input_dim` for an empty stack
    #[must_use]
    pub fn output_dim(&self, input_dim: usize) -> usize {
        self.layers.last().map_or(input_dim, Linear::out_features)
    }

    /// Forward pass
    #[must_use]
    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let mut h = x.to_owned();
        for layer in &self.layers {
            h = layer.forward(&h.view()).mapv(f32::tanh);
        }
        h
    }

    /// Forward pass keeping every activation; `acts[0]` is the input
    #[must_use]
    pub fn forward_cached(&self, x: &ArrayView2<f32>) -> Vec<Array2<f32>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x.to_owned());
        for layer in &self.layers {
            let next = layer.forward(&acts[acts.len() - 1].view()).mapv(f32::tanh);
            acts.push(next);
        }
        acts
    }

    /// Backpropagate `grad_out` (gradient w.r.t. the last activation)
    pub fn backward(&self, acts: &[Array2<f32>], grad_out: Array2<f32>, grads: &mut Mlp) -> Array2<f32> {
        let mut g = grad_out;
        for (k, layer) in self.layers.iter().enumerate().rev() {
            let dz = g * &acts[k + 1].mapv(|a| 1.0 - a * a);
            g = layer.backward(&acts[k].view(), &dz.view(), &mut grads.layers[k]);
        }
        g
    }
}

/// `(rows, cols)` matrix with orthonormal rows or columns, scaled by `gain`
#[allow(clippy::cast_possible_truncation)]
pub fn orthogonal<R: Rng + ?Sized>(rows: usize, cols: usize, gain: f32, rng: &mut R) -> Array2<f32> {
    let (n, m) = if rows >= cols { (rows, cols) } else { (cols, rows) };
    let mut a = Array2::<f64>::from_shape_simple_fn((n, m), || StandardNormal.sample(&mut *rng));

    // Gram-Schmidt over the m columns of length n
    for j in 0..m {
        for k in 0..j {
            let proj = a.column(j).dot(&a.column(k));
            let basis = a.column(k).to_owned();
            a.column_mut(j).scaled_add(-proj, &basis);
        }
        let norm = a.column(j).dot(&a.column(j)).sqrt().max(1e-12);
        a.column_mut(j).mapv_inplace(|v| v / norm);
    }

    let q = if rows >= cols { a } else { a.reversed_axes() };
    q.mapv(|v| (v * f64::from(gain)) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn orthogonal_rows_are_orthonormal() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = orthogonal(4, 12, 1.0, &mut rng);
        let gram = w.dot(&w.t());
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[[i, j]], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn orthogonal_columns_are_scaled_by_gain() {
        let mut rng = StdRng::seed_from_u64(1);
        let w = orthogonal(64, 3, 2.0, &mut rng);
        let gram = w.t().dot(&w);
        for i in 0..3 {
            assert_relative_eq!(gram[[i, i]], 4.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn linear_forward_uses_transposed_weight() {
        let layer = Linear {
            weight: array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]],
            bias: array![0.5, 0.0, -1.0],
        };
        let out = layer.forward(&array![[3.0, 4.0]].view());
        assert_eq!(out, array![[3.5, 8.0, 6.0]]);
    }

    #[test]
    fn mlp_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(2);
        let mlp = Mlp::new(3, &[5, 4], 1.0, &mut rng);
        let x = array![[0.3, -0.2, 0.9], [-0.5, 0.1, 0.4]];

        // loss = sum of outputs
        let acts = mlp.forward_cached(&x.view());
        let out = acts.last().unwrap();
        let mut grads = mlp.zeros_like();
        mlp.backward(&acts, Array2::ones(out.raw_dim()), &mut grads);

        let eps = 1e-3;
        for (l, k) in [(0, [1, 2]), (1, [3, 0])] {
            let mut plus = mlp.clone();
            plus.layers[l].weight[k] += eps;
            let mut minus = mlp.clone();
            minus.layers[l].weight[k] -= eps;
            let numeric = (plus.forward(&x.view()).sum() - minus.forward(&x.view()).sum()) / (2.0 * eps);
            assert_relative_eq!(grads.layers[l].weight[k], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn empty_mlp_is_identity() {
        let mut rng = StdRng::seed_from_u64(3);
        let mlp = Mlp::new(3, &[], 1.0, &mut rng);
        let x = array![[1.0, 2.0, 3.0]];
        assert_eq!(mlp.forward(&x.view()), x);
        assert_eq!(mlp.output_dim(3), 3);
    }
}
