//! Utility functions and helpers for RL agents

use ndarray::ArrayView1;

/// Fraction of the variance of `y_true` explained by `y_pred`
///
/// `1` is a perfect fit, `0` is no better than predicting the mean, and the
/// result is `NaN` when `y_true` has no variance.
#[must_use]
pub fn explained_variance(y_pred: &ArrayView1<f32>, y_true: &ArrayView1<f32>) -> f32 {
    let var_y = variance(y_true);
    if var_y == 0.0 {
        return f32::NAN;
    }
    let residual = y_true - y_pred;
    1.0 - variance(&residual.view()) / var_y
}

/// Mean of `values`, or `None` when empty
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn safe_mean<I>(values: I) -> Option<f64>
where
    I: IntoIterator,
    I::Item: Into<f64>,
{
    let (sum, count) = values
        .into_iter()
        .fold((0.0f64, 0usize), |(s, n), v| (s + Into::<f64>::into(v), n + 1));
    (count > 0).then(|| sum / count as f64)
}

#[allow(clippy::cast_precision_loss)]
fn variance(x: &ArrayView1<f32>) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    let mean = x.sum() / x.len() as f32;
    x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / x.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn perfect_prediction_explains_everything() {
        let y = array![1.0f32, 2.0, 3.0];
        assert_relative_eq!(explained_variance(&y.view(), &y.view()), 1.0);
    }

    #[test]
    fn constant_prediction_explains_nothing() {
        let y = array![1.0f32, 2.0, 3.0];
        let pred = array![2.0f32, 2.0, 2.0];
        assert_relative_eq!(explained_variance(&pred.view(), &y.view()), 0.0);
    }

    #[test]
    fn constant_target_is_nan() {
        let y = array![1.0f32, 1.0];
        assert!(explained_variance(&y.view(), &y.view()).is_nan());
    }

    #[test]
    fn safe_mean_handles_empty_input() {
        assert_eq!(safe_mean(Vec::<f32>::new()), None);
        assert_eq!(safe_mean(vec![1.0f32, 2.0, 6.0]), Some(3.0));
    }
}
