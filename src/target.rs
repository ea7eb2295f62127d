//! Target distributions: where the "empirical" side of the IMLE objective comes from.
//!
//! Given the cost array \(\theta\), the realized solver output \(y\) and the incoming
//! gradient \(\nabla_y L\), the target cost array is
//! \[
//! \theta' = \theta + \alpha\, y + \sigma \beta\, \nabla_y L,
//! \]
//! with \(\sigma = +1\) for minimizing solvers and \(\sigma = -1\) for maximizing ones.
//! Solving at \(\theta'\) yields the structure the downstream loss would prefer, and the
//! surrogate gradient is the difference between that structure and \(y\).

use ndarray::{ArrayD, ArrayViewD, Zip};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const SCALING_EPS: f64 = 1e-7;

/// Whether the external solver returns the arg-min or the arg-max structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Solver returns the minimum-cost structure (shortest path, assignment, ...).
    #[default]
    Minimize,
    /// Solver returns the maximum-score structure (top-k, MAP inference, ...).
    Maximize,
}

impl Objective {
    /// Sign applied to the downstream gradient when building the target.
    pub fn sign(self) -> f64 {
        match self {
            Objective::Minimize => 1.0,
            Objective::Maximize => -1.0,
        }
    }
}

/// Parameters of the target cost array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetDistribution {
    /// Weight of the realized solver output in the target.
    pub alpha: f64,
    /// Weight of the downstream gradient; must be nonzero.
    pub beta: f64,
    /// Rescale the surrogate gradient to the L1 norm of the downstream gradient.
    #[serde(default)]
    pub gradient_scaling: bool,
}

impl Default for TargetDistribution {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            beta: 1.0,
            gradient_scaling: false,
        }
    }
}

impl TargetDistribution {
    /// Validated target distribution without gradient scaling.
    pub fn new(alpha: f64, beta: f64) -> Result<Self> {
        let t = Self {
            alpha,
            beta,
            gradient_scaling: false,
        };
        t.validate()?;
        Ok(t)
    }

    /// Enable or disable L1 gradient scaling.
    pub fn with_gradient_scaling(mut self, on: bool) -> Self {
        self.gradient_scaling = on;
        self
    }

    /// `alpha` must be finite; `beta` finite and nonzero (a zero `beta` makes every
    /// surrogate gradient zero).
    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "alpha must be finite, got {}",
                self.alpha
            )));
        }
        if self.beta == 0.0 || !self.beta.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "beta must be finite and nonzero, got {}",
                self.beta
            )));
        }
        Ok(())
    }

    /// Target cost array \(\theta + \alpha y + \sigma\beta\nabla_y L\).
    pub fn params(
        &self,
        theta: ArrayViewD<'_, f64>,
        y: ArrayViewD<'_, f64>,
        grad_y: ArrayViewD<'_, f64>,
        objective: Objective,
    ) -> Result<ArrayD<f64>> {
        if y.shape() != theta.shape() {
            return Err(Error::shape_mismatch("target solver output", theta.shape(), y.shape()));
        }
        if grad_y.shape() != theta.shape() {
            return Err(Error::shape_mismatch("target gradient", theta.shape(), grad_y.shape()));
        }
        let alpha = self.alpha;
        let step = objective.sign() * self.beta;
        let mut out = theta.to_owned();
        if alpha == 0.0 {
            // Keep `0 * inf` out of the target when the solver output is unbounded.
            Zip::from(&mut out).and(&grad_y).for_each(|o, &g| *o += step * g);
        } else {
            Zip::from(&mut out)
                .and(&y)
                .and(&grad_y)
                .for_each(|o, &yv, &g| *o += alpha * yv + step * g);
        }
        Ok(out)
    }

    /// Optional post-processing of the surrogate gradient.
    ///
    /// With `gradient_scaling`, the gradient is rescaled so that
    /// \(\lVert g \rVert_1 = \lVert \nabla_y L \rVert_1\).
    pub fn process(&self, grad_y: ArrayViewD<'_, f64>, mut gradient: ArrayD<f64>) -> ArrayD<f64> {
        if self.gradient_scaling {
            let l1_dy: f64 = grad_y.iter().map(|v| v.abs()).sum();
            let l1_g: f64 = gradient.iter().map(|v| v.abs()).sum();
            let factor = l1_dy / (l1_g + SCALING_EPS);
            gradient.mapv_inplace(|v| v * factor);
        }
        gradient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn zero_beta_is_rejected() {
        assert!(matches!(
            TargetDistribution::new(0.0, 0.0),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            TargetDistribution::new(f64::NAN, 1.0),
            Err(Error::InvalidConfiguration(_))
        ));
        // No sign restriction.
        assert!(TargetDistribution::new(-2.0, -0.5).is_ok());
    }

    #[test]
    fn alpha_zero_nudges_theta_by_scaled_gradient() {
        let t = TargetDistribution::new(0.0, 2.0).unwrap();
        let theta = array![[1.0, 5.0], [5.0, 1.0]].into_dyn();
        let y = array![[1.0, 0.0], [0.0, 1.0]].into_dyn();
        let g = array![[1.0, 0.0], [0.0, -1.0]].into_dyn();

        let tmin = t.params(theta.view(), y.view(), g.view(), Objective::Minimize).unwrap();
        assert_eq!(tmin, array![[3.0, 5.0], [5.0, -1.0]].into_dyn());

        let tmax = t.params(theta.view(), y.view(), g.view(), Objective::Maximize).unwrap();
        assert_eq!(tmax, array![[-1.0, 5.0], [5.0, 3.0]].into_dyn());
    }

    #[test]
    fn alpha_blends_in_solver_output() {
        let t = TargetDistribution::new(0.5, 1.0).unwrap();
        let theta = array![[0.0, 0.0]].into_dyn();
        let y = array![[1.0, 0.0]].into_dyn();
        let g = array![[0.0, 0.0]].into_dyn();
        let out = t.params(theta.view(), y.view(), g.view(), Objective::Minimize).unwrap();
        assert_eq!(out, array![[0.5, 0.0]].into_dyn());
    }

    #[test]
    fn mismatched_gradient_shape_is_reported() {
        let t = TargetDistribution::default();
        let theta = array![[1.0, 2.0]].into_dyn();
        let g = array![[1.0, 2.0, 3.0]].into_dyn();
        let err = t
            .params(theta.view(), theta.view(), g.view(), Objective::Minimize)
            .unwrap_err();
        match err {
            Error::ShapeMismatch { expected, actual, .. } => {
                assert_eq!(expected, vec![1, 2]);
                assert_eq!(actual, vec![1, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gradient_scaling_matches_l1_norm_of_incoming_gradient() {
        let t = TargetDistribution::default().with_gradient_scaling(true);
        let g = array![[3.0, -1.0]].into_dyn();
        let grad = array![[1.0, -1.0]].into_dyn();
        let out = t.process(g.view(), grad);
        let l1: f64 = out.iter().map(|v| v.abs()).sum();
        assert!((l1 - 4.0).abs() < 1e-6, "l1={}", l1);
    }

    proptest! {
        #[test]
        fn zero_gradient_leaves_theta_unchanged_when_alpha_is_zero(
            theta in prop::collection::vec(-10.0f64..10.0, 1..12),
            beta in prop_oneof![-5.0f64..-0.01, 0.01f64..5.0]
        ) {
            let t = TargetDistribution::new(0.0, beta).unwrap();
            let n = theta.len();
            let theta = ArrayD::from_shape_vec(vec![1, n], theta).unwrap();
            let y = ArrayD::<f64>::zeros(vec![1, n]);
            let g = ArrayD::<f64>::zeros(vec![1, n]);
            let out = t.params(theta.view(), y.view(), g.view(), Objective::Minimize).unwrap();
            prop_assert_eq!(&out, &theta);

            let scaled = t.with_gradient_scaling(true).process(g.view(), y.clone());
            prop_assert!(scaled.iter().all(|v| *v == 0.0));
        }
    }
}
