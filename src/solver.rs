//! The black-box solver contract and how replicas are handed to it.
//!
//! A solver maps a cost array to a discrete structure of the same shape. It is
//! opaque to this crate: no gradient ever flows through it, and its failures are
//! forwarded unchanged.

use ndarray::{stack, ArrayD, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::SolverError;
use crate::{Error, Result};

/// Deterministic map from a cost array `[batch, *dims]` to a structure of the same shape.
pub trait Solver {
    /// Solve every instance in the batch.
    fn solve(&self, theta: &ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError>;
}

impl<F> Solver for F
where
    F: Fn(&ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError>,
{
    fn solve(&self, theta: &ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError> {
        self(theta)
    }
}

/// How the `nb_samples` perturbed replicas are passed to the solver.
///
/// The same policy is used in forward and backward so noise replicas stay aligned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Fold the sample axis into the batch axis and call the solver once.
    #[default]
    Batched,
    /// Call the solver once per replica on a `[batch, *dims]` slice.
    PerSample,
}

fn solve_checked<S: Solver + ?Sized>(solver: &S, input: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    let out = solver.solve(input).map_err(Error::Solver)?;
    if out.shape() != input.shape() {
        return Err(Error::shape_mismatch("solver output", input.shape(), out.shape()));
    }
    Ok(out)
}

impl BatchPolicy {
    /// Solve every replica of `perturbed` (shape `[batch, nb_samples, *dims]`).
    ///
    /// Returns the per-replica structures with the same shape as `perturbed`.
    pub(crate) fn solve_replicas<S: Solver + ?Sized>(
        self,
        solver: &S,
        perturbed: &ArrayD<f64>,
    ) -> Result<ArrayD<f64>> {
        let shape = perturbed.shape().to_vec();
        if shape.len() < 2 {
            return Err(Error::shape_mismatch(
                "perturbed replicas (need [batch, nb_samples, ..])",
                &[0, 0],
                &shape,
            ));
        }
        match self {
            BatchPolicy::Batched => {
                let mut flat = Vec::with_capacity(shape.len() - 1);
                flat.push(shape[0] * shape[1]);
                flat.extend_from_slice(&shape[2..]);
                let input = perturbed
                    .as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(IxDyn(&flat))
                    .map_err(|_| Error::shape_mismatch("sample axis folding", &flat, &shape))?;
                tracing::trace!(rows = flat[0], "solver call (batched)");
                let out = solve_checked(solver, &input)?;
                out.as_standard_layout()
                    .into_owned()
                    .into_shape_with_order(IxDyn(&shape))
                    .map_err(|_| Error::shape_mismatch("sample axis unfolding", &shape, &flat))
            }
            BatchPolicy::PerSample => {
                let mut outs = Vec::with_capacity(shape[1]);
                for s in 0..shape[1] {
                    let input = perturbed.index_axis(Axis(1), s).to_owned();
                    tracing::trace!(replica = s, "solver call (per sample)");
                    outs.push(solve_checked(solver, &input)?);
                }
                let views: Vec<ArrayViewD<'_, f64>> = outs.iter().map(|o| o.view()).collect();
                stack(Axis(1), &views)
                    .map_err(|_| Error::shape_mismatch("replica stacking", &shape, &[]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::cell::Cell;

    fn sign_solver(theta: &ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError> {
        Ok(theta.mapv(|v| if v < 0.0 { 1.0 } else { 0.0 }))
    }

    #[test]
    fn batched_and_per_sample_agree_and_differ_in_call_count() {
        let calls = Cell::new(0usize);
        let solver = |t: &ArrayD<f64>| {
            calls.set(calls.get() + 1);
            sign_solver(t)
        };
        // [batch=2, nb_samples=3, dims=2]
        let p = ArrayD::from_shape_fn(IxDyn(&[2, 3, 2]), |ix| {
            (ix[0] as f64) - (ix[1] as f64) + 0.5 * (ix[2] as f64) - 0.7
        });

        let a = BatchPolicy::Batched.solve_replicas(&solver, &p).unwrap();
        assert_eq!(calls.get(), 1);
        let b = BatchPolicy::PerSample.solve_replicas(&solver, &p).unwrap();
        assert_eq!(calls.get(), 1 + 3);

        assert_eq!(a, b);
        assert_eq!(a.shape(), &[2, 3, 2]);
        assert_eq!(a, p.mapv(|v| if v < 0.0 { 1.0 } else { 0.0 }));
    }

    #[test]
    fn wrong_output_shape_is_a_shape_mismatch() {
        let solver = |t: &ArrayD<f64>| -> std::result::Result<ArrayD<f64>, SolverError> {
            Ok(ArrayD::zeros(IxDyn(&[t.shape()[0], 7])))
        };
        let p = array![[[1.0, 2.0]]].into_dyn();
        let err = BatchPolicy::Batched.solve_replicas(&solver, &p).unwrap_err();
        match err {
            Error::ShapeMismatch { expected, actual, .. } => {
                assert_eq!(expected, vec![1, 2]);
                assert_eq!(actual, vec![1, 7]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn solver_failure_is_propagated() {
        let solver = |_: &ArrayD<f64>| -> std::result::Result<ArrayD<f64>, SolverError> {
            Err("solver timed out".into())
        };
        let p = array![[[1.0]]].into_dyn();
        for policy in [BatchPolicy::Batched, BatchPolicy::PerSample] {
            let err = policy.solve_replicas(&solver, &p).unwrap_err();
            assert!(matches!(err, Error::Solver(_)));
            assert_eq!(err.to_string(), "solver timed out");
        }
    }
}
