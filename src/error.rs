//! Error taxonomy shared by every operator in this crate.
//!
//! Nothing here is ever downgraded to a default gradient: a wrong surrogate
//! gradient is harder to notice than a failed training step.

/// Boxed error produced by an external solver.
pub type SolverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors for the IMLE estimator and its building blocks.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed noise, target-distribution, or estimator parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Two arrays that must agree on shape do not.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was observed (e.g. `"solver output"`).
        context: &'static str,
        /// Shape the estimator required.
        expected: Vec<usize>,
        /// Shape it actually received.
        actual: Vec<usize>,
    },
    /// `backward` was called on a context that no `forward` populated.
    #[error("backward called without a matching forward call")]
    ContextMissing,
    /// A context was used for a second forward or backward call.
    #[error("estimator context was already consumed by a previous call")]
    ContextReused,
    /// The external solver failed; its error is forwarded unchanged.
    #[error("{0}")]
    Solver(#[source] SolverError),
}

impl Error {
    pub(crate) fn shape_mismatch(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_message_carries_both_shapes() {
        let e = Error::shape_mismatch("solver output", &[2, 3], &[2, 4]);
        let msg = e.to_string();
        assert!(msg.contains("[2, 3]"), "msg={}", msg);
        assert!(msg.contains("[2, 4]"), "msg={}", msg);
        assert!(msg.contains("solver output"), "msg={}", msg);
    }

    #[test]
    fn solver_errors_are_forwarded_verbatim() {
        let inner: SolverError = "infeasible instance".into();
        let e = Error::Solver(inner);
        assert_eq!(e.to_string(), "infeasible instance");
    }
}
