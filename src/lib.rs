//! Gradients through black-box combinatorial solvers.
//!
//! This crate implements implicit maximum-likelihood estimation (I-MLE): a solver that
//! maps a cost array to a discrete structure (a path, an assignment, a top-k mask) is
//! wrapped as a custom operator whose backward pass returns a surrogate gradient for
//! the cost array.
//!
//! Public invariants (must not change):
//! - The solver is opaque: it is called, never differentiated.
//! - Forward noise is drawn once and reused verbatim by the matching backward call.
//! - Output and gradient have the cost array's shape; the sample axis never leaks.
//! - Configuration is validated eagerly, before the first solver call.

pub mod error;
pub mod imle;
pub mod noise;
pub mod op;
pub mod shortest_path;
pub mod solver;
pub mod target;

pub use error::{Error, Result, SolverError};
pub use imle::{imle, ContextPhase, Imle, ImleConfig, ImleContext, Reduction};
pub use noise::{NoiseDistribution, NoiseSampler, NoiseSource};
pub use op::CustomOp;
pub use solver::{BatchPolicy, Solver};
pub use target::{Objective, TargetDistribution};
