//! Extension contract between a host differentiation engine and a custom operator.
//!
//! The host owns the graph; it creates one `Context` per node, calls `forward`
//! while building the graph and `backward` when the gradient reaches the node.

use ndarray::{ArrayD, ArrayViewD};

use crate::Result;

/// A custom forward/backward operator over `f64` arrays.
pub trait CustomOp {
    /// Per-invocation state carried from `forward` to `backward`.
    type Context: Default;

    /// Compute the output and record what `backward` needs in `ctx`.
    fn forward(&mut self, ctx: &mut Self::Context, input: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>>;

    /// Gradient with respect to the input, given the gradient with respect to the output.
    fn backward(&self, ctx: &mut Self::Context, grad_output: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>>;
}
