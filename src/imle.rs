//! Implicit maximum-likelihood estimation (I-MLE) through a black-box solver.
//!
//! Forward:
//! \[
//! y = \operatorname{reduce}_i\, \operatorname{MAP}(\theta + \tau_{in}\,\epsilon_i),
//! \qquad \epsilon_i \sim \text{noise}.
//! \]
//! Backward, with the *same* \(\epsilon_i\):
//! \[
//! \theta' = \theta + \alpha y + \sigma\beta\,\nabla_y L,\qquad
//! y'_i = \operatorname{MAP}(\theta' + \tau_{t}\,\epsilon_i),\qquad
//! \nabla_\theta L \approx \frac{\sigma}{\tau_t}\operatorname{reduce}_i (y'_i - y_i),
//! \]
//! where \(\sigma = +1\) for arg-min solvers and \(-1\) for arg-max solvers. Descending
//! this gradient moves \(\theta\) toward costs whose MAP structure looks like the one
//! the downstream loss asked for.
//!
//! The noise is owned by the [`ImleContext`] between the two calls; `backward` has no
//! random source of its own, so it cannot redraw.

use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::SolverError;
use crate::noise::{NoiseDistribution, NoiseSampler, NoiseSource};
use crate::op::CustomOp;
use crate::solver::{BatchPolicy, Solver};
use crate::target::{Objective, TargetDistribution};
use crate::{Error, Result};

/// How per-replica solver outputs are collapsed onto the cost array's shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Average over the sample axis.
    #[default]
    Mean,
    /// Keep the first replica only.
    First,
}

impl Reduction {
    /// Reduce `[batch, nb_samples, *dims]` to `[batch, *dims]`.
    pub fn reduce(self, samples: &ArrayD<f64>) -> ArrayD<f64> {
        match self {
            Reduction::Mean => {
                let n = samples.len_of(Axis(1)) as f64;
                samples.sum_axis(Axis(1)) / n
            }
            Reduction::First => samples.index_axis(Axis(1), 0).to_owned(),
        }
    }
}

/// Estimator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImleConfig {
    /// Perturbed replicas per forward call (`>= 1`).
    pub nb_samples: usize,
    /// Noise scale for the forward replicas (`> 0`).
    pub input_noise_temperature: f64,
    /// Noise scale for the target replicas (`> 0`); also divides the gradient.
    pub target_noise_temperature: f64,
    /// Noise family.
    pub noise_distribution: NoiseDistribution,
    /// Target cost construction.
    pub target_distribution: TargetDistribution,
    /// Whether the solver minimizes or maximizes.
    pub objective: Objective,
    /// Sample-axis reduction, shared by forward and backward.
    pub reduction: Reduction,
    /// Solver batching, shared by forward and backward.
    pub batch_policy: BatchPolicy,
    /// Seed of the noise RNG.
    pub seed: u64,
}

impl Default for ImleConfig {
    fn default() -> Self {
        Self {
            nb_samples: 1,
            input_noise_temperature: 1.0,
            target_noise_temperature: 1.0,
            noise_distribution: NoiseDistribution::Gumbel,
            target_distribution: TargetDistribution::default(),
            objective: Objective::Minimize,
            reduction: Reduction::Mean,
            batch_policy: BatchPolicy::Batched,
            seed: 0,
        }
    }
}

fn check_temperature(name: &str, t: f64) -> Result<()> {
    if t <= 0.0 || !t.is_finite() {
        return Err(Error::InvalidConfiguration(format!(
            "{name} must be positive and finite, got {t}"
        )));
    }
    Ok(())
}

impl ImleConfig {
    /// Set the number of replicas.
    pub fn with_nb_samples(mut self, nb_samples: usize) -> Self {
        self.nb_samples = nb_samples;
        self
    }

    /// Set the forward noise temperature.
    pub fn with_input_noise_temperature(mut self, t: f64) -> Self {
        self.input_noise_temperature = t;
        self
    }

    /// Set the target noise temperature.
    pub fn with_target_noise_temperature(mut self, t: f64) -> Self {
        self.target_noise_temperature = t;
        self
    }

    /// Set the noise family.
    pub fn with_noise(mut self, noise: NoiseDistribution) -> Self {
        self.noise_distribution = noise;
        self
    }

    /// Set the target distribution.
    pub fn with_target(mut self, target: TargetDistribution) -> Self {
        self.target_distribution = target;
        self
    }

    /// Set the solver's optimization direction.
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    /// Set the sample-axis reduction.
    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    /// Set the solver batching policy.
    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    /// Set the noise seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject malformed settings before any solver call happens.
    pub fn validate(&self) -> Result<()> {
        self.validate_estimator()?;
        self.noise_distribution.validate()
    }

    // Everything except the noise family, which only the built-in sampler reads.
    fn validate_estimator(&self) -> Result<()> {
        if self.nb_samples < 1 {
            return Err(Error::InvalidConfiguration(format!(
                "nb_samples must be >= 1, got {}",
                self.nb_samples
            )));
        }
        check_temperature("input_noise_temperature", self.input_noise_temperature)?;
        check_temperature("target_noise_temperature", self.target_noise_temperature)?;
        self.target_distribution.validate()?;
        Ok(())
    }

    /// Wrap `solver` into an estimator drawing noise from `noise_distribution`.
    pub fn build<S: Solver>(self, solver: S) -> Result<Imle<S>> {
        self.validate()?;
        let noise = NoiseSampler::new(self.noise_distribution, self.seed)?;
        Ok(Imle {
            config: self,
            solver,
            noise,
        })
    }

    /// Like [`ImleConfig::build`], with a caller-supplied noise source.
    ///
    /// `noise_distribution` and `seed` are ignored in that case, and are not validated.
    pub fn build_with_noise<S: Solver, N: NoiseSource>(self, solver: S, noise: N) -> Result<Imle<S, N>> {
        self.validate_estimator()?;
        Ok(Imle {
            config: self,
            solver,
            noise,
        })
    }
}

/// Wrap a solver function into an estimator (decorator-style entry point).
///
/// ```
/// use imle::imle;
/// use ::imle::{ImleConfig, SolverError};
/// use ndarray::ArrayD;
///
/// let mut op = imle(ImleConfig::default(), |theta: &ArrayD<f64>| {
///     Ok::<_, SolverError>(theta.mapv(|v| if v < 0.0 { 1.0 } else { 0.0 }))
/// })
/// .unwrap();
/// let theta = ndarray::array![[-1.0, 3.0]].into_dyn();
/// let (y, _ctx) = op.apply(theta.view()).unwrap();
/// assert_eq!(y.shape(), theta.shape());
/// ```
pub fn imle<F>(config: ImleConfig, solver: F) -> Result<Imle<F>>
where
    F: Fn(&ArrayD<f64>) -> std::result::Result<ArrayD<f64>, SolverError>,
{
    config.build(solver)
}

#[derive(Debug)]
struct Saved {
    config: ImleConfig,
    theta: ArrayD<f64>,
    noise: ArrayD<f64>,
    samples: ArrayD<f64>,
    output: ArrayD<f64>,
}

#[derive(Debug, Default)]
enum ContextState {
    #[default]
    Unbound,
    ForwardDone(Saved),
    BackwardDone,
}

/// Lifecycle of an [`ImleContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    /// No forward call has populated the context.
    Unbound,
    /// Forward ran; the context holds the noise and outputs.
    ForwardDone,
    /// Backward ran; the saved state has been dropped.
    BackwardDone,
}

/// State binding one forward call to its backward call.
///
/// A context is single-use: `Unbound -> ForwardDone -> BackwardDone`.
#[derive(Debug, Default)]
pub struct ImleContext {
    state: ContextState,
}

impl ImleContext {
    /// Fresh, unbound context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ContextPhase {
        match self.state {
            ContextState::Unbound => ContextPhase::Unbound,
            ContextState::ForwardDone(_) => ContextPhase::ForwardDone,
            ContextState::BackwardDone => ContextPhase::BackwardDone,
        }
    }

    /// Noise drawn by the forward call, `[batch, nb_samples, *dims]`.
    pub fn noise(&self) -> Option<&ArrayD<f64>> {
        match &self.state {
            ContextState::ForwardDone(s) => Some(&s.noise),
            _ => None,
        }
    }

    /// Per-replica forward solver outputs, `[batch, nb_samples, *dims]`.
    pub fn samples(&self) -> Option<&ArrayD<f64>> {
        match &self.state {
            ContextState::ForwardDone(s) => Some(&s.samples),
            _ => None,
        }
    }
}

/// Differentiable wrapper around a black-box solver.
#[derive(Debug)]
pub struct Imle<S, N = NoiseSampler> {
    config: ImleConfig,
    solver: S,
    noise: N,
}

fn perturb(theta: ArrayViewD<'_, f64>, noise: &ArrayD<f64>, temperature: f64) -> ArrayD<f64> {
    let mut out = noise.mapv(|e| temperature * e);
    out += &theta.insert_axis(Axis(1));
    out
}

impl<S: Solver, N: NoiseSource> Imle<S, N> {
    /// The configuration this estimator was built with.
    pub fn config(&self) -> &ImleConfig {
        &self.config
    }

    /// The wrapped solver.
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Solve perturbed copies of `theta` and return the reduced structure.
    ///
    /// `theta` has shape `[batch, *dims]`; so does the result. `ctx` must be unbound.
    pub fn forward(&mut self, ctx: &mut ImleContext, theta: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        if !matches!(ctx.state, ContextState::Unbound) {
            return Err(Error::ContextReused);
        }
        if theta.ndim() < 1 {
            return Err(Error::shape_mismatch("cost array (needs a batch axis)", &[1], theta.shape()));
        }
        let cfg = self.config;

        let mut noise_shape = Vec::with_capacity(theta.ndim() + 1);
        noise_shape.push(theta.shape()[0]);
        noise_shape.push(cfg.nb_samples);
        noise_shape.extend_from_slice(&theta.shape()[1..]);

        let noise = self.noise.sample(&noise_shape)?;
        if noise.shape() != noise_shape.as_slice() {
            return Err(Error::shape_mismatch("noise sample", &noise_shape, noise.shape()));
        }

        let perturbed = perturb(theta.view(), &noise, cfg.input_noise_temperature);
        let samples = cfg.batch_policy.solve_replicas(&self.solver, &perturbed)?;
        let output = cfg.reduction.reduce(&samples);

        tracing::debug!(
            shape = ?theta.shape(),
            nb_samples = cfg.nb_samples,
            policy = ?cfg.batch_policy,
            "imle forward"
        );

        ctx.state = ContextState::ForwardDone(Saved {
            config: cfg,
            theta: theta.to_owned(),
            noise,
            samples,
            output: output.clone(),
        });
        Ok(output)
    }

    /// Surrogate gradient with respect to `theta` for the forward call recorded in `ctx`.
    ///
    /// Consumes the context's saved state; a second call fails with
    /// [`Error::ContextReused`].
    pub fn backward(&self, ctx: &mut ImleContext, grad_y: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let saved = match &ctx.state {
            ContextState::Unbound => return Err(Error::ContextMissing),
            ContextState::BackwardDone => return Err(Error::ContextReused),
            ContextState::ForwardDone(saved) => saved,
        };
        if grad_y.shape() != saved.theta.shape() {
            return Err(Error::shape_mismatch("incoming gradient", saved.theta.shape(), grad_y.shape()));
        }
        let Saved {
            config: cfg,
            theta,
            noise,
            samples,
            output,
        } = match std::mem::replace(&mut ctx.state, ContextState::BackwardDone) {
            ContextState::ForwardDone(saved) => saved,
            _ => return Err(Error::ContextMissing),
        };

        let target = cfg.target_distribution;
        if target.alpha == 0.0 && grad_y.iter().all(|g| *g == 0.0) {
            // theta' == theta: no downstream signal, so no solver call and no gradient.
            tracing::debug!(shape = ?theta.shape(), "imle backward skipped (zero incoming gradient)");
            return Ok(ArrayD::zeros(theta.raw_dim()));
        }
        let theta_target = target.params(theta.view(), output.view(), grad_y.view(), cfg.objective)?;
        let perturbed = perturb(theta_target.view(), &noise, cfg.target_noise_temperature);
        let target_samples = cfg.batch_policy.solve_replicas(&self.solver, &perturbed)?;

        // sign * (y' - y) / tau
        let scale = cfg.objective.sign() / cfg.target_noise_temperature;
        let mut diff = target_samples - &samples;
        diff.mapv_inplace(|d| d * scale);
        let gradient = target.process(grad_y.view(), cfg.reduction.reduce(&diff));

        let flat = gradient.iter().all(|g| *g == 0.0);
        if flat && grad_y.iter().any(|g| *g != 0.0) {
            tracing::warn!(
                beta = target.beta,
                "imle surrogate gradient is zero for a nonzero incoming gradient; beta may be too small"
            );
        }
        tracing::debug!(shape = ?theta.shape(), zero = flat, "imle backward");
        Ok(gradient)
    }

    /// Run `forward` on a fresh context and hand the context back.
    pub fn apply(&mut self, theta: ArrayViewD<'_, f64>) -> Result<(ArrayD<f64>, ImleContext)> {
        let mut ctx = ImleContext::new();
        let y = self.forward(&mut ctx, theta)?;
        Ok((y, ctx))
    }
}

impl<S: Solver, N: NoiseSource> CustomOp for Imle<S, N> {
    type Context = ImleContext;

    fn forward(&mut self, ctx: &mut ImleContext, input: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        Imle::forward(self, ctx, input)
    }

    fn backward(&self, ctx: &mut ImleContext, grad_output: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        Imle::backward(self, ctx, grad_output)
    }
}
