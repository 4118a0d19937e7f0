//! Batched central-difference gradient.
//!
//! The residual evaluator only exposes values, so gradient-based refinement
//! approximates the gradient with central differences:
//!
//! ```text
//! g_i = (f(c + h_i·e_i) − f(c − h_i·e_i)) / 2h_i
//! ```
//!
//! The step `h_i` is per dimension, since positions and angles usually live on
//! very different scales. All `2·D` shifted points are wrapped, passed through
//! the model hook and then scored through [`Objective::evaluate_batch`], so a
//! batching evaluator sees full tiles.

use crate::{
    core::objective::{Objective, ResidualEvaluator},
    error,
    manifold::{self, Renormalize},
    optimizer::{self, bfgs::DifferentiableObjective},
};
use nalgebra::DVector;

/// Check that every step is finite and positive.
pub fn validate_steps(steps: &DVector<f64>) -> optimizer::OptimizerResult<()> {
    match steps.iter().position(|h| !(h.is_finite() && *h > 0.0)) {
        Some(i) => Err(optimizer::OptimizerError::InvalidParameters(format!(
            "finite difference step {i} must be positive, got {}",
            steps[i]
        ))
        .log()),
        None => Ok(()),
    }
}

/// Central-difference gradient of `objective` at `coeff`, one step per dimension.
///
/// # Errors
/// `InvalidParameters` for a non-positive or non-finite step, a dimension
/// error when `steps` or `angle_flags` do not match `coeff`, and any error
/// raised by the objective.
pub fn central_difference_gradient<E: ResidualEvaluator>(
    objective: &mut Objective<E>,
    coeff: &DVector<f64>,
    steps: &DVector<f64>,
    angle_flags: &[bool],
    renormalize: Option<&dyn Renormalize>,
) -> error::PoseFitResult<DVector<f64>> {
    let n = coeff.len();
    optimizer::check_dimension("finite difference steps", n, steps.len())?;
    optimizer::check_dimension("angle flags", n, angle_flags.len())?;
    validate_steps(steps)?;

    let mut shifted = Vec::with_capacity(2 * n);
    for (i, &step) in steps.iter().enumerate() {
        for sign in [1.0, -1.0] {
            let mut point = coeff.clone();
            point[i] += sign * step;
            manifold::normalize(&mut point, angle_flags, renormalize);
            shifted.push(point);
        }
    }

    let values = objective.evaluate_batch(&shifted)?;
    Ok(DVector::from_fn(n, |i, _| {
        (values[2 * i] - values[2 * i + 1]) / (2.0 * steps[i])
    }))
}

/// [`Objective`] viewed as a differentiable function for BFGS.
pub struct FiniteDifference<'a, E> {
    objective: &'a mut Objective<E>,
    steps: DVector<f64>,
    angle_flags: &'a [bool],
    renormalize: Option<&'a dyn Renormalize>,
}

impl<'a, E: ResidualEvaluator> FiniteDifference<'a, E> {
    /// Same `step` on every dimension of `angle_flags`.
    pub fn new(
        objective: &'a mut Objective<E>,
        step: f64,
        angle_flags: &'a [bool],
        renormalize: Option<&'a dyn Renormalize>,
    ) -> Self {
        Self {
            objective,
            steps: DVector::from_element(angle_flags.len(), step),
            angle_flags,
            renormalize,
        }
    }

    /// Replace the uniform step with one step per dimension.
    pub fn with_steps(mut self, steps: DVector<f64>) -> Self {
        self.steps = steps;
        self
    }

    pub fn steps(&self) -> &DVector<f64> {
        &self.steps
    }
}

impl<E: ResidualEvaluator> DifferentiableObjective for FiniteDifference<'_, E> {
    fn cost(&mut self, x: &DVector<f64>) -> error::PoseFitResult<f64> {
        Ok(self.objective.evaluate(x)?)
    }

    fn gradient(&mut self, x: &DVector<f64>) -> error::PoseFitResult<DVector<f64>> {
        central_difference_gradient(
            self.objective,
            x,
            &self.steps,
            self.angle_flags,
            self.renormalize,
        )
    }
}
