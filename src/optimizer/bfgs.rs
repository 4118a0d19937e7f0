//! BFGS quasi-Newton optimization with backtracking line search.
//!
//! BFGS keeps an approximation `H` of the inverse Hessian, starting from the
//! identity, and refines it from the observed change in gradient after every
//! accepted step:
//!
//! ```text
//! p   = −H·∇f(x)                               search direction
//! α   : largest of 1, γ, γ², … with            Armijo sufficient decrease
//!       f(x + αp) ≤ f(x) + η·α·∇f(x)ᵀp
//! s   = x⁺ − x,   y = ∇f(x⁺) − ∇f(x)
//! H⁺  = H + ((sᵀy + yᵀHy) / (sᵀy)²)·ssᵀ − (H·y·sᵀ + s·yᵀ·H) / sᵀy
//! ```
//!
//! # Angles
//!
//! Trial points on angle dimensions are blended on the unit circle (sine and
//! cosine components of `x` and `x + p`, weight α, recovered with `atan2`)
//! instead of along the raw radian value, and `s` is the shortest-arc
//! displacement. The blend follows the short arc, so a direction whose
//! largest angle component exceeds a quarter turn is scaled down to it before
//! the line search; otherwise the trial would run against the descent
//! direction. Every trial point is wrapped and passed through the optional
//! model hook before it is scored.
//!
//! # Termination
//!
//! The optimizer stops, always with a normal result, when:
//! - `‖∇f‖₂ < jac_2norm_term` (gradient tolerance)
//! - `‖s‖₂ < delta_x_2norm_term` (parameter tolerance)
//! - `f(x) − f(x⁺) < delta_f_term` (cost tolerance)
//! - backtracking fails after `max_backtracks` halvings (line search exhausted)
//! - `max_iterations` steps were taken
//! - the cost or gradient turns non-finite
//!
//! # Example
//!
//! ```
//! use nalgebra::{DVector, dvector};
//! use posefit::optimizer::bfgs::{Bfgs, FnDifferentiable};
//!
//! # fn main() -> Result<(), posefit::PoseFitError> {
//! let mut problem = FnDifferentiable::new(
//!     |x: &DVector<f64>| (x[0] - 3.0).powi(2),
//!     |x: &DVector<f64>| dvector![2.0 * (x[0] - 3.0)],
//! );
//! let mut solver = Bfgs::new();
//! let result = solver.minimize(&mut problem, &dvector![-40.0], &[false], None)?;
//! assert!((result.parameters[0] - 3.0).abs() < 1e-4);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Nocedal, J. & Wright, S. (2006). *Numerical Optimization* (2nd ed.). Springer. Chapters 3 and 6.

use crate::{
    error, manifold,
    manifold::{Renormalize, so2},
    optimizer,
};

use nalgebra::{DMatrix, DVector};
use std::f64::consts::FRAC_PI_2;
use std::fmt;
use tracing::{debug, warn};
use web_time as time;

/// Objective with an analytic (or approximated) gradient.
pub trait DifferentiableObjective {
    /// Objective value at `x`
    fn cost(&mut self, x: &DVector<f64>) -> error::PoseFitResult<f64>;

    /// Gradient at `x`, same length as `x`
    fn gradient(&mut self, x: &DVector<f64>) -> error::PoseFitResult<DVector<f64>>;
}

/// Closure-pair adapter for [`DifferentiableObjective`].
pub struct FnDifferentiable<F, G> {
    cost: F,
    gradient: G,
}

impl<F, G> FnDifferentiable<F, G>
where
    F: FnMut(&DVector<f64>) -> f64,
    G: FnMut(&DVector<f64>) -> DVector<f64>,
{
    pub fn new(cost: F, gradient: G) -> Self {
        Self { cost, gradient }
    }
}

impl<F, G> DifferentiableObjective for FnDifferentiable<F, G>
where
    F: FnMut(&DVector<f64>) -> f64,
    G: FnMut(&DVector<f64>) -> DVector<f64>,
{
    fn cost(&mut self, x: &DVector<f64>) -> error::PoseFitResult<f64> {
        Ok((self.cost)(x))
    }

    fn gradient(&mut self, x: &DVector<f64>) -> error::PoseFitResult<DVector<f64>> {
        Ok((self.gradient)(x))
    }
}

/// Summary statistics for a BFGS run.
#[derive(Debug, Clone)]
pub struct BfgsSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of accepted steps
    pub iterations: usize,
    /// Maximum gradient norm encountered
    pub max_gradient_norm: f64,
    /// Final gradient norm
    pub final_gradient_norm: f64,
    /// Final accepted step norm
    pub final_parameter_update_norm: f64,
    /// Total backtracking halvings
    pub total_backtracks: usize,
    /// Inverse-Hessian updates skipped for failed curvature
    pub skipped_updates: usize,
    /// Total time elapsed
    pub total_time: time::Duration,
    /// Average time per iteration
    pub average_time_per_iteration: time::Duration,
    /// Per-iteration statistics (collected only at debug level)
    pub iteration_history: Vec<IterationStats>,
    /// Convergence status
    pub convergence_status: optimizer::OptimizationStatus,
}

impl fmt::Display for BfgsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BFGS Final Result")?;
        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "STOPPED ({:?})", self.convergence_status)?;
        }
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            optimizer::reduction_percent(self.initial_cost, self.final_cost)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:           {}", self.iterations)?;
        writeln!(f, "  Backtracks:      {}", self.total_backtracks)?;
        writeln!(f, "  Skipped updates: {}", self.skipped_updates)?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_gradient_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(f, "Parameter Update:")?;
        writeln!(f, "  Final norm: {:.2e}", self.final_parameter_update_norm)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}

/// Per-iteration statistics for detailed logging.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (1 = first accepted step)
    pub iteration: usize,
    /// Cost after the step
    pub cost: f64,
    /// Cost decrease of the step
    pub cost_change: f64,
    /// Gradient norm before the step
    pub gradient_norm: f64,
    /// Norm of the accepted step
    pub step_norm: f64,
    /// Accepted step length α
    pub step_length: f64,
    /// Backtracking halvings
    pub ls_iter: usize,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
}

impl IterationStats {
    /// Print table header
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>7}  {:>11}  {:>13}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "alpha",
            "ls_iter",
            "iter_time",
            "total_time"
        );
    }

    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>11.2}ms",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.step_length,
            self.ls_iter,
            self.iter_time_ms,
            self.total_time_ms
        );
    }
}

/// Configuration parameters for BFGS.
///
/// ```
/// use posefit::optimizer::bfgs::BfgsConfig;
///
/// let config = BfgsConfig::new()
///     .with_max_iterations(200)
///     .with_gradient_tolerance(1e-8);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BfgsConfig {
    /// Maximum number of accepted steps
    pub max_iterations: usize,
    /// Armijo sufficient-decrease constant η
    pub eta_s: f64,
    /// Backtracking contraction factor γ
    pub gamma: f64,
    /// Maximum backtracking halvings per iteration
    pub max_backtracks: usize,
    /// Gradient 2-norm termination threshold
    pub jac_2norm_term: f64,
    /// Step 2-norm termination threshold
    pub delta_x_2norm_term: f64,
    /// Cost decrease termination threshold
    pub delta_f_term: f64,
}

impl Default for BfgsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            eta_s: 1e-4,
            gamma: 0.5,
            max_backtracks: 100,
            jac_2norm_term: 1e-4,
            delta_x_2norm_term: 1e-5,
            delta_f_term: 1e-5,
        }
    }
}

impl BfgsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the Armijo constant η (0 < η < 1)
    pub fn with_sufficient_decrease(mut self, eta_s: f64) -> Self {
        self.eta_s = eta_s;
        self
    }

    /// Set the backtracking factor γ (0 < γ < 1)
    pub fn with_backtracking_factor(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set the maximum number of halvings per line search
    pub fn with_max_backtracks(mut self, max_backtracks: usize) -> Self {
        self.max_backtracks = max_backtracks;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.jac_2norm_term = tolerance;
        self
    }

    /// Set the step (parameter) tolerance
    pub fn with_parameter_tolerance(mut self, tolerance: f64) -> Self {
        self.delta_x_2norm_term = tolerance;
        self
    }

    /// Set the cost decrease tolerance
    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.delta_f_term = tolerance;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nConfiguration:\n  Solver:              BFGS (Armijo backtracking)\n  Max iterations:      {}\n  Armijo eta:          {:.2e}\n  Backtrack gamma:     {:.2}\n  Max backtracks:      {}\n  Gradient tolerance:  {:.2e}\n  Parameter tolerance: {:.2e}\n  Cost tolerance:      {:.2e}",
            self.max_iterations,
            self.eta_s,
            self.gamma,
            self.max_backtracks,
            self.jac_2norm_term,
            self.delta_x_2norm_term,
            self.delta_f_term
        );
    }

    pub(crate) fn validate(&self) -> optimizer::OptimizerResult<()> {
        let in_unit_interval = |v: f64| v > 0.0 && v < 1.0;
        if !in_unit_interval(self.eta_s) || !in_unit_interval(self.gamma) {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "eta_s and gamma must lie in (0, 1), got {} and {}",
                self.eta_s, self.gamma
            ))
            .log());
        }
        let tolerances = [
            self.jac_2norm_term,
            self.delta_x_2norm_term,
            self.delta_f_term,
        ];
        if tolerances.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "termination thresholds must be finite and non-negative".to_string(),
            )
            .log());
        }
        Ok(())
    }
}

/// Largest angle component a search direction may carry.
pub const MAX_ANGLE_STEP: f64 = FRAC_PI_2;

/// Scale `direction` so no angle component exceeds [`MAX_ANGLE_STEP`].
///
/// Returns `true` when the direction was shortened.
fn limit_angle_step(direction: &mut DVector<f64>, angle_flags: &[bool]) -> bool {
    let largest = direction
        .iter()
        .zip(angle_flags)
        .filter(|&(_, &is_angle)| is_angle)
        .fold(0.0_f64, |acc, (p, _)| acc.max(p.abs()));
    if largest > MAX_ANGLE_STEP {
        *direction *= MAX_ANGLE_STEP / largest;
        true
    } else {
        false
    }
}

/// Trial point `x ⊕ α·p`: circular blend on angles, linear elsewhere.
fn trial_point(
    x: &DVector<f64>,
    direction: &DVector<f64>,
    alpha: f64,
    angle_flags: &[bool],
    renormalize: Option<&dyn Renormalize>,
) -> DVector<f64> {
    let mut trial = DVector::from_fn(x.len(), |i, _| {
        if angle_flags[i] {
            so2::circular_interpolate(x[i], x[i] + direction[i], alpha)
        } else {
            x[i] + alpha * direction[i]
        }
    });
    manifold::normalize(&mut trial, angle_flags, renormalize);
    trial
}

/// Rank-2 BFGS update of the inverse Hessian approximation.
fn update_inverse_hessian(h: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>, sy: f64) {
    let hy = &*h * y;
    let yhy = y.dot(&hy);
    let ss_t = s * s.transpose();
    let hy_s_t = &hy * s.transpose();
    let s_y_t_h = s * (y.transpose() * &*h);
    *h += ss_t * ((sy + yhy) / (sy * sy));
    *h -= (hy_s_t + s_y_t_h) / sy;
}

/// BFGS solver with Armijo backtracking.
pub struct Bfgs {
    config: BfgsConfig,
    observers: optimizer::OptObserverVec,
}

impl Default for Bfgs {
    fn default() -> Self {
        Self::new()
    }
}

impl Bfgs {
    /// Create a BFGS solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(BfgsConfig::default())
    }

    /// Create a BFGS solver with the given configuration.
    ///
    /// The configuration is validated on the first call to [`Bfgs::minimize`].
    pub fn with_config(config: BfgsConfig) -> Self {
        Self {
            config,
            observers: optimizer::OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &BfgsConfig {
        &self.config
    }

    /// Add an observer notified after every accepted step.
    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Minimize `problem` starting from `start`.
    ///
    /// # Arguments
    /// * `problem` - Objective and gradient
    /// * `start` - Initial point (wrapped before the first evaluation)
    /// * `angle_flags` - Which dimensions are periodic angles
    /// * `renormalize` - Optional model hook applied to every trial point
    pub fn minimize(
        &mut self,
        problem: &mut impl DifferentiableObjective,
        start: &DVector<f64>,
        angle_flags: &[bool],
        renormalize: Option<&dyn Renormalize>,
    ) -> error::PoseFitResult<optimizer::SolverResult<DVector<f64>>> {
        self.config.validate()?;
        let n = start.len();
        optimizer::check_dimension("angle flags", n, angle_flags.len())?;

        let start_time = time::Instant::now();
        let debug_enabled = tracing::enabled!(tracing::Level::DEBUG);
        let mut iteration_stats = Vec::new();
        if debug_enabled {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let mut x = start.clone();
        manifold::normalize(&mut x, angle_flags, renormalize);
        let mut cost = problem.cost(&x)?;
        let mut gradient = problem.gradient(&x)?;
        optimizer::check_dimension("gradient", n, gradient.len())?;
        let mut cost_evaluations = 1;
        let mut jacobian_evaluations = 1;

        let initial_cost = cost;
        let mut h = DMatrix::<f64>::identity(n, n);
        let mut iteration = 0;
        let mut gradient_norm = gradient.norm();
        let mut max_gradient_norm = gradient_norm;
        let mut step_norm = 0.0;
        let mut total_backtracks = 0;
        let mut skipped_updates = 0;

        let status = loop {
            gradient_norm = gradient.norm();
            max_gradient_norm = max_gradient_norm.max(gradient_norm);
            if !cost.is_finite() || !gradient_norm.is_finite() {
                break optimizer::OptimizationStatus::InvalidNumericalValues;
            }
            if gradient_norm < self.config.jac_2norm_term {
                break optimizer::OptimizationStatus::GradientToleranceReached;
            }
            if iteration >= self.config.max_iterations {
                break optimizer::OptimizationStatus::MaxIterationsReached;
            }

            let iter_start = time::Instant::now();
            let mut direction = -(&h * &gradient);
            let mut slope = gradient.dot(&direction);
            if slope >= 0.0 || slope.is_nan() {
                // Approximation lost positive definiteness numerically
                debug!("BFGS direction is not a descent direction, resetting to steepest descent");
                h.fill_with_identity();
                direction = -gradient.clone();
                slope = gradient.dot(&direction);
            }
            if limit_angle_step(&mut direction, angle_flags) {
                slope = gradient.dot(&direction);
            }

            let mut alpha = 1.0;
            let mut ls_iter = 0;
            let accepted = loop {
                let trial = trial_point(&x, &direction, alpha, angle_flags, renormalize);
                let trial_cost = problem.cost(&trial)?;
                cost_evaluations += 1;
                if trial_cost <= cost + self.config.eta_s * alpha * slope {
                    break Some((trial, trial_cost));
                }
                if ls_iter >= self.config.max_backtracks {
                    break None;
                }
                alpha *= self.config.gamma;
                ls_iter += 1;
            };
            total_backtracks += ls_iter;

            let Some((x_new, cost_new)) = accepted else {
                warn!(
                    "BFGS line search exhausted after {} halvings at cost {:.6e}",
                    ls_iter, cost
                );
                break optimizer::OptimizationStatus::LineSearchExhausted;
            };

            let s = manifold::displacement(&x_new, &x, angle_flags);
            step_norm = s.norm();
            let cost_decrease = cost - cost_new;
            x = x_new;
            cost = cost_new;
            iteration += 1;

            if debug_enabled {
                let stats = IterationStats {
                    iteration,
                    cost,
                    cost_change: cost_decrease,
                    gradient_norm,
                    step_norm,
                    step_length: alpha,
                    ls_iter,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                };
                stats.print_line();
                iteration_stats.push(stats);
            }

            if !self.observers.is_empty() {
                self.observers.set_iteration_metrics(
                    cost,
                    &optimizer::IterationMetrics {
                        gradient_norm: Some(gradient_norm),
                        step_norm: Some(step_norm),
                        step_length: Some(alpha),
                        ..Default::default()
                    },
                );
                self.observers.notify(&x, iteration);
            }

            if step_norm < self.config.delta_x_2norm_term {
                break optimizer::OptimizationStatus::ParameterToleranceReached;
            }
            if cost_decrease < self.config.delta_f_term {
                break optimizer::OptimizationStatus::CostToleranceReached;
            }

            let gradient_new = problem.gradient(&x)?;
            optimizer::check_dimension("gradient", n, gradient_new.len())?;
            jacobian_evaluations += 1;

            let y = &gradient_new - &gradient;
            let sy = s.dot(&y);
            if sy > 0.0 {
                update_inverse_hessian(&mut h, &s, &y, sy);
            } else {
                skipped_updates += 1;
                debug!("Skipping BFGS update: curvature s'y = {:.3e}", sy);
            }
            gradient = gradient_new;
        };

        let elapsed = start_time.elapsed();
        if debug_enabled {
            let summary = BfgsSummary {
                initial_cost,
                final_cost: cost,
                iterations: iteration,
                max_gradient_norm,
                final_gradient_norm: gradient_norm,
                final_parameter_update_norm: step_norm,
                total_backtracks,
                skipped_updates,
                total_time: elapsed,
                average_time_per_iteration: if iteration > 0 {
                    elapsed / iteration as u32
                } else {
                    time::Duration::from_secs(0)
                },
                iteration_history: iteration_stats,
                convergence_status: status.clone(),
            };
            debug!("{}", summary);
        }

        Ok(optimizer::SolverResult {
            parameters: x,
            status,
            initial_cost,
            final_cost: cost,
            iterations: iteration,
            elapsed_time: elapsed,
            convergence_info: Some(optimizer::ConvergenceInfo {
                final_gradient_norm: Some(gradient_norm),
                final_parameter_update_norm: Some(step_norm),
                cost_evaluations,
                jacobian_evaluations,
                ..Default::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};
    use std::f64::consts::PI;
    use std::sync::{Arc, Mutex};

    fn quadratic(a: DMatrix<f64>) -> impl DifferentiableObjective {
        let grad_a = a.clone();
        FnDifferentiable::new(
            move |x: &DVector<f64>| x.dot(&(&a * x)),
            move |x: &DVector<f64>| (&grad_a * x) * 2.0,
        )
    }

    #[test]
    fn test_isotropic_quadratic_within_dimension_plus_one() -> Result<(), Box<dyn std::error::Error>>
    {
        let dim = 4;
        let starts = [
            dvector![1.0, -2.0, 3.0, 0.5],
            dvector![-10.0, 0.1, 7.0, -3.0],
            dvector![0.2, 0.2, -0.2, 0.2],
        ];
        for start in starts {
            let mut problem = quadratic(DMatrix::identity(dim, dim) * 0.5);
            let mut solver = Bfgs::new();
            let result = solver.minimize(&mut problem, &start, &[false; 4], None)?;

            assert!(
                result.iterations <= dim + 1,
                "took {} iterations from {start}",
                result.iterations
            );
            assert!(result.parameters.norm() < 1e-8, "got {}", result.parameters);
            assert_eq!(result.status, optimizer::OptimizationStatus::GradientToleranceReached);
        }
        Ok(())
    }

    #[test]
    fn test_general_spd_quadratic() -> Result<(), Box<dyn std::error::Error>> {
        let a = dmatrix![
            4.0, 1.0, 0.5;
            1.0, 3.0, 0.2;
            0.5, 0.2, 1.0
        ];
        let mut problem = quadratic(a);
        let config = BfgsConfig::new()
            .with_gradient_tolerance(1e-10)
            .with_parameter_tolerance(1e-14)
            .with_cost_tolerance(1e-20);
        let mut solver = Bfgs::with_config(config);
        let result = solver.minimize(&mut problem, &dvector![3.0, -4.0, 5.0], &[false; 3], None)?;

        assert!(result.parameters.norm() < 1e-8, "got {}", result.parameters);
        assert!(result.iterations < 50, "took {} iterations", result.iterations);
        Ok(())
    }

    #[test]
    fn test_rosenbrock() -> Result<(), Box<dyn std::error::Error>> {
        let mut problem = FnDifferentiable::new(
            |x: &DVector<f64>| 100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2),
            |x: &DVector<f64>| {
                dvector![
                    -400.0 * x[0] * (x[1] - x[0] * x[0]) - 2.0 * (1.0 - x[0]),
                    200.0 * (x[1] - x[0] * x[0])
                ]
            },
        );
        let config = BfgsConfig::new()
            .with_gradient_tolerance(1e-8)
            .with_parameter_tolerance(1e-12)
            .with_cost_tolerance(1e-16);
        let mut solver = Bfgs::with_config(config);
        let result = solver.minimize(&mut problem, &dvector![-1.2, 1.0], &[false, false], None)?;

        assert!((result.parameters[0] - 1.0).abs() < 1e-3, "got {}", result.parameters);
        assert!((result.parameters[1] - 1.0).abs() < 1e-3, "got {}", result.parameters);
        assert!(result.final_cost < 1e-6);
        Ok(())
    }

    #[test]
    fn test_angle_converges_across_seam() -> Result<(), Box<dyn std::error::Error>> {
        let target = PI - 0.1;
        let mut problem = FnDifferentiable::new(
            move |x: &DVector<f64>| 1.0 - (x[0] - target).cos(),
            move |x: &DVector<f64>| dvector![(x[0] - target).sin()],
        );
        let config = BfgsConfig::new().with_gradient_tolerance(1e-8);
        let mut solver = Bfgs::with_config(config);
        let result = solver.minimize(&mut problem, &dvector![-PI + 0.2], &[true], None)?;

        let error = so2::circular_displacement(result.parameters[0], target);
        assert!(error.abs() < 1e-4, "ended at {}", result.parameters[0]);
        assert!((-PI..PI).contains(&result.parameters[0]));
        Ok(())
    }

    #[test]
    fn test_long_angle_step_keeps_descent_direction() -> Result<(), Box<dyn std::error::Error>> {
        // The first steepest-descent step is about −4.5 rad, past a half turn
        let mut problem = FnDifferentiable::new(
            |x: &DVector<f64>| 4.83 * (1.0 - x[0].cos()),
            |x: &DVector<f64>| dvector![4.83 * x[0].sin()],
        );
        let mut solver = Bfgs::new();
        let result = solver.minimize(&mut problem, &dvector![1.2], &[true], None)?;

        assert!(result.iterations > 0);
        assert!(
            so2::circular_displacement(result.parameters[0], 0.0).abs() < 1e-2,
            "ended at {}",
            result.parameters[0]
        );
        assert!(result.final_cost < 1e-3, "final cost {}", result.final_cost);
        assert!(result.final_cost < result.initial_cost);
        Ok(())
    }

    #[test]
    fn test_limit_angle_step_scales_whole_direction() {
        let mut direction = dvector![-4.0, 2.0, 8.0];
        assert!(limit_angle_step(&mut direction, &[true, false, false]));
        let scale = FRAC_PI_2 / 4.0;
        assert!((direction - dvector![-4.0, 2.0, 8.0] * scale).norm() < 1e-12);

        let mut short = dvector![1.0, 100.0];
        assert!(!limit_angle_step(&mut short, &[true, false]));
        assert_eq!(short, dvector![1.0, 100.0]);
    }

    #[test]
    fn test_line_search_exhausted_keeps_point() -> Result<(), Box<dyn std::error::Error>> {
        let evaluations = Arc::new(Mutex::new(0usize));
        let counter = evaluations.clone();
        // Gradient with the wrong sign: every direction goes uphill
        let mut problem = FnDifferentiable::new(
            move |x: &DVector<f64>| {
                if let Ok(mut count) = counter.lock() {
                    *count += 1;
                }
                x[0] * x[0]
            },
            |x: &DVector<f64>| dvector![-2.0 * x[0]],
        );
        let mut solver = Bfgs::with_config(BfgsConfig::new().with_max_backtracks(10));
        let result = solver.minimize(&mut problem, &dvector![1.0], &[false], None)?;

        assert_eq!(result.status, optimizer::OptimizationStatus::LineSearchExhausted);
        assert_eq!(result.parameters, dvector![1.0]);
        assert_eq!(result.iterations, 0);
        let count = *evaluations.lock().map_err(|e| e.to_string())?;
        assert_eq!(count, 1 + 11);
        Ok(())
    }

    #[test]
    fn test_renormalize_applied_before_evaluation() -> Result<(), Box<dyn std::error::Error>> {
        let clamp = |x: &mut DVector<f64>| x[0] = x[0].max(0.0);
        let mut problem = FnDifferentiable::new(
            |x: &DVector<f64>| {
                assert!(x[0] >= 0.0, "evaluated infeasible point {x}");
                (x[0] + 1.0).powi(2)
            },
            |x: &DVector<f64>| dvector![2.0 * (x[0] + 1.0)],
        );
        let mut solver = Bfgs::new();
        let result = solver.minimize(&mut problem, &dvector![2.0], &[false], Some(&clamp))?;
        assert_eq!(result.parameters[0], 0.0);
        Ok(())
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let mut problem = FnDifferentiable::new(
            |x: &DVector<f64>| x.norm_squared(),
            |_: &DVector<f64>| dvector![0.0, 0.0, 0.0],
        );
        let mut solver = Bfgs::new();
        assert!(solver.minimize(&mut problem, &dvector![1.0, 1.0], &[false], None).is_err());
        assert!(solver.minimize(&mut problem, &dvector![1.0, 1.0], &[false, false], None).is_err());

        let mut solver = Bfgs::with_config(BfgsConfig::new().with_backtracking_factor(1.5));
        assert!(solver.minimize(&mut problem, &dvector![1.0, 1.0, 1.0], &[false; 3], None).is_err());
    }

    #[test]
    fn test_inverse_hessian_update_satisfies_secant() {
        let mut h = DMatrix::<f64>::identity(2, 2);
        let s = dvector![0.5, -0.25];
        let y = dvector![2.0, 1.0];
        let sy = s.dot(&y);
        update_inverse_hessian(&mut h, &s, &y, sy);

        let hy = &h * &y;
        assert!((hy - &s).norm() < 1e-12, "secant condition H⁺y = s violated");
        assert!((&h - h.transpose()).norm() < 1e-12);
    }
}
