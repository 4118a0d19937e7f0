//! Derivative-free and quasi-Newton optimizers for pose coefficients.
//!
//! This module provides the two search procedures the fit controller drives:
//! - Constriction-coefficient particle swarm (primary, derivative-free, batched)
//! - BFGS with Armijo backtracking (alternative / cross-check, needs a gradient)
//!
//! plus a batched central-difference gradient for objectives that only expose
//! values.

use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod bfgs;
pub mod finite_diff;
pub mod particle_swarm;

pub use bfgs::{Bfgs, BfgsConfig};
pub use particle_swarm::{ParticleSwarm, ParticleSwarmConfig};

// Re-export observer types from the observers module
pub use crate::observers::{IterationMetrics, OptObserver, OptObserverVec};

/// Optimizer-specific error types
///
/// All variants describe invalid setup; numerical non-convergence is reported
/// through [`OptimizationStatus`] instead.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Swarm size is zero or not a whole number of evaluator batches
    #[error("Swarm size {swarm_size} must be a positive multiple of the batch width {batch_width}")]
    InvalidSwarmSize {
        swarm_size: usize,
        batch_width: usize,
    },

    /// Acceleration coefficients too small for the constriction coefficient
    #[error("Constriction requires c_p + c_g > 4, got {phi}")]
    InvalidAccelerationCoefficients { phi: f64 },

    /// Inputs of mismatched dimension
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Fail with `DimensionMismatch` unless `actual == expected`.
pub(crate) fn check_dimension(context: &str, expected: usize, actual: usize) -> OptimizerResult<()> {
    if expected != actual {
        return Err(OptimizerError::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual,
        }
        .log());
    }
    Ok(())
}

/// Detailed convergence information.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInfo {
    /// Final gradient norm (BFGS)
    pub final_gradient_norm: Option<f64>,
    /// Final accepted step norm (BFGS)
    pub final_parameter_update_norm: Option<f64>,
    /// Final per-dimension swarm extent norm (swarm)
    pub final_swarm_spread: Option<f64>,
    /// Objective evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let fmt_opt = |value: Option<f64>| match value {
            Some(v) => format!("{v:.2e}"),
            None => "-".to_string(),
        };
        write!(
            f,
            "Final gradient norm: {}, Final parameter update norm: {}, Final swarm spread: {}, Cost evaluations: {}, Jacobian evaluations: {}",
            fmt_opt(self.final_gradient_norm),
            fmt_opt(self.final_parameter_update_norm),
            fmt_opt(self.final_swarm_spread),
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Why an optimization run stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Objective decrease of an accepted step fell below tolerance
    CostToleranceReached,
    /// Accepted step norm fell below tolerance
    ParameterToleranceReached,
    /// Gradient norm fell below tolerance
    GradientToleranceReached,
    /// Swarm collapsed below the spread tolerance
    SpreadToleranceReached,
    /// Backtracking found no sufficient decrease; no progress possible
    LineSearchExhausted,
    /// NaN or Inf detected in cost or gradient
    InvalidNumericalValues,
}

impl OptimizationStatus {
    /// Whether the run stopped on a convergence criterion
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
                | OptimizationStatus::SpreadToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::SpreadToleranceReached => write!(f, "Swarm spread tolerance reached"),
            OptimizationStatus::LineSearchExhausted => write!(f, "Line search exhausted"),
            OptimizationStatus::InvalidNumericalValues => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    /// Final parameters
    pub parameters: T,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

/// Percentage cost reduction, guarded against a zero initial cost.
pub(crate) fn reduction_percent(initial_cost: f64, final_cost: f64) -> f64 {
    100.0 * (initial_cost - final_cost) / initial_cost.abs().max(1e-12)
}

/// Per-dimension extent `max - min` of a set of vectors.
pub(crate) fn extent(vectors: &[DVector<f64>]) -> Option<DVector<f64>> {
    let first = vectors.first()?;
    let mut lo = first.clone();
    let mut hi = first.clone();
    for v in &vectors[1..] {
        for i in 0..v.len() {
            lo[i] = lo[i].min(v[i]);
            hi[i] = hi[i].max(v[i]);
        }
    }
    Some(hi - lo)
}
