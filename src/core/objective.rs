//! Objective adapter between the optimizers and the external residual.
//!
//! The residual itself (render the model, compare with the observation) lives
//! outside this crate behind the [`ResidualEvaluator`] trait. An evaluator
//! scores one coefficient vector at a time or a whole batch at once; batching
//! is how a GPU renderer amortizes its dispatch cost, and the swarm optimizer
//! always feeds it full batches.
//!
//! [`Objective`] composes the final score the optimizers minimize:
//!
//! ```text
//! f(c) = penalty(c, c_prev) · residual(c)
//! ```
//!
//! and keeps the evaluation count. In validation builds it also checks the
//! evaluator's batching contract: every batched residual must match a single
//! evaluation of the same vector within a relative tolerance (1% by default).
//!
//! # Example
//!
//! ```
//! use nalgebra::dvector;
//! use posefit::core::objective::{FnEvaluator, Objective};
//!
//! # fn main() -> Result<(), posefit::core::CoreError> {
//! let evaluator = FnEvaluator::new(|c: &nalgebra::DVector<f64>| c.norm_squared())
//!     .with_batch_width(4);
//! let mut objective = Objective::new(evaluator);
//!
//! let values = objective.evaluate_batch(&[dvector![1.0, 2.0], dvector![0.0, 3.0]])?;
//! assert_eq!(values, vec![5.0, 9.0]);
//! assert_eq!(objective.evaluation_count(), 2);
//! # Ok(())
//! # }
//! ```

use crate::core::{CoreError, CoreResult, penalty::PenaltyFunction};
use nalgebra::DVector;
use tracing::warn;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Default relative tolerance of the batched-vs-single contract
pub const DEFAULT_CONTRACT_TOLERANCE: f64 = 0.01;

/// Smallest denominator of the contract's relative error, so near-zero
/// residuals are compared absolutely
pub const CONTRACT_ABSOLUTE_FLOOR: f64 = 1e-6;

/// External residual source.
///
/// Implementations must return non-negative residuals for valid vectors, and
/// `evaluate_batch` must agree with `evaluate_one` on each element. Calls are
/// blocking and not reentrant.
pub trait ResidualEvaluator {
    /// Number of vectors a single batch call accepts
    fn batch_width(&self) -> usize;

    /// Residual of one coefficient vector
    fn evaluate_one(&mut self, coeff: &DVector<f64>) -> f64;

    /// Residuals of up to `batch_width()` vectors, in order.
    fn evaluate_batch(&mut self, coeffs: &[DVector<f64>]) -> Vec<f64> {
        coeffs.iter().map(|coeff| self.evaluate_one(coeff)).collect()
    }
}

/// Closure-backed evaluator.
///
/// Batches are evaluated with rayon when the `parallel` feature is enabled.
pub struct FnEvaluator<F> {
    func: F,
    batch_width: usize,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    /// Wrap `func` with a batch width of one
    pub fn new(func: F) -> Self {
        Self {
            func,
            batch_width: 1,
        }
    }

    /// Set the number of vectors evaluated per batch call
    pub fn with_batch_width(mut self, batch_width: usize) -> Self {
        self.batch_width = batch_width;
        self
    }
}

impl<F> ResidualEvaluator for FnEvaluator<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    fn batch_width(&self) -> usize {
        self.batch_width
    }

    fn evaluate_one(&mut self, coeff: &DVector<f64>) -> f64 {
        (self.func)(coeff)
    }

    fn evaluate_batch(&mut self, coeffs: &[DVector<f64>]) -> Vec<f64> {
        let func = &self.func;

        #[cfg(feature = "parallel")]
        let residuals = coeffs.par_iter().map(func).collect();

        #[cfg(not(feature = "parallel"))]
        let residuals = coeffs.iter().map(func).collect();

        residuals
    }
}

/// Penalized objective driven by the optimizers.
pub struct Objective<E> {
    evaluator: E,
    penalty: Option<PenaltyFunction>,
    previous: Option<DVector<f64>>,
    validate_batches: bool,
    contract_tolerance: f64,
    evaluations: usize,
}

impl<E: ResidualEvaluator> Objective<E> {
    /// Unpenalized objective over `evaluator`.
    ///
    /// Batch validation defaults to on in debug builds.
    pub fn new(evaluator: E) -> Self {
        Self {
            evaluator,
            penalty: None,
            previous: None,
            validate_batches: cfg!(debug_assertions),
            contract_tolerance: DEFAULT_CONTRACT_TOLERANCE,
            evaluations: 0,
        }
    }

    /// Multiply every residual by `penalty`
    pub fn with_penalty(mut self, penalty: PenaltyFunction) -> Self {
        self.penalty = Some(penalty);
        self
    }

    /// Enable or disable the batched-vs-single contract check
    pub fn with_batch_validation(mut self, validate: bool) -> Self {
        self.validate_batches = validate;
        self
    }

    /// Set the relative tolerance of the contract check
    pub fn with_contract_tolerance(mut self, tolerance: f64) -> Self {
        self.contract_tolerance = tolerance;
        self
    }

    #[inline]
    pub fn batch_width(&self) -> usize {
        self.evaluator.batch_width()
    }

    /// Coefficient dimension, known only when a penalty is attached
    pub fn dimension(&self) -> Option<usize> {
        self.penalty.as_ref().map(PenaltyFunction::dimension)
    }

    pub fn penalty(&self) -> Option<&PenaltyFunction> {
        self.penalty.as_ref()
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut E {
        &mut self.evaluator
    }

    /// Previous-frame coefficients used by the temporal penalty
    pub fn previous(&self) -> Option<&DVector<f64>> {
        self.previous.as_ref()
    }

    /// Replace the previous-frame coefficients.
    pub fn set_previous(&mut self, previous: Option<DVector<f64>>) -> CoreResult<()> {
        if let Some(prev) = &previous {
            self.check_dimension(prev.len())?;
        }
        self.previous = previous;
        Ok(())
    }

    /// Objective evaluations since construction or the last reset
    #[inline]
    pub fn evaluation_count(&self) -> usize {
        self.evaluations
    }

    pub fn reset_evaluation_count(&mut self) {
        self.evaluations = 0;
    }

    /// Penalty factor at `coeff` (1 without a penalty).
    pub fn penalty_factor(&self, coeff: &DVector<f64>) -> f64 {
        self.penalty
            .as_ref()
            .map_or(1.0, |penalty| penalty.evaluate(coeff, self.previous.as_ref()))
    }

    /// Raw external residual at `coeff`, without the penalty.
    pub fn residual(&mut self, coeff: &DVector<f64>) -> CoreResult<f64> {
        self.check_dimension(coeff.len())?;
        self.evaluations += 1;
        Ok(self.evaluator.evaluate_one(coeff))
    }

    /// Penalized objective at a single vector.
    pub fn evaluate(&mut self, coeff: &DVector<f64>) -> CoreResult<f64> {
        let residual = self.residual(coeff)?;
        Ok(self.penalty_factor(coeff) * residual)
    }

    /// Penalized objective for any number of vectors.
    ///
    /// Vectors are handed to the evaluator in tiles of `batch_width()`.
    pub fn evaluate_batch(&mut self, coeffs: &[DVector<f64>]) -> CoreResult<Vec<f64>> {
        let width = self.batch_width();
        if width == 0 {
            return Err(
                CoreError::InvalidInput("evaluator batch width must be positive".to_string())
                    .log(),
            );
        }
        for coeff in coeffs {
            self.check_dimension(coeff.len())?;
        }

        let mut values = Vec::with_capacity(coeffs.len());
        for tile in coeffs.chunks(width) {
            let residuals = self.evaluator.evaluate_batch(tile);
            if residuals.len() != tile.len() {
                return Err(CoreError::DimensionMismatch {
                    expected: tile.len(),
                    actual: residuals.len(),
                }
                .log());
            }
            if self.validate_batches {
                self.check_batch_contract(values.len(), tile, &residuals)?;
            }
            self.evaluations += tile.len();
            values.extend(
                tile.iter()
                    .zip(residuals)
                    .map(|(coeff, residual)| self.penalty_factor(coeff) * residual),
            );
        }
        Ok(values)
    }

    fn check_batch_contract(
        &mut self,
        offset: usize,
        tile: &[DVector<f64>],
        residuals: &[f64],
    ) -> CoreResult<()> {
        for (slot, (coeff, &batched)) in tile.iter().zip(residuals).enumerate() {
            let single = self.evaluator.evaluate_one(coeff);
            if single.is_nan() && batched.is_nan() {
                continue;
            }
            let relative_error =
                (batched - single).abs() / single.abs().max(CONTRACT_ABSOLUTE_FLOOR);
            if relative_error.is_nan() || relative_error > self.contract_tolerance {
                warn!(
                    "Residual evaluator broke the batching contract at slot {}",
                    offset + slot
                );
                return Err(CoreError::ContractViolation {
                    index: offset + slot,
                    single,
                    batched,
                    relative_error,
                }
                .log());
            }
        }
        Ok(())
    }

    fn check_dimension(&self, len: usize) -> CoreResult<()> {
        match &self.penalty {
            Some(penalty) => penalty.constraints().check_dimension(len),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        constraints::{CoeffConstraint, ConstraintTable},
        penalty::PenaltyConfig,
    };
    use nalgebra::dvector;

    /// Evaluator whose batch path is deliberately off by a relative amount
    struct SkewedEvaluator {
        skew: f64,
        batch_calls: usize,
    }

    impl ResidualEvaluator for SkewedEvaluator {
        fn batch_width(&self) -> usize {
            2
        }

        fn evaluate_one(&mut self, coeff: &DVector<f64>) -> f64 {
            1.0 + coeff.norm_squared()
        }

        fn evaluate_batch(&mut self, coeffs: &[DVector<f64>]) -> Vec<f64> {
            self.batch_calls += 1;
            coeffs
                .iter()
                .map(|c| (1.0 + c.norm_squared()) * (1.0 + self.skew))
                .collect()
        }
    }

    fn grid(count: usize) -> Vec<DVector<f64>> {
        (0..count)
            .map(|i| dvector![i as f64 * 0.5, -(i as f64)])
            .collect()
    }

    #[test]
    fn test_batched_matches_single_for_deterministic_stub() -> Result<(), CoreError> {
        let evaluator = FnEvaluator::new(|c: &DVector<f64>| (c[0] - 1.0).powi(2) + c[1].abs())
            .with_batch_width(4);
        let mut objective = Objective::new(evaluator).with_batch_validation(true);

        let coeffs = grid(12);
        let batched = objective.evaluate_batch(&coeffs)?;
        for (coeff, value) in coeffs.iter().zip(&batched) {
            let single = objective.evaluate(coeff)?;
            assert_eq!(single, *value, "mismatch at {coeff:?}");
        }
        assert_eq!(objective.evaluation_count(), 24);
        Ok(())
    }

    #[test]
    fn test_batches_are_tiled_by_width() -> Result<(), CoreError> {
        let mut objective = Objective::new(SkewedEvaluator {
            skew: 0.0,
            batch_calls: 0,
        });
        objective.evaluate_batch(&grid(6))?;
        assert_eq!(objective.evaluator().batch_calls, 3);
        Ok(())
    }

    #[test]
    fn test_contract_violation_detected() {
        let mut objective = Objective::new(SkewedEvaluator {
            skew: 0.05,
            batch_calls: 0,
        })
        .with_batch_validation(true);

        match objective.evaluate_batch(&grid(4)) {
            Err(CoreError::ContractViolation {
                index,
                relative_error,
                ..
            }) => {
                assert_eq!(index, 0);
                assert!((relative_error - 0.05).abs() < 1e-9);
            }
            other => panic!("Expected ContractViolation, got {other:?}"),
        }
    }

    /// Evaluator that is exact on single calls and slightly off in batches
    struct NearZeroEvaluator {
        batch_offset: f64,
    }

    impl ResidualEvaluator for NearZeroEvaluator {
        fn batch_width(&self) -> usize {
            4
        }

        fn evaluate_one(&mut self, _coeff: &DVector<f64>) -> f64 {
            0.0
        }

        fn evaluate_batch(&mut self, coeffs: &[DVector<f64>]) -> Vec<f64> {
            vec![self.batch_offset; coeffs.len()]
        }
    }

    #[test]
    fn test_zero_residual_tolerates_rounding_noise() -> Result<(), CoreError> {
        let mut objective = Objective::new(NearZeroEvaluator {
            batch_offset: 1e-9,
        })
        .with_batch_validation(true);
        assert_eq!(objective.evaluate_batch(&grid(4))?, vec![1e-9; 4]);

        let mut objective = Objective::new(NearZeroEvaluator {
            batch_offset: 1e-3,
        })
        .with_batch_validation(true);
        assert!(matches!(
            objective.evaluate_batch(&grid(4)),
            Err(CoreError::ContractViolation { index: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_small_disagreement_within_tolerance() -> Result<(), CoreError> {
        let mut objective = Objective::new(SkewedEvaluator {
            skew: 0.005,
            batch_calls: 0,
        })
        .with_batch_validation(true);
        assert_eq!(objective.evaluate_batch(&grid(4))?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_validation_disabled_accepts_skew() -> Result<(), CoreError> {
        let mut objective = Objective::new(SkewedEvaluator {
            skew: 0.5,
            batch_calls: 0,
        })
        .with_batch_validation(false);
        assert!(objective.evaluate_batch(&grid(4)).is_ok());
        Ok(())
    }

    #[test]
    fn test_penalty_multiplies_residual() -> Result<(), CoreError> {
        let table = ConstraintTable::new(vec![
            CoeffConstraint::bounded(0.0, 1.0, 4.0),
            CoeffConstraint::unconstrained(),
        ])?;
        let penalty = PenaltyFunction::new(PenaltyConfig::default(), table)?;
        let evaluator = FnEvaluator::new(|_: &DVector<f64>| 3.0).with_batch_width(2);
        let mut objective = Objective::new(evaluator).with_penalty(penalty);

        assert_eq!(objective.evaluate(&dvector![0.5, 10.0])?, 3.0);
        // penalty 1 + 4 * (1/2)^2 = 2
        assert!((objective.evaluate(&dvector![2.0, 0.0])? - 6.0).abs() < 1e-12);
        assert_eq!(objective.residual(&dvector![2.0, 0.0])?, 3.0);
        Ok(())
    }

    #[test]
    fn test_dimension_checked_against_penalty() -> Result<(), CoreError> {
        let table = ConstraintTable::unconstrained(&[false, false])?;
        let penalty = PenaltyFunction::new(PenaltyConfig::default(), table)?;
        let mut objective =
            Objective::new(FnEvaluator::new(|_: &DVector<f64>| 0.0)).with_penalty(penalty);

        assert!(matches!(
            objective.evaluate(&dvector![1.0]),
            Err(CoreError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert!(objective.set_previous(Some(dvector![1.0, 2.0, 3.0])).is_err());
        assert_eq!(objective.evaluation_count(), 0);
        Ok(())
    }
}
