//! Core building blocks of the pose optimizer
//!
//! This module contains everything the optimizers consume but do not own:
//! - Per-dimension coefficient constraints (limits, penalty scales, angle flags)
//! - The multiplicative penalty that soft-enforces those constraints
//! - The objective adapter that composes penalty and external residual

pub mod constraints;
pub mod objective;
pub mod penalty;

use thiserror::Error;
use tracing::error;

/// Core module error types for constraint tables, penalties and objectives
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Vector length does not match the coefficient dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Invalid constraint row (limits, scales)
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Batched evaluation disagrees with single evaluation of the same vector
    #[error(
        "Batched residual {batched:.6e} disagrees with single residual {single:.6e} at batch slot {index} (relative error {relative_error:.3e})"
    )]
    ContractViolation {
        index: usize,
        single: f64,
        batched: f64,
        relative_error: f64,
    },
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
