//! Error types for the posefit library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`PoseFitError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `OptimizerError`) are wrapped
//!   inside `PoseFitError` transparently
//!
//! Running out of iterations, exhausting the line search or collapsing the
//! swarm are not errors: they are reported through
//! [`OptimizationStatus`](crate::optimizer::OptimizationStatus). Errors are
//! reserved for misconfiguration (bad sizes, bad coefficients, mismatched
//! dimensions) and for a residual evaluator that breaks its batching contract.
//!
//! Example error chain:
//! ```text
//! PoseFitError::Optimizer(
//!     OptimizerError::InvalidSwarmSize { swarm_size: 100, batch_width: 64 }
//! )
//! ```

use crate::{core::CoreError, optimizer::OptimizerError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the posefit library
pub type PoseFitResult<T> = Result<T, PoseFitError>;

/// Main error type for the posefit library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = controller.fit(&start, None) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum PoseFitError {
    /// Constraint table, penalty and objective errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimizer configuration errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

impl PoseFitError {
    /// Get the full error chain as a multi-line string for logging and debugging.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// ```rust,ignore
    /// error!("Fit failed: {}", err.chain_compact());
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }

    /// Whether the error stems from invalid setup rather than from the evaluator.
    ///
    /// Configuration errors are fatal and surface at construction or on the
    /// first call; retrying with the same inputs fails the same way.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, PoseFitError::Core(CoreError::ContractViolation { .. }))
    }
}
