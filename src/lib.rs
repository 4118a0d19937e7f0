//! # posefit
//!
//! Black-box optimization of pose coefficients against an external residual.
//!
//! A model is described by a vector of real coefficients (positions, joint
//! angles, scales). Some external component, typically a renderer comparing a
//! synthetic image with an observation, scores a coefficient vector with a
//! non-negative residual. This crate searches for the coefficients that
//! minimize that residual, frame after frame, treating the residual as a
//! black box that can only be evaluated, singly or in batches.
//!
//! ## Features
//!
//! - **Constraint table**: per-coefficient bounds, angle and position flags,
//!   reused across repeated entities
//! - **Multiplicative penalty**: box violations, optional marked-point
//!   avoidance and optional frame-to-frame smoothness, always `≥ 1`
//! - **Particle swarm**: constriction-coefficient PSO driving a batching
//!   evaluator with full tiles, periodic-aware on angle dimensions
//! - **BFGS**: quasi-Newton refinement with Armijo backtracking and circular
//!   interpolation on angles
//! - **Fit controller**: annealed swarm repeats, optional BFGS polish,
//!   previous-frame cache and evaluation accounting
//!
//! ## Cargo features
//!
//! - `parallel` (default): evaluate closure batches with rayon
//! - `logging` (default): `init_logger` helpers built on `tracing-subscriber`

pub mod core;
pub mod error;
pub mod fit;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod observers;
pub mod optimizer;

pub use crate::core::constraints::{CoeffConstraint, ConstraintTable};
pub use crate::core::objective::{FnEvaluator, Objective, ResidualEvaluator};
pub use crate::core::penalty::{PenaltyConfig, PenaltyFunction, PenaltyKind, TemporalConfig};
pub use error::{PoseFitError, PoseFitResult};
pub use fit::{FitConfig, FitController, FitResult};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::Renormalize;
pub use optimizer::{
    Bfgs, BfgsConfig, OptObserver, OptObserverVec, OptimizationStatus,
    ParticleSwarm, ParticleSwarmConfig, SolverResult,
};
