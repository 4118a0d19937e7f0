//! Multiplicative soft-constraint penalty.
//!
//! The optimizers never project onto the feasible box. Instead the external
//! residual is multiplied by a penalty that is exactly `1` for a feasible
//! coefficient vector and grows with every violation:
//!
//! ```text
//! penalty(c) = 1 + box(c) + marked(c) + temporal(c, c_prev)      ≥ 1
//! ```
//!
//! - **box**: for each active dimension outside `[min, max]`, either
//!   `scale · (|v| / 2)²` ([`PenaltyKind::Quadratic`], the default) or
//!   `scale · |v| / 10` ([`PenaltyKind::Linear`]).
//! - **marked** (optional): pushes the search away from known low-energy poses,
//!   `Σ_m min(K / ‖w ⊙ (m − c)‖, cap)` where position dimensions are weighted
//!   by `position_weight`.
//! - **temporal** (optional): discourages jumps from the previous frame,
//!   `scale_t · Σ max(|Δ| − threshold · (max − min), 0)²` over active dimensions.
//!
//! The penalty is a pure function of its inputs and cheap to evaluate.

use crate::core::{
    CoreError, CoreResult,
    constraints::{CoeffConstraint, ConstraintTable},
};
use crate::manifold::so2;
use nalgebra::DVector;
use tracing::debug;

/// Shape of the box-violation term
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    /// `scale · (|violation| / 2)²`
    #[default]
    Quadratic,
    /// `scale · |violation| / 10`
    Linear,
}

/// Previous-frame smoothness term settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalConfig {
    /// Weight of the summed squared excess
    pub scale: f64,
    /// Allowed jump as a fraction of each dimension's range
    pub threshold: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            scale: 0.001,
            threshold: 0.3,
        }
    }
}

/// Configuration of the penalty terms.
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyConfig {
    /// Box term shape
    pub kind: PenaltyKind,
    /// Low-energy poses the search should move away from (empty disables the term)
    pub marked_points: Vec<DVector<f64>>,
    /// Numerator K of the marked-point term
    pub marked_point_constant: f64,
    /// Upper bound of a single marked-point contribution
    pub marked_point_cap: f64,
    /// Weight applied to position dimensions in the marked-point distance
    pub position_weight: f64,
    /// Previous-frame term, disabled when `None`
    pub temporal: Option<TemporalConfig>,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            kind: PenaltyKind::Quadratic,
            marked_points: Vec::new(),
            marked_point_constant: 0.1,
            marked_point_cap: 1e6,
            position_weight: 0.1,
            temporal: None,
        }
    }
}

impl PenaltyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the box term shape
    pub fn with_kind(mut self, kind: PenaltyKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the marked low-energy points
    pub fn with_marked_points(mut self, marked_points: Vec<DVector<f64>>) -> Self {
        self.marked_points = marked_points;
        self
    }

    /// Set the marked-point numerator K
    pub fn with_marked_point_constant(mut self, constant: f64) -> Self {
        self.marked_point_constant = constant;
        self
    }

    /// Set the per-point contribution cap
    pub fn with_marked_point_cap(mut self, cap: f64) -> Self {
        self.marked_point_cap = cap;
        self
    }

    /// Set the position weight used in marked-point distances
    pub fn with_position_weight(mut self, weight: f64) -> Self {
        self.position_weight = weight;
        self
    }

    /// Enable the previous-frame term
    pub fn with_temporal(mut self, temporal: TemporalConfig) -> Self {
        self.temporal = Some(temporal);
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "\nPenalty:\n  Box term:        {:?}\n  Marked points:   {}\n  Marked K / cap:  {:.2e} / {:.2e}\n  Position weight: {:.2}\n  Temporal:        {}",
            self.kind,
            self.marked_points.len(),
            self.marked_point_constant,
            self.marked_point_cap,
            self.position_weight,
            match &self.temporal {
                Some(t) => format!("scale {:.2e}, threshold {:.2}", t.scale, t.threshold),
                None => "disabled".to_string(),
            }
        );
    }
}

/// Multiplicative penalty over a [`ConstraintTable`].
///
/// # Example
/// ```
/// use nalgebra::dvector;
/// use posefit::core::constraints::{CoeffConstraint, ConstraintTable};
/// use posefit::core::penalty::{PenaltyConfig, PenaltyFunction};
///
/// # fn main() -> Result<(), posefit::core::CoreError> {
/// let table = ConstraintTable::new(vec![CoeffConstraint::bounded(0.0, 1.0, 4.0)])?;
/// let penalty = PenaltyFunction::new(PenaltyConfig::default(), table)?;
///
/// assert_eq!(penalty.evaluate(&dvector![0.5], None), 1.0);
/// // 1 + 4 · (1 / 2)²
/// assert!((penalty.evaluate(&dvector![2.0], None) - 2.0).abs() < 1e-12);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PenaltyFunction {
    config: PenaltyConfig,
    constraints: ConstraintTable,
}

impl PenaltyFunction {
    /// Create a penalty, validating the configuration against the table.
    pub fn new(config: PenaltyConfig, constraints: ConstraintTable) -> CoreResult<Self> {
        let dimension = constraints.dimension();
        for point in &config.marked_points {
            if point.len() != dimension {
                return Err(CoreError::DimensionMismatch {
                    expected: dimension,
                    actual: point.len(),
                }
                .log());
            }
        }
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if !config.marked_points.is_empty()
            && !(positive(config.marked_point_constant)
                && positive(config.marked_point_cap)
                && positive(config.position_weight))
        {
            return Err(CoreError::InvalidInput(
                "marked-point constant, cap and position weight must be positive".to_string(),
            )
            .log());
        }
        if let Some(temporal) = &config.temporal
            && !(temporal.scale.is_finite()
                && temporal.scale >= 0.0
                && temporal.threshold.is_finite()
                && temporal.threshold >= 0.0)
        {
            return Err(CoreError::InvalidInput(format!(
                "temporal scale and threshold must be finite and non-negative, got {:?}",
                temporal
            ))
            .log());
        }
        Ok(Self {
            config,
            constraints,
        })
    }

    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    pub fn constraints(&self) -> &ConstraintTable {
        &self.constraints
    }

    /// Coefficient dimension D
    #[inline]
    pub fn dimension(&self) -> usize {
        self.constraints.dimension()
    }

    /// Whether the previous-frame term is enabled
    #[inline]
    pub fn uses_previous_frame(&self) -> bool {
        self.config.temporal.is_some()
    }

    /// Total multiplicative penalty, always `≥ 1`.
    pub fn evaluate(&self, coeff: &DVector<f64>, previous: Option<&DVector<f64>>) -> f64 {
        let mut penalty = 1.0 + self.box_term(coeff) + self.marked_point_term(coeff);
        if let Some(previous) = previous {
            penalty += self.temporal_term(coeff, previous);
        }
        penalty
    }

    /// Sum of box-violation contributions.
    pub fn box_term(&self, coeff: &DVector<f64>) -> f64 {
        coeff
            .iter()
            .zip(self.constraints.iter())
            .filter(|(_, constraint)| constraint.is_active())
            .map(|(&value, constraint)| {
                let violation = constraint.violation(value);
                if violation <= 0.0 {
                    return 0.0;
                }
                match self.config.kind {
                    PenaltyKind::Quadratic => {
                        let half = violation / 2.0;
                        constraint.penalty_scale * half * half
                    }
                    PenaltyKind::Linear => constraint.penalty_scale * violation / 10.0,
                }
            })
            .sum()
    }

    /// Sum of capped inverse-distance terms to every marked point.
    pub fn marked_point_term(&self, coeff: &DVector<f64>) -> f64 {
        self.config
            .marked_points
            .iter()
            .map(|point| {
                let dist_sq: f64 = point
                    .iter()
                    .zip(coeff.iter())
                    .zip(self.constraints.iter())
                    .map(|((&marked, &value), constraint)| {
                        let d = self.weighted_delta(constraint, marked, value);
                        d * d
                    })
                    .sum();
                (self.config.marked_point_constant / dist_sq.sqrt())
                    .min(self.config.marked_point_cap)
            })
            .sum()
    }

    /// Squared excess of per-dimension jumps beyond the allowed fraction of range.
    ///
    /// Zero when the temporal term is disabled.
    pub fn temporal_term(&self, coeff: &DVector<f64>, previous: &DVector<f64>) -> f64 {
        let Some(temporal) = &self.config.temporal else {
            return 0.0;
        };
        let entity_dim = self.constraints.entity_dimension();

        // Rows are shared, so every entity block is scored against the same limits
        let mut excess = 0.0;
        for (block, (current, prev)) in coeff
            .as_slice()
            .chunks(entity_dim)
            .zip(previous.as_slice().chunks(entity_dim))
            .enumerate()
        {
            for (row, (&value, &prev_value)) in current.iter().zip(prev).enumerate() {
                let constraint = self.constraints.get(block * entity_dim + row);
                if !constraint.is_active() {
                    continue;
                }
                let delta = if constraint.is_angle {
                    so2::circular_displacement(value, prev_value)
                } else {
                    value - prev_value
                };
                let err = delta.abs() - temporal.threshold * constraint.range();
                if err > 0.0 {
                    excess += err * err;
                }
            }
        }
        temporal.scale * excess
    }

    fn weighted_delta(&self, constraint: &CoeffConstraint, marked: f64, value: f64) -> f64 {
        let delta = if constraint.is_angle {
            so2::circular_displacement(marked, value)
        } else {
            marked - value
        };
        if constraint.is_position {
            delta * self.config.position_weight
        } else {
            delta
        }
    }
}
