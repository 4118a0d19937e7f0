//! Per-dimension coefficient constraints.
//!
//! Every coefficient dimension carries a box `[min, max]` (either side may be
//! infinite), a penalty scale (zero disables the box), and flags describing how
//! the value is interpreted: angles are 2π-periodic, positions are down-weighted
//! when measuring distance to marked low-energy poses.
//!
//! A [`ConstraintTable`] holds the rows for one tracked entity and repeats them
//! for every entity, so coefficient `i` of a multi-entity vector uses row
//! `i % rows`.
//!
//! # Example
//!
//! ```
//! use posefit::core::constraints::{CoeffConstraint, ConstraintTable};
//! use std::f64::consts::PI;
//!
//! # fn main() -> Result<(), posefit::core::CoreError> {
//! let rows = vec![
//!     CoeffConstraint::bounded(-1.0, 1.0, 1.0).with_position(true),
//!     CoeffConstraint::angle(-PI / 2.0, PI / 2.0, 1.0),
//! ];
//! // Two hands sharing one table
//! let table = ConstraintTable::with_entities(rows, 2)?;
//! assert_eq!(table.dimension(), 4);
//! assert!(table.get(3).is_angle);
//! # Ok(())
//! # }
//! ```

use crate::core::{CoreError, CoreResult};

/// Penalty scales at or below this value disable a constraint
pub const CONSTRAINT_EPSILON: f64 = 1e-6;

/// Limits and interpretation of a single coefficient dimension
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoeffConstraint {
    /// Lower limit (may be `-inf`)
    pub min: f64,
    /// Upper limit (may be `+inf`)
    pub max: f64,
    /// Weight of the box violation in the penalty; zero disables it
    pub penalty_scale: f64,
    /// Value is an angle interpreted modulo 2π
    pub is_angle: bool,
    /// Value is a translational coordinate
    pub is_position: bool,
}

impl Default for CoeffConstraint {
    fn default() -> Self {
        Self::unconstrained()
    }
}

impl CoeffConstraint {
    /// A linear dimension with no limits and no penalty.
    pub fn unconstrained() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            penalty_scale: 0.0,
            is_angle: false,
            is_position: false,
        }
    }

    /// A linear dimension limited to `[min, max]`.
    pub fn bounded(min: f64, max: f64, penalty_scale: f64) -> Self {
        Self {
            min,
            max,
            penalty_scale,
            ..Self::unconstrained()
        }
    }

    /// An angular dimension limited to `[min, max]` (radians).
    pub fn angle(min: f64, max: f64, penalty_scale: f64) -> Self {
        Self {
            min,
            max,
            penalty_scale,
            is_angle: true,
            is_position: false,
        }
    }

    /// Mark the dimension as a translational coordinate
    pub fn with_position(mut self, is_position: bool) -> Self {
        self.is_position = is_position;
        self
    }

    /// Whether the box participates in the penalty
    #[inline]
    pub fn is_active(&self) -> bool {
        self.penalty_scale > CONSTRAINT_EPSILON
    }

    /// Distance of `value` outside `[min, max]`, zero inside.
    #[inline]
    pub fn violation(&self, value: f64) -> f64 {
        if value < self.min {
            self.min - value
        } else if value > self.max {
            value - self.max
        } else {
            0.0
        }
    }

    /// Width of the allowed interval
    #[inline]
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    fn validate(&self, index: usize) -> CoreResult<()> {
        if self.min.is_nan() || self.max.is_nan() {
            return Err(CoreError::InvalidConstraint(format!(
                "row {index}: limits must not be NaN"
            ))
            .log());
        }
        if self.min > self.max {
            return Err(CoreError::InvalidConstraint(format!(
                "row {index}: min {} exceeds max {}",
                self.min, self.max
            ))
            .log());
        }
        if !self.penalty_scale.is_finite() || self.penalty_scale < 0.0 {
            return Err(CoreError::InvalidConstraint(format!(
                "row {index}: penalty scale must be finite and non-negative, got {}",
                self.penalty_scale
            ))
            .log());
        }
        Ok(())
    }
}

/// Constraint rows for one entity, repeated for every tracked entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintTable {
    rows: Vec<CoeffConstraint>,
    entities: usize,
}

impl ConstraintTable {
    /// Build a single-entity table.
    pub fn new(rows: Vec<CoeffConstraint>) -> CoreResult<Self> {
        Self::with_entities(rows, 1)
    }

    /// Build a table whose rows are shared by `entities` consecutive blocks.
    pub fn with_entities(rows: Vec<CoeffConstraint>, entities: usize) -> CoreResult<Self> {
        if rows.is_empty() {
            return Err(
                CoreError::InvalidConstraint("constraint table has no rows".to_string()).log(),
            );
        }
        if entities == 0 {
            return Err(CoreError::InvalidConstraint(
                "constraint table needs at least one entity".to_string(),
            )
            .log());
        }
        for (index, row) in rows.iter().enumerate() {
            row.validate(index)?;
        }
        Ok(Self { rows, entities })
    }

    /// Table with no limits; `angle_flags` decides which dimensions are periodic.
    pub fn unconstrained(angle_flags: &[bool]) -> CoreResult<Self> {
        Self::new(
            angle_flags
                .iter()
                .map(|&is_angle| CoeffConstraint {
                    is_angle,
                    ..CoeffConstraint::unconstrained()
                })
                .collect(),
        )
    }

    /// Total coefficient dimension D
    #[inline]
    pub fn dimension(&self) -> usize {
        self.rows.len() * self.entities
    }

    /// Coefficients per entity
    #[inline]
    pub fn entity_dimension(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entities
    }

    /// Constraint applying to coefficient `index`.
    ///
    /// # Panics
    /// Panics when `index >= self.dimension()`.
    #[inline]
    pub fn get(&self, index: usize) -> &CoeffConstraint {
        assert!(index < self.dimension(), "coefficient index out of range");
        &self.rows[index % self.rows.len()]
    }

    /// Constraints for all D coefficients, in order
    pub fn iter(&self) -> impl Iterator<Item = &CoeffConstraint> + '_ {
        self.rows.iter().cycle().take(self.dimension())
    }

    /// Angle flag per coefficient
    pub fn angle_flags(&self) -> Vec<bool> {
        self.iter().map(|c| c.is_angle).collect()
    }

    /// Fail unless `len` equals the table dimension.
    pub fn check_dimension(&self, len: usize) -> CoreResult<()> {
        if len != self.dimension() {
            return Err(CoreError::DimensionMismatch {
                expected: self.dimension(),
                actual: len,
            }
            .log());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_violation_inside_and_outside() {
        let c = CoeffConstraint::bounded(-1.0, 2.0, 1.0);
        assert_eq!(c.violation(0.5), 0.0);
        assert_eq!(c.violation(-1.0), 0.0);
        assert_eq!(c.violation(2.0), 0.0);
        assert!((c.violation(-1.5) - 0.5).abs() < 1e-12);
        assert!((c.violation(3.25) - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_unconstrained_never_violates() {
        let c = CoeffConstraint::unconstrained();
        assert_eq!(c.violation(1e300), 0.0);
        assert_eq!(c.violation(-1e300), 0.0);
        assert!(!c.is_active());
    }

    #[test]
    fn test_zero_scale_disables_constraint() {
        assert!(!CoeffConstraint::bounded(0.0, 1.0, 0.0).is_active());
        assert!(CoeffConstraint::bounded(0.0, 1.0, 0.5).is_active());
    }

    #[test]
    fn test_multi_entity_rows_repeat() -> Result<(), CoreError> {
        let rows = vec![
            CoeffConstraint::bounded(0.0, 1.0, 1.0).with_position(true),
            CoeffConstraint::angle(-PI, PI, 1.0),
            CoeffConstraint::unconstrained(),
        ];
        let table = ConstraintTable::with_entities(rows, 3)?;

        assert_eq!(table.dimension(), 9);
        assert_eq!(table.entity_dimension(), 3);
        assert_eq!(table.entity_count(), 3);
        assert_eq!(
            table.angle_flags(),
            vec![false, true, false, false, true, false, false, true, false]
        );
        assert!(table.get(6).is_position);
        assert_eq!(table.iter().count(), 9);
        Ok(())
    }

    #[test]
    fn test_invalid_rows_rejected() {
        assert!(ConstraintTable::new(vec![]).is_err());
        assert!(ConstraintTable::with_entities(vec![CoeffConstraint::unconstrained()], 0).is_err());
        assert!(ConstraintTable::new(vec![CoeffConstraint::bounded(1.0, -1.0, 1.0)]).is_err());
        assert!(ConstraintTable::new(vec![CoeffConstraint::bounded(f64::NAN, 1.0, 1.0)]).is_err());
        assert!(ConstraintTable::new(vec![CoeffConstraint::bounded(0.0, 1.0, -1.0)]).is_err());
    }

    #[test]
    fn test_check_dimension() -> Result<(), CoreError> {
        let table = ConstraintTable::unconstrained(&[false, true])?;
        assert!(table.check_dimension(2).is_ok());
        match table.check_dimension(3) {
            Err(CoreError::DimensionMismatch { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected DimensionMismatch, got {other:?}"),
        }
        Ok(())
    }
}
