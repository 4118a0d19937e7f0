//! Coefficient-space geometry for partially periodic parameter vectors.
//!
//! A pose coefficient vector mixes ordinary Euclidean entries (positions,
//! scales) with angles that live on the circle. This module provides the two
//! things both optimizers need to move around in that space:
//!
//! - [`so2`]: wrapping, shortest-arc displacement and circular blending of angles
//! - [`Renormalize`]: the hook the model collaborator supplies to restore its own
//!   invariants (e.g. joint coupling) after every candidate update
//!
//! Optimizers always wrap angle dimensions first and call the hook second, so a
//! hook can rely on angles already being in `[-π, π)`.

pub mod so2;

use nalgebra::DVector;

/// Post-update normalization hook applied to every candidate vector.
///
/// Any `Fn(&mut DVector<f64>)` closure implements this trait.
///
/// # Example
/// ```
/// use nalgebra::DVector;
/// use posefit::manifold::Renormalize;
///
/// let clamp_scale = |coeff: &mut DVector<f64>| coeff[0] = coeff[0].max(0.0);
/// let mut coeff = DVector::from_vec(vec![-1.0, 2.0]);
/// clamp_scale.renormalize(&mut coeff);
/// assert_eq!(coeff[0], 0.0);
/// ```
pub trait Renormalize {
    /// Restore model invariants on `coeff` in place
    fn renormalize(&self, coeff: &mut DVector<f64>);
}

impl<F> Renormalize for F
where
    F: Fn(&mut DVector<f64>),
{
    fn renormalize(&self, coeff: &mut DVector<f64>) {
        self(coeff)
    }
}

/// Wrap every flagged angle dimension into `[-π, π)`.
pub fn wrap_angles(coeff: &mut DVector<f64>, angle_flags: &[bool]) {
    for (value, &is_angle) in coeff.iter_mut().zip(angle_flags) {
        if is_angle {
            *value = so2::wrap_angle(*value);
        }
    }
}

/// Wrap angles, then apply the optional model hook.
pub fn normalize(
    coeff: &mut DVector<f64>,
    angle_flags: &[bool],
    renormalize: Option<&dyn Renormalize>,
) {
    wrap_angles(coeff, angle_flags);
    if let Some(hook) = renormalize {
        hook.renormalize(coeff);
    }
}

/// Per-dimension displacement `to - from`, shortest arc on angle dimensions.
pub fn displacement(to: &DVector<f64>, from: &DVector<f64>, angle_flags: &[bool]) -> DVector<f64> {
    DVector::from_fn(to.len(), |i, _| {
        if angle_flags.get(i).copied().unwrap_or(false) {
            so2::circular_displacement(to[i], from[i])
        } else {
            to[i] - from[i]
        }
    })
}
