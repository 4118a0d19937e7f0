//! Circle arithmetic for angular coefficients
//!
//! Angle coefficients live on the 2π-periodic circle. Every angle handed to an
//! objective is kept in the canonical range `[-π, π)`. Differences between two
//! angles are taken along the shorter arc, and blends between two angles are
//! taken on the unit circle (sine/cosine components) rather than on the raw
//! radian values, so a step never "wraps the long way round".

use std::f64::consts::PI;

/// One full turn in radians
pub const TWO_PI: f64 = 2.0 * PI;

/// Wrap an angle into the canonical range `[-π, π)`.
///
/// Non-finite input is returned unchanged.
pub fn wrap_angle(theta: f64) -> f64 {
    if !theta.is_finite() {
        return theta;
    }
    let wrapped = (theta + PI).rem_euclid(TWO_PI) - PI;
    // rem_euclid can round up to exactly 2π for tiny negative inputs
    if wrapped >= PI {
        wrapped - TWO_PI
    } else {
        wrapped
    }
}

/// Shortest signed angular displacement from `b` to `a`.
///
/// Returns the member of `{a - b, a - b + 2π, a - b - 2π}` with the smallest
/// magnitude. For inputs in the canonical range the result lies in `(-π, π]`;
/// the half-turn tie resolves to `+π`.
///
/// # Example
/// ```
/// use posefit::manifold::so2::circular_displacement;
/// use std::f64::consts::PI;
///
/// let d = circular_displacement(-0.9 * PI, 0.9 * PI);
/// assert!((d - 0.2 * PI).abs() < 1e-12);
/// ```
pub fn circular_displacement(a: f64, b: f64) -> f64 {
    let direct = a - b;
    let wrapped = if direct > 0.0 {
        direct - TWO_PI
    } else {
        direct + TWO_PI
    };
    let shortest = if wrapped.abs() < direct.abs() {
        wrapped
    } else {
        direct
    };
    if shortest <= -PI {
        shortest + TWO_PI
    } else {
        shortest
    }
}

/// Blend two angles on the unit circle.
///
/// `t = 0` yields `from`, `t = 1` yields `to` (both wrapped). Intermediate
/// values interpolate the sine and cosine components linearly and recover the
/// angle with `atan2`. When `from` and `to` are antipodal and the blend passes
/// through the origin the direction is undefined and `atan2(0, 0)` decides it.
pub fn circular_interpolate(from: f64, to: f64, t: f64) -> f64 {
    let (sin_from, cos_from) = from.sin_cos();
    let (sin_to, cos_to) = to.sin_cos();
    let y = sin_from + t * (sin_to - sin_from);
    let x = cos_from + t * (cos_to - cos_from);
    wrap_angle(y.atan2(x))
}
