//! Conversions between equatorial coordinates and points on the unit sphere.
//!
//! Sky positions are stored as unit vectors so that proximity queries reduce to Euclidean
//! comparisons. All angles are in radians.

use nalgebra::Vector3;

use crate::Float;

/// Project equatorial coordinates onto the unit sphere.
///
/// Inputs outside of `[-2π, 2π]` are accepted, the mapping is periodic.
///
/// # Example:
/// ```
/// # use trailblazer::coordinates::to_unit_sphere;
/// let v = to_unit_sphere(0.0_f64, std::f64::consts::FRAC_PI_2);
/// assert!((v.z - 1.0).abs() < 1e-12);
/// ```
pub fn to_unit_sphere<F: Float>(ra: F, dec: F) -> Vector3<F> {
    let cos_dec = dec.cos();
    Vector3::new(cos_dec * ra.cos(), cos_dec * ra.sin(), dec.sin())
}

/// Recover equatorial coordinates from a point on the unit sphere.
///
/// Right ascension is returned in `[0, 2π)`, declination in `[-π/2, π/2]`.
/// Rounding errors pushing `|z|` above one are clamped instead of producing `NaN`.
pub fn to_equatorial<F: Float>(point: &Vector3<F>) -> (F, F) {
    let mut ra = point.y.atan2(point.x);
    if ra < F::zero() {
        ra += F::two_pi();
    }
    if ra >= F::two_pi() {
        ra -= F::two_pi();
    }
    let z = point.z.clamp(-F::one(), F::one());
    (ra, z.asin())
}

/// Euclidean distance between two points on the unit sphere.
///
/// For small separations this approximates the great-circle distance in radians.
pub fn chord_distance<F: Float>(a: &Vector3<F>, b: &Vector3<F>) -> F {
    (a - b).norm()
}
