//! Vector and quaternion primitives and the Euler <-> quaternion boundary.
//!
//! The truth model carries attitude as Euler angles (roll φ, pitch θ, yaw ψ) using the
//! aerospace ZYX sequence, while the estimator carries a unit quaternion. Conversions
//! between the two live here and nowhere else. Euler angles have a singularity at
//! θ = ±90°, so [`quaternion_to_euler`] clamps the pitch argument and callers should not
//! assume a round trip is exact in that neighbourhood.
//!
//! Frames are North-East-Down (inertial) and forward-right-down (body). Quaternions map
//! body vectors into the inertial frame: $v_n = q \otimes v_b \otimes q^*$.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Standard gravity (m/s²), positive down in NED.
pub const GRAVITY: f64 = 9.81;

/// Angular increments below this are treated as no rotation during integration.
const SMALL_ROTATION: f64 = 1e-12;

/// Build the body-to-NED attitude quaternion from ZYX Euler angles.
///
/// # Example
/// ```rust
/// use aerosim::math::{euler_to_quaternion, quaternion_to_euler};
/// let q = euler_to_quaternion(0.1, -0.2, 1.0);
/// let (phi, theta, psi) = quaternion_to_euler(&q);
/// assert!((phi - 0.1).abs() < 1e-12);
/// assert!((theta + 0.2).abs() < 1e-12);
/// assert!((psi - 1.0).abs() < 1e-12);
/// ```
pub fn euler_to_quaternion(phi: f64, theta: f64, psi: f64) -> UnitQuaternion<f64> {
    let (sr, cr) = (0.5 * phi).sin_cos();
    let (sp, cp) = (0.5 * theta).sin_cos();
    let (sy, cy) = (0.5 * psi).sin_cos();
    let w = cr * cp * cy + sr * sp * sy;
    let x = sr * cp * cy - cr * sp * sy;
    let y = cr * sp * cy + sr * cp * sy;
    let z = cr * cp * sy - sr * sp * cy;
    UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
}

/// Recover ZYX Euler angles `(φ, θ, ψ)` from an attitude quaternion.
///
/// The pitch argument is clamped to [-1, 1] so that a slightly non-unit input near
/// gimbal lock returns ±π/2 instead of NaN.
pub fn quaternion_to_euler(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let phi = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let sin_theta = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0);
    let theta = sin_theta.asin();
    let psi = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
    (phi, theta, psi)
}

/// Propagate an attitude quaternion by a constant body rate over `dt`.
///
/// Uses the exact exponential map $q_{k+1} = q_k \otimes \exp(\tfrac{1}{2}\omega\,dt)$ and
/// renormalizes the result.
pub fn integrate_quaternion(
    q: &UnitQuaternion<f64>,
    omega: &Vector3<f64>,
    dt: f64,
) -> UnitQuaternion<f64> {
    let rotation = omega * dt;
    if rotation.norm() < SMALL_ROTATION {
        return *q;
    }
    let dq = UnitQuaternion::from_scaled_axis(rotation);
    UnitQuaternion::new_normalize((q * dq).into_inner())
}

/// Time derivative of a (not necessarily unit) quaternion: $\dot q = \tfrac12 q \otimes [0, \omega]$.
pub fn quaternion_derivative(q: &Quaternion<f64>, omega: &Vector3<f64>) -> Quaternion<f64> {
    let omega_q = Quaternion::new(0.0, omega.x, omega.y, omega.z);
    (q * omega_q) * 0.5
}

/// Rotate a body-frame vector into the NED frame.
pub fn body_to_inertial(v: &Vector3<f64>, q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.transform_vector(v)
}

/// Rotate an NED-frame vector into the body frame.
pub fn inertial_to_body(v: &Vector3<f64>, q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.inverse_transform_vector(v)
}

/// Direction cosine matrix R_be taking body vectors to NED for ZYX Euler angles.
pub fn body_to_ned_matrix(phi: f64, theta: f64, psi: f64) -> Matrix3<f64> {
    let (sphi, cphi) = phi.sin_cos();
    let (sth, cth) = theta.sin_cos();
    let (spsi, cpsi) = psi.sin_cos();
    Matrix3::new(
        cth * cpsi,
        sphi * sth * cpsi - cphi * spsi,
        cphi * sth * cpsi + sphi * spsi,
        cth * spsi,
        sphi * sth * spsi + cphi * cpsi,
        cphi * sth * spsi - sphi * cpsi,
        -sth,
        sphi * cth,
        cphi * cth,
    )
}

/// Gravity resolved in body axes for the given attitude.
pub fn gravity_body(phi: f64, theta: f64) -> Vector3<f64> {
    Vector3::new(
        -GRAVITY * theta.sin(),
        GRAVITY * phi.sin() * theta.cos(),
        GRAVITY * phi.cos() * theta.cos(),
    )
}

/// Wrap an angle to (-π, π].
pub fn wrap_to_pi(angle: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut a = angle.rem_euclid(two_pi);
    if a > std::f64::consts::PI {
        a -= two_pi;
    }
    a
}

/// Read a quaternion stored as `(x, y, z, w)` starting at `offset`.
pub fn quaternion_from_slice(values: &[f64], offset: usize) -> Quaternion<f64> {
    Quaternion::new(
        values[offset + 3],
        values[offset],
        values[offset + 1],
        values[offset + 2],
    )
}

/// Write a quaternion as `(x, y, z, w)` starting at `offset`.
pub fn quaternion_to_slice(q: &Quaternion<f64>, values: &mut [f64], offset: usize) {
    values[offset] = q.i;
    values[offset + 1] = q.j;
    values[offset + 2] = q.k;
    values[offset + 3] = q.w;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    const ATTITUDES: [(f64, f64, f64); 6] = [
        (0.0, 0.0, 0.0),
        (0.3, 0.0, 0.0),
        (0.0, -0.7, 0.0),
        (0.0, 0.0, 2.5),
        (-1.2, 0.4, -2.9),
        (2.8, 1.3, 0.1),
    ];

    #[test]
    fn euler_round_trip() {
        for (phi, theta, psi) in ATTITUDES {
            let q = euler_to_quaternion(phi, theta, psi);
            let (p2, t2, y2) = quaternion_to_euler(&q);
            assert_approx_eq!(p2, phi, 1e-10);
            assert_approx_eq!(t2, theta, 1e-10);
            assert_approx_eq!(y2, psi, 1e-10);
        }
    }

    #[test]
    fn quaternion_matches_rotation_matrix() {
        for (phi, theta, psi) in ATTITUDES {
            let q = euler_to_quaternion(phi, theta, psi);
            let r = body_to_ned_matrix(phi, theta, psi);
            let v = Vector3::new(1.0, -2.0, 0.5);
            let a = body_to_inertial(&v, &q);
            let b = r * v;
            assert_approx_eq!(a.x, b.x, 1e-12);
            assert_approx_eq!(a.y, b.y, 1e-12);
            assert_approx_eq!(a.z, b.z, 1e-12);
        }
    }

    #[test]
    fn gimbal_lock_pitch_is_clamped() {
        let q = euler_to_quaternion(0.0, FRAC_PI_2, 0.0);
        let (_, theta, _) = quaternion_to_euler(&q);
        assert!(theta.is_finite());
        assert_approx_eq!(theta, FRAC_PI_2, 1e-6);
    }

    #[test]
    fn inertial_body_round_trip() {
        let q = euler_to_quaternion(0.2, 0.1, -0.4);
        let v = Vector3::new(3.0, 4.0, -5.0);
        let back = body_to_inertial(&inertial_to_body(&v, &q), &q);
        assert_approx_eq!((back - v).norm(), 0.0, 1e-12);
    }

    #[test]
    fn gravity_body_matches_quaternion_rotation() {
        let (phi, theta) = (0.3, -0.2);
        let q = euler_to_quaternion(phi, theta, 1.1);
        let g = inertial_to_body(&Vector3::new(0.0, 0.0, GRAVITY), &q);
        let expected = gravity_body(phi, theta);
        assert_approx_eq!((g - expected).norm(), 0.0, 1e-12);
    }

    #[test]
    fn constant_yaw_rate_integration() {
        let mut q = UnitQuaternion::identity();
        let omega = Vector3::new(0.0, 0.0, 0.1);
        for _ in 0..100 {
            q = integrate_quaternion(&q, &omega, 0.1);
        }
        let (_, _, psi) = quaternion_to_euler(&q);
        assert_approx_eq!(psi, 1.0, 1e-10);
        assert_approx_eq!(q.norm(), 1.0, 1e-12);
    }

    #[test]
    fn zero_rate_leaves_attitude() {
        let q = euler_to_quaternion(0.1, 0.2, 0.3);
        let q2 = integrate_quaternion(&q, &Vector3::zeros(), 0.01);
        assert_eq!(q, q2);
    }

    #[test]
    fn wrap_to_pi_range() {
        let pi = std::f64::consts::PI;
        assert_approx_eq!(wrap_to_pi(3.5 * pi), -0.5 * pi, 1e-12);
        assert_approx_eq!(wrap_to_pi(-0.5), -0.5, 1e-12);
        assert_approx_eq!(wrap_to_pi(7.0), 7.0 - 2.0 * std::f64::consts::PI, 1e-12);
    }

    #[test]
    fn slice_layout_is_xyzw() {
        let q = Quaternion::new(0.9, 0.1, 0.2, 0.3);
        let mut buf = [0.0; 6];
        quaternion_to_slice(&q, &mut buf, 2);
        assert_eq!(buf, [0.0, 0.0, 0.1, 0.2, 0.3, 0.9]);
        assert_eq!(quaternion_from_slice(&buf, 2), q);
    }
}
