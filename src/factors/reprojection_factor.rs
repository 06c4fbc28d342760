//! Reprojection factor for the BAL ("Bundle Adjustment in the Large") camera model.
//!
//! Each camera is a 9-vector `[ω (angle-axis, 3), t (3), f, k1, k2]` and each point a
//! 3-vector. The projection follows the Bundler convention:
//!
//! ```text
//! P  = R(ω)·X + t
//! p  = -P.xy / P.z
//! d  = 1 + k1·|p|² + k2·|p|⁴
//! uv = f·d·p
//! r  = uv - observed
//! ```
//!
//! Jacobians are analytic. With `P = R(ω)·X + t` the chain is
//!
//! ```text
//! ∂P/∂ω = -[R(ω)·X]× · Jₗ(ω)     (Jₗ: left Jacobian of SO(3))
//! ∂P/∂t = I
//! ∂P/∂X = R(ω)
//! ```
//!
//! followed by the perspective division and the radial distortion. The factor is the
//! typical two-block residual of a bundle adjustment problem, which is the structure
//! Schur-complement solvers are built for: points never share a residual with other points.

use super::{Factor, FactorError, FactorResult, Linearization};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Matrix3, Rotation3, Vector2, Vector3};

/// Size of a BAL camera parameter block
pub const CAMERA_SIZE: usize = 9;
/// Size of a BAL point parameter block
pub const POINT_SIZE: usize = 3;

/// Below this rotation angle the left Jacobian uses its second-order expansion
const SMALL_ANGLE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct SnavelyReprojectionFactor {
    /// Observed image coordinates
    pub observed: Vector2<f64>,
}

impl SnavelyReprojectionFactor {
    pub fn new(observed_x: f64, observed_y: f64) -> Self {
        Self {
            observed: Vector2::new(observed_x, observed_y),
        }
    }

    fn evaluate(
        &self,
        camera: &DVector<f64>,
        point: &DVector<f64>,
        compute_jacobian: bool,
    ) -> FactorResult<(Vector2<f64>, Option<DMatrix<f64>>)> {
        let axis_angle = Vector3::new(camera[0], camera[1], camera[2]);
        let translation = Vector3::new(camera[3], camera[4], camera[5]);
        let focal = camera[6];
        let k1 = camera[7];
        let k2 = camera[8];

        let rotation = Rotation3::new(axis_angle);
        let rotated = rotation * Vector3::new(point[0], point[1], point[2]);
        let p = rotated + translation;
        if p.z.abs() < f64::EPSILON {
            return Err(FactorError::InvalidProjection(format!(
                "point projects onto the camera plane (z = {:.3e})",
                p.z
            )));
        }

        let xp = -p.x / p.z;
        let yp = -p.y / p.z;
        let r2 = xp * xp + yp * yp;
        let distortion = 1.0 + r2 * (k1 + k2 * r2);

        let predicted = Vector2::new(focal * distortion * xp, focal * distortion * yp);
        let residual = predicted - self.observed;
        if !residual.iter().all(|v| v.is_finite()) {
            return Err(FactorError::NumericalInstability(
                "non-finite reprojection residual".to_string(),
            ));
        }
        if !compute_jacobian {
            return Ok((residual, None));
        }

        // ∂(xp, yp)/∂P
        let inv_z = 1.0 / p.z;
        let d_normalized = Matrix2x3::new(
            -inv_z, 0.0, p.x * inv_z * inv_z,
            0.0, -inv_z, p.y * inv_z * inv_z,
        );
        // ∂(u, v)/∂(xp, yp)
        let d_distortion = 2.0 * (k1 + 2.0 * k2 * r2);
        let d_pixel = focal
            * Matrix2::new(
                distortion + d_distortion * xp * xp,
                d_distortion * xp * yp,
                d_distortion * xp * yp,
                distortion + d_distortion * yp * yp,
            );
        let d_camera_point = d_pixel * d_normalized;

        let d_rotation = -d_camera_point * rotated.cross_matrix() * so3_left_jacobian(&axis_angle);
        let d_point = d_camera_point * rotation.matrix();

        let mut jacobian = DMatrix::<f64>::zeros(2, CAMERA_SIZE + POINT_SIZE);
        jacobian.view_mut((0, 0), (2, 3)).copy_from(&d_rotation);
        jacobian.view_mut((0, 3), (2, 3)).copy_from(&d_camera_point);
        for (row, normalized) in [xp, yp].into_iter().enumerate() {
            jacobian[(row, 6)] = distortion * normalized;
            jacobian[(row, 7)] = focal * r2 * normalized;
            jacobian[(row, 8)] = focal * r2 * r2 * normalized;
        }
        jacobian.view_mut((0, CAMERA_SIZE), (2, POINT_SIZE)).copy_from(&d_point);

        Ok((residual, Some(jacobian)))
    }
}

/// Left Jacobian of SO(3): `exp([ω + δ]×) ≈ exp([Jₗ(ω)·δ]×) · exp([ω]×)`.
fn so3_left_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = omega.norm_squared();
    let skew = omega.cross_matrix();
    let skew2 = skew * skew;
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * skew + skew2 / 6.0;
    }
    let theta = theta2.sqrt();
    Matrix3::identity()
        + (1.0 - theta.cos()) / theta2 * skew
        + (theta - theta.sin()) / (theta2 * theta) * skew2
}

impl Factor for SnavelyReprojectionFactor {
    fn linearize(
        &self,
        params: &[DVector<f64>],
        compute_jacobian: bool,
    ) -> FactorResult<Linearization> {
        if params.len() != 2 {
            return Err(FactorError::InvalidDimension {
                expected: 2,
                actual: params.len(),
            });
        }
        if params[0].len() != CAMERA_SIZE {
            return Err(FactorError::InvalidDimension {
                expected: CAMERA_SIZE,
                actual: params[0].len(),
            });
        }
        if params[1].len() != POINT_SIZE {
            return Err(FactorError::InvalidDimension {
                expected: POINT_SIZE,
                actual: params[1].len(),
            });
        }

        let (residual, jacobian) = self.evaluate(&params[0], &params[1], compute_jacobian)?;
        Ok((DVector::from_column_slice(residual.as_slice()), jacobian))
    }

    fn get_dimension(&self) -> usize {
        2
    }

    fn parameter_block_sizes(&self) -> Option<Vec<usize>> {
        Some(vec![CAMERA_SIZE, POINT_SIZE])
    }
}
