//! Dense direct solvers.
//!
//! Both solvers work on `nalgebra` matrices. `DenseQrSolver` avoids forming `JᵀJ` and is
//! the most robust choice for small problems; `DenseNormalCholeskySolver` is cheaper when
//! the Jacobian has many more rows than columns.

use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    JacobianMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    LinearSolverType, check_step, check_system_shape,
};

/// QR factorization of the augmented system `[J; √λ I] δ = [-r; 0]`.
#[derive(Debug, Clone, Default)]
pub struct DenseQrSolver;

impl DenseQrSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseQrSolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::DenseQr
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        check_system_shape(jacobian, residuals)?;
        let (m, n) = (jacobian.nrows(), jacobian.ncols());
        if n == 0 {
            return Ok(LinearSolverSummary {
                step: DVector::zeros(0),
                num_iterations: 0,
                solver_type: self.solver_type(),
            });
        }

        let dense = jacobian.to_dense();
        let mut augmented = DMatrix::<f64>::zeros(m + n, n);
        augmented.view_mut((0, 0), (m, n)).copy_from(&dense);
        let sqrt_lambda = lambda.max(0.0).sqrt();
        for i in 0..n {
            augmented[(m + i, i)] = sqrt_lambda;
        }

        let mut rhs = DVector::<f64>::zeros(m + n);
        rhs.rows_mut(0, m).copy_from(&(-residuals));

        // A thin QR needs at least as many rows as columns, which the damping rows guarantee
        let qr = augmented.qr();
        let qt_b = qr.q().tr_mul(&rhs);
        let r = qr.r();
        let step = r
            .solve_upper_triangular(&qt_b)
            .ok_or_else(|| LinAlgError::SingularMatrix.log())?;
        check_step(&step)?;

        Ok(LinearSolverSummary {
            step,
            num_iterations: 1,
            solver_type: self.solver_type(),
        })
    }
}

/// Dense Cholesky factorization of `JᵀJ + λI`.
#[derive(Debug, Clone, Default)]
pub struct DenseNormalCholeskySolver {
    /// Gradient `Jᵀr` from the last solve
    gradient: Option<DVector<f64>>,
}

impl DenseNormalCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gradient(&self) -> Option<&DVector<f64>> {
        self.gradient.as_ref()
    }
}

impl LinearSolver for DenseNormalCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::DenseNormalCholesky
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        check_system_shape(jacobian, residuals)?;

        let hessian = jacobian.damped_normal_matrix(lambda);
        let gradient = jacobian.apply_transpose(residuals)?;

        let cholesky = hessian
            .cholesky()
            .ok_or_else(|| LinAlgError::SingularMatrix.log())?;
        let step = cholesky.solve(&(-&gradient));
        check_step(&step)?;

        self.gradient = Some(gradient);
        Ok(LinearSolverSummary {
            step,
            num_iterations: 1,
            solver_type: self.solver_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::tests::sample_jacobian;
    use nalgebra::dvector;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Step from explicitly inverting the damped normal matrix
    fn reference_step(j: &DMatrix<f64>, r: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
        let h = j.tr_mul(j) + DMatrix::identity(j.ncols(), j.ncols()) * lambda;
        h.try_inverse().map(|inv| -(inv * j.tr_mul(r)))
    }

    #[test]
    fn test_qr_matches_normal_equations() -> TestResult {
        let j = sample_jacobian();
        let r = dvector![1.0, -2.0, 0.5, 1.2];
        let expected = reference_step(&j, &r, 0.1).ok_or("reference inverse failed")?;

        let summary = DenseQrSolver::new().solve(&JacobianMatrix::Dense(j), &r, 0.1)?;
        assert!((summary.step - expected).norm() < TOLERANCE);
        assert_eq!(summary.solver_type, LinearSolverType::DenseQr);
        Ok(())
    }

    #[test]
    fn test_cholesky_matches_qr() -> TestResult {
        let jacobian = JacobianMatrix::Dense(sample_jacobian());
        let r = dvector![1.0, -2.0, 0.5, 1.2];

        let qr = DenseQrSolver::new().solve(&jacobian, &r, 0.0)?;
        let mut solver = DenseNormalCholeskySolver::new();
        let chol = solver.solve(&jacobian, &r, 0.0)?;

        assert!((qr.step - chol.step).norm() < 1e-9);
        assert!(solver.gradient().is_some());
        Ok(())
    }

    #[test]
    fn test_singular_system_without_damping_fails() -> TestResult {
        // Second column is zero, so JᵀJ is singular
        let j = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]);
        let r = dvector![0.0, 1.0];

        let result =
            DenseNormalCholeskySolver::new().solve(&JacobianMatrix::Dense(j.clone()), &r, 0.0);
        assert!(result.is_err());

        // Damping makes the system solvable
        let summary = DenseQrSolver::new().solve(&JacobianMatrix::Dense(j), &r, 1.0)?;
        assert!(summary.step.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let result = DenseQrSolver::new().solve(
            &JacobianMatrix::Dense(sample_jacobian()),
            &dvector![1.0, 2.0],
            0.0,
        );
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
    }
}
