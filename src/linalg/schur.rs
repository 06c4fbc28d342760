//! Schur-complement solvers.
//!
//! The first `num_eliminate_cols` columns of the Jacobian belong to the eliminated
//! parameter blocks. Because those blocks form an independent set, the corresponding part
//! of the damped normal matrix is block diagonal:
//!
//! ```text
//! ┌           ┐ ┌    ┐   ┌     ┐
//! │ E    F    │ │ δe │   │ -ge │      E = diag(E_1, ..., E_k)
//! │ Fᵀ   G    │ │ δf │ = │ -gf │
//! └           ┘ └    ┘   └     ┘
//! ```
//!
//! Each `E_i` is inverted on its own, the reduced system `S δf = -gf + Fᵀ E⁻¹ ge` with
//! `S = G - Fᵀ E⁻¹ F` is solved by the configured back end, and `δe` follows by
//! back-substitution. The reduced system is formed densely.

use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    DEFAULT_CG_TOLERANCE, JacobianMatrix, LinAlgError, LinAlgResult, LinearSolver,
    LinearSolverOptions, LinearSolverSummary, LinearSolverType,
    cg::{jacobi_preconditioner, preconditioned_conjugate_gradient},
    check_step, check_system_shape,
};

/// How the reduced system is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchurBackend {
    /// Dense Cholesky
    Dense,
    /// Sparse Cholesky on faer (feature `sparse`)
    Sparse,
    /// Jacobi-preconditioned conjugate gradients
    Iterative,
}

impl SchurBackend {
    pub fn solver_type(self) -> LinearSolverType {
        match self {
            SchurBackend::Dense => LinearSolverType::DenseSchur,
            SchurBackend::Sparse => LinearSolverType::SparseSchur,
            SchurBackend::Iterative => LinearSolverType::IterativeSchur,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchurComplementSolver {
    backend: SchurBackend,
    /// Sizes of the eliminated parameter blocks, in column order
    eliminated_block_sizes: Vec<usize>,
    min_num_iterations: usize,
    max_num_iterations: usize,
    tolerance: f64,
}

impl SchurComplementSolver {
    pub fn new(backend: SchurBackend, options: LinearSolverOptions) -> Self {
        Self {
            backend,
            eliminated_block_sizes: options.eliminated_block_sizes,
            min_num_iterations: options.min_num_iterations,
            max_num_iterations: options.max_num_iterations,
            tolerance: DEFAULT_CG_TOLERANCE,
        }
    }

    pub fn backend(&self) -> SchurBackend {
        self.backend
    }

    pub fn num_eliminate_blocks(&self) -> usize {
        self.eliminated_block_sizes.len()
    }

    pub fn num_eliminate_cols(&self) -> usize {
        self.eliminated_block_sizes.iter().sum()
    }

    /// Solve `S x = rhs` with the configured back end; returns the solution and iterations.
    fn solve_reduced(
        &self,
        reduced: DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<(DVector<f64>, usize)> {
        if rhs.is_empty() {
            return Ok((DVector::zeros(0), 0));
        }
        match self.backend {
            SchurBackend::Dense => {
                let cholesky = reduced
                    .cholesky()
                    .ok_or_else(|| LinAlgError::SingularMatrix.log())?;
                Ok((cholesky.solve(rhs), 1))
            }
            #[cfg(feature = "sparse")]
            SchurBackend::Sparse => {
                use faer::{Mat, sparse::SparseColMat, sparse::Triplet};

                let n = reduced.nrows();
                let mut triplets = Vec::new();
                for col in 0..n {
                    for row in 0..n {
                        let value = reduced[(row, col)];
                        if value != 0.0 || row == col {
                            triplets.push(Triplet::new(row, col, value));
                        }
                    }
                }
                let reduced = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
                    LinAlgError::SparseMatrixCreation(
                        "Failed to build sparse reduced system".to_string(),
                    )
                    .log_with_source(e)
                })?;
                let gradient = Mat::from_fn(n, 1, |i, _| -rhs[i]);

                // The reduced pattern depends on the values, so no symbolic reuse here
                let mut symbolic = None;
                let solution = crate::linalg::cholesky::solve_sparse_spd(
                    &reduced,
                    &gradient,
                    0.0,
                    &mut symbolic,
                )?;
                Ok((solution, 1))
            }
            #[cfg(not(feature = "sparse"))]
            SchurBackend::Sparse => Err(LinAlgError::UnsupportedSolver(
                "sparse Schur back end requires the `sparse` feature".to_string(),
            )
            .log()),
            SchurBackend::Iterative => {
                let preconditioner = jacobi_preconditioner(&reduced.diagonal());
                let outcome = preconditioned_conjugate_gradient(
                    |x| Ok(&reduced * x),
                    rhs,
                    &preconditioner,
                    self.min_num_iterations,
                    self.max_num_iterations,
                    self.tolerance,
                )?;
                Ok((outcome.solution, outcome.num_iterations))
            }
        }
    }
}

impl LinearSolver for SchurComplementSolver {
    fn solver_type(&self) -> LinearSolverType {
        self.backend.solver_type()
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        check_system_shape(jacobian, residuals)?;

        let n = jacobian.ncols();
        let e = self.num_eliminate_cols();
        if e > n {
            return Err(LinAlgError::DimensionMismatch(format!(
                "{e} eliminated columns requested but the Jacobian has {n} columns"
            ))
            .log());
        }
        let f = n - e;
        let gradient = jacobian.apply_transpose(residuals)?;

        // Inverse of each diagonal block E_i and its column offset
        let mut inverse_blocks = Vec::with_capacity(self.eliminated_block_sizes.len());
        let mut offset = 0;
        for &size in &self.eliminated_block_sizes {
            let block = DMatrix::from_fn(size, size, |i, j| {
                let value = jacobian.column_dot(offset + i, offset + j);
                if i == j { value + lambda } else { value }
            });
            let inverse = block
                .cholesky()
                .ok_or_else(|| LinAlgError::SingularMatrix.log())?
                .inverse();
            inverse_blocks.push((offset, inverse));
            offset += size;
        }

        // F: coupling between eliminated and free columns, G: free block
        let coupling = DMatrix::from_fn(e, f, |i, j| jacobian.column_dot(i, e + j));
        let mut reduced = DMatrix::from_fn(f, f, |i, j| {
            let value = jacobian.column_dot(e + i, e + j);
            if i == j { value + lambda } else { value }
        });
        let mut rhs = -gradient.rows(e, f);

        for (offset, inverse) in &inverse_blocks {
            let size = inverse.nrows();
            let f_i = coupling.rows(*offset, size);
            let g_i = gradient.rows(*offset, size);
            let einv_f = inverse * f_i;
            reduced -= f_i.transpose() * &einv_f;
            rhs += f_i.transpose() * (inverse * g_i);
        }

        let (delta_f, num_iterations) = self.solve_reduced(reduced, &rhs)?;

        // Back-substitution: δe_i = E_i⁻¹ (-ge_i - F_i δf)
        let mut step = DVector::zeros(n);
        for (offset, inverse) in &inverse_blocks {
            let size = inverse.nrows();
            let rhs_i = -gradient.rows(*offset, size) - coupling.rows(*offset, size) * &delta_f;
            step.rows_mut(*offset, size).copy_from(&(inverse * rhs_i));
        }
        step.rows_mut(e, f).copy_from(&delta_f);
        check_step(&step)?;

        Ok(LinearSolverSummary {
            step,
            num_iterations,
            solver_type: self.solver_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::DenseQrSolver;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Two eliminated 1-D "points" and one 2-D "camera"; points never share a row
    fn schur_shaped_jacobian() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            5,
            4,
            &[
                1.0, 0.0, 0.5, -0.2, //
                0.0, 2.0, 0.3, 0.4, //
                1.5, 0.0, 0.0, 1.0, //
                0.0, 0.7, -1.0, 0.0, //
                0.0, 0.0, 1.0, 1.0, //
            ],
        )
    }

    fn options() -> LinearSolverOptions {
        LinearSolverOptions {
            eliminated_block_sizes: vec![1, 1],
            max_num_iterations: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_backends_match_qr() -> TestResult {
        let jacobian = JacobianMatrix::Dense(schur_shaped_jacobian());
        let residuals = dvector![0.3, -1.0, 2.0, 0.5, -0.7];
        let expected = DenseQrSolver::new().solve(&jacobian, &residuals, 0.05)?.step;

        let mut backends = vec![SchurBackend::Dense, SchurBackend::Iterative];
        if cfg!(feature = "sparse") {
            backends.push(SchurBackend::Sparse);
        }
        for backend in backends {
            let mut solver = SchurComplementSolver::new(backend, options());
            let summary = solver.solve(&jacobian, &residuals, 0.05)?;
            assert!(
                (&summary.step - &expected).norm() < 1e-8,
                "{backend:?} disagrees with QR"
            );
            assert_eq!(summary.solver_type, backend.solver_type());
        }
        Ok(())
    }

    #[test]
    fn test_sparse_jacobian_input() -> TestResult {
        let dense = JacobianMatrix::Dense(schur_shaped_jacobian());
        let sparse = JacobianMatrix::Sparse(dense.to_sparse()?);
        let residuals = dvector![0.3, -1.0, 2.0, 0.5, -0.7];

        let mut solver = SchurComplementSolver::new(SchurBackend::Dense, options());
        let from_dense = solver.solve(&dense, &residuals, 0.0)?;
        let from_sparse = solver.solve(&sparse, &residuals, 0.0)?;
        assert!((from_dense.step - from_sparse.step).norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_everything_eliminated() -> TestResult {
        // No free columns: the reduced system is empty
        let jacobian = JacobianMatrix::Dense(DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]));
        let residuals = dvector![1.0, 1.0];
        let mut solver = SchurComplementSolver::new(SchurBackend::Dense, options());
        let summary = solver.solve(&jacobian, &residuals, 0.0)?;
        assert!((summary.step - dvector![-0.5, -0.25]).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_too_many_eliminated_columns() {
        let jacobian = JacobianMatrix::Dense(DMatrix::zeros(1, 1));
        let mut solver = SchurComplementSolver::new(SchurBackend::Dense, options());
        let result = solver.solve(&jacobian, &dvector![0.0], 1.0);
        assert!(matches!(result, Err(LinAlgError::DimensionMismatch(_))));
    }
}
