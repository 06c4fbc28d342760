use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use nalgebra::DVector;
use std::ops::Mul;

use crate::linalg::{
    JacobianMatrix, LinAlgError, LinAlgResult, LinearSolver, LinearSolverSummary,
    LinearSolverType, check_step, check_system_shape,
};

/// Sparse `LLᵀ` of `JᵀJ + λI` on faer.
#[derive(Debug, Clone, Default)]
pub struct SparseNormalCholeskySolver {
    /// Cached symbolic factorization for reuse across iterations.
    ///
    /// The sparsity pattern of `JᵀJ + λI` only depends on the problem structure, so it is
    /// computed on the first solve and reused afterwards.
    symbolic_factorization: Option<SymbolicLlt<usize>>,

    /// The Hessian `JᵀJ` from the last solve (without damping)
    hessian: Option<SparseColMat<usize, f64>>,
}

impl SparseNormalCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    pub fn has_symbolic_factorization(&self) -> bool {
        self.symbolic_factorization.is_some()
    }
}

impl LinearSolver for SparseNormalCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::SparseNormalCholesky
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        check_system_shape(jacobian, residuals)?;
        let jacobian = jacobian.to_sparse()?;

        // H = J^T * J
        let jt = jacobian.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobian.as_ref());

        // g = J^T * r
        let residuals = Mat::from_fn(residuals.len(), 1, |i, _| residuals[i]);
        let gradient = jacobian.as_ref().transpose().mul(&residuals);

        let step = solve_sparse_spd(
            &hessian,
            &gradient,
            lambda,
            &mut self.symbolic_factorization,
        )?;
        check_step(&step)?;
        self.hessian = Some(hessian);

        Ok(LinearSolverSummary {
            step,
            num_iterations: 1,
            solver_type: self.solver_type(),
        })
    }
}

/// Solve `(H + λI) x = -g` by sparse Cholesky, caching the symbolic factorization.
///
/// `H` must be symmetric positive (semi-)definite and `g` an `n x 1` column.
pub(crate) fn solve_sparse_spd(
    hessian: &SparseColMat<usize, f64>,
    gradient: &Mat<f64>,
    lambda: f64,
    symbolic_cache: &mut Option<SymbolicLlt<usize>>,
) -> LinAlgResult<DVector<f64>> {
    let n = hessian.ncols();
    if n == 0 {
        return Ok(DVector::zeros(0));
    }

    // H_aug = H + lambda * I; the diagonal is always stored so the pattern is stable in lambda
    let lambda_i_triplets: Vec<_> = (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
    let lambda_i = SparseColMat::try_new_from_triplets(n, n, &lambda_i_triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
            .log_with_source(e)
    })?;
    let augmented_hessian = hessian + lambda_i;

    let sym = if let Some(cached_sym) = symbolic_cache.as_ref() {
        // SymbolicLlt is reference-counted, so clone() is cheap
        cached_sym.clone()
    } else {
        let new_sym =
            SymbolicLlt::try_new(augmented_hessian.symbolic(), Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed(
                    "Symbolic Cholesky decomposition failed".to_string(),
                )
                .log_with_source(e)
            })?;
        *symbolic_cache = Some(new_sym.clone());
        new_sym
    };

    let cholesky = Llt::try_new_with_symbolic(sym, augmented_hessian.as_ref(), Side::Lower)
        .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

    let dx = cholesky.solve(-gradient);
    Ok(DVector::from_fn(n, |i, _| dx[(i, 0)]))
}
