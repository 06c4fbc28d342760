//! Linear solvers for the trust-region step.
//!
//! Every solver computes the damped Gauss-Newton step
//!
//! ```text
//! (JᵀJ + λI) δ = -Jᵀr
//! ```
//!
//! from a Jacobian stored either densely (`nalgebra::DMatrix`) or sparsely
//! (`faer::sparse::SparseColMat`). Which storage the evaluator produces is decided by
//! [`LinearSolverType::uses_dense_jacobian`], so a solver always receives the layout it
//! was configured for. Solvers accept the other layout too and convert it.
//!
//! Solver families form a closed enum. Schur-complement families additionally require an
//! elimination ordering whose first group is an independent set; see
//! [`crate::core::graph`].

pub mod cg;
#[cfg(feature = "sparse")]
pub mod cholesky;
pub mod dense;
pub mod schur;

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::error;

use crate::core::worker_pool::WorkerPool;

pub use cg::CgnrSolver;
#[cfg(feature = "sparse")]
pub use cholesky::SparseNormalCholeskySolver;
pub use dense::{DenseNormalCholeskySolver, DenseQrSolver};
pub use schur::{SchurBackend, SchurComplementSolver};

/// Relative residual tolerance used by the conjugate-gradient solvers.
pub const DEFAULT_CG_TOLERANCE: f64 = 1e-10;

/// Linear solver families.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinearSolverType {
    #[default]
    DenseQr,
    DenseNormalCholesky,
    DenseSchur,
    SparseNormalCholesky,
    SparseSchur,
    IterativeSchur,
    Cgnr,
}

impl LinearSolverType {
    /// Every solver family, in declaration order.
    pub const ALL: [LinearSolverType; 7] = [
        LinearSolverType::DenseQr,
        LinearSolverType::DenseNormalCholesky,
        LinearSolverType::DenseSchur,
        LinearSolverType::SparseNormalCholesky,
        LinearSolverType::SparseSchur,
        LinearSolverType::IterativeSchur,
        LinearSolverType::Cgnr,
    ];

    /// True for the Schur-complement families, which need an elimination group.
    pub fn is_schur(self) -> bool {
        match self {
            LinearSolverType::DenseSchur
            | LinearSolverType::SparseSchur
            | LinearSolverType::IterativeSchur => true,
            LinearSolverType::DenseQr
            | LinearSolverType::DenseNormalCholesky
            | LinearSolverType::SparseNormalCholesky
            | LinearSolverType::Cgnr => false,
        }
    }

    /// Non-Schur family used when the elimination group is empty.
    ///
    /// Non-Schur families map to themselves.
    pub fn schur_fallback(self) -> LinearSolverType {
        match self {
            LinearSolverType::DenseSchur => LinearSolverType::DenseQr,
            LinearSolverType::SparseSchur => LinearSolverType::SparseNormalCholesky,
            LinearSolverType::IterativeSchur => LinearSolverType::Cgnr,
            other => other,
        }
    }

    /// True for families that need a sparse direct factorization.
    pub fn requires_sparse_backend(self) -> bool {
        match self {
            LinearSolverType::SparseNormalCholesky | LinearSolverType::SparseSchur => true,
            LinearSolverType::DenseQr
            | LinearSolverType::DenseNormalCholesky
            | LinearSolverType::DenseSchur
            | LinearSolverType::IterativeSchur
            | LinearSolverType::Cgnr => false,
        }
    }

    /// True for families bounded by the linear solver iteration limits.
    pub fn is_iterative(self) -> bool {
        match self {
            LinearSolverType::IterativeSchur | LinearSolverType::Cgnr => true,
            LinearSolverType::DenseQr
            | LinearSolverType::DenseNormalCholesky
            | LinearSolverType::DenseSchur
            | LinearSolverType::SparseNormalCholesky
            | LinearSolverType::SparseSchur => false,
        }
    }

    /// True if the evaluator should assemble a dense Jacobian for this family.
    pub fn uses_dense_jacobian(self) -> bool {
        match self {
            LinearSolverType::DenseQr
            | LinearSolverType::DenseNormalCholesky
            | LinearSolverType::DenseSchur => true,
            LinearSolverType::SparseNormalCholesky
            | LinearSolverType::SparseSchur
            | LinearSolverType::IterativeSchur
            | LinearSolverType::Cgnr => false,
        }
    }
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseQr => write!(f, "Dense QR"),
            LinearSolverType::DenseNormalCholesky => write!(f, "Dense Normal Cholesky"),
            LinearSolverType::DenseSchur => write!(f, "Dense Schur"),
            LinearSolverType::SparseNormalCholesky => write!(f, "Sparse Normal Cholesky"),
            LinearSolverType::SparseSchur => write!(f, "Sparse Schur"),
            LinearSolverType::IterativeSchur => write!(f, "Iterative Schur"),
            LinearSolverType::Cgnr => write!(f, "CGNR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// Operand shapes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Solver family not available in this build
    #[error("Unsupported linear solver: {0}")]
    UnsupportedSolver(String),

    /// Iterative solver produced a non-finite iterate
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Solver threads could not be started
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Jacobian in the storage the evaluator was configured for.
#[derive(Debug, Clone)]
pub enum JacobianMatrix {
    Dense(DMatrix<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl JacobianMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            JacobianMatrix::Dense(m) => m.nrows(),
            JacobianMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            JacobianMatrix::Dense(m) => m.ncols(),
            JacobianMatrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, JacobianMatrix::Sparse(_))
    }

    /// Number of stored entries.
    pub fn num_nonzeros(&self) -> usize {
        match self {
            JacobianMatrix::Dense(m) => m.len(),
            JacobianMatrix::Sparse(m) => (0..m.ncols()).map(|c| m.val_of_col(c).len()).sum(),
        }
    }

    /// `J x`
    pub fn apply(&self, x: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        if x.len() != self.ncols() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J is {}x{}, x has {} entries",
                self.nrows(),
                self.ncols(),
                x.len()
            )));
        }
        match self {
            JacobianMatrix::Dense(m) => Ok(m * x),
            JacobianMatrix::Sparse(m) => {
                let mut y = DVector::zeros(m.nrows());
                let symbolic = m.symbolic();
                for col in 0..m.ncols() {
                    let rows = symbolic.row_idx_of_col_raw(col);
                    let values = m.val_of_col(col);
                    for (&row, &value) in rows.iter().zip(values) {
                        y[row] += value * x[col];
                    }
                }
                Ok(y)
            }
        }
    }

    /// `Jᵀ y`
    pub fn apply_transpose(&self, y: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        if y.len() != self.nrows() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J is {}x{}, y has {} entries",
                self.nrows(),
                self.ncols(),
                y.len()
            )));
        }
        match self {
            JacobianMatrix::Dense(m) => Ok(m.tr_mul(y)),
            JacobianMatrix::Sparse(m) => {
                let symbolic = m.symbolic();
                Ok(DVector::from_fn(m.ncols(), |col, _| {
                    symbolic
                        .row_idx_of_col_raw(col)
                        .iter()
                        .zip(m.val_of_col(col))
                        .map(|(&row, &value)| value * y[row])
                        .sum()
                }))
            }
        }
    }

    /// Dot product of columns `i` and `j`, i.e. the `(i, j)` entry of `JᵀJ`.
    pub fn column_dot(&self, i: usize, j: usize) -> f64 {
        match self {
            JacobianMatrix::Dense(m) => m.column(i).dot(&m.column(j)),
            JacobianMatrix::Sparse(m) => {
                let symbolic = m.symbolic();
                let (rows_i, vals_i) = (symbolic.row_idx_of_col_raw(i), m.val_of_col(i));
                let (rows_j, vals_j) = (symbolic.row_idx_of_col_raw(j), m.val_of_col(j));

                // Row indices are sorted within each column
                let (mut a, mut b, mut sum) = (0, 0, 0.0);
                while a < rows_i.len() && b < rows_j.len() {
                    match rows_i[a].cmp(&rows_j[b]) {
                        std::cmp::Ordering::Less => a += 1,
                        std::cmp::Ordering::Greater => b += 1,
                        std::cmp::Ordering::Equal => {
                            sum += vals_i[a] * vals_j[b];
                            a += 1;
                            b += 1;
                        }
                    }
                }
                sum
            }
        }
    }

    /// Squared column norms, the diagonal of `JᵀJ`.
    pub fn column_squared_norms(&self) -> DVector<f64> {
        match self {
            JacobianMatrix::Dense(m) => {
                DVector::from_fn(m.ncols(), |c, _| m.column(c).norm_squared())
            }
            JacobianMatrix::Sparse(m) => DVector::from_fn(m.ncols(), |c, _| {
                m.val_of_col(c).iter().map(|v| v * v).sum()
            }),
        }
    }

    /// Dense `JᵀJ + λI`.
    pub fn damped_normal_matrix(&self, lambda: f64) -> DMatrix<f64> {
        let mut hessian = match self {
            JacobianMatrix::Dense(m) => m.tr_mul(m),
            JacobianMatrix::Sparse(_) => {
                let n = self.ncols();
                let mut h = DMatrix::zeros(n, n);
                for j in 0..n {
                    for i in j..n {
                        let value = self.column_dot(i, j);
                        h[(i, j)] = value;
                        h[(j, i)] = value;
                    }
                }
                h
            }
        };
        for i in 0..hessian.nrows() {
            hessian[(i, i)] += lambda;
        }
        hessian
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            JacobianMatrix::Dense(m) => m.clone(),
            JacobianMatrix::Sparse(m) => {
                let mut dense = DMatrix::zeros(m.nrows(), m.ncols());
                let symbolic = m.symbolic();
                for col in 0..m.ncols() {
                    let rows = symbolic.row_idx_of_col_raw(col);
                    for (&row, &value) in rows.iter().zip(m.val_of_col(col)) {
                        dense[(row, col)] += value;
                    }
                }
                dense
            }
        }
    }

    /// Sparse copy of the Jacobian; dense storage keeps only its non-zero entries.
    pub fn to_sparse(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        match self {
            JacobianMatrix::Sparse(m) => Ok(m.clone()),
            JacobianMatrix::Dense(m) => {
                let mut triplets = Vec::new();
                for col in 0..m.ncols() {
                    for row in 0..m.nrows() {
                        let value = m[(row, col)];
                        if value != 0.0 {
                            triplets.push(Triplet::new(row, col, value));
                        }
                    }
                }
                SparseColMat::try_new_from_triplets(m.nrows(), m.ncols(), &triplets).map_err(|e| {
                    LinAlgError::SparseMatrixCreation(
                        "Failed to convert dense Jacobian to sparse storage".to_string(),
                    )
                    .log_with_source(e)
                })
            }
        }
    }
}

/// Options shared by all linear solvers.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolverOptions {
    pub solver_type: LinearSolverType,
    /// Number of parameter blocks per elimination group, in processing order
    pub elimination_groups: Vec<usize>,
    /// Scalar sizes of the eliminated parameter blocks, in column order
    pub eliminated_block_sizes: Vec<usize>,
    pub min_num_iterations: usize,
    pub max_num_iterations: usize,
    pub num_threads: usize,
}

impl Default for LinearSolverOptions {
    fn default() -> Self {
        Self {
            solver_type: LinearSolverType::default(),
            elimination_groups: Vec::new(),
            eliminated_block_sizes: Vec::new(),
            min_num_iterations: 0,
            max_num_iterations: 500,
            num_threads: 1,
        }
    }
}

impl LinearSolverOptions {
    /// Number of parameter blocks in the Schur elimination group.
    pub fn num_eliminate_blocks(&self) -> usize {
        self.eliminated_block_sizes.len()
    }

    /// Number of Jacobian columns eliminated by a Schur solver.
    pub fn num_eliminate_cols(&self) -> usize {
        self.eliminated_block_sizes.iter().sum()
    }
}

/// Result of one linear solve.
#[derive(Debug, Clone)]
pub struct LinearSolverSummary {
    pub step: DVector<f64>,
    /// Iterations used by iterative solvers, 1 for direct factorizations
    pub num_iterations: usize,
    pub solver_type: LinearSolverType,
}

/// A solver for the damped normal equations `(JᵀJ + λI) δ = -Jᵀr`.
pub trait LinearSolver: Send {
    fn solver_type(&self) -> LinearSolverType;

    /// # Errors
    /// Returns `LinAlgError` if shapes disagree, the factorization fails, or the system is
    /// singular.
    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary>;
}

/// Instantiate the solver for `options.solver_type`, solving on `options.num_threads`
/// worker threads.
///
/// # Errors
/// `LinAlgError::UnsupportedSolver` for sparse direct families when the `sparse` feature is
/// disabled, `LinAlgError::ThreadPool` if the workers cannot be started.
pub fn create_linear_solver(options: &LinearSolverOptions) -> LinAlgResult<Box<dyn LinearSolver>> {
    let pool = WorkerPool::new(options.num_threads).map_err(|e| {
        LinAlgError::ThreadPool(format!("cannot start {} solver threads", options.num_threads))
            .log_with_source(e)
    })?;
    create_linear_solver_with_pool(options, pool)
}

/// Like [`create_linear_solver`], but solves on an existing pool.
pub fn create_linear_solver_with_pool(
    options: &LinearSolverOptions,
    pool: WorkerPool,
) -> LinAlgResult<Box<dyn LinearSolver>> {
    let inner: Box<dyn LinearSolver> = match options.solver_type {
        LinearSolverType::DenseQr => Box::new(DenseQrSolver::new()),
        LinearSolverType::DenseNormalCholesky => Box::new(DenseNormalCholeskySolver::new()),
        LinearSolverType::DenseSchur => Box::new(SchurComplementSolver::new(
            SchurBackend::Dense,
            options.clone(),
        )),
        LinearSolverType::IterativeSchur => Box::new(SchurComplementSolver::new(
            SchurBackend::Iterative,
            options.clone(),
        )),
        LinearSolverType::Cgnr => Box::new(CgnrSolver::new(
            options.min_num_iterations,
            options.max_num_iterations,
        )),
        #[cfg(feature = "sparse")]
        LinearSolverType::SparseNormalCholesky => Box::new(SparseNormalCholeskySolver::new()),
        #[cfg(feature = "sparse")]
        LinearSolverType::SparseSchur => Box::new(SchurComplementSolver::new(
            SchurBackend::Sparse,
            options.clone(),
        )),
        #[cfg(not(feature = "sparse"))]
        LinearSolverType::SparseNormalCholesky | LinearSolverType::SparseSchur => {
            return Err(LinAlgError::UnsupportedSolver(format!(
                "{} requires the `sparse` feature",
                options.solver_type
            ))
            .log());
        }
    };
    Ok(Box::new(PooledSolver { inner, pool }))
}

/// Runs every solve of `inner` on `pool`, which also bounds faer's internal parallelism.
struct PooledSolver {
    inner: Box<dyn LinearSolver>,
    pool: WorkerPool,
}

impl LinearSolver for PooledSolver {
    fn solver_type(&self) -> LinearSolverType {
        self.inner.solver_type()
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        let Self { inner, pool } = self;
        pool.install(|| inner.solve(jacobian, residuals, lambda))
    }
}

/// Check that `residuals` matches the row count of `jacobian`.
pub(crate) fn check_system_shape(
    jacobian: &JacobianMatrix,
    residuals: &DVector<f64>,
) -> LinAlgResult<()> {
    if residuals.len() != jacobian.nrows() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "Jacobian has {} rows but {} residuals were given",
            jacobian.nrows(),
            residuals.len()
        ))
        .log());
    }
    Ok(())
}

/// Reject steps containing NaN or infinity.
pub(crate) fn check_step(step: &DVector<f64>) -> LinAlgResult<()> {
    if step.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(LinAlgError::NumericalInstability("non-finite entry in step".to_string()).log())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    pub(crate) fn sample_jacobian() -> DMatrix<f64> {
        dmatrix![
            2.0, 1.0, 0.0;
            1.0, 3.0, 1.0;
            0.0, 1.0, 2.0;
            1.5, 0.0, 0.5
        ]
    }

    #[test]
    fn test_schur_classification() {
        let schur: Vec<_> = LinearSolverType::ALL
            .iter()
            .filter(|t| t.is_schur())
            .collect();
        assert_eq!(schur.len(), 3);
        for t in LinearSolverType::ALL {
            assert!(!t.schur_fallback().is_schur());
            if !t.is_schur() {
                assert_eq!(t.schur_fallback(), t);
            }
        }
        assert_eq!(
            LinearSolverType::DenseSchur.schur_fallback(),
            LinearSolverType::DenseQr
        );
    }

    #[test]
    fn test_sparse_and_dense_products_agree() -> TestResult {
        let dense = JacobianMatrix::Dense(sample_jacobian());
        let sparse = JacobianMatrix::Sparse(dense.to_sparse()?);

        let x = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let y = DVector::from_vec(vec![0.5, 1.0, -1.0, 2.0]);
        assert!((dense.apply(&x)? - sparse.apply(&x)?).norm() < 1e-12);
        assert!((dense.apply_transpose(&y)? - sparse.apply_transpose(&y)?).norm() < 1e-12);
        let normal_gap = dense.damped_normal_matrix(0.3) - sparse.damped_normal_matrix(0.3);
        assert!(normal_gap.norm() < 1e-12);
        assert!((sparse.to_dense() - sample_jacobian()).norm() < 1e-12);
        assert_eq!(sparse.num_nonzeros(), 9);
        Ok(())
    }

    #[test]
    fn test_apply_rejects_wrong_length() {
        let dense = JacobianMatrix::Dense(sample_jacobian());
        assert!(matches!(
            dense.apply(&DVector::zeros(2)),
            Err(LinAlgError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_factory_builds_requested_type() -> TestResult {
        for solver_type in LinearSolverType::ALL {
            #[cfg(not(feature = "sparse"))]
            if solver_type.requires_sparse_backend() {
                continue;
            }
            let options = LinearSolverOptions {
                solver_type,
                ..Default::default()
            };
            let solver = create_linear_solver(&options)?;
            assert_eq!(solver.solver_type(), solver_type);
        }
        Ok(())
    }

    #[test]
    fn test_solvers_share_a_pool() -> TestResult {
        let pool = WorkerPool::new(1)?;
        let jacobian = JacobianMatrix::Dense(sample_jacobian());
        let residuals = DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0]);

        let mut qr = create_linear_solver_with_pool(&LinearSolverOptions::default(), pool.clone())?;
        let cgnr_options = LinearSolverOptions {
            solver_type: LinearSolverType::Cgnr,
            ..Default::default()
        };
        let mut cgnr = create_linear_solver_with_pool(&cgnr_options, pool)?;

        let direct = qr.solve(&jacobian, &residuals, 1e-2)?;
        let iterative = cgnr.solve(&jacobian, &residuals, 1e-2)?;
        assert_eq!(direct.solver_type, LinearSolverType::DenseQr);
        for i in 0..3 {
            assert!((direct.step[i] - iterative.step[i]).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_zero_solver_threads_rejected() {
        let options = LinearSolverOptions {
            num_threads: 0,
            ..Default::default()
        };
        assert!(matches!(create_linear_solver(&options), Err(LinAlgError::ThreadPool(_))));
    }
}
