//! Conjugate gradients.
//!
//! [`preconditioned_conjugate_gradient`] is matrix free: it only needs a closure applying a
//! symmetric positive definite operator. `CgnrSolver` uses it on the normal equations
//! `(JᵀJ + λI) δ = -Jᵀr` without forming `JᵀJ`; the iterative Schur solver uses it on the
//! reduced camera system.

use nalgebra::DVector;
use tracing::debug;

use crate::linalg::{
    DEFAULT_CG_TOLERANCE, JacobianMatrix, LinAlgError, LinAlgResult, LinearSolver,
    LinearSolverSummary, LinearSolverType, check_step, check_system_shape,
};

/// Outcome of a conjugate-gradient run.
#[derive(Debug, Clone)]
pub struct ConjugateGradientOutcome {
    pub solution: DVector<f64>,
    pub num_iterations: usize,
    pub converged: bool,
}

/// Solve `A x = b` for SPD `A` with a Jacobi (diagonal) preconditioner.
///
/// `inverse_diagonal` holds `1 / A_ii` (or 1 where the diagonal vanishes). Iteration stops
/// once `||b - A x|| <= tolerance * ||b||` and at least `min_iterations` have run, or after
/// `max_iterations`. Running out of iterations is not an error; the last iterate is returned
/// with `converged == false`.
pub fn preconditioned_conjugate_gradient<F>(
    apply: F,
    rhs: &DVector<f64>,
    inverse_diagonal: &DVector<f64>,
    min_iterations: usize,
    max_iterations: usize,
    tolerance: f64,
) -> LinAlgResult<ConjugateGradientOutcome>
where
    F: Fn(&DVector<f64>) -> LinAlgResult<DVector<f64>>,
{
    let n = rhs.len();
    let mut x = DVector::zeros(n);
    let rhs_norm = rhs.norm();
    if rhs_norm == 0.0 {
        return Ok(ConjugateGradientOutcome {
            solution: x,
            num_iterations: 0,
            converged: true,
        });
    }

    let mut r = rhs.clone();
    let mut z = r.component_mul(inverse_diagonal);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    for iteration in 1..=max_iterations {
        let ap = apply(&p)?;
        let pap = p.dot(&ap);
        if !pap.is_finite() || pap <= 0.0 {
            return Err(LinAlgError::NumericalInstability(format!(
                "operator is not positive definite (pᵀAp = {pap:.3e}) at iteration {iteration}"
            ))
            .log());
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);

        // An exact solution ends the run regardless of the minimum iteration count
        let residual_norm = r.norm();
        let converged = iteration >= min_iterations && residual_norm <= tolerance * rhs_norm;
        if residual_norm == 0.0 || converged {
            return Ok(ConjugateGradientOutcome {
                solution: x,
                num_iterations: iteration,
                converged: true,
            });
        }

        z = r.component_mul(inverse_diagonal);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p = &z + &p * beta;
    }

    debug!(
        "Conjugate gradients stopped after {} iterations (relative residual {:.3e})",
        max_iterations,
        r.norm() / rhs_norm
    );
    Ok(ConjugateGradientOutcome {
        solution: x,
        num_iterations: max_iterations,
        converged: false,
    })
}

/// Inverse of a diagonal, mapping zeros to 1.
pub(crate) fn jacobi_preconditioner(diagonal: &DVector<f64>) -> DVector<f64> {
    diagonal.map(|d| if d > 0.0 { 1.0 / d } else { 1.0 })
}

/// Conjugate gradients on the normal equations.
#[derive(Debug, Clone)]
pub struct CgnrSolver {
    min_num_iterations: usize,
    max_num_iterations: usize,
    tolerance: f64,
}

impl CgnrSolver {
    pub fn new(min_num_iterations: usize, max_num_iterations: usize) -> Self {
        Self {
            min_num_iterations,
            max_num_iterations,
            tolerance: DEFAULT_CG_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_num_iterations(&self) -> usize {
        self.max_num_iterations
    }
}

impl LinearSolver for CgnrSolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::Cgnr
    }

    fn solve(
        &mut self,
        jacobian: &JacobianMatrix,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> LinAlgResult<LinearSolverSummary> {
        check_system_shape(jacobian, residuals)?;

        let rhs = -jacobian.apply_transpose(residuals)?;
        let diagonal = jacobian.column_squared_norms().add_scalar(lambda);
        let preconditioner = jacobi_preconditioner(&diagonal);

        let outcome = preconditioned_conjugate_gradient(
            |x| {
                let mut y = jacobian.apply_transpose(&jacobian.apply(x)?)?;
                y.axpy(lambda, x, 1.0);
                Ok(y)
            },
            &rhs,
            &preconditioner,
            self.min_num_iterations,
            self.max_num_iterations,
            self.tolerance,
        )?;
        check_step(&outcome.solution)?;

        Ok(LinearSolverSummary {
            step: outcome.solution,
            num_iterations: outcome.num_iterations,
            solver_type: self.solver_type(),
        })
    }
}
