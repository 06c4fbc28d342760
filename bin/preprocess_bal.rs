use std::path::PathBuf;
use std::time::Instant;

use apex_preprocessor::core::problem::Problem;
use apex_preprocessor::error::ApexResult;
use apex_preprocessor::init_logger;
use apex_preprocessor::io::{BalLoader, BalProblem};
use apex_preprocessor::linalg::LinearSolverType;
use apex_preprocessor::preprocessor::{PreprocessedProblem, SolverOptions, preprocess};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "preprocess_bal")]
#[command(about = "Preprocess bundle adjustment problems for trust-region minimization")]
struct Args {
    /// BAL file to load; a synthetic scene is generated when omitted
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Number of cameras of the synthetic scene
    #[arg(long, default_value = "16")]
    cameras: usize,

    /// Number of points of the synthetic scene
    #[arg(long, default_value = "400")]
    points: usize,

    /// Cameras observing each synthetic point
    #[arg(long, default_value = "4")]
    observations_per_point: usize,

    /// Linear solver: "dense_qr", "dense_normal_cholesky", "dense_schur",
    /// "sparse_normal_cholesky", "sparse_schur", "iterative_schur", "cgnr", or "all"
    #[arg(short, long, default_value = "sparse_schur")]
    solver: String,

    /// Build an inner-iteration minimizer and run one sweep
    #[arg(long)]
    inner_iterations: bool,

    /// Hold the first N cameras constant
    #[arg(long, default_value = "1")]
    fix_cameras: usize,

    /// Solve one damped step with the selected solver after preprocessing
    #[arg(long)]
    solve: bool,

    /// Damping for the trial step
    #[arg(long, default_value = "1e-4")]
    lambda: f64,

    /// Worker threads for evaluation and linear algebra
    #[arg(long, default_value = "1")]
    threads: usize,
}

struct RunResult {
    solver: LinearSolverType,
    effective: LinearSolverType,
    eliminated: usize,
    parameters: usize,
    residuals: usize,
    preprocess_ms: f64,
    initial_cost: Option<f64>,
    step_cost: Option<f64>,
}

fn parse_solver(name: &str) -> Result<Vec<LinearSolverType>, String> {
    let solver = match name {
        "all" => return Ok(LinearSolverType::ALL.to_vec()),
        "dense_qr" => LinearSolverType::DenseQr,
        "dense_normal_cholesky" => LinearSolverType::DenseNormalCholesky,
        "dense_schur" => LinearSolverType::DenseSchur,
        "sparse_normal_cholesky" => LinearSolverType::SparseNormalCholesky,
        "sparse_schur" => LinearSolverType::SparseSchur,
        "iterative_schur" => LinearSolverType::IterativeSchur,
        "cgnr" => LinearSolverType::Cgnr,
        other => return Err(format!("Unknown linear solver: {other}")),
    };
    Ok(vec![solver])
}

fn run(problem: &Problem, solver: LinearSolverType, args: &Args) -> ApexResult<RunResult> {
    let options = SolverOptions::new()
        .with_linear_solver_type(solver)
        .with_inner_iterations(args.inner_iterations)
        .with_num_threads(args.threads);

    let mut preprocessed = preprocess(&options, problem)?;
    for line in preprocessed.to_string().lines() {
        info!("{}", line);
    }

    let (initial_cost, step_cost) = if args.solve {
        trial_step(&mut preprocessed, args.lambda)?
    } else {
        (None, None)
    };

    Ok(RunResult {
        solver,
        effective: preprocessed.options.linear_solver_type,
        eliminated: preprocessed.linear_solver_options.num_eliminate_blocks(),
        parameters: preprocessed
            .evaluator
            .as_ref()
            .map_or(0, |evaluator| evaluator.num_parameters()),
        residuals: preprocessed
            .evaluator
            .as_ref()
            .map_or(0, |evaluator| evaluator.num_residuals()),
        preprocess_ms: preprocessed.preprocessor_time.as_secs_f64() * 1e3,
        initial_cost,
        step_cost,
    })
}

/// One damped step followed by an optional inner-iteration sweep.
fn trial_step(
    preprocessed: &mut PreprocessedProblem<'_>,
    lambda: f64,
) -> ApexResult<(Option<f64>, Option<f64>)> {
    let (Some(evaluator), Some(linear_solver)) =
        (preprocessed.evaluator.as_ref(), preprocessed.linear_solver.as_mut())
    else {
        info!("Nothing to solve");
        return Ok((None, None));
    };

    let state = evaluator.initial_state();
    let evaluation = evaluator.evaluate(&state, true)?;
    let Some(jacobian) = evaluation.jacobian.as_ref() else {
        return Ok((Some(evaluation.cost), None));
    };

    let start = Instant::now();
    let summary = linear_solver.solve(jacobian, &evaluation.residuals, lambda)?;
    let mut next = evaluator.plus(&state, &summary.step)?;
    evaluator.project_to_bounds(&mut next)?;
    let step_cost = evaluator.evaluate(&next, false)?.cost;
    info!(
        "Step: |dx| = {:.6e}, {} iterations, {:.2} ms, cost {:.6e} -> {:.6e}",
        summary.step.norm(),
        summary.num_iterations,
        start.elapsed().as_secs_f64() * 1e3,
        evaluation.cost,
        step_cost
    );

    if let Some(minimizer) = &preprocessed.inner_iteration_minimizer {
        let sweep = minimizer.minimize(evaluator, &mut next)?;
        info!(
            "Inner iterations: cost {:.6e} -> {:.6e} ({} blocks updated, {} rejected)",
            sweep.initial_cost,
            sweep.final_cost,
            sweep.num_blocks_updated,
            sweep.num_blocks_rejected
        );
        return Ok((Some(evaluation.cost), Some(sweep.final_cost)));
    }
    Ok((Some(evaluation.cost), Some(step_cost)))
}

fn format_summary_table(results: &[RunResult]) {
    info!("Final summary table:");
    info!(
        "{:<22} | {:<22} | {:<10} | {:<8} | {:<9} | {:<12} | {:<12} | {:<10}",
        "Requested",
        "Effective",
        "Eliminated",
        "Params",
        "Residuals",
        "Init Cost",
        "Step Cost",
        "Time(ms)"
    );
    info!("{}", "-".repeat(124));
    for result in results {
        let format_cost = |cost: Option<f64>| cost.map_or("-".to_string(), |c| format!("{c:.6e}"));
        info!(
            "{:<22} | {:<22} | {:<10} | {:<8} | {:<9} | {:<12} | {:<12} | {:<10.3}",
            result.solver.to_string(),
            result.effective.to_string(),
            result.eliminated,
            result.parameters,
            result.residuals,
            format_cost(result.initial_cost),
            format_cost(result.step_cost),
            result.preprocess_ms
        );
    }
    info!("{}", "-".repeat(124));
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger();

    info!("APEX-PREPROCESSOR BUNDLE ADJUSTMENT\n");

    let bal = match &args.file {
        Some(path) => BalLoader::load(path)?,
        None => {
            info!(
                "Generating synthetic scene: {} cameras, {} points, {} observations per point",
                args.cameras, args.points, args.observations_per_point
            );
            BalProblem::synthetic(args.cameras, args.points, args.observations_per_point)
        }
    };
    let (mut problem, blocks) = bal.build_problem()?;
    for &camera in blocks.cameras.iter().take(args.fix_cameras) {
        problem.set_parameter_block_constant(camera)?;
    }
    info!(
        "Problem: {} parameter blocks ({} parameters), {} residual blocks ({} residuals)",
        problem.num_parameter_blocks(),
        problem.num_parameters(),
        problem.num_residual_blocks(),
        problem.num_residuals()
    );

    let solvers = parse_solver(&args.solver)?;
    let mut results = Vec::new();
    let mut failures = 0;
    for &solver in &solvers {
        info!("--- {} ---", solver);
        match run(&problem, solver, &args) {
            Ok(result) => results.push(result),
            Err(e) => {
                failures += 1;
                error!("{} failed", solver);
                error!("Full error chain:\n{}", e.chain());
            }
        }
    }

    if results.len() > 1 {
        format_summary_table(&results);
    }

    if failures == 0 {
        Ok(())
    } else {
        Err(format!("{failures}/{} solver configurations failed", solvers.len()).into())
    }
}
