//! Preprocessing benchmark over synthetic bundle adjustment scenes.
//!
//! For every scene and linear solver family this measures:
//!
//! - **Preprocess**: validation, reduction, ordering and assembly (`preprocess`)
//! - **Evaluate**: one residual and Jacobian evaluation in the solver's layout
//! - **Solve**: one damped step with the selected linear solver
//!
//! Each configuration runs 5 times and timings are averaged. Scene construction is excluded.
//! The first camera is held constant to remove the gauge freedom.

use std::hint::black_box;
use std::time::Instant;
use tracing::{info, warn};

use apex_preprocessor::core::problem::Problem;
use apex_preprocessor::init_logger;
use apex_preprocessor::io::BalProblem;
use apex_preprocessor::linalg::LinearSolverType;
use apex_preprocessor::preprocessor::{SolverOptions, preprocess};

const NUM_RUNS: usize = 5;
const LAMBDA: f64 = 1e-4;

struct Scene {
    name: &'static str,
    cameras: usize,
    points: usize,
    observations_per_point: usize,
}

const SCENES: &[Scene] = &[
    Scene {
        name: "small",
        cameras: 8,
        points: 100,
        observations_per_point: 3,
    },
    Scene {
        name: "medium",
        cameras: 16,
        points: 300,
        observations_per_point: 4,
    },
    Scene {
        name: "large",
        cameras: 24,
        points: 600,
        observations_per_point: 4,
    },
];

struct BenchmarkResult {
    scene: &'static str,
    solver: LinearSolverType,
    effective: LinearSolverType,
    preprocess_ms: f64,
    evaluate_ms: f64,
    solve_ms: f64,
}

fn build_scene(scene: &Scene) -> Result<Problem, Box<dyn std::error::Error>> {
    let bal = BalProblem::synthetic(scene.cameras, scene.points, scene.observations_per_point);
    let (mut problem, blocks) = bal.build_problem()?;
    if let Some(&camera) = blocks.cameras.first() {
        problem.set_parameter_block_constant(camera)?;
    }
    Ok(problem)
}

fn run_once(
    problem: &Problem,
    solver: LinearSolverType,
) -> Result<(LinearSolverType, f64, f64, f64), Box<dyn std::error::Error>> {
    let options = SolverOptions::new().with_linear_solver_type(solver);

    let start = Instant::now();
    let mut preprocessed = black_box(preprocess(&options, problem)?);
    let preprocess_ms = start.elapsed().as_secs_f64() * 1e3;

    let effective = preprocessed.options.linear_solver_type;
    let (Some(evaluator), Some(linear_solver)) =
        (preprocessed.evaluator.as_ref(), preprocessed.linear_solver.as_mut())
    else {
        return Ok((effective, preprocess_ms, 0.0, 0.0));
    };

    let state = evaluator.initial_state();
    let start = Instant::now();
    let evaluation = black_box(evaluator.evaluate(&state, true)?);
    let evaluate_ms = start.elapsed().as_secs_f64() * 1e3;

    let jacobian = evaluation.jacobian.as_ref().ok_or("evaluation returned no Jacobian")?;
    let start = Instant::now();
    black_box(linear_solver.solve(jacobian, &evaluation.residuals, LAMBDA)?);
    let solve_ms = start.elapsed().as_secs_f64() * 1e3;

    Ok((effective, preprocess_ms, evaluate_ms, solve_ms))
}

fn run_benchmark(
    scene: &Scene,
    problem: &Problem,
    solver: LinearSolverType,
) -> Option<BenchmarkResult> {
    let mut totals = (0.0, 0.0, 0.0);
    let mut effective = solver;
    for _ in 0..NUM_RUNS {
        match run_once(problem, solver) {
            Ok((used, preprocess_ms, evaluate_ms, solve_ms)) => {
                effective = used;
                totals.0 += preprocess_ms;
                totals.1 += evaluate_ms;
                totals.2 += solve_ms;
            }
            Err(e) => {
                warn!("{} on {} failed: {}", solver, scene.name, e);
                return None;
            }
        }
    }
    let runs = NUM_RUNS as f64;
    Some(BenchmarkResult {
        scene: scene.name,
        solver,
        effective,
        preprocess_ms: totals.0 / runs,
        evaluate_ms: totals.1 / runs,
        solve_ms: totals.2 / runs,
    })
}

fn main() {
    init_logger();

    info!("Starting preprocessing benchmark...");
    info!("Running each configuration {} times and averaging results...", NUM_RUNS);

    let mut all_results = Vec::new();
    for scene in SCENES {
        let problem = match build_scene(scene) {
            Ok(problem) => problem,
            Err(e) => {
                warn!("Failed to build scene {}: {}", scene.name, e);
                continue;
            }
        };
        info!(
            "Scene: {} ({} parameter blocks, {} residual blocks)",
            scene.name,
            problem.num_parameter_blocks(),
            problem.num_residual_blocks()
        );

        for solver in LinearSolverType::ALL {
            if let Some(result) = run_benchmark(scene, &problem, solver) {
                info!(
                    "{} done (preprocess: {:.2} ms, solve: {:.2} ms)",
                    solver, result.preprocess_ms, result.solve_ms
                );
                all_results.push(result);
            }
        }
    }

    info!("{}", "=".repeat(110));
    info!(
        "{:<8} | {:<22} | {:<22} | {:>14} | {:>12} | {:>10}",
        "Scene", "Requested", "Effective", "Preprocess(ms)", "Evaluate(ms)", "Solve(ms)"
    );
    info!("{}", "-".repeat(110));
    for result in &all_results {
        info!(
            "{:<8} | {:<22} | {:<22} | {:>14.3} | {:>12.3} | {:>10.3}",
            result.scene,
            result.solver.to_string(),
            result.effective.to_string(),
            result.preprocess_ms,
            result.evaluate_ms,
            result.solve_ms
        );
    }
    info!("{}", "=".repeat(110));
}
