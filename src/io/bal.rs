//! BAL file loader.
//!
//! Layout of a BAL file, all values whitespace separated:
//!
//! ```text
//! <num_cameras> <num_points> <num_observations>
//! <camera_index> <point_index> <x> <y>        (num_observations times)
//! <camera parameters>                         (9 values per camera)
//! <point coordinates>                         (3 values per point)
//! ```

use std::{fs::File, path::Path, str::SplitWhitespace};

use nalgebra::DVector;
use tracing::info;

use crate::core::problem::{ParameterBlockId, Problem};
use crate::factors::reprojection_factor::{CAMERA_SIZE, POINT_SIZE, SnavelyReprojectionFactor};
use crate::io::IoError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalObservation {
    pub camera: usize,
    pub point: usize,
    pub x: f64,
    pub y: f64,
}

/// Cameras, points and observations of a bundle adjustment problem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalProblem {
    pub cameras: Vec<[f64; CAMERA_SIZE]>,
    pub points: Vec<[f64; POINT_SIZE]>,
    pub observations: Vec<BalObservation>,
}

/// Parameter block ids of a problem built from a [`BalProblem`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalBlocks {
    pub cameras: Vec<ParameterBlockId>,
    pub points: Vec<ParameterBlockId>,
}

impl BalProblem {
    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    /// Build a [`Problem`] with one 9-dimensional block per camera, one 3-dimensional block
    /// per point and one reprojection residual per observation.
    pub fn build_problem(&self) -> Result<(Problem, BalBlocks), IoError> {
        let mut problem = Problem::new();
        let cameras: Vec<ParameterBlockId> = self
            .cameras
            .iter()
            .map(|c| problem.add_parameter_block(DVector::from_column_slice(c)))
            .collect();
        let points: Vec<ParameterBlockId> = self
            .points
            .iter()
            .map(|p| problem.add_parameter_block(DVector::from_column_slice(p)))
            .collect();

        for observation in &self.observations {
            let (Some(&camera), Some(&point)) =
                (cameras.get(observation.camera), points.get(observation.point))
            else {
                return Err(IoError::ProblemConstruction(format!(
                    "observation references camera {} / point {} outside the scene",
                    observation.camera, observation.point
                ))
                .log());
            };
            problem
                .add_residual_block(
                    &[camera, point],
                    Box::new(SnavelyReprojectionFactor::new(observation.x, observation.y)),
                )
                .map_err(|e| IoError::ProblemConstruction(e.to_string()).log_with_source(e))?;
        }

        Ok((problem, BalBlocks { cameras, points }))
    }

    /// A deterministic scene of `num_cameras` cameras on a line observing a grid of points.
    ///
    /// Every point is seen by `observations_per_point` consecutive cameras (wrapping
    /// around). Cameras carry no rotation or distortion, so the observations are exact
    /// projections shifted by a small deterministic perturbation.
    pub fn synthetic(num_cameras: usize, num_points: usize, observations_per_point: usize) -> Self {
        let focal = 500.0;
        let cameras: Vec<[f64; CAMERA_SIZE]> = (0..num_cameras)
            .map(|i| {
                let tx = i as f64 * 0.5 - num_cameras as f64 * 0.25;
                [0.0, 0.0, 0.0, tx, 0.0, -10.0, focal, 0.0, 0.0]
            })
            .collect();

        let side = (num_points as f64).sqrt().ceil().max(1.0) as usize;
        let points: Vec<[f64; POINT_SIZE]> = (0..num_points)
            .map(|j| {
                let u = (j % side) as f64 / side as f64 - 0.5;
                let v = (j / side) as f64 / side as f64 - 0.5;
                [u * 4.0, v * 4.0, (j % 7) as f64 * 0.1]
            })
            .collect();

        let mut observations = Vec::new();
        if num_cameras > 0 {
            for (j, point) in points.iter().enumerate() {
                for k in 0..observations_per_point.min(num_cameras) {
                    let i = (j + k) % num_cameras;
                    let camera = &cameras[i];
                    let px = point[0] + camera[3];
                    let py = point[1] + camera[4];
                    let pz = point[2] + camera[5];
                    let noise = ((i * 31 + j * 17) % 11) as f64 * 0.05 - 0.25;
                    observations.push(BalObservation {
                        camera: i,
                        point: j,
                        x: -focal * px / pz + noise,
                        y: -focal * py / pz - noise,
                    });
                }
            }
        }

        Self {
            cameras,
            points,
            observations,
        }
    }
}

/// Memory-mapped BAL reader.
pub struct BalLoader;

impl BalLoader {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<BalProblem, IoError> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to open BAL file: {:?}", path_ref))
        })?;
        // SAFETY: the map is read-only and dropped before this function returns
        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| {
                IoError::Io(e)
                    .log_with_source(format!("Failed to memory-map BAL file: {:?}", path_ref))
            })?
        };
        let content = std::str::from_utf8(&mmap).map_err(|e| {
            IoError::Parse {
                line: 0,
                message: format!("Invalid UTF-8: {e}"),
            }
            .log()
        })?;

        let problem = Self::parse_content(content)?;
        info!(
            "Loaded BAL file {:?}: {} cameras, {} points, {} observations",
            path_ref,
            problem.num_cameras(),
            problem.num_points(),
            problem.num_observations()
        );
        Ok(problem)
    }

    pub fn parse_content(content: &str) -> Result<BalProblem, IoError> {
        let mut tokens = Tokens::new(content);

        let num_cameras = tokens.next_usize("number of cameras")?;
        let num_points = tokens.next_usize("number of points")?;
        let num_observations = tokens.next_usize("number of observations")?;

        let mut observations = Vec::with_capacity(num_observations.min(content.len()));
        for _ in 0..num_observations {
            let camera = tokens.next_usize("camera index")?;
            let point = tokens.next_usize("point index")?;
            let line = tokens.line;
            if camera >= num_cameras {
                return Err(IoError::IndexOutOfRange {
                    line,
                    kind: "camera",
                    index: camera,
                    count: num_cameras,
                }
                .log());
            }
            if point >= num_points {
                return Err(IoError::IndexOutOfRange {
                    line,
                    kind: "point",
                    index: point,
                    count: num_points,
                }
                .log());
            }
            let x = tokens.next_f64("observation x")?;
            let y = tokens.next_f64("observation y")?;
            observations.push(BalObservation { camera, point, x, y });
        }

        let mut cameras = Vec::with_capacity(num_cameras.min(content.len()));
        for _ in 0..num_cameras {
            let mut camera = [0.0; CAMERA_SIZE];
            for value in &mut camera {
                *value = tokens.next_f64("camera parameter")?;
            }
            cameras.push(camera);
        }

        let mut points = Vec::with_capacity(num_points.min(content.len()));
        for _ in 0..num_points {
            let mut point = [0.0; POINT_SIZE];
            for value in &mut point {
                *value = tokens.next_f64("point coordinate")?;
            }
            points.push(point);
        }

        Ok(BalProblem {
            cameras,
            points,
            observations,
        })
    }
}

/// Whitespace tokenizer that remembers the 1-based line of the last token.
struct Tokens<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    current: Option<SplitWhitespace<'a>>,
    line: usize,
}

impl<'a> Tokens<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().enumerate(),
            current: None,
            line: 0,
        }
    }

    fn next_token(&mut self, expected: &str) -> Result<&'a str, IoError> {
        loop {
            if let Some(token) = self.current.as_mut().and_then(Iterator::next) {
                return Ok(token);
            }
            let Some((index, line)) = self.lines.next() else {
                return Err(IoError::UnexpectedEof {
                    expected: expected.to_string(),
                }
                .log());
            };
            self.line = index + 1;
            self.current = Some(line.split_whitespace());
        }
    }

    fn next_usize(&mut self, expected: &str) -> Result<usize, IoError> {
        let token = self.next_token(expected)?;
        token.parse::<usize>().map_err(|e| {
            IoError::InvalidNumber {
                line: self.line,
                value: token.to_string(),
            }
            .log_with_source(e)
        })
    }

    fn next_f64(&mut self, expected: &str) -> Result<f64, IoError> {
        let token = self.next_token(expected)?;
        token.parse::<f64>().map_err(|e| {
            IoError::InvalidNumber {
                line: self.line,
                value: token.to_string(),
            }
            .log_with_source(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const SMALL_BAL: &str = "2 1 2
0 0 -1.5 2.0
1 0 3.25 -0.5
0.01 0.02 0.03 0.1 0.2 -5.0 400.0 0.0 0.0
0.0 0.0 0.0 -0.1 0.0 -6.0 420.0 1e-3 -2e-4
0.5 -0.25 1.0
";

    #[test]
    fn test_parse_small_file() -> TestResult {
        let bal = BalLoader::parse_content(SMALL_BAL)?;
        assert_eq!(bal.num_cameras(), 2);
        assert_eq!(bal.num_points(), 1);
        assert_eq!(bal.num_observations(), 2);
        assert_eq!(
            bal.observations[1],
            BalObservation {
                camera: 1,
                point: 0,
                x: 3.25,
                y: -0.5
            }
        );
        assert_eq!(bal.cameras[1][6], 420.0);
        assert_eq!(bal.points[0], [0.5, -0.25, 1.0]);
        Ok(())
    }

    #[test]
    fn test_build_problem() -> TestResult {
        let bal = BalLoader::parse_content(SMALL_BAL)?;
        let (problem, blocks) = bal.build_problem()?;
        assert_eq!(problem.num_parameter_blocks(), 3);
        assert_eq!(problem.num_residual_blocks(), 2);
        assert_eq!(problem.num_parameters(), 2 * CAMERA_SIZE + POINT_SIZE);
        assert_eq!(problem.residual_blocks_for(blocks.points[0]).len(), 2);
        Ok(())
    }

    #[test]
    fn test_truncated_file() {
        let truncated = &SMALL_BAL[..SMALL_BAL.len() - 6];
        assert!(matches!(
            BalLoader::parse_content(truncated),
            Err(IoError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_invalid_number_reports_line() {
        let content = "1 1 1\n0 0 abc 1.0\n";
        assert!(matches!(
            BalLoader::parse_content(content),
            Err(IoError::InvalidNumber { line: 2, .. })
        ));
    }

    #[test]
    fn test_observation_index_out_of_range() {
        let content = "1 1 1\n0 3 1.0 1.0\n";
        assert!(matches!(
            BalLoader::parse_content(content),
            Err(IoError::IndexOutOfRange { kind: "point", index: 3, .. })
        ));
    }

    #[test]
    fn test_synthetic_scene() -> TestResult {
        let bal = BalProblem::synthetic(4, 10, 3);
        assert_eq!(bal.num_cameras(), 4);
        assert_eq!(bal.num_points(), 10);
        assert_eq!(bal.num_observations(), 30);

        let (problem, _) = bal.build_problem()?;
        for (_, residual) in problem.residual_blocks() {
            let values = problem.gather_values(residual);
            let r = residual.evaluate_residual(&values)?;
            assert!(r.norm() < 1.0);
        }
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("apex_preprocessor_missing_file.bal");
        assert!(matches!(BalLoader::load(path), Err(IoError::Io(_))));
    }
}
