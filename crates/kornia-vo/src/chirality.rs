use crate::error::{check_same_len, VoError};
use crate::essential::{CandidateKind, MotionCandidate};
use crate::triangulation::{triangulate_iterative, ProjectionMatrix, TriangulationParams};
use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Which cameras a triangulated point must lie in front of to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthTest {
    /// Positive depth in the reference camera `[I|0]` only.
    FirstCamera,
    /// Positive depth in both cameras.
    #[default]
    BothCameras,
}

/// Parameters of the candidate resolver.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChiralityParams {
    /// Positive-depth criterion.
    pub depth_test: DepthTest,
    /// Triangulation settings used while scoring.
    pub triangulation: TriangulationParams,
}

/// Score of one motion hypothesis.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    /// The scored hypothesis.
    pub candidate: MotionCandidate,
    /// Number of points passing the depth test.
    pub positive_depth: usize,
    /// One triangulated point per correspondence, in the first camera frame.
    ///
    /// Correspondences that could not be triangulated hold `None`.
    pub points: Vec<Option<DVec3>>,
    /// Mean number of reweighting iterations.
    pub mean_iterations: f64,
    /// Mean reprojection residual over triangulated points.
    pub mean_residual: f64,
}

impl CandidateScore {
    /// Kind of the scored hypothesis.
    pub fn kind(&self) -> CandidateKind {
        self.candidate.kind
    }
}

/// Triangulate every correspondence under one hypothesis and count points in front of the cameras.
///
/// `previous` and `current` are normalized image coordinates. The previous camera
/// is `[I|0]`, the current one `[R|t]` of the candidate.
pub fn score_candidate(
    candidate: &MotionCandidate,
    previous: &[DVec2],
    current: &[DVec2],
    params: &ChiralityParams,
) -> CandidateScore {
    let p1 = ProjectionMatrix::identity();
    let p2 = ProjectionMatrix::from_motion(&candidate.rotation, &candidate.translation);

    let mut positive_depth = 0;
    let mut total_iterations = 0;
    let mut total_residual = 0.0;
    let mut triangulated = 0;
    let mut points = Vec::with_capacity(previous.len());

    for (u1, u2) in previous.iter().zip(current.iter()) {
        let Some(tri) = triangulate_iterative(*u1, &p1, *u2, &p2, &params.triangulation) else {
            points.push(None);
            continue;
        };
        triangulated += 1;
        total_iterations += tri.iterations;
        if tri.residual.is_finite() {
            total_residual += tri.residual;
        }

        let in_front = match params.depth_test {
            DepthTest::FirstCamera => p1.depth(tri.point) > 0.0,
            DepthTest::BothCameras => p1.depth(tri.point) > 0.0 && p2.depth(tri.point) > 0.0,
        };
        if in_front {
            positive_depth += 1;
        }
        points.push(Some(tri.point));
    }

    let (mean_iterations, mean_residual) = if triangulated > 0 {
        (
            total_iterations as f64 / triangulated as f64,
            total_residual / triangulated as f64,
        )
    } else {
        (0.0, f64::INFINITY)
    };

    CandidateScore {
        candidate: *candidate,
        positive_depth,
        points,
        mean_iterations,
        mean_residual,
    }
}

/// Select the physically valid hypothesis.
///
/// Every candidate is scored with [`score_candidate`]; the one with the most
/// points in front of the cameras wins, ties going to the first one seen.
pub fn resolve_candidates(
    candidates: &[MotionCandidate],
    previous: &[DVec2],
    current: &[DVec2],
    params: &ChiralityParams,
) -> Result<CandidateScore, VoError> {
    check_same_len("previous", previous.len(), "current", current.len())?;
    if previous.is_empty() {
        return Err(VoError::DegenerateInput("no correspondences to triangulate"));
    }

    let mut best: Option<CandidateScore> = None;
    for candidate in candidates {
        let score = score_candidate(candidate, previous, current, params);
        log::debug!(
            "candidate {:?}: {}/{} points in front",
            score.kind(),
            score.positive_depth,
            previous.len()
        );
        let better = match &best {
            Some(b) => score.positive_depth > b.positive_depth,
            None => true,
        };
        if better {
            best = Some(score);
        }
    }

    match best {
        Some(b) if b.positive_depth > 0 => Ok(b),
        _ => Err(VoError::EstimationFailure(
            "no motion candidate places points in front of the camera",
        )),
    }
}
