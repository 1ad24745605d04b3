use crate::error::{check_same_len, VoError};
use crate::linalg::{null_vector, svd3};
use crate::normalize::normalize_correspondences;
use crate::source::Correspondence;
use glam::{DMat3, DVec2, DVec3};
use rand::prelude::*;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Minimal sample size of the 8-point solver.
pub const MIN_CORRESPONDENCES: usize = 8;

/// Parameters for RANSAC fundamental matrix estimation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier tolerance as a fraction of the largest normalized coordinate.
    pub threshold_fraction: f64,
    /// Desired probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    /// Minimum number of inliers required for acceptance.
    pub min_inliers: usize,
    /// Optional RNG seed for deterministic runs.
    pub random_seed: Option<u64>,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold_fraction: 0.006,
            confidence: 0.99,
            min_inliers: MIN_CORRESPONDENCES,
            random_seed: Some(0),
        }
    }
}

/// Result of a RANSAC model fit.
#[derive(Clone, Debug)]
pub struct RansacResult<M> {
    /// Estimated model.
    pub model: M,
    /// Per-point inlier mask.
    pub inliers: Vec<bool>,
    /// Total inlier count.
    pub inlier_count: usize,
    /// Sum of inlier errors (lower is better).
    pub score: f64,
    /// Number of hypotheses evaluated.
    pub iterations: usize,
}

/// Output of the robust fundamental estimator, with outliers pruned.
#[derive(Clone, Debug)]
pub struct FundamentalEstimate {
    /// Fundamental matrix in pixel coordinates, `x_current^T F x_previous = 0`.
    pub fundamental: DMat3,
    /// Inlier mask over the input correspondences.
    pub inlier_mask: Vec<bool>,
    /// Surviving correspondences, in input order.
    pub matches: Vec<Correspondence>,
    /// Previous-frame points of the surviving correspondences.
    pub previous_inliers: Vec<DVec2>,
    /// Current-frame points of the surviving correspondences.
    pub current_inliers: Vec<DVec2>,
    /// Number of correspondences before pruning.
    pub matches_before: usize,
    /// Mean image-plane displacement over the inliers, in pixels.
    pub mean_displacement: f64,
}

/// Estimate the fundamental matrix using the 8-point algorithm.
///
/// - `x1`: points in image 1 (length >= 8)
/// - `x2`: corresponding points in image 2 (same length)
///
/// The points should already be normalized (see [`crate::normalize`]); the
/// returned matrix satisfies `x2^T F x1 = 0` in the coordinates it was given
/// and has rank 2.
pub fn fundamental_8point(x1: &[DVec2], x2: &[DVec2]) -> Result<DMat3, VoError> {
    check_same_len("x1", x1.len(), "x2", x2.len())?;
    if x1.len() < MIN_CORRESPONDENCES {
        return Err(VoError::TooFewCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: x1.len(),
        });
    }

    // Build design matrix A (N x 9) for x2' * F * x1 = 0
    let n = x1.len();
    let mut a = faer::Mat::<f64>::zeros(n, 9);
    for i in 0..n {
        let (x, y) = (x1[i].x, x1[i].y);
        let (xp, yp) = (x2[i].x, x2[i].y);
        let row = [xp * x, xp * y, xp, yp * x, yp * y, yp, x, y, 1.0];
        for (j, v) in row.iter().enumerate() {
            a.write(i, j, *v);
        }
    }

    // Solve Af = 0 via SVD: take last column of V
    let f = null_vector(&a);
    if !f.iter().all(|v| v.is_finite()) {
        return Err(VoError::EstimationFailure("8-point solve produced non-finite values"));
    }
    let f = DMat3::from_cols(
        DVec3::new(f[0], f[3], f[6]),
        DVec3::new(f[1], f[4], f[7]),
        DVec3::new(f[2], f[5], f[8]),
    );

    // Enforce rank-2 constraint on F via SVD(F) and zero smallest singular value
    let svd = svd3(&f);
    let s = DVec3::new(svd.s.x, svd.s.y, 0.0);
    Ok(svd.u * DMat3::from_diagonal(s) * svd.v.transpose())
}

/// Algebraic epipolar residual `x2^T F x1`.
pub fn epipolar_residual(f: &DMat3, x1: &DVec2, x2: &DVec2) -> f64 {
    let x1h = DVec3::new(x1.x, x1.y, 1.0);
    let x2h = DVec3::new(x2.x, x2.y, 1.0);
    x2h.dot(*f * x1h)
}

/// Squared Sampson distance of a correspondence to the epipolar geometry of `f`.
///
/// Returns infinity when the epipolar lines are undefined.
pub fn sampson_distance(f: &DMat3, x1: &DVec2, x2: &DVec2) -> f64 {
    let x1h = DVec3::new(x1.x, x1.y, 1.0);
    let x2h = DVec3::new(x2.x, x2.y, 1.0);
    let fx1 = *f * x1h;
    let ftx2 = f.transpose() * x2h;
    let num = x2h.dot(fx1);
    let den = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
    if den <= f64::EPSILON {
        return f64::INFINITY;
    }
    num * num / den
}

/// Number of RANSAC iterations needed to draw one outlier-free sample with `confidence`.
fn adaptive_iterations(inlier_ratio: f64, confidence: f64, max_iterations: usize) -> usize {
    let outlier_free = inlier_ratio.powi(MIN_CORRESPONDENCES as i32);
    if outlier_free >= 1.0 - f64::EPSILON {
        return 0;
    }
    if outlier_free <= f64::EPSILON {
        return max_iterations;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - outlier_free).ln();
    if !needed.is_finite() || needed < 0.0 {
        return max_iterations;
    }
    (needed.ceil() as usize).min(max_iterations)
}

/// Estimate a fundamental matrix with RANSAC using the 8-point solver.
///
/// A correspondence is an inlier when its Sampson distance is within `threshold`.
/// The winning model is refit on all of its inliers.
pub fn ransac_fundamental(
    x1: &[DVec2],
    x2: &[DVec2],
    threshold: f64,
    params: &RansacParams,
) -> Result<RansacResult<DMat3>, VoError> {
    check_same_len("x1", x1.len(), "x2", x2.len())?;
    if x1.len() < MIN_CORRESPONDENCES {
        return Err(VoError::TooFewCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: x1.len(),
        });
    }

    let mut rng = match params.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => {
            let mut tr = rand::rng();
            StdRng::from_rng(&mut tr)
        }
    };

    let n = x1.len();
    let threshold_sq = threshold * threshold;
    let mut best_model = None;
    let mut best_inliers = Vec::new();
    let mut best_count = 0usize;
    let mut best_score = f64::INFINITY;
    let mut max_iterations = params.max_iterations;
    let mut iterations = 0usize;

    while iterations < max_iterations {
        iterations += 1;
        let sample = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES);
        let s1 = sample.iter().map(|idx| x1[idx]).collect::<Vec<_>>();
        let s2 = sample.iter().map(|idx| x2[idx]).collect::<Vec<_>>();
        let f = match fundamental_8point(&s1, &s2) {
            Ok(f) => f,
            Err(_) => continue,
        };

        let (inliers, count, score) = score_model(&f, x1, x2, threshold_sq);

        if count > best_count || (count == best_count && score < best_score) {
            best_model = Some(f);
            best_inliers = inliers;
            best_count = count;
            best_score = score;
            max_iterations = max_iterations.min(adaptive_iterations(
                count as f64 / n as f64,
                params.confidence,
                params.max_iterations,
            ));
        }
    }

    let model = match best_model {
        Some(m) if best_count >= params.min_inliers.max(MIN_CORRESPONDENCES) => m,
        _ => {
            return Err(VoError::EstimationFailure(
                "RANSAC failed to find a fundamental matrix with enough inliers",
            ))
        }
    };

    // least-squares refit over the consensus set
    let (i1, i2): (Vec<DVec2>, Vec<DVec2>) = best_inliers
        .iter()
        .zip(x1.iter().zip(x2.iter()))
        .filter(|(inlier, _)| **inlier)
        .map(|(_, (a, b))| (*a, *b))
        .unzip();
    let model = match fundamental_8point(&i1, &i2) {
        Ok(refit) => {
            let (inliers, count, score) = score_model(&refit, x1, x2, threshold_sq);
            if count >= best_count {
                best_inliers = inliers;
                best_count = count;
                best_score = score;
                refit
            } else {
                model
            }
        }
        Err(_) => model,
    };

    log::debug!(
        "RANSAC fundamental: {}/{} inliers after {} iterations",
        best_count,
        n,
        iterations
    );

    Ok(RansacResult {
        model,
        inliers: best_inliers,
        inlier_count: best_count,
        score: best_score,
        iterations,
    })
}

fn score_model(f: &DMat3, x1: &[DVec2], x2: &[DVec2], threshold_sq: f64) -> (Vec<bool>, usize, f64) {
    let mut inliers = vec![false; x1.len()];
    let mut count = 0usize;
    let mut score = 0.0f64;
    for i in 0..x1.len() {
        let d = sampson_distance(f, &x1[i], &x2[i]);
        if d <= threshold_sq {
            inliers[i] = true;
            count += 1;
            score += d;
        }
    }
    (inliers, count, score)
}

/// Robustly estimate the fundamental matrix between two frames and prune outliers.
///
/// `previous` and `current` are the (undistorted) pixel coordinates of each
/// correspondence in `matches`, index-aligned. The points are normalized, fit with
/// RANSAC using a tolerance of `threshold_fraction` times the largest normalized
/// coordinate, and the model is mapped back to pixel coordinates. Outliers are
/// removed consistently from the point lists and from the matches.
pub fn estimate_fundamental(
    previous: &[DVec2],
    current: &[DVec2],
    matches: &[Correspondence],
    params: &RansacParams,
) -> Result<FundamentalEstimate, VoError> {
    check_same_len("previous", previous.len(), "current", current.len())?;
    check_same_len("points", previous.len(), "matches", matches.len())?;
    if matches.len() < MIN_CORRESPONDENCES {
        return Err(VoError::TooFewCorrespondences {
            required: MIN_CORRESPONDENCES,
            actual: matches.len(),
        });
    }

    let normalized = normalize_correspondences(previous, current)?;
    let threshold = params.threshold_fraction * normalized.max_abs_coordinate();
    let ransac = ransac_fundamental(&normalized.previous, &normalized.current, threshold, params)?;
    let fundamental = normalized.denormalize_fundamental(&ransac.model);

    let mut kept_matches = Vec::with_capacity(ransac.inlier_count);
    let mut previous_inliers = Vec::with_capacity(ransac.inlier_count);
    let mut current_inliers = Vec::with_capacity(ransac.inlier_count);
    let mut total_displacement = 0.0;
    for (i, inlier) in ransac.inliers.iter().enumerate() {
        if !inlier {
            continue;
        }
        kept_matches.push(matches[i]);
        previous_inliers.push(previous[i]);
        current_inliers.push(current[i]);
        total_displacement += (current[i] - previous[i]).length();
    }

    if kept_matches.is_empty() {
        return Err(VoError::DegenerateInput("no correspondences survived outlier rejection"));
    }
    let mean_displacement = total_displacement / kept_matches.len() as f64;

    Ok(FundamentalEstimate {
        fundamental,
        inlier_mask: ransac.inliers,
        matches: kept_matches,
        previous_inliers,
        current_inliers,
        matches_before: matches.len(),
        mean_displacement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{RigidMotion, SyntheticScene};

    // Check x2'^T F x1 ~ 0 for perfect correspondences from a known F
    #[test]
    fn test_fundamental_8point_epipolar_constraint() -> Result<(), Box<dyn std::error::Error>> {
        // rank-2 by construction
        let h = DMat3::from_cols(
            DVec3::new(1.0, 0.1, -0.2),
            DVec3::new(0.05, 0.9, 0.1),
            DVec3::new(0.3, -0.4, 1.0),
        );
        let f_true = crate::linalg::skew(DVec3::new(0.3, -0.2, 1.0)) * h;
        // Generate points x1 and compute epipolar lines l2 = F x1, then sample x2 on those lines
        let x1 = vec![
            DVec2::new(1.0, 2.0),
            DVec2::new(3.0, -0.5),
            DVec2::new(-1.5, 1.2),
            DVec2::new(0.7, 0.8),
            DVec2::new(1.0, 0.5),
            DVec2::new(-0.4, 0.7),
            DVec2::new(0.6, -0.3),
            DVec2::new(1.5, 1.5),
            DVec2::new(-2.0, -1.0),
        ];
        let x2 = x1
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let l = f_true * DVec3::new(p.x, p.y, 1.0);
                // pick x2 on the line with a varying y
                let yp = 0.3 * i as f64 - 1.0;
                DVec2::new(-(l.y * yp + l.z) / l.x, yp)
            })
            .collect::<Vec<_>>();

        let f_est = fundamental_8point(&x1, &x2)?;

        for (a, b) in x1.iter().zip(x2.iter()) {
            assert!(epipolar_residual(&f_est, a, b).abs() < 1e-8);
        }
        assert!(svd3(&f_est).s.z.abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_fundamental_8point_too_few() {
        let x = vec![DVec2::ZERO; 7];
        assert!(matches!(
            fundamental_8point(&x, &x),
            Err(VoError::TooFewCorrespondences {
                required: 8,
                actual: 7
            })
        ));
    }

    #[test]
    fn test_sampson_distance_zero_on_epipolar_line() {
        // pure x-translation: F = [t]x with t = (1, 0, 0)
        let f = crate::linalg::skew(DVec3::X);
        let d = sampson_distance(&f, &DVec2::new(0.2, 0.4), &DVec2::new(0.7, 0.4));
        assert!(d < 1e-20);
        let d = sampson_distance(&f, &DVec2::new(0.2, 0.4), &DVec2::new(0.7, 0.5));
        assert!(d > 1e-4);
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 2000), 0);
        assert_eq!(adaptive_iterations(0.0, 0.99, 2000), 2000);
        let k = adaptive_iterations(0.8, 0.99, 2000);
        assert!(k > 10 && k < 2000);
    }

    #[test]
    fn test_estimate_fundamental_rejects_outliers() -> Result<(), Box<dyn std::error::Error>> {
        let scene = SyntheticScene::random(60, 11);
        let camera = SyntheticScene::default_camera()?;
        let motion = RigidMotion::from_axis_angle(
            DVec3::new(0.02, -0.05, 0.01),
            DVec3::new(0.3, 0.05, 0.1),
        );
        let mut sample = scene.observe(&camera, &motion, 0.2, 3)?;
        // corrupt a handful of correspondences
        let corrupted = [3usize, 17, 29, 41, 55];
        for &i in &corrupted {
            sample.current[i] += DVec2::new(35.0, -28.0);
        }

        let estimate = estimate_fundamental(
            &sample.previous,
            &sample.current,
            &sample.matches,
            &RansacParams::default(),
        )?;

        assert_eq!(estimate.matches_before, sample.matches.len());
        for &i in &corrupted {
            assert!(!estimate.inlier_mask[i]);
        }
        assert!(estimate.matches.len() >= sample.matches.len() - corrupted.len() - 3);
        assert_eq!(estimate.matches.len(), estimate.previous_inliers.len());
        assert_eq!(estimate.matches.len(), estimate.current_inliers.len());
        assert!(estimate.mean_displacement > 0.0);

        // the epipolar constraint holds for every inlier in pixel coordinates
        for (p, c) in estimate
            .previous_inliers
            .iter()
            .zip(estimate.current_inliers.iter())
        {
            let d = sampson_distance(&estimate.fundamental, p, c).sqrt();
            assert!(d < 2.5, "sampson distance {d} px");
        }
        Ok(())
    }

    #[test]
    fn test_estimate_fundamental_too_few() {
        let points = (0..5).map(|i| DVec2::new(i as f64, 2.0 * i as f64)).collect::<Vec<_>>();
        let matches = (0..5)
            .map(|i| Correspondence::new(i, i))
            .collect::<Vec<_>>();
        let err = estimate_fundamental(&points, &points, &matches, &RansacParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DegenerateInput);
    }
}
