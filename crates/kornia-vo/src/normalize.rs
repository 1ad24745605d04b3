use crate::error::{check_same_len, VoError};
use glam::{DMat3, DVec2, DVec3};

/// Index-aligned point lists after isotropic normalization.
#[derive(Debug, Clone)]
pub struct NormalizedCorrespondences {
    /// Normalized points of the previous frame.
    pub previous: Vec<DVec2>,
    /// Normalized points of the current frame.
    pub current: Vec<DVec2>,
    /// Similarity transform applied to the previous points.
    pub t_previous: DMat3,
    /// Similarity transform applied to the current points.
    pub t_current: DMat3,
}

impl NormalizedCorrespondences {
    /// Undo the normalization of a fundamental matrix estimated on the normalized points.
    pub fn denormalize_fundamental(&self, f_normalized: &DMat3) -> DMat3 {
        denormalize_fundamental(f_normalized, &self.t_previous, &self.t_current)
    }

    /// Largest absolute coordinate over both point lists.
    pub fn max_abs_coordinate(&self) -> f64 {
        self.previous
            .iter()
            .chain(self.current.iter())
            .fold(0.0f64, |acc, p| acc.max(p.x.abs()).max(p.y.abs()))
    }
}

/// Normalize points to have zero mean and an average distance of sqrt(2) to the origin.
///
/// Returns the normalized points and the similarity transform
/// `T = [[s, 0, -s*mx], [0, s, -s*my], [0, 0, 1]]` that maps the input onto them.
///
/// Fails with [`VoError::DegenerateInput`] when the list is empty or all points coincide.
pub fn normalize_points_2d(x: &[DVec2]) -> Result<(Vec<DVec2>, DMat3), VoError> {
    if x.is_empty() {
        return Err(VoError::DegenerateInput("cannot normalize an empty point set"));
    }
    let n = x.len() as f64;
    let centroid = x.iter().copied().fold(DVec2::ZERO, |acc, p| acc + p) / n;
    let mean_dist = x.iter().map(|p| (*p - centroid).length()).sum::<f64>() / n;
    if !mean_dist.is_finite() || mean_dist <= f64::EPSILON {
        return Err(VoError::DegenerateInput(
            "cannot normalize a point set with zero spread",
        ));
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;

    let xn = x.iter().map(|p| (*p - centroid) * scale).collect();

    let t = DMat3::from_cols(
        DVec3::new(scale, 0.0, 0.0),
        DVec3::new(0.0, scale, 0.0),
        DVec3::new(-scale * centroid.x, -scale * centroid.y, 1.0),
    );
    Ok((xn, t))
}

/// Normalize both sides of a set of correspondences independently.
pub fn normalize_correspondences(
    previous: &[DVec2],
    current: &[DVec2],
) -> Result<NormalizedCorrespondences, VoError> {
    check_same_len("previous", previous.len(), "current", current.len())?;
    let (previous, t_previous) = normalize_points_2d(previous)?;
    let (current, t_current) = normalize_points_2d(current)?;
    Ok(NormalizedCorrespondences {
        previous,
        current,
        t_previous,
        t_current,
    })
}

/// Denormalize: F = T_current^T * F_normalized * T_previous.
pub fn denormalize_fundamental(f_normalized: &DMat3, t_previous: &DMat3, t_current: &DMat3) -> DMat3 {
    t_current.transpose() * *f_normalized * *t_previous
}
