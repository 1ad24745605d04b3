use crate::error::VoError;
use crate::linalg::svd3;
use glam::{DMat3, DVec3};

/// Default minimum ratio between the two largest singular values of an essential matrix.
pub const DEFAULT_MIN_SINGULAR_VALUE_RATIO: f64 = 0.7;

/// Tag of one of the four motion hypotheses of an essential matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    /// `(U W V^T, +u3)`
    R1PositiveT,
    /// `(U W V^T, -u3)`
    R1NegativeT,
    /// `(U W^T V^T, +u3)`
    R2PositiveT,
    /// `(U W^T V^T, -u3)`
    R2NegativeT,
}

impl CandidateKind {
    /// All kinds in decomposition order.
    pub const ALL: [CandidateKind; 4] = [
        CandidateKind::R1PositiveT,
        CandidateKind::R1NegativeT,
        CandidateKind::R2PositiveT,
        CandidateKind::R2NegativeT,
    ];

    /// Position of the kind in decomposition order.
    pub fn index(self) -> usize {
        match self {
            CandidateKind::R1PositiveT => 0,
            CandidateKind::R1NegativeT => 1,
            CandidateKind::R2PositiveT => 2,
            CandidateKind::R2NegativeT => 3,
        }
    }
}

/// A rigid motion hypothesis `x_current = R * x_previous + t`, with `t` known up to scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCandidate {
    /// Which of the four hypotheses this is.
    pub kind: CandidateKind,
    /// Proper rotation matrix (determinant +1).
    pub rotation: DMat3,
    /// Unit translation direction.
    pub translation: DVec3,
}

/// The four motion hypotheses of an essential matrix, in decomposition order.
#[derive(Debug, Clone, Copy)]
pub struct MotionCandidates {
    candidates: [MotionCandidate; 4],
    singular_values: DVec3,
}

impl MotionCandidates {
    /// The candidates as a slice, ordered `(R1,t), (R1,-t), (R2,t), (R2,-t)`.
    pub fn as_slice(&self) -> &[MotionCandidate] {
        &self.candidates
    }

    /// Candidate of a given kind.
    pub fn get(&self, kind: CandidateKind) -> &MotionCandidate {
        &self.candidates[kind.index()]
    }

    /// Singular values of the decomposed essential matrix, non-increasing.
    pub fn singular_values(&self) -> DVec3 {
        self.singular_values
    }
}

impl IntoIterator for MotionCandidates {
    type Item = MotionCandidate;
    type IntoIter = std::array::IntoIter<MotionCandidate, 4>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

/// Build an essential matrix from a fundamental matrix and camera intrinsics.
///
/// E = K^T * F * K
pub fn essential_from_fundamental(f: &DMat3, k: &DMat3) -> DMat3 {
    k.transpose() * *f * *k
}

/// Enforce the (1,1,0) singular value constraint on an essential matrix.
pub fn enforce_essential_constraints(e: &DMat3) -> DMat3 {
    let svd = svd3(e);
    svd.u * DMat3::from_diagonal(DVec3::new(1.0, 1.0, 0.0)) * svd.v.transpose()
}

/// Ratio of the two largest singular values folded into `[0, 1]`.
///
/// Returns `None` when either value is zero or not finite.
pub fn singular_value_ratio(s0: f64, s1: f64) -> Option<f64> {
    if !s0.is_finite() || !s1.is_finite() || s0 == 0.0 || s1 == 0.0 {
        return None;
    }
    let (a, b) = (s0.abs(), s1.abs());
    Some(a.min(b) / a.max(b))
}

/// Decompose an essential matrix into its four motion hypotheses.
///
/// The two largest singular values must be commensurate, `ratio >= min_ratio`,
/// otherwise the decomposition is rejected with [`VoError::IllConditionedGeometry`].
/// The translation is the third left singular vector; rotations with a negative
/// determinant are negated.
pub fn decompose_essential(e: &DMat3, min_ratio: f64) -> Result<MotionCandidates, VoError> {
    let svd = svd3(e);

    let ratio = singular_value_ratio(svd.s.x, svd.s.y).unwrap_or(0.0);
    if ratio < min_ratio {
        log::debug!(
            "singular values are too far apart: {:?} (ratio {:.4})",
            svd.s,
            ratio
        );
        return Err(VoError::IllConditionedGeometry { ratio, min_ratio });
    }

    let w = DMat3::from_cols(
        DVec3::new(0.0, 1.0, 0.0),
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::new(0.0, 0.0, 1.0),
    );
    let wt = w.transpose();
    let vt = svd.v.transpose();

    let r1 = proper_rotation(svd.u * w * vt);
    let r2 = proper_rotation(svd.u * wt * vt);

    let t = svd.u.z_axis.normalize_or_zero();
    if t == DVec3::ZERO {
        return Err(VoError::DegenerateInput("essential matrix has no translation direction"));
    }

    let candidate = |kind, rotation, translation| MotionCandidate {
        kind,
        rotation,
        translation,
    };
    Ok(MotionCandidates {
        candidates: [
            candidate(CandidateKind::R1PositiveT, r1, t),
            candidate(CandidateKind::R1NegativeT, r1, -t),
            candidate(CandidateKind::R2PositiveT, r2, t),
            candidate(CandidateKind::R2NegativeT, r2, -t),
        ],
        singular_values: svd.s,
    })
}

fn proper_rotation(r: DMat3) -> DMat3 {
    if r.determinant() < 0.0 {
        -r
    } else {
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::skew;

    fn max_abs_diff(a: &DMat3, b: &DMat3) -> f64 {
        a.to_cols_array()
            .iter()
            .zip(b.to_cols_array().iter())
            .fold(0.0f64, |acc, (x, y)| acc.max((x - y).abs()))
    }

    fn assert_contains_ground_truth(r: DMat3, t: DVec3) -> Result<(), Box<dyn std::error::Error>> {
        let e = skew(t) * r;
        let candidates = decompose_essential(&e, DEFAULT_MIN_SINGULAR_VALUE_RATIO)?;
        assert_eq!(candidates.as_slice().len(), 4);

        let t_unit = t.normalize();
        let mut found = false;
        for c in candidates {
            assert!((c.rotation.determinant() - 1.0).abs() < 1e-9);
            assert!((c.translation.length() - 1.0).abs() < 1e-9);
            if max_abs_diff(&c.rotation, &r) < 1e-9 && c.translation.dot(t_unit).abs() > 1.0 - 1e-9
            {
                found = true;
            }
        }
        assert!(found, "ground truth not among the candidates");
        Ok(())
    }

    #[test]
    fn test_decompose_essential_identity_rotation() -> Result<(), Box<dyn std::error::Error>> {
        assert_contains_ground_truth(DMat3::IDENTITY, DVec3::new(1.0, 0.0, 0.0))
    }

    #[test]
    fn test_decompose_essential_general_motion() -> Result<(), Box<dyn std::error::Error>> {
        let r = DMat3::from_axis_angle(DVec3::new(0.2, -0.7, 0.3).normalize(), 0.35);
        assert_contains_ground_truth(r, DVec3::new(-0.4, 0.1, 0.9))?;
        let r = DMat3::from_axis_angle(DVec3::Y, -0.1);
        assert_contains_ground_truth(r, DVec3::new(0.0, 0.0, -0.1))
    }

    #[test]
    fn test_decompose_essential_order_and_signs() -> Result<(), Box<dyn std::error::Error>> {
        let e = skew(DVec3::new(0.3, 0.4, 0.5)) * DMat3::from_rotation_z(0.2);
        let candidates = decompose_essential(&e, 0.7)?;
        let kinds = candidates
            .as_slice()
            .iter()
            .map(|c| c.kind)
            .collect::<Vec<_>>();
        assert_eq!(kinds, CandidateKind::ALL.to_vec());
        let c = candidates.as_slice();
        assert_eq!(c[0].rotation, c[1].rotation);
        assert_eq!(c[2].rotation, c[3].rotation);
        assert_eq!(c[0].translation, -c[1].translation);
        assert_eq!(c[2].translation, c[0].translation);
        assert_eq!(candidates.get(CandidateKind::R2NegativeT).kind, CandidateKind::R2NegativeT);
        Ok(())
    }

    #[test]
    fn test_singular_value_ratio_boundary() {
        let min_ratio = DEFAULT_MIN_SINGULAR_VALUE_RATIO;
        let at = singular_value_ratio(1.0, 0.7).unwrap();
        assert!(at >= min_ratio);
        let flipped = singular_value_ratio(0.7, 1.0).unwrap();
        assert!(flipped >= min_ratio);
        let below = singular_value_ratio(1.0, 0.69).unwrap();
        assert!(below < min_ratio);
        assert!(singular_value_ratio(1.0, 0.0).is_none());
        assert!(singular_value_ratio(f64::NAN, 1.0).is_none());
    }

    #[test]
    fn test_decompose_essential_rejects_ill_conditioned() {
        let e = DMat3::from_diagonal(DVec3::new(1.0, 0.3, 0.0));
        let err = decompose_essential(&e, DEFAULT_MIN_SINGULAR_VALUE_RATIO).unwrap_err();
        match err {
            VoError::IllConditionedGeometry { ratio, min_ratio } => {
                assert!((ratio - 0.3).abs() < 1e-9);
                assert_eq!(min_ratio, 0.7);
            }
            other => panic!("unexpected error: {other}"),
        }
        // the same matrix passes once the threshold is relaxed
        assert!(decompose_essential(&e, 0.25).is_ok());
    }

    #[test]
    fn test_decompose_essential_zero_matrix() {
        assert!(decompose_essential(&DMat3::ZERO, 0.7).is_err());
    }

    #[test]
    fn test_essential_from_fundamental_roundtrip() {
        let k = DMat3::from_cols(
            DVec3::new(500.0, 0.0, 0.0),
            DVec3::new(0.0, 480.0, 0.0),
            DVec3::new(320.0, 240.0, 1.0),
        );
        let e_true = skew(DVec3::new(0.1, 0.0, 1.0)) * DMat3::from_rotation_y(0.05);
        let k_inv = k.inverse();
        let f = k_inv.transpose() * e_true * k_inv;
        let e = essential_from_fundamental(&f, &k);
        assert!(max_abs_diff(&e, &e_true) < 1e-9);
    }

    #[test]
    fn test_enforce_essential_constraints_rank2() {
        let e = DMat3::from_cols(
            DVec3::new(0.1, 0.2, -0.3),
            DVec3::new(0.4, -0.1, 0.2),
            DVec3::new(-0.2, 0.5, 0.3),
        );
        let e_fixed = enforce_essential_constraints(&e);
        let s = svd3(&e_fixed).s;
        assert!(s.z.abs() < 1e-9);
        assert!((s.x - s.y).abs() < 1e-9);
    }
}
