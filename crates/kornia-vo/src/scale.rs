use crate::error::{check_same_len, VoError};
use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Parameters of the scale solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// Weight of the equations derived from the x image coordinate.
    pub x_weight: f64,
    /// Weight of the equations derived from the y image coordinate.
    pub y_weight: f64,
    /// Normal-equation denominators below this are treated as degenerate.
    pub min_denominator: f64,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            x_weight: 1.0,
            y_weight: 1.0,
            min_denominator: 1e-12,
        }
    }
}

/// Solve the length of the translation of a motion from known 3D structure.
///
/// Each observation `x` of a point `X` satisfies `x ~ R X + s t` with `t` of unit
/// length. Writing `r1, r2, r3` for the rows of `R`, the x and y image constraints
/// are linear in the unknown scale `s`:
///
/// - `s (t_z x - t_x) = (r1 - x r3) . X`
/// - `s (t_z y - t_y) = (r2 - y r3) . X`
///
/// The stacked system is solved in closed form from its normal equation.
///
/// - `observations`: normalized image coordinates in the second view.
/// - `points`: the matching 3D points in the frame of the first view.
/// - `rotation`, `translation`: the motion; the translation is normalized first.
pub fn solve_scale(
    observations: &[DVec2],
    points: &[DVec3],
    rotation: &DMat3,
    translation: &DVec3,
    params: &ScaleParams,
) -> Result<f64, VoError> {
    check_same_len("observations", observations.len(), "points", points.len())?;
    if observations.is_empty() {
        return Err(VoError::DegenerateInput("no observations to solve the scale from"));
    }
    let norm = translation.length();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return Err(VoError::DegenerateInput("translation has zero length"));
    }
    let t = *translation / norm;

    let (r1, r2, r3) = (rotation.row(0), rotation.row(1), rotation.row(2));

    let mut ata = 0.0;
    let mut atb = 0.0;
    for (x, point) in observations.iter().zip(points.iter()) {
        let ax = params.x_weight * (t.z * x.x - t.x);
        let bx = params.x_weight * (r1 - r3 * x.x).dot(*point);
        let ay = params.y_weight * (t.z * x.y - t.y);
        let by = params.y_weight * (r2 - r3 * x.y).dot(*point);
        ata += ax * ax + ay * ay;
        atb += ax * bx + ay * by;
    }

    if !ata.is_finite() || ata < params.min_denominator {
        return Err(VoError::DegenerateInput(
            "scale is unobservable from these observations",
        ));
    }
    Ok(atb / ata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observe(points: &[DVec3], r: &DMat3, t: &DVec3) -> Vec<DVec2> {
        points
            .iter()
            .map(|p| {
                let q = *r * *p + *t;
                DVec2::new(q.x / q.z, q.y / q.z)
            })
            .collect()
    }

    fn points() -> Vec<DVec3> {
        (0..30)
            .map(|i| {
                let f = i as f64;
                DVec3::new((f * 0.7).sin() * 2.0, (f * 1.3).cos(), 4.0 + (f * 0.11) % 3.0)
            })
            .collect()
    }

    #[test]
    fn test_solve_scale_recovers_factor() -> Result<(), Box<dyn std::error::Error>> {
        let r = DMat3::from_axis_angle(DVec3::new(0.0, 1.0, 0.2).normalize(), 0.08);
        let direction = DVec3::new(0.3, -0.1, -0.9).normalize();
        let points = points();
        for factor in [0.05, 0.37, 1.0, 4.2] {
            let observations = observe(&points, &r, &(direction * factor));
            // any positive length of the direction gives the same answer
            for length in [1.0, 2.5] {
                let s = solve_scale(
                    &observations,
                    &points,
                    &r,
                    &(direction * length),
                    &ScaleParams::default(),
                )?;
                assert_relative_eq!(s, factor, epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_solve_scale_axis_weights() -> Result<(), Box<dyn std::error::Error>> {
        let r = DMat3::IDENTITY;
        let direction = DVec3::new(0.6, 0.8, 0.0);
        let points = points();
        let observations = observe(&points, &r, &(direction * 0.2));
        for (x_weight, y_weight) in [(1.0, 0.0), (0.0, 1.0), (0.3, 2.0)] {
            let params = ScaleParams {
                x_weight,
                y_weight,
                ..Default::default()
            };
            let s = solve_scale(&observations, &points, &r, &direction, &params)?;
            assert_relative_eq!(s, 0.2, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_solve_scale_degenerate_inputs() {
        let params = ScaleParams::default();
        let r = DMat3::IDENTITY;
        assert!(solve_scale(&[], &[], &r, &DVec3::Z, &params).is_err());
        assert!(solve_scale(&[DVec2::ZERO], &[DVec3::Z], &r, &DVec3::ZERO, &params).is_err());
        assert!(matches!(
            solve_scale(&[DVec2::ZERO], &[], &r, &DVec3::Z, &params),
            Err(VoError::MismatchedLengths { .. })
        ));
        // forward motion observed at the principal point carries no scale information
        let err = solve_scale(&[DVec2::ZERO], &[DVec3::new(0.0, 0.0, 5.0)], &r, &DVec3::Z, &params)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DegenerateInput);
    }
}
