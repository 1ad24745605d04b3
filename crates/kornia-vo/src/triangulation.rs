use crate::linalg::solve_least_squares;
use glam::{DMat3, DVec2, DVec3, DVec4};
use serde::{Deserialize, Serialize};

/// Relative singular value below which the DLT system is considered rank deficient.
const RCOND: f64 = 1e-12;

/// Depth weights smaller than this stop the reweighting.
const MIN_WEIGHT: f64 = 1e-12;

/// A 3x4 camera projection matrix `[R|t]` acting on normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionMatrix {
    rows: [DVec4; 3],
}

impl ProjectionMatrix {
    /// The reference camera `[I|0]`.
    pub fn identity() -> Self {
        Self::from_motion(&DMat3::IDENTITY, &DVec3::ZERO)
    }

    /// The camera `[R|t]`.
    pub fn from_motion(rotation: &DMat3, translation: &DVec3) -> Self {
        Self {
            rows: [
                rotation.row(0).extend(translation.x),
                rotation.row(1).extend(translation.y),
                rotation.row(2).extend(translation.z),
            ],
        }
    }

    /// Row `i` of the matrix.
    pub fn row(&self, i: usize) -> DVec4 {
        self.rows[i]
    }

    /// Homogeneous depth `P_3 . (X, 1)` of a point.
    pub fn depth(&self, point: DVec3) -> f64 {
        self.rows[2].dot(point.extend(1.0))
    }

    /// Project a point, returning `None` when it lies on the principal plane.
    pub fn project(&self, point: DVec3) -> Option<DVec2> {
        let xh = point.extend(1.0);
        let z = self.rows[2].dot(xh);
        if z.abs() < MIN_WEIGHT {
            return None;
        }
        Some(DVec2::new(self.rows[0].dot(xh) / z, self.rows[1].dot(xh) / z))
    }
}

/// Parameters of the iterative triangulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationParams {
    /// Maximum number of reweighting iterations.
    pub max_iterations: usize,
    /// Stop once both depth weights change by at most this amount.
    pub tolerance: f64,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            tolerance: 1e-4,
        }
    }
}

/// A triangulated point with convergence diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangulation {
    /// The point in the frame of the first camera.
    pub point: DVec3,
    /// Number of reweighting iterations performed.
    pub iterations: usize,
    /// Mean reprojection error over both views, in normalized image units.
    pub residual: f64,
}

/// Linear least-squares triangulation of a single correspondence.
///
/// Builds the 4x3 inhomogeneous DLT system, assuming `X = (x, y, z, 1)`, and
/// solves it in the least-squares sense.
///
/// - `u1`, `u2`: normalized image coordinates in the first and second view.
/// - `p1`, `p2`: projection matrices of both views.
///
/// Returns `None` when the system is rank deficient.
pub fn triangulate_linear(
    u1: DVec2,
    p1: &ProjectionMatrix,
    u2: DVec2,
    p2: &ProjectionMatrix,
) -> Option<DVec3> {
    solve_weighted(u1, p1, 1.0, u2, p2, 1.0)
}

/// Iteratively reweighted linear triangulation.
///
/// Each iteration divides the equations of a view by the homogeneous depth of
/// the previous estimate in that view, so the algebraic error approaches the
/// reprojection error. Stops after `max_iterations` or once both weights change
/// by at most `tolerance`.
pub fn triangulate_iterative(
    u1: DVec2,
    p1: &ProjectionMatrix,
    u2: DVec2,
    p2: &ProjectionMatrix,
    params: &TriangulationParams,
) -> Option<Triangulation> {
    let (mut w1, mut w2) = (1.0, 1.0);
    let mut point = solve_weighted(u1, p1, w1, u2, p2, w2)?;
    let mut iterations = 0;

    for _ in 0..params.max_iterations {
        let d1 = p1.depth(point);
        let d2 = p2.depth(point);

        if (w1 - d1).abs() <= params.tolerance && (w2 - d2).abs() <= params.tolerance {
            break;
        }
        if d1.abs() < MIN_WEIGHT || d2.abs() < MIN_WEIGHT {
            break;
        }

        w1 = d1;
        w2 = d2;
        iterations += 1;
        match solve_weighted(u1, p1, w1, u2, p2, w2) {
            Some(x) => point = x,
            None => break,
        }
    }

    Some(Triangulation {
        point,
        iterations,
        residual: reprojection_residual(point, u1, p1, u2, p2),
    })
}

fn solve_weighted(
    u1: DVec2,
    p1: &ProjectionMatrix,
    w1: f64,
    u2: DVec2,
    p2: &ProjectionMatrix,
    w2: f64,
) -> Option<DVec3> {
    let rows = [
        (p1.row(2) * u1.x - p1.row(0)) / w1,
        (p1.row(2) * u1.y - p1.row(1)) / w1,
        (p2.row(2) * u2.x - p2.row(0)) / w2,
        (p2.row(2) * u2.y - p2.row(1)) / w2,
    ];

    let mut a = faer::Mat::<f64>::zeros(4, 3);
    let mut b = [0.0; 4];
    for (i, row) in rows.iter().enumerate() {
        a.write(i, 0, row.x);
        a.write(i, 1, row.y);
        a.write(i, 2, row.z);
        b[i] = -row.w;
    }

    let x = solve_least_squares(&a, &b, RCOND)?;
    let point = DVec3::new(x[0], x[1], x[2]);
    point.is_finite().then_some(point)
}

fn reprojection_residual(
    point: DVec3,
    u1: DVec2,
    p1: &ProjectionMatrix,
    u2: DVec2,
    p2: &ProjectionMatrix,
) -> f64 {
    match (p1.project(point), p2.project(point)) {
        (Some(q1), Some(q2)) => 0.5 * ((q1 - u1).length() + (q2 - u2).length()),
        _ => f64::INFINITY,
    }
}
