use glam::{DMat3, DVec3};

/// Singular value decomposition of a 3x3 matrix, `m = u * diag(s) * v^T`.
///
/// Singular values are sorted in non-increasing order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Svd3 {
    pub u: DMat3,
    pub s: DVec3,
    pub v: DMat3,
}

pub(crate) fn mat3_to_faer(m: &DMat3) -> faer::Mat<f64> {
    faer::Mat::from_fn(3, 3, |i, j| m.col(j)[i])
}

pub(crate) fn faer_to_mat3(m: faer::MatRef<'_, f64>) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(m.read(0, 0), m.read(1, 0), m.read(2, 0)),
        DVec3::new(m.read(0, 1), m.read(1, 1), m.read(2, 1)),
        DVec3::new(m.read(0, 2), m.read(1, 2), m.read(2, 2)),
    )
}

pub(crate) fn svd3(m: &DMat3) -> Svd3 {
    let svd = mat3_to_faer(m).svd();
    let s = svd.s_diagonal();
    Svd3 {
        u: faer_to_mat3(svd.u()),
        s: DVec3::new(s.read(0), s.read(1), s.read(2)),
        v: faer_to_mat3(svd.v()),
    }
}

/// Right singular vector of the smallest singular value, the least-squares solution of `a x = 0`.
pub(crate) fn null_vector(a: &faer::Mat<f64>) -> Vec<f64> {
    let svd = a.svd();
    let v = svd.v();
    let last = v.ncols() - 1;
    (0..v.nrows()).map(|i| v.read(i, last)).collect()
}

/// Least-squares solution of `a x = b` through the SVD pseudo-inverse.
///
/// Returns `None` when `a` is rank deficient, i.e. a singular value falls below
/// `rcond` times the largest one.
pub(crate) fn solve_least_squares(a: &faer::Mat<f64>, b: &[f64], rcond: f64) -> Option<Vec<f64>> {
    debug_assert_eq!(a.nrows(), b.len());
    let svd = a.svd();
    let (u, s, v) = (svd.u(), svd.s_diagonal(), svd.v());
    let rank = s.nrows();
    if rank < a.ncols() {
        return None;
    }

    let s_max = s.read(0);
    if !s_max.is_finite() || s_max <= 0.0 {
        return None;
    }

    let mut x = vec![0.0; a.ncols()];
    for k in 0..rank {
        let sk = s.read(k);
        if sk <= rcond * s_max {
            return None;
        }
        let ub = (0..a.nrows()).map(|i| u.read(i, k) * b[i]).sum::<f64>();
        let coeff = ub / sk;
        for (j, xj) in x.iter_mut().enumerate() {
            *xj += coeff * v.read(j, k);
        }
    }
    Some(x)
}

/// Skew-symmetric cross-product matrix, `skew(t) * x == t.cross(x)`.
pub(crate) fn skew(t: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, t.z, -t.y),
        DVec3::new(-t.z, 0.0, t.x),
        DVec3::new(t.y, -t.x, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_svd3_reconstructs() {
        let m = DMat3::from_cols(
            DVec3::new(0.1, 0.2, -0.3),
            DVec3::new(0.4, -0.1, 0.2),
            DVec3::new(-0.2, 0.5, 0.3),
        );
        let svd = svd3(&m);
        assert!(svd.s.x >= svd.s.y && svd.s.y >= svd.s.z);
        let rec = svd.u * DMat3::from_diagonal(svd.s) * svd.v.transpose();
        for j in 0..3 {
            for i in 0..3 {
                assert_relative_eq!(rec.col(j)[i], m.col(j)[i], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_solve_least_squares_overdetermined() {
        // x + y = 3, x - y = 1, 2x = 4 -> x = 2, y = 1
        let a = faer::mat![[1.0, 1.0], [1.0, -1.0], [2.0, 0.0]];
        let x = solve_least_squares(&a, &[3.0, 1.0, 4.0], 1e-12).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_least_squares_rank_deficient() {
        let a = faer::mat![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        assert!(solve_least_squares(&a, &[1.0, 2.0, 3.0], 1e-10).is_none());
    }

    #[test]
    fn test_skew_matches_cross() {
        let t = DVec3::new(0.3, -1.2, 2.0);
        let x = DVec3::new(-0.5, 0.7, 1.1);
        let a = skew(t) * x;
        let b = t.cross(x);
        assert_relative_eq!(a.x, b.x, epsilon = 1e-12);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-12);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-12);
    }
}
