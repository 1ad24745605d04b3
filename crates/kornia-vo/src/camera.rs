use crate::error::VoError;
use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed-point iterations used to invert the distortion model.
const UNDISTORT_ITERATIONS: usize = 20;

/// Represents the polynomial distortion parameters of a camera
///
/// The radial part is the rational model
/// `(1 + k1 r^2 + k2 r^4 + k3 r^6) / (1 + k4 r^2 + k5 r^4 + k6 r^6)`,
/// the tangential part uses `p1` and `p2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PolynomialDistortion {
    /// The first radial distortion coefficient
    pub k1: f64,
    /// The second radial distortion coefficient
    pub k2: f64,
    /// The third radial distortion coefficient
    pub k3: f64,
    /// The fourth radial distortion coefficient
    pub k4: f64,
    /// The fifth radial distortion coefficient
    pub k5: f64,
    /// The sixth radial distortion coefficient
    pub k6: f64,
    /// The first tangential distortion coefficient
    pub p1: f64,
    /// The second tangential distortion coefficient
    pub p2: f64,
}

impl PolynomialDistortion {
    /// Build the model from coefficients in OpenCV order `k1, k2, p1, p2[, k3[, k4, k5, k6]]`.
    ///
    /// An empty slice yields the zero (pinhole) model.
    pub fn from_coefficients(coeffs: &[f64]) -> Result<Self, VoError> {
        let c = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        match coeffs.len() {
            0 | 4 | 5 | 8 => Ok(Self {
                k1: c(0),
                k2: c(1),
                p1: c(2),
                p2: c(3),
                k3: c(4),
                k4: c(5),
                k5: c(6),
                k6: c(7),
            }),
            n => Err(VoError::Configuration(format!(
                "unsupported number of distortion coefficients: {n} (expected 0, 4, 5 or 8)"
            ))),
        }
    }

    /// Whether every coefficient is zero.
    pub fn is_zero(&self) -> bool {
        self.coefficients().iter().all(|c| *c == 0.0)
    }

    fn coefficients(&self) -> [f64; 8] {
        [
            self.k1, self.k2, self.p1, self.p2, self.k3, self.k4, self.k5, self.k6,
        ]
    }

    /// Distort a point given in normalized camera coordinates.
    pub fn distort(&self, p: DVec2) -> DVec2 {
        let (x, y) = (p.x, p.y);

        // calculate the radial distance
        let r2 = x * x + y * y;

        // radial distortion
        let kr = self.radial(r2);

        // tangential distortion
        let xd = x * kr + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * kr + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

        DVec2::new(xd, yd)
    }

    /// Undistort a point given in normalized camera coordinates.
    ///
    /// Inverts [`Self::distort`] by fixed-point iteration, which converges for the
    /// moderate distortion of ordinary lenses.
    pub fn undistort(&self, pd: DVec2) -> DVec2 {
        if self.is_zero() {
            return pd;
        }
        let mut p = pd;
        for _ in 0..UNDISTORT_ITERATIONS {
            let (x, y) = (p.x, p.y);
            let r2 = x * x + y * y;
            let kr = self.radial(r2);
            if !kr.is_finite() || kr.abs() < f64::EPSILON {
                break;
            }
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            p = DVec2::new((pd.x - dx) / kr, (pd.y - dy) / kr);
        }
        p
    }

    fn radial(&self, r2: f64) -> f64 {
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6)
    }
}

/// On-disk layout of the calibration produced by the calibration tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IntrinsicsFile {
    camera_matrix: [[f64; 3]; 3],
    #[serde(default)]
    distortion: Vec<f64>,
}

/// Pinhole camera intrinsics with lens distortion.
///
/// Loaded once at startup and read-only for the lifetime of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    k: DMat3,
    k_inv: DMat3,
    distortion: PolynomialDistortion,
}

impl CameraIntrinsics {
    /// Create intrinsics from a calibration matrix and a distortion model.
    ///
    /// Fails with [`VoError::Configuration`] when the matrix is not a valid pinhole matrix.
    pub fn new(k: DMat3, distortion: PolynomialDistortion) -> Result<Self, VoError> {
        validate_camera_matrix(&k)?;
        if !distortion.coefficients().iter().all(|c| c.is_finite()) {
            return Err(VoError::Configuration(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(Self {
            k,
            k_inv: k.inverse(),
            distortion,
        })
    }

    /// Create distortion-free intrinsics from focal lengths and principal point.
    pub fn from_pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, VoError> {
        let k = DMat3::from_cols(
            DVec3::new(fx, 0.0, 0.0),
            DVec3::new(0.0, fy, 0.0),
            DVec3::new(cx, cy, 1.0),
        );
        Self::new(k, PolynomialDistortion::default())
    }

    /// Identity intrinsics.
    ///
    /// A degraded fallback for callers that decide to run without a calibration:
    /// pixel coordinates are then treated as normalized camera coordinates.
    pub fn identity() -> Self {
        Self {
            k: DMat3::IDENTITY,
            k_inv: DMat3::IDENTITY,
            distortion: PolynomialDistortion::default(),
        }
    }

    /// Load intrinsics from a JSON file.
    ///
    /// The expected layout is
    /// `{"camera_matrix": [[fx, 0, cx], [0, fy, cy], [0, 0, 1]], "distortion": [k1, k2, p1, p2, k3]}`
    /// with the matrix given row by row.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VoError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parse intrinsics from a JSON string, see [`Self::from_json_file`].
    pub fn from_json_str(contents: &str) -> Result<Self, VoError> {
        let file: IntrinsicsFile = serde_json::from_str(contents)?;
        let rows = file.camera_matrix;
        let k = DMat3::from_cols(
            DVec3::new(rows[0][0], rows[1][0], rows[2][0]),
            DVec3::new(rows[0][1], rows[1][1], rows[2][1]),
            DVec3::new(rows[0][2], rows[1][2], rows[2][2]),
        );
        let distortion = PolynomialDistortion::from_coefficients(&file.distortion)?;
        Self::new(k, distortion)
    }

    /// The 3x3 calibration matrix.
    pub fn k(&self) -> &DMat3 {
        &self.k
    }

    /// The inverse of the calibration matrix.
    pub fn k_inv(&self) -> &DMat3 {
        &self.k_inv
    }

    /// The lens distortion model.
    pub fn distortion(&self) -> &PolynomialDistortion {
        &self.distortion
    }

    /// Map a distorted pixel to normalized, undistorted camera coordinates.
    pub fn normalize_pixel(&self, pixel: DVec2) -> DVec2 {
        let p = self.k_inv * DVec3::new(pixel.x, pixel.y, 1.0);
        self.distortion.undistort(DVec2::new(p.x / p.z, p.y / p.z))
    }

    /// Remove lens distortion from a pixel, keeping it in pixel units.
    pub fn undistort_pixel(&self, pixel: DVec2) -> DVec2 {
        if self.distortion.is_zero() {
            return pixel;
        }
        self.project_normalized(self.normalize_pixel(pixel))
    }

    /// Map normalized, undistorted camera coordinates to an ideal pixel.
    pub fn project_normalized(&self, p: DVec2) -> DVec2 {
        let q = self.k * DVec3::new(p.x, p.y, 1.0);
        DVec2::new(q.x / q.z, q.y / q.z)
    }

    /// Project a 3D point in the camera frame to a distorted pixel.
    ///
    /// Returns `None` for points on or behind the image plane.
    pub fn project_point(&self, point: DVec3) -> Option<DVec2> {
        if point.z <= 0.0 {
            return None;
        }
        let p = self
            .distortion
            .distort(DVec2::new(point.x / point.z, point.y / point.z));
        Some(self.project_normalized(p))
    }
}

fn validate_camera_matrix(k: &DMat3) -> Result<(), VoError> {
    let cols = k.to_cols_array();
    if !cols.iter().all(|v| v.is_finite()) {
        return Err(VoError::Configuration(
            "camera matrix must be finite".to_string(),
        ));
    }
    // bottom row is [0, 0, 1]
    if k.x_axis.z != 0.0 || k.y_axis.z != 0.0 || k.z_axis.z != 1.0 {
        return Err(VoError::Configuration(
            "camera matrix last row must be [0, 0, 1]".to_string(),
        ));
    }
    if k.x_axis.x <= 0.0 || k.y_axis.y <= 0.0 {
        return Err(VoError::Configuration(format!(
            "focal lengths must be positive, got fx={} fy={}",
            k.x_axis.x, k.y_axis.y
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_normalize_pixel_pinhole() -> Result<(), Box<dyn std::error::Error>> {
        let camera = CameraIntrinsics::from_pinhole(500.0, 400.0, 320.0, 240.0)?;
        let p = camera.normalize_pixel(DVec2::new(570.0, 40.0));
        assert_relative_eq!(p.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(p.y, -0.5, epsilon = 1e-12);
        let q = camera.project_normalized(p);
        assert_relative_eq!(q.x, 570.0, epsilon = 1e-9);
        assert_relative_eq!(q.y, 40.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let distortion = PolynomialDistortion {
            k1: -0.12,
            k2: 0.03,
            p1: 0.001,
            p2: -0.0005,
            ..Default::default()
        };
        let p = DVec2::new(0.31, -0.22);
        let pd = distortion.distort(p);
        assert!((pd - p).length() > 1e-3);
        let pu = distortion.undistort(pd);
        assert_relative_eq!(pu.x, p.x, epsilon = 1e-9);
        assert_relative_eq!(pu.y, p.y, epsilon = 1e-9);
    }

    #[test]
    fn test_project_point_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let distortion = PolynomialDistortion::from_coefficients(&[-0.1, 0.01, 0.0, 0.0, 0.0])?;
        let k = DMat3::from_cols(
            DVec3::new(450.0, 0.0, 0.0),
            DVec3::new(0.0, 450.0, 0.0),
            DVec3::new(320.0, 240.0, 1.0),
        );
        let camera = CameraIntrinsics::new(k, distortion)?;
        let point = DVec3::new(0.4, -0.3, 2.0);
        let pixel = camera.project_point(point).ok_or("point behind camera")?;
        let n = camera.normalize_pixel(pixel);
        assert_relative_eq!(n.x, 0.2, epsilon = 1e-9);
        assert_relative_eq!(n.y, -0.15, epsilon = 1e-9);
        assert!(camera.project_point(DVec3::new(0.0, 0.0, -1.0)).is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_intrinsics_rejected() {
        assert!(CameraIntrinsics::from_pinhole(0.0, 500.0, 320.0, 240.0).is_err());
        assert!(CameraIntrinsics::from_pinhole(f64::NAN, 500.0, 320.0, 240.0).is_err());
        let err = PolynomialDistortion::from_coefficients(&[0.1, 0.2, 0.3]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_from_json_file() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"camera_matrix": [[525.0, 0.0, 319.5], [0.0, 525.0, 239.5], [0.0, 0.0, 1.0]],
                "distortion": [0.1, -0.05, 0.0, 0.0, 0.01]}}"#
        )?;
        let camera = CameraIntrinsics::from_json_file(file.path())?;
        assert_relative_eq!(camera.k().x_axis.x, 525.0);
        assert_relative_eq!(camera.k().z_axis.x, 319.5);
        assert_relative_eq!(camera.k().z_axis.y, 239.5);
        assert_relative_eq!(camera.distortion().k3, 0.01);
        assert_relative_eq!(camera.distortion().k2, -0.05);
        Ok(())
    }

    #[test]
    fn test_from_json_missing_file_is_configuration_error() {
        let err = CameraIntrinsics::from_json_file("/nonexistent/intrinsics.json").unwrap_err();
        assert!(err.is_fatal());
        let err = CameraIntrinsics::from_json_str(r#"{"camera_matrix": [[1.0]]}"#).unwrap_err();
        assert!(err.is_fatal());
    }
}
