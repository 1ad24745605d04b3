use crate::chirality::ChiralityParams;
use crate::error::VoError;
use crate::essential::DEFAULT_MIN_SINGULAR_VALUE_RATIO;
use crate::fundamental::RansacParams;
use crate::scale::ScaleParams;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration of the odometry pipeline.
///
/// Every field has a default, so a configuration file only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    /// Robust fundamental matrix estimation.
    pub ransac: RansacParams,
    /// Frames whose mean inlier displacement (pixels) is below this are skipped.
    pub min_displacement: f64,
    /// Minimum ratio between the two largest singular values of the essential matrix.
    pub min_singular_value_ratio: f64,
    /// Candidate resolution, including the triangulation settings.
    pub chirality: ChiralityParams,
    /// Scale solver weights.
    pub scale: ScaleParams,
    /// Scale of the first step when neither structure nor platform metadata is available.
    pub bootstrap_scale: f64,
    /// Minimum number of inliers with known structure to solve the scale.
    pub min_scale_points: usize,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            ransac: RansacParams::default(),
            min_displacement: 0.5,
            min_singular_value_ratio: DEFAULT_MIN_SINGULAR_VALUE_RATIO,
            chirality: ChiralityParams::default(),
            scale: ScaleParams::default(),
            bootstrap_scale: 1.0,
            min_scale_points: 3,
        }
    }
}

impl OdometryConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VoError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), VoError> {
        let invalid = |msg: String| Err(VoError::Configuration(msg));

        if self.ransac.max_iterations == 0 {
            return invalid("ransac.max_iterations must be positive".to_string());
        }
        if !(self.ransac.threshold_fraction.is_finite() && self.ransac.threshold_fraction > 0.0) {
            return invalid(format!(
                "ransac.threshold_fraction must be positive, got {}",
                self.ransac.threshold_fraction
            ));
        }
        if !(self.ransac.confidence > 0.0 && self.ransac.confidence < 1.0) {
            return invalid(format!(
                "ransac.confidence must be in (0, 1), got {}",
                self.ransac.confidence
            ));
        }
        if !(self.min_displacement.is_finite() && self.min_displacement >= 0.0) {
            return invalid(format!(
                "min_displacement must be non-negative, got {}",
                self.min_displacement
            ));
        }
        if !(self.min_singular_value_ratio >= 0.0 && self.min_singular_value_ratio <= 1.0) {
            return invalid(format!(
                "min_singular_value_ratio must be in [0, 1], got {}",
                self.min_singular_value_ratio
            ));
        }
        let tri = &self.chirality.triangulation;
        if !(tri.tolerance.is_finite() && tri.tolerance >= 0.0) {
            return invalid(format!(
                "triangulation tolerance must be non-negative, got {}",
                tri.tolerance
            ));
        }
        let scale = &self.scale;
        if !(scale.x_weight.is_finite()
            && scale.y_weight.is_finite()
            && scale.x_weight >= 0.0
            && scale.y_weight >= 0.0
            && scale.x_weight + scale.y_weight > 0.0)
        {
            return invalid(format!(
                "scale weights must be non-negative and not both zero, got ({}, {})",
                scale.x_weight, scale.y_weight
            ));
        }
        if !(self.bootstrap_scale.is_finite() && self.bootstrap_scale > 0.0) {
            return invalid(format!(
                "bootstrap_scale must be positive, got {}",
                self.bootstrap_scale
            ));
        }
        if self.min_scale_points == 0 {
            return invalid("min_scale_points must be positive".to_string());
        }
        Ok(())
    }
}
