use crate::error::VoError;
use glam::{DMat3, DMat4, DVec3, DVec4};

/// Accumulated camera pose.
///
/// A homogeneous transform mapping coordinates expressed in the first camera of
/// the sequence into the current camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    matrix: DMat4,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// The pose at the start of a sequence.
    pub fn identity() -> Self {
        Self {
            matrix: DMat4::IDENTITY,
        }
    }

    /// Wrap a homogeneous matrix.
    pub fn from_matrix(matrix: DMat4) -> Self {
        Self { matrix }
    }

    /// The 4x4 homogeneous matrix.
    pub fn matrix(&self) -> &DMat4 {
        &self.matrix
    }

    /// Rotation block.
    pub fn rotation(&self) -> DMat3 {
        DMat3::from_mat4(self.matrix)
    }

    /// Translation column.
    pub fn translation(&self) -> DVec3 {
        self.matrix.w_axis.truncate()
    }

    /// Position of the current camera in the frame of the first camera, `-R^T t`.
    pub fn camera_position(&self) -> DVec3 {
        -(self.rotation().transpose() * self.translation())
    }

    /// Rotation angle of the rotation block, in radians.
    pub fn rotation_angle(&self) -> f64 {
        rotation_angle(&self.rotation())
    }

    /// Compose a relative step into the pose, `pose <- step * pose`.
    ///
    /// The result is re-normalized so its homogeneous coordinate is 1. A step that
    /// would leave a zero or non-finite homogeneous coordinate is rejected and the
    /// pose is left untouched.
    pub fn accumulate(&mut self, step: &DMat4) -> Result<(), VoError> {
        let composed = *step * self.matrix;
        let w = composed.w_axis.w;
        if !w.is_finite() || w.abs() <= f64::EPSILON {
            return Err(VoError::EstimationFailure(
                "accumulated pose has a degenerate homogeneous coordinate",
            ));
        }
        let normalized = composed * (1.0 / w);
        if !normalized.is_finite() {
            return Err(VoError::EstimationFailure("accumulated pose is not finite"));
        }
        self.matrix = normalized;
        Ok(())
    }
}

/// Homogeneous transform of one step, `[R | s * t_unit]`.
pub fn relative_transform(rotation: &DMat3, translation: &DVec3, scale: f64) -> DMat4 {
    let t = translation.normalize_or_zero() * scale;
    DMat4::from_cols(
        rotation.x_axis.extend(0.0),
        rotation.y_axis.extend(0.0),
        rotation.z_axis.extend(0.0),
        DVec4::new(t.x, t.y, t.z, 1.0),
    )
}

/// Angle of a rotation matrix, in radians.
pub fn rotation_angle(rotation: &DMat3) -> f64 {
    let trace = rotation.x_axis.x + rotation.y_axis.y + rotation.z_axis.z;
    ((trace - 1.0) * 0.5).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_relative_transform_scales_unit_translation() {
        let r = DMat3::from_rotation_z(0.3);
        let step = relative_transform(&r, &DVec3::new(0.0, 0.0, 2.0), 0.1);
        let pose = Pose::from_matrix(step);
        assert_relative_eq!(pose.translation().z, 0.1, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation_angle(), 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_accumulate_left_multiplies() -> Result<(), Box<dyn std::error::Error>> {
        let mut pose = Pose::identity();
        let a = relative_transform(&DMat3::from_rotation_y(0.1), &DVec3::X, 0.5);
        let b = relative_transform(&DMat3::from_rotation_x(-0.2), &DVec3::Z, 0.25);
        pose.accumulate(&a)?;
        pose.accumulate(&b)?;
        let expected = b * a;
        assert!(pose.matrix().abs_diff_eq(expected, 1e-12));
        assert_relative_eq!(pose.matrix().w_axis.w, 1.0);
        Ok(())
    }

    #[test]
    fn test_accumulate_renormalizes_homogeneous_coordinate() -> Result<(), Box<dyn std::error::Error>>
    {
        let mut pose = Pose::identity();
        let mut step = relative_transform(&DMat3::IDENTITY, &DVec3::Z, 1.0);
        step *= 2.0;
        pose.accumulate(&step)?;
        assert_relative_eq!(pose.matrix().w_axis.w, 1.0);
        assert_relative_eq!(pose.translation().z, 1.0);
        Ok(())
    }

    #[test]
    fn test_accumulate_rejects_degenerate_step() {
        let mut pose = Pose::identity();
        assert!(pose.accumulate(&DMat4::ZERO).is_err());
        assert_eq!(pose, Pose::identity());
    }

    #[test]
    fn test_camera_position() {
        // camera moved forward by 0.1: points appear 0.1 closer, t = (0, 0, -0.1)
        let pose = Pose::from_matrix(relative_transform(&DMat3::IDENTITY, &-DVec3::Z, 0.1));
        assert_relative_eq!(pose.camera_position().z, 0.1, epsilon = 1e-12);
    }
}
