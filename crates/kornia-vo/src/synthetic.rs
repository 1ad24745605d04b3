use crate::camera::CameraIntrinsics;
use crate::error::VoError;
use crate::source::{Correspondence, FeaturePoint, Frame};
use glam::{DMat3, DVec2, DVec3};
use rand::prelude::*;
use rand::SeedableRng;

/// A rigid transform `X' = R X + t` mapping points of one frame into another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidMotion {
    /// Rotation part.
    pub rotation: DMat3,
    /// Translation part.
    pub translation: DVec3,
}

impl Default for RigidMotion {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidMotion {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: DMat3::IDENTITY,
            translation: DVec3::ZERO,
        }
    }

    /// Build a motion from a rotation vector (axis times angle, radians) and a translation.
    pub fn from_axis_angle(rotvec: DVec3, translation: DVec3) -> Self {
        let angle = rotvec.length();
        let rotation = if angle > f64::EPSILON {
            DMat3::from_axis_angle(rotvec / angle, angle)
        } else {
            DMat3::IDENTITY
        };
        Self {
            rotation,
            translation,
        }
    }

    /// World-to-camera transform of a camera centred at `center` with orientation `orientation`.
    ///
    /// `orientation` maps camera axes to world axes.
    pub fn from_camera_center(orientation: DMat3, center: DVec3) -> Self {
        let rotation = orientation.transpose();
        Self {
            rotation,
            translation: -(rotation * center),
        }
    }

    /// Transform a point.
    pub fn apply(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.translation
    }

    /// Camera centre, when the motion is a world-to-camera transform.
    pub fn camera_center(&self) -> DVec3 {
        -(self.rotation.transpose() * self.translation)
    }

    /// Motion taking coordinates of camera `from` into camera `to`.
    ///
    /// Both arguments are world-to-camera transforms.
    pub fn between(from: &RigidMotion, to: &RigidMotion) -> Self {
        let rotation = to.rotation * from.rotation.transpose();
        Self {
            rotation,
            translation: to.translation - rotation * from.translation,
        }
    }
}

/// Two views of a synthetic scene.
#[derive(Debug, Clone)]
pub struct TwoViewSample {
    /// Pixels in the first view.
    pub previous: Vec<DVec2>,
    /// Pixels in the second view.
    pub current: Vec<DVec2>,
    /// Identity correspondences, `i <-> i`.
    pub matches: Vec<Correspondence>,
    /// The observed points, in the frame of the first view.
    pub points: Vec<DVec3>,
}

/// A cloud of 3D landmarks.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Landmark positions in world coordinates.
    pub points: Vec<DVec3>,
}

impl SyntheticScene {
    /// Uniformly distributed landmarks in front of the world origin.
    ///
    /// `x` and `y` lie in `[-2, 2]` and the depth in `[4, 10]`.
    pub fn random(num_points: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                DVec3::new(
                    rng.random_range(-2.0..2.0),
                    rng.random_range(-2.0..2.0),
                    rng.random_range(4.0..10.0),
                )
            })
            .collect();
        Self { points }
    }

    /// Distortion-free 640x480 camera with a 500 px focal length.
    pub fn default_camera() -> Result<CameraIntrinsics, VoError> {
        CameraIntrinsics::from_pinhole(500.0, 500.0, 320.0, 240.0)
    }

    /// Observe the scene from the world origin and from `motion`.
    ///
    /// Landmarks behind either camera are dropped. Each pixel is perturbed by
    /// uniform noise in `[-noise_px, noise_px]`.
    pub fn observe(
        &self,
        camera: &CameraIntrinsics,
        motion: &RigidMotion,
        noise_px: f64,
        seed: u64,
    ) -> Result<TwoViewSample, VoError> {
        let mut noise = PixelNoise::new(noise_px, seed)?;
        let mut sample = TwoViewSample {
            previous: Vec::with_capacity(self.points.len()),
            current: Vec::with_capacity(self.points.len()),
            matches: Vec::with_capacity(self.points.len()),
            points: Vec::with_capacity(self.points.len()),
        };

        for point in &self.points {
            let (Some(a), Some(b)) = (
                camera.project_point(*point),
                camera.project_point(motion.apply(*point)),
            ) else {
                continue;
            };
            let i = sample.points.len();
            sample.previous.push(a + noise.sample());
            sample.current.push(b + noise.sample());
            sample.matches.push(Correspondence::new(i, i));
            sample.points.push(*point);
        }

        if sample.points.is_empty() {
            return Err(VoError::DegenerateInput("no landmark is visible in both views"));
        }
        Ok(sample)
    }

    /// Render one [`Frame`] per camera pose.
    ///
    /// `poses` are world-to-camera transforms. Every visible landmark becomes a
    /// feature whose descriptor is the landmark id, so frames can be matched with
    /// [`crate::source::DescriptorIdentityMatcher`]. Each frame records its camera
    /// centre as platform position.
    pub fn frames(
        &self,
        camera: &CameraIntrinsics,
        poses: &[RigidMotion],
        noise_px: f64,
        seed: u64,
    ) -> Result<Vec<Frame>, VoError> {
        let mut noise = PixelNoise::new(noise_px, seed)?;
        let frames = poses
            .iter()
            .enumerate()
            .map(|(index, pose)| {
                let features = self
                    .points
                    .iter()
                    .enumerate()
                    .filter_map(|(id, point)| {
                        let pixel = camera.project_point(pose.apply(*point))?;
                        Some(FeaturePoint::new(
                            pixel + noise.sample(),
                            (id as u32).to_le_bytes().to_vec(),
                        ))
                    })
                    .collect();
                Frame::new(index as u64, features).with_platform_position(pose.camera_center())
            })
            .collect();
        Ok(frames)
    }
}

/// Camera poses of a platform moving by `step` per frame while yawing by `yaw_per_frame` radians.
///
/// Returned as world-to-camera transforms, the first one being the identity.
pub fn trajectory(num_frames: usize, step: DVec3, yaw_per_frame: f64) -> Vec<RigidMotion> {
    (0..num_frames)
        .map(|k| {
            let k = k as f64;
            RigidMotion::from_camera_center(DMat3::from_rotation_y(k * yaw_per_frame), step * k)
        })
        .collect()
}

struct PixelNoise {
    rng: StdRng,
    amplitude: f64,
}

impl PixelNoise {
    fn new(amplitude: f64, seed: u64) -> Result<Self, VoError> {
        if !(amplitude.is_finite() && amplitude >= 0.0) {
            return Err(VoError::Configuration(format!(
                "pixel noise must be non-negative, got {amplitude}"
            )));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            amplitude,
        })
    }

    fn sample(&mut self) -> DVec2 {
        if self.amplitude == 0.0 {
            return DVec2::ZERO;
        }
        DVec2::new(
            self.rng.random_range(-self.amplitude..=self.amplitude),
            self.rng.random_range(-self.amplitude..=self.amplitude),
        )
    }
}
