use crate::camera::CameraIntrinsics;
use crate::chirality::resolve_candidates;
use crate::config::OdometryConfig;
use crate::error::VoError;
use crate::essential::{decompose_essential, essential_from_fundamental, CandidateKind};
use crate::fundamental::{estimate_fundamental, FundamentalEstimate};
use crate::pose::{relative_transform, Pose};
use crate::scale::solve_scale;
use crate::source::{Correspondence, FeatureMatcher, Frame, FrameSource};
use crate::triangulation::ProjectionMatrix;
use glam::{DMat3, DMat4, DVec2, DVec3};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Phase of the odometry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No frame retained yet.
    #[default]
    Init,
    /// The last frame produced a pose update.
    Steady,
    /// The last frame was skipped; the previous key frame is kept.
    Skip,
}

/// The frame the next one is matched against, with the metric structure seen from it.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// The retained frame.
    pub frame: Frame,
    /// Metric 3D points in the frame's camera, keyed by feature index.
    pub structure: HashMap<usize, DVec3>,
}

/// State threaded through [`step`].
#[derive(Debug, Clone)]
pub struct OdometryState {
    /// Current phase.
    pub phase: Phase,
    /// Accumulated pose.
    pub pose: Pose,
    /// Retained key frame, `None` before the first frame.
    pub previous: Option<KeyFrame>,
    /// Scale applied by the last update, or the bootstrap scale.
    pub last_scale: f64,
}

impl Default for OdometryState {
    fn default() -> Self {
        Self::new(OdometryConfig::default().bootstrap_scale)
    }
}

impl OdometryState {
    /// Initial state of a sequence.
    pub fn new(bootstrap_scale: f64) -> Self {
        Self {
            phase: Phase::Init,
            pose: Pose::identity(),
            previous: None,
            last_scale: bootstrap_scale,
        }
    }
}

/// Where the length of a translation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleSource {
    /// Solved against structure triangulated in the previous step.
    Structure,
    /// Displacement between the platform positions of the two frames.
    Platform,
    /// Carried over from the previous step.
    Carried,
}

/// Diagnostics of a successful pose update.
#[derive(Debug, Clone)]
pub struct StepDiagnostics {
    /// Correspondences before outlier rejection.
    pub matches_before: usize,
    /// Correspondences after outlier rejection.
    pub inliers: usize,
    /// Mean inlier displacement, in pixels.
    pub mean_displacement: f64,
    /// The selected motion hypothesis.
    pub candidate: CandidateKind,
    /// Inliers triangulated in front of the cameras.
    pub positive_depth: usize,
    /// Length of the applied translation.
    pub scale: f64,
    /// Where `scale` came from.
    pub scale_source: ScaleSource,
    /// Mean reweighting iterations of the triangulation.
    pub mean_iterations: f64,
    /// Mean reprojection residual of the triangulation.
    pub mean_residual: f64,
    /// The applied step, `[R | s t]`.
    pub relative: DMat4,
}

/// Why a frame did not update the pose.
#[derive(Debug)]
pub enum SkipReason {
    /// The inliers moved less than the configured minimum.
    InsufficientMotion {
        /// Measured mean displacement, in pixels.
        mean_displacement: f64,
    },
    /// Estimation failed on this frame.
    Error(VoError),
}

/// What happened to a frame.
#[derive(Debug)]
pub enum StepOutcome {
    /// First frame of the sequence, retained as key frame.
    Initialized,
    /// The pose was updated.
    Updated(StepDiagnostics),
    /// The frame was skipped.
    Skipped(SkipReason),
}

/// Per-frame result of [`step`].
#[derive(Debug)]
pub struct StepReport {
    /// Index of the processed frame.
    pub frame_index: u64,
    /// Phase after the step.
    pub phase: Phase,
    /// What happened.
    pub outcome: StepOutcome,
    /// Pose after the step.
    pub pose: Pose,
}

/// Counters of a [`VisualOdometry::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Frames taken from the source.
    pub frames: usize,
    /// Frames that updated the pose.
    pub updates: usize,
    /// Frames that were skipped.
    pub skips: usize,
    /// Whether the run ended on the stop signal.
    pub stopped: bool,
    /// Final pose.
    pub pose: Pose,
}

/// Advance the odometry by one frame.
///
/// The first frame is only retained. Every following frame is matched against the
/// retained key frame through `matches`; on success the pose is updated and the
/// frame replaces the key frame, otherwise the frame is dropped and the state is
/// kept as it was, apart from the phase.
pub fn step(
    config: &OdometryConfig,
    intrinsics: &CameraIntrinsics,
    mut state: OdometryState,
    frame: Frame,
    matches: &[Correspondence],
) -> (OdometryState, StepReport) {
    let frame_index = frame.index;

    let Some(previous) = state.previous.take() else {
        log::debug!("frame {frame_index}: retained as first key frame");
        state.previous = Some(KeyFrame {
            frame,
            structure: HashMap::new(),
        });
        state.phase = Phase::Steady;
        let report = StepReport {
            frame_index,
            phase: state.phase,
            outcome: StepOutcome::Initialized,
            pose: state.pose,
        };
        return (state, report);
    };

    let result = estimate_step(
        config,
        intrinsics,
        &previous,
        &frame,
        matches,
        state.pose,
        state.last_scale,
    );

    let outcome = match result {
        Ok(Estimate::Motion {
            pose,
            diagnostics,
            structure,
        }) => {
            log::debug!(
                "frame {frame_index}: {} -> {} matches, displacement {:.2} px, {:?}, scale {:.4} ({:?})",
                diagnostics.matches_before,
                diagnostics.inliers,
                diagnostics.mean_displacement,
                diagnostics.candidate,
                diagnostics.scale,
                diagnostics.scale_source
            );
            state.pose = pose;
            state.last_scale = diagnostics.scale;
            state.previous = Some(KeyFrame { frame, structure });
            state.phase = Phase::Steady;
            StepOutcome::Updated(diagnostics)
        }
        Ok(Estimate::InsufficientMotion(mean_displacement)) => {
            log::info!(
                "frame {frame_index}: skipped, mean displacement {mean_displacement:.3} px below {}",
                config.min_displacement
            );
            state.previous = Some(previous);
            state.phase = Phase::Skip;
            StepOutcome::Skipped(SkipReason::InsufficientMotion { mean_displacement })
        }
        Err(err) => {
            log::info!("frame {frame_index}: skipped, {err}");
            state.previous = Some(previous);
            state.phase = Phase::Skip;
            StepOutcome::Skipped(SkipReason::Error(err))
        }
    };

    let report = StepReport {
        frame_index,
        phase: state.phase,
        outcome,
        pose: state.pose,
    };
    (state, report)
}

enum Estimate {
    Motion {
        pose: Pose,
        diagnostics: StepDiagnostics,
        structure: HashMap<usize, DVec3>,
    },
    InsufficientMotion(f64),
}

fn feature_pixel(frame: &Frame, index: usize) -> Result<DVec2, VoError> {
    frame
        .features
        .get(index)
        .map(|f| f.pixel())
        .ok_or(VoError::DegenerateInput("correspondence refers to a missing feature"))
}

#[allow(clippy::too_many_arguments)]
fn estimate_step(
    config: &OdometryConfig,
    intrinsics: &CameraIntrinsics,
    previous: &KeyFrame,
    frame: &Frame,
    matches: &[Correspondence],
    mut pose: Pose,
    last_scale: f64,
) -> Result<Estimate, VoError> {
    let mut previous_px = Vec::with_capacity(matches.len());
    let mut current_px = Vec::with_capacity(matches.len());
    for m in matches {
        previous_px.push(intrinsics.undistort_pixel(feature_pixel(&previous.frame, m.previous)?));
        current_px.push(intrinsics.undistort_pixel(feature_pixel(frame, m.current)?));
    }

    let fundamental = estimate_fundamental(&previous_px, &current_px, matches, &config.ransac)?;
    if fundamental.mean_displacement < config.min_displacement {
        return Ok(Estimate::InsufficientMotion(fundamental.mean_displacement));
    }

    let essential = essential_from_fundamental(&fundamental.fundamental, intrinsics.k());
    let candidates = decompose_essential(&essential, config.min_singular_value_ratio)?;

    // normalized coordinates of the surviving correspondences
    let mut previous_n = Vec::with_capacity(fundamental.matches.len());
    let mut current_n = Vec::with_capacity(fundamental.matches.len());
    for m in &fundamental.matches {
        previous_n.push(intrinsics.normalize_pixel(feature_pixel(&previous.frame, m.previous)?));
        current_n.push(intrinsics.normalize_pixel(feature_pixel(frame, m.current)?));
    }

    let best = resolve_candidates(
        candidates.as_slice(),
        &previous_n,
        &current_n,
        &config.chirality,
    )?;
    let rotation = best.candidate.rotation;
    let translation = best.candidate.translation;

    let (scale, scale_source) = select_scale(
        config,
        previous,
        frame,
        &fundamental,
        &current_n,
        &rotation,
        &translation,
        last_scale,
    );

    let structure = metric_structure(&fundamental.matches, &best.points, &rotation, &translation, scale);

    let diagnostics = StepDiagnostics {
        matches_before: fundamental.matches_before,
        inliers: fundamental.matches.len(),
        mean_displacement: fundamental.mean_displacement,
        candidate: best.kind(),
        positive_depth: best.positive_depth,
        scale,
        scale_source,
        mean_iterations: best.mean_iterations,
        mean_residual: best.mean_residual,
        relative: relative_transform(&rotation, &translation, scale),
    };
    pose.accumulate(&diagnostics.relative)?;
    Ok(Estimate::Motion {
        pose,
        diagnostics,
        structure,
    })
}

#[allow(clippy::too_many_arguments)]
fn select_scale(
    config: &OdometryConfig,
    previous: &KeyFrame,
    frame: &Frame,
    fundamental: &FundamentalEstimate,
    current_n: &[DVec2],
    rotation: &DMat3,
    translation: &DVec3,
    last_scale: f64,
) -> (f64, ScaleSource) {
    let mut observations = Vec::new();
    let mut points = Vec::new();
    for (m, x) in fundamental.matches.iter().zip(current_n.iter()) {
        if let Some(point) = previous.structure.get(&m.previous) {
            observations.push(*x);
            points.push(*point);
        }
    }

    if observations.len() >= config.min_scale_points {
        match solve_scale(&observations, &points, rotation, translation, &config.scale) {
            Ok(s) if s.is_finite() && s > 0.0 => return (s, ScaleSource::Structure),
            Ok(s) => log::warn!(
                "frame {}: rejected scale {s} from {} structure points",
                frame.index,
                observations.len()
            ),
            Err(err) => log::warn!("frame {}: scale from structure failed, {err}", frame.index),
        }
    } else if !previous.structure.is_empty() {
        log::warn!(
            "frame {}: only {} of {} required structure points tracked",
            frame.index,
            observations.len(),
            config.min_scale_points
        );
    }

    if let (Some(a), Some(b)) = (previous.frame.platform_position(), frame.platform_position()) {
        let d = (b - a).length();
        if d.is_finite() && d > f64::EPSILON {
            return (d, ScaleSource::Platform);
        }
        log::warn!("frame {}: platform did not move, ignoring its position", frame.index);
    }

    log::warn!("frame {}: carrying scale {last_scale}", frame.index);
    (last_scale, ScaleSource::Carried)
}

/// Express the triangulated inliers in the current camera, in metric units.
fn metric_structure(
    matches: &[Correspondence],
    points: &[Option<DVec3>],
    rotation: &DMat3,
    translation: &DVec3,
    scale: f64,
) -> HashMap<usize, DVec3> {
    let t = translation.normalize_or_zero();
    let p1 = ProjectionMatrix::identity();
    let p2 = ProjectionMatrix::from_motion(rotation, &t);
    matches
        .iter()
        .zip(points.iter())
        .filter_map(|(m, point)| {
            let point = (*point)?;
            if p1.depth(point) <= 0.0 || p2.depth(point) <= 0.0 {
                return None;
            }
            Some((m.current, (*rotation * point + t) * scale))
        })
        .collect()
}

/// Owning driver of the odometry pipeline.
pub struct VisualOdometry {
    config: OdometryConfig,
    intrinsics: CameraIntrinsics,
    state: OdometryState,
}

impl VisualOdometry {
    /// Create a driver.
    ///
    /// Fails with [`VoError::Configuration`] when the configuration is invalid.
    pub fn new(config: OdometryConfig, intrinsics: CameraIntrinsics) -> Result<Self, VoError> {
        config.validate()?;
        let state = OdometryState::new(config.bootstrap_scale);
        Ok(Self {
            config,
            intrinsics,
            state,
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &OdometryConfig {
        &self.config
    }

    /// Process one frame with its correspondences to the previous key frame.
    pub fn process(&mut self, frame: Frame, matches: &[Correspondence]) -> StepReport {
        let state = std::mem::take(&mut self.state);
        let (state, report) = step(&self.config, &self.intrinsics, state, frame, matches);
        self.state = state;
        report
    }

    /// The retained key frame, if any.
    pub fn previous_frame(&self) -> Option<&Frame> {
        self.state.previous.as_ref().map(|k| &k.frame)
    }

    /// The accumulated pose.
    pub fn pose(&self) -> &Pose {
        &self.state.pose
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Full state, e.g. to checkpoint it.
    pub fn state(&self) -> &OdometryState {
        &self.state
    }

    /// Run until the source is exhausted or `stop` is set.
    ///
    /// `stop` is checked before each frame is requested, so the frame being
    /// processed always finishes. Errors returned by `on_report` end the run.
    pub fn run<S, M, F>(
        &mut self,
        source: &mut S,
        matcher: &M,
        stop: &AtomicBool,
        mut on_report: F,
    ) -> Result<RunSummary, VoError>
    where
        S: FrameSource + ?Sized,
        M: FeatureMatcher + ?Sized,
        F: FnMut(&StepReport) -> Result<(), VoError>,
    {
        let mut summary = RunSummary {
            frames: 0,
            updates: 0,
            skips: 0,
            stopped: false,
            pose: self.state.pose,
        };

        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("stop requested after {} frames", summary.frames);
                summary.stopped = true;
                break;
            }
            let Some(frame) = source.next_frame() else {
                break;
            };

            let matches = match self.previous_frame() {
                Some(previous) => matcher.match_features(&previous.features, &frame.features),
                None => Vec::new(),
            };
            let report = self.process(frame, &matches);

            summary.frames += 1;
            match report.outcome {
                StepOutcome::Updated(_) => summary.updates += 1,
                StepOutcome::Skipped(_) => summary.skips += 1,
                StepOutcome::Initialized => {}
            }
            on_report(&report)?;
        }

        summary.pose = self.state.pose;
        Ok(summary)
    }
}
