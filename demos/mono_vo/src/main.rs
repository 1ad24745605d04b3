use argh::FromArgs;
use glam::DVec3;
use kornia_vo::{
    camera::CameraIntrinsics,
    config::OdometryConfig,
    pipeline::{SkipReason, StepOutcome, StepReport, VisualOdometry},
    source::{Correspondence, FeatureMatcher, FeaturePoint, Frame},
    synthetic::{trajectory, SyntheticScene},
    VoError,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::sync_channel,
    Arc,
};

#[derive(FromArgs)]
/// Run monocular visual odometry over a feature sequence and print one JSON line per frame
struct Args {
    /// camera intrinsics JSON file
    #[argh(option)]
    intrinsics: Option<PathBuf>,

    /// run with identity intrinsics when no intrinsics file is given
    #[argh(switch)]
    allow_default_intrinsics: bool,

    /// odometry configuration JSON file
    #[argh(option)]
    config: Option<PathBuf>,

    /// JSON file holding an array of frames
    #[argh(option)]
    sequence: Option<PathBuf>,

    /// generate a synthetic sequence with this many frames instead
    #[argh(option)]
    synthetic: Option<usize>,

    /// capacity of the frame queue
    #[argh(option, default = "4")]
    queue_size: usize,

    /// maximum Hamming distance of a descriptor match
    #[argh(option, default = "64")]
    max_distance: u32,
}

/// Brute-force descriptor matcher with cross check.
struct HammingMatcher {
    max_distance: u32,
}

impl HammingMatcher {
    fn distance(a: &[u8], b: &[u8]) -> Option<u32> {
        if a.is_empty() || a.len() != b.len() {
            return None;
        }
        Some(a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum())
    }

    fn best(&self, query: &FeaturePoint, train: &[FeaturePoint]) -> Option<(usize, u32)> {
        train
            .iter()
            .enumerate()
            .filter_map(|(j, t)| Self::distance(&query.descriptor, &t.descriptor).map(|d| (j, d)))
            .filter(|(_, d)| *d <= self.max_distance)
            .min_by_key(|(_, d)| *d)
    }
}

impl FeatureMatcher for HammingMatcher {
    fn match_features(
        &self,
        previous: &[FeaturePoint],
        current: &[FeaturePoint],
    ) -> Vec<Correspondence> {
        previous
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                let (j, d) = self.best(p, current)?;
                // keep mutual nearest neighbours only
                let (back, _) = self.best(&current[j], previous)?;
                (back == i).then_some(Correspondence::with_score(i, j, d as f32))
            })
            .collect()
    }
}

fn load_frames(args: &Args) -> Result<(Vec<Frame>, Option<CameraIntrinsics>), VoError> {
    match (&args.sequence, args.synthetic) {
        (Some(path), None) => {
            let contents = std::fs::read_to_string(path)?;
            Ok((serde_json::from_str(&contents)?, None))
        }
        (None, Some(num_frames)) => {
            let camera = SyntheticScene::default_camera()?;
            let poses = trajectory(num_frames, DVec3::new(0.02, 0.0, 0.1), 0.005);
            let frames = SyntheticScene::random(300, 0).frames(&camera, &poses, 0.5, 1)?;
            Ok((frames, Some(camera)))
        }
        _ => Err(VoError::Configuration(
            "exactly one of --sequence or --synthetic is required".to_string(),
        )),
    }
}

fn report_json(report: &StepReport) -> serde_json::Value {
    let (outcome, details) = match &report.outcome {
        StepOutcome::Initialized => ("initialized", serde_json::Value::Null),
        StepOutcome::Updated(d) => (
            "updated",
            serde_json::json!({
                "matches_before": d.matches_before,
                "inliers": d.inliers,
                "mean_displacement": d.mean_displacement,
                "candidate": format!("{:?}", d.candidate),
                "positive_depth": d.positive_depth,
                "scale": d.scale,
                "scale_source": format!("{:?}", d.scale_source),
                "mean_iterations": d.mean_iterations,
                "mean_residual": d.mean_residual,
            }),
        ),
        StepOutcome::Skipped(SkipReason::InsufficientMotion { mean_displacement }) => (
            "skipped",
            serde_json::json!({ "mean_displacement": mean_displacement }),
        ),
        StepOutcome::Skipped(SkipReason::Error(err)) => (
            "skipped",
            serde_json::json!({ "kind": format!("{:?}", err.kind()), "error": err.to_string() }),
        ),
    };
    serde_json::json!({
        "frame": report.frame_index,
        "phase": format!("{:?}", report.phase),
        "outcome": outcome,
        "details": details,
        "position": report.pose.camera_position().to_array(),
        "rotation_deg": report.pose.rotation_angle().to_degrees(),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let config = match &args.config {
        Some(path) => OdometryConfig::from_json_file(path)?,
        None => OdometryConfig::default(),
    };

    let (frames, synthetic_camera) = load_frames(&args)?;

    let intrinsics = match (&args.intrinsics, synthetic_camera) {
        (Some(path), _) => CameraIntrinsics::from_json_file(path)?,
        (None, Some(camera)) => camera,
        (None, None) if args.allow_default_intrinsics => {
            log::warn!("no intrinsics given, treating pixels as normalized coordinates");
            CameraIntrinsics::identity()
        }
        (None, None) => {
            return Err(VoError::Configuration(
                "--intrinsics is required (or pass --allow-default-intrinsics)".to_string(),
            )
            .into())
        }
    };

    let mut vo = VisualOdometry::new(config, intrinsics)?;

    // create a cancel token to stop the odometry
    let cancel_token = Arc::new(AtomicBool::new(false));

    ctrlc::set_handler({
        let cancel_token = cancel_token.clone();
        move || {
            log::info!("Received Ctrl-C signal. Sending cancel signal !!");
            cancel_token.store(true, Ordering::SeqCst);
        }
    })?;

    // the producer feeds a bounded queue; it stops once the consumer hangs up
    let (tx, mut rx) = sync_channel::<Frame>(args.queue_size.max(1));
    let producer = std::thread::spawn(move || {
        for frame in frames {
            if tx.send(frame).is_err() {
                break;
            }
        }
    });

    let matcher = HammingMatcher {
        max_distance: args.max_distance,
    };
    let stdout = std::io::stdout();
    let summary = vo.run(&mut rx, &matcher, &cancel_token, |report| {
        let mut out = stdout.lock();
        writeln!(out, "{}", report_json(report))?;
        Ok(())
    })?;

    drop(rx);
    if producer.join().is_err() {
        log::error!("frame producer panicked");
    }

    let position = summary.pose.camera_position();
    log::info!(
        "processed {} frames: {} updates, {} skips{}; final position [{:.3}, {:.3}, {:.3}]",
        summary.frames,
        summary.updates,
        summary.skips,
        if summary.stopped { " (stopped)" } else { "" },
        position.x,
        position.y,
        position.z
    );

    Ok(())
}
