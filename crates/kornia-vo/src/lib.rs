#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Camera intrinsics, lens distortion and point normalization.
pub mod camera;

/// Triangulation-based disambiguation of the four motion hypotheses.
pub mod chirality;

/// Odometry configuration.
pub mod config;

/// Error types.
pub mod error;

/// Essential matrix construction and decomposition.
pub mod essential;

/// Robust fundamental matrix estimation.
pub mod fundamental;

/// Isotropic normalization of point correspondences.
pub mod normalize;

/// Per-frame pipeline driver and state machine.
pub mod pipeline;

/// Accumulated camera pose.
pub mod pose;

/// Absolute scale recovery.
pub mod scale;

/// Frame and correspondence collaborators.
pub mod source;

/// Synthetic scenes and correspondences for tests, benches and demos.
pub mod synthetic;

/// Two-view triangulation.
pub mod triangulation;

mod linalg;

pub use error::{ErrorKind, VoError};
