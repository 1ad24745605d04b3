use thiserror::Error;

/// Error types for the visual odometry pipeline.
#[derive(Debug, Error)]
pub enum VoError {
    /// Not enough correspondences for the requested estimator.
    #[error("Need at least {required} correspondences, got {actual}")]
    TooFewCorrespondences {
        /// Minimum number of correspondences required.
        required: usize,
        /// Actual number of correspondences provided.
        actual: usize,
    },

    /// Two index-aligned inputs have different lengths.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedLengths {
        /// Label for the left-hand slice.
        left_name: &'static str,
        /// Length of the left-hand slice.
        left_len: usize,
        /// Label for the right-hand slice.
        right_name: &'static str,
        /// Length of the right-hand slice.
        right_len: usize,
    },

    /// The input admits no well-defined answer (empty sets, zero spread, zero norms).
    #[error("Degenerate input: {0}")]
    DegenerateInput(&'static str),

    /// The two largest singular values of the essential matrix are too far apart.
    #[error("Ill-conditioned geometry: singular value ratio {ratio:.4} is below {min_ratio:.4}")]
    IllConditionedGeometry {
        /// Observed ratio in `[0, 1]`.
        ratio: f64,
        /// Minimum accepted ratio.
        min_ratio: f64,
    },

    /// A robust or geometric estimator could not find a consistent model.
    #[error("Estimation failure: {0}")]
    EstimationFailure(&'static str),

    /// Missing or invalid configuration or intrinsics.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to read a configuration file.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a configuration file.
    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of [`VoError`] used by the pipeline driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Too few or degenerate correspondences; the frame is skipped.
    DegenerateInput,
    /// Insufficient parallax or a noisy estimate; the frame is skipped.
    IllConditionedGeometry,
    /// No consistent model; the frame is skipped.
    EstimationFailure,
    /// Fatal, reported before any frame is processed.
    Configuration,
}

impl VoError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoError::TooFewCorrespondences { .. }
            | VoError::MismatchedLengths { .. }
            | VoError::DegenerateInput(_) => ErrorKind::DegenerateInput,
            VoError::IllConditionedGeometry { .. } => ErrorKind::IllConditionedGeometry,
            VoError::EstimationFailure(_) => ErrorKind::EstimationFailure,
            VoError::Configuration(_) | VoError::Io(_) | VoError::Json(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Whether the error must stop the run instead of skipping the current frame.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

pub(crate) fn check_same_len(
    left_name: &'static str,
    left_len: usize,
    right_name: &'static str,
    right_len: usize,
) -> Result<(), VoError> {
    if left_len != right_len {
        return Err(VoError::MismatchedLengths {
            left_name,
            left_len,
            right_name,
            right_len,
        });
    }
    Ok(())
}
