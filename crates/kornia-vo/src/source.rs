use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;

/// A detected feature: pixel coordinate plus descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePoint {
    /// Pixel coordinate `[x, y]`.
    pub position: [f64; 2],
    /// Descriptor bytes produced by the feature extractor.
    #[serde(default)]
    pub descriptor: Vec<u8>,
}

impl FeaturePoint {
    /// Create a feature point.
    pub fn new(position: DVec2, descriptor: Vec<u8>) -> Self {
        Self {
            position: position.to_array(),
            descriptor,
        }
    }

    /// Pixel coordinate.
    pub fn pixel(&self) -> DVec2 {
        DVec2::from_array(self.position)
    }
}

/// A match between a feature of the previous frame and one of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Index into the previous frame's features.
    pub previous: usize,
    /// Index into the current frame's features.
    pub current: usize,
    /// Optional match quality, e.g. the descriptor distance.
    #[serde(default)]
    pub score: Option<f32>,
}

impl Correspondence {
    /// Create a correspondence without a score.
    pub fn new(previous: usize, current: usize) -> Self {
        Self {
            previous,
            current,
            score: None,
        }
    }

    /// Create a correspondence with a match score.
    pub fn with_score(previous: usize, current: usize, score: f32) -> Self {
        Self {
            previous,
            current,
            score: Some(score),
        }
    }
}

/// The features of one captured image and the platform metadata recorded with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Sequence number of the frame.
    pub index: u64,
    /// Features extracted from the image.
    pub features: Vec<FeaturePoint>,
    /// Position of the platform at capture time, if available.
    #[serde(default)]
    pub platform_position: Option<[f64; 3]>,
}

impl Frame {
    /// Create a frame without platform metadata.
    pub fn new(index: u64, features: Vec<FeaturePoint>) -> Self {
        Self {
            index,
            features,
            platform_position: None,
        }
    }

    /// Attach the platform position recorded at capture time.
    pub fn with_platform_position(mut self, position: DVec3) -> Self {
        self.platform_position = Some(position.to_array());
        self
    }

    /// Platform position, if recorded.
    pub fn platform_position(&self) -> Option<DVec3> {
        self.platform_position.map(DVec3::from_array)
    }
}

/// Supplies frames to the pipeline, one at a time.
pub trait FrameSource {
    /// The next frame, or `None` once the source is exhausted or failed.
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Matches the features of two frames.
pub trait FeatureMatcher {
    /// Correspondences between `previous` and `current` feature lists.
    fn match_features(&self, previous: &[FeaturePoint], current: &[FeaturePoint])
        -> Vec<Correspondence>;
}

/// Iterator-backed source, e.g. a recorded sequence held in memory.
pub struct IterSource<I>(pub I);

impl<I: Iterator<Item = Frame>> FrameSource for IterSource<I> {
    fn next_frame(&mut self) -> Option<Frame> {
        self.0.next()
    }
}

/// Consumer end of a producer thread, typically a bounded `sync_channel`.
impl FrameSource for Receiver<Frame> {
    fn next_frame(&mut self) -> Option<Frame> {
        self.recv().ok()
    }
}

/// Matches features that carry the same descriptor bytes.
///
/// Useful when descriptors are stable identifiers, as in recorded tracks or
/// synthetic data.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorIdentityMatcher;

impl FeatureMatcher for DescriptorIdentityMatcher {
    fn match_features(
        &self,
        previous: &[FeaturePoint],
        current: &[FeaturePoint],
    ) -> Vec<Correspondence> {
        let index = previous
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.descriptor.is_empty())
            .map(|(i, f)| (f.descriptor.as_slice(), i))
            .collect::<std::collections::HashMap<_, _>>();
        current
            .iter()
            .enumerate()
            .filter_map(|(j, f)| index.get(f.descriptor.as_slice()).map(|&i| Correspondence::new(i, j)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(x: f64, id: u8) -> FeaturePoint {
        FeaturePoint::new(DVec2::new(x, 2.0 * x), vec![id, 0, 7])
    }

    #[test]
    fn test_descriptor_identity_matcher() {
        let previous = vec![feature(1.0, 1), feature(2.0, 2), feature(3.0, 3)];
        let current = vec![feature(5.0, 3), feature(6.0, 9), feature(7.0, 1)];
        let matches = DescriptorIdentityMatcher.match_features(&previous, &current);
        assert_eq!(matches, vec![Correspondence::new(2, 0), Correspondence::new(0, 2)]);
    }

    #[test]
    fn test_channel_source_ends_when_sender_dropped() {
        let (tx, mut rx) = std::sync::mpsc::sync_channel(2);
        tx.send(Frame::new(0, vec![])).unwrap();
        tx.send(Frame::new(1, vec![])).unwrap();
        drop(tx);
        assert_eq!(rx.next_frame().map(|f| f.index), Some(0));
        assert_eq!(rx.next_frame().map(|f| f.index), Some(1));
        assert!(rx.next_frame().is_none());
    }

    #[test]
    fn test_frame_serde_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::new(4, vec![feature(1.5, 4)]).with_platform_position(DVec3::new(0.0, 0.0, 0.3));
        let json = serde_json::to_string(&frame)?;
        let back: Frame = serde_json::from_str(&json)?;
        assert_eq!(back, frame);
        assert_eq!(back.platform_position(), Some(DVec3::new(0.0, 0.0, 0.3)));
        Ok(())
    }
}
