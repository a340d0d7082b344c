//! Numeric backend
//!
//! The stacking engines only select, filter and compose; the pixel-level
//! primitives live here behind two seams:
//! - [`FeatureBackend`]: keypoints, descriptors and descriptor matching
//! - [`TransformSolver`]: robust model fitting from point correspondences
//!
//! [`NativeBackend`] and [`RansacSolver`] are the pure-Rust defaults. Filters,
//! pyramids, warping and colour conversion are plain functions.

pub mod color;
pub mod features;
pub mod filter;
pub mod plane;
pub mod pyramid;
pub mod ransac;
pub mod warp;

pub use features::{
    DMatch, DescriptorKind, Descriptors, DetectorKind, Features, KeyPoint, MatchMethod,
};
pub use plane::{Plane, Sample};
pub use ransac::{Estimate, RansacSolver, TransformKind};

use features::BriefPattern;
use image::GrayImage;
use nalgebra::Point2;

/// Keypoint detection, description and matching
pub trait FeatureBackend: Send + Sync {
    fn detect_and_compute(&self, image: &GrayImage) -> Features;

    /// Ordered correspondences from `query` into `train`. `threshold` is the
    /// ratio for [`MatchMethod::Knn`] and ignored otherwise.
    fn match_features(
        &self,
        query: &Features,
        train: &Features,
        method: MatchMethod,
        threshold: f32,
    ) -> Vec<DMatch>;
}

/// Robust estimation of a transform mapping `src` onto `dst`
pub trait TransformSolver: Send + Sync {
    fn estimate(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
        kind: TransformKind,
        threshold: f64,
    ) -> Option<Estimate>;
}

impl TransformSolver for RansacSolver {
    fn estimate(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
        kind: TransformKind,
        threshold: f64,
    ) -> Option<Estimate> {
        self.fit(src, dst, kind, threshold)
    }
}

#[derive(Debug, Clone)]
pub struct NativeBackend {
    pub detector: DetectorKind,
    pub descriptor: DescriptorKind,
    pub max_features: usize,
    pub fast_threshold: u8,
    pattern: BriefPattern,
}

impl NativeBackend {
    pub fn new(
        detector: DetectorKind,
        descriptor: DescriptorKind,
        max_features: usize,
        fast_threshold: u8,
    ) -> Self {
        Self {
            detector,
            descriptor,
            max_features,
            fast_threshold,
            pattern: BriefPattern::default(),
        }
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new(DetectorKind::Fast, DescriptorKind::Brief, 1000, 20)
    }
}

impl FeatureBackend for NativeBackend {
    fn detect_and_compute(&self, image: &GrayImage) -> Features {
        let keypoints = match self.detector {
            DetectorKind::Fast => features::fast_detect(image, self.fast_threshold, self.max_features),
            DetectorKind::Harris => features::harris_detect(image, self.max_features),
        };
        let smoothed = features::descriptor_smoothing(image);
        let descriptors = match self.descriptor {
            DescriptorKind::Brief => self.pattern.compute(&smoothed, &keypoints),
            DescriptorKind::Patch => features::patch_compute(&smoothed, &keypoints),
        };
        Features {
            keypoints,
            descriptors,
        }
    }

    fn match_features(
        &self,
        query: &Features,
        train: &Features,
        method: MatchMethod,
        threshold: f32,
    ) -> Vec<DMatch> {
        match method {
            MatchMethod::Knn => {
                features::knn_ratio_match(&query.descriptors, &train.descriptors, threshold)
            }
            MatchMethod::Hamming => {
                features::cross_check_match(&query.descriptors, &train.descriptors)
            }
        }
    }
}
