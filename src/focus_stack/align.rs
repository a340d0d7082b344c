//! Feature-based frame registration
//!
//! Each non-reference frame is matched against its effective reference,
//! a transform is estimated robustly and the frame is warped onto the
//! reference raster. Too few matches, or no consensus model, is fatal for the
//! whole job.

use super::actions::{ActionSummary, FrameAction, SequenceContext, StepInput};
use crate::backend::filter::{box_downscale, gaussian_blur};
use crate::backend::warp::{coverage_mask, warp_plane, Border};
use crate::backend::{
    DescriptorKind, DetectorKind, FeatureBackend, MatchMethod, NativeBackend, Plane,
    RansacSolver, TransformKind, TransformSolver,
};
use crate::errors::{AlignmentFailure, Result, StackError};
use crate::types::Frame;
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Gaussian kernel used to fill uncovered borders
const BORDER_BLUR_KERNEL: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderMode {
    Constant,
    Replicate,
    /// Replicate, then replace uncovered pixels with a blurred copy
    ReplicateBlur,
}

impl FromStr for BorderMode {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "replicate" => Ok(Self::Replicate),
            "replicate_blur" => Ok(Self::ReplicateBlur),
            _ => Err(StackError::configuration("border_mode", s)),
        }
    }
}

/// Detector and descriptor selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub detector: DetectorKind,
    pub descriptor: DescriptorKind,
    pub max_features: usize,
    /// FAST intensity threshold
    pub fast_threshold: u8,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Fast,
            descriptor: DescriptorKind::Brief,
            max_features: 1000,
            fast_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    pub features: FeatureConfig,
    pub match_method: MatchMethod,
    /// Ratio for KNN matching
    pub match_threshold: f32,
    pub transform: TransformKind,
    /// Maximum reprojection error of an inlier, in pixels
    pub ransac_threshold: f64,
    pub ransac_max_iterations: usize,
    pub ransac_confidence: f64,
    pub seed: u64,
    pub border_mode: BorderMode,
    /// Fill value per channel for [`BorderMode::Constant`]
    pub border_value: [f64; 3],
    /// Sigma of the border blur
    pub border_blur: f64,
    /// Detect features on images downscaled by this factor
    pub subsample: u32,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            match_method: MatchMethod::Knn,
            match_threshold: 0.75,
            transform: TransformKind::Rigid,
            ransac_threshold: 5.0,
            ransac_max_iterations: 2000,
            ransac_confidence: 0.995,
            seed: 0,
            border_mode: BorderMode::ReplicateBlur,
            border_value: [0.0; 3],
            border_blur: 50.0,
            subsample: 1,
        }
    }
}

impl AlignConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.features.descriptor.supports(self.match_method) {
            return Err(StackError::configuration(
                "match_method",
                format!("{:?} with {:?} descriptors", self.match_method, self.features.descriptor),
            ));
        }
        if self.match_method == MatchMethod::Knn
            && !(self.match_threshold > 0.0 && self.match_threshold <= 1.0)
        {
            return Err(StackError::configuration("match_threshold", self.match_threshold));
        }
        if !(self.ransac_threshold > 0.0) {
            return Err(StackError::configuration("ransac_threshold", self.ransac_threshold));
        }
        if self.ransac_max_iterations == 0 {
            return Err(StackError::configuration("ransac_max_iterations", 0));
        }
        if !(self.ransac_confidence > 0.0 && self.ransac_confidence < 1.0) {
            return Err(StackError::configuration("ransac_confidence", self.ransac_confidence));
        }
        if self.subsample == 0 {
            return Err(StackError::configuration("subsample", 0));
        }
        if self.features.max_features == 0 {
            return Err(StackError::configuration("max_features", 0));
        }
        if self.border_blur < 0.0 {
            return Err(StackError::configuration("border_blur", self.border_blur));
        }
        Ok(())
    }
}

/// Estimated mapping from a candidate onto the reference
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub matrix: Matrix3<f64>,
    pub kind: TransformKind,
    pub inliers: Vec<bool>,
    pub matches: usize,
}

impl Transform {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&i| i).count()
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.matrix - Matrix3::identity()).abs().max() <= tolerance
    }
}

#[derive(Debug, Clone)]
pub struct Aligned {
    pub frame: Frame,
    pub transform: Transform,
}

pub struct AlignmentEngine {
    config: AlignConfig,
    features: Box<dyn FeatureBackend>,
    solver: Box<dyn TransformSolver>,
    matches: Vec<Option<usize>>,
}

impl AlignmentEngine {
    pub fn new(config: AlignConfig) -> Result<Self> {
        let features = NativeBackend::new(
            config.features.detector,
            config.features.descriptor,
            config.features.max_features,
            config.features.fast_threshold,
        );
        let solver = RansacSolver::new(
            config.ransac_max_iterations,
            config.ransac_confidence,
            config.seed,
        );
        Self::with_backend(config, Box::new(features), Box::new(solver))
    }

    pub fn with_backend(
        config: AlignConfig,
        features: Box<dyn FeatureBackend>,
        solver: Box<dyn TransformSolver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            features,
            solver,
            matches: Vec::new(),
        })
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    /// Match count per frame index; `None` for the reference and unvisited frames
    pub fn match_counts(&self) -> &[Option<usize>] {
        &self.matches
    }

    /// Register `candidate` (frame `index`) onto `reference`.
    pub fn align(&self, reference: &Frame, candidate: &Frame, index: usize) -> Result<Aligned> {
        reference.meta().validate(candidate)?;

        let transform = self.estimate(reference, candidate, index)?;
        let inverse = transform
            .matrix
            .try_inverse()
            .filter(|m| m.iter().all(|v| v.is_finite()))
            .ok_or_else(|| StackError::alignment(index, AlignmentFailure::DegenerateTransform))?;

        log::debug!(
            "Frame {}: {} matches, {} inliers",
            index,
            transform.matches,
            transform.inlier_count()
        );
        let frame = self.warp(candidate, &inverse)?;
        Ok(Aligned { frame, transform })
    }

    fn estimate(&self, reference: &Frame, candidate: &Frame, index: usize) -> Result<Transform> {
        let scale = self.config.subsample;
        let (mut ref_gray, mut cand_gray) = (reference.to_gray8(), candidate.to_gray8());
        if scale > 1 {
            ref_gray = box_downscale(&ref_gray, scale);
            cand_gray = box_downscale(&cand_gray, scale);
        }

        let ref_features = self.features.detect_and_compute(&ref_gray);
        let cand_features = self.features.detect_and_compute(&cand_gray);
        let matches = self.features.match_features(
            &cand_features,
            &ref_features,
            self.config.match_method,
            self.config.match_threshold,
        );

        let kind = self.config.transform;
        let required = kind.min_matches();
        if matches.len() < required {
            return Err(StackError::alignment(
                index,
                AlignmentFailure::TooFewMatches {
                    found: matches.len(),
                    required,
                },
            ));
        }

        // Keypoints found on a downscaled image map back to pixel centres
        let s = scale as f64;
        let full = |x: f32, y: f32| Point2::new((x as f64 + 0.5) * s - 0.5, (y as f64 + 0.5) * s - 0.5);
        let (src, dst): (Vec<_>, Vec<_>) = matches
            .iter()
            .map(|m| {
                let q = &cand_features.keypoints[m.query];
                let t = &ref_features.keypoints[m.train];
                (full(q.x, q.y), full(t.x, t.y))
            })
            .unzip();

        let estimate = self
            .solver
            .estimate(&src, &dst, kind, self.config.ransac_threshold)
            .ok_or_else(|| {
                StackError::alignment(
                    index,
                    AlignmentFailure::NoTransform {
                        matches: matches.len(),
                    },
                )
            })?;

        Ok(Transform {
            matrix: estimate.matrix,
            kind,
            inliers: estimate.inliers,
            matches: matches.len(),
        })
    }

    /// Warp every channel of `frame`; `inverse` maps reference pixels into `frame`.
    pub fn warp(&self, frame: &Frame, inverse: &Matrix3<f64>) -> Result<Frame> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let mask = match self.config.border_mode {
            BorderMode::ReplicateBlur => Some(coverage_mask(w, h, inverse)),
            _ => None,
        };

        let planes: Vec<Plane<f64>> = (0..frame.channels() as usize)
            .map(|c| {
                let src = frame.channel_plane::<f64>(c);
                let border = match self.config.border_mode {
                    BorderMode::Constant => Border::Constant(self.config.border_value[c.min(2)]),
                    BorderMode::Replicate | BorderMode::ReplicateBlur => Border::Replicate,
                };
                let warped = warp_plane(&src, inverse, border);
                match &mask {
                    Some(mask) if mask.iter().any(|&covered| !covered) => {
                        let blurred =
                            gaussian_blur(&warped, BORDER_BLUR_KERNEL, self.config.border_blur);
                        let data = warped
                            .data()
                            .iter()
                            .zip(blurred.data())
                            .zip(mask)
                            .map(|((&v, &b), &covered)| if covered { v } else { b })
                            .collect();
                        Plane::from_vec(w, h, data)
                    }
                    _ => warped,
                }
            })
            .collect();

        Frame::from_planes(&planes, frame.depth())
    }
}

impl FrameAction for AlignmentEngine {
    fn name(&self) -> &str {
        "align"
    }

    fn begin(&mut self, ctx: &SequenceContext<'_>) -> Result<()> {
        self.matches = vec![None; ctx.frames.len()];
        Ok(())
    }

    fn run_frame(&mut self, input: &StepInput<'_>, frame: Frame) -> Result<Option<Frame>> {
        if input.is_reference() {
            return Ok(Some(frame));
        }
        let aligned = self.align(input.reference, &frame, input.step.index)?;
        if let Some(slot) = self.matches.get_mut(input.step.index) {
            *slot = Some(aligned.transform.matches);
        }
        log::info!(
            "Aligned {} ({} matches)",
            input.name,
            aligned.transform.matches
        );
        Ok(Some(aligned.frame))
    }

    fn summary(&self) -> ActionSummary {
        ActionSummary {
            action: "align".to_string(),
            metric: "matches".to_string(),
            values: self
                .matches
                .iter()
                .map(|m| m.map(|n| vec![n as f64]).unwrap_or_default())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DMatch, Estimate, Features};
    use crate::testing::synthetic_data::{shifted_frame, textured_frame};
    use image::GrayImage;

    #[test]
    fn test_patch_descriptor_rejects_hamming() {
        let mut config = AlignConfig::default();
        config.features.descriptor = DescriptorKind::Patch;
        config.match_method = MatchMethod::Hamming;
        assert!(matches!(
            AlignmentEngine::new(config),
            Err(StackError::Configuration { .. })
        ));
    }

    #[test]
    fn test_self_alignment_is_identity() {
        let frame = textured_frame(96, 96, 11);
        let engine = AlignmentEngine::new(AlignConfig::default()).unwrap();
        let aligned = engine.align(&frame, &frame, 1).unwrap();
        assert!(aligned.transform.is_identity(1e-6));
        assert_eq!(aligned.frame, frame);
    }

    #[test]
    fn test_recovers_translation() {
        let reference = textured_frame(120, 120, 5);
        let candidate = shifted_frame(&reference, 3, -2);
        let engine = AlignmentEngine::new(AlignConfig::default()).unwrap();
        let aligned = engine.align(&reference, &candidate, 0).unwrap();
        let m = aligned.transform.matrix;
        // candidate (x, y) holds reference (x - 3, y + 2)
        assert!((m[(0, 2)] + 3.0).abs() < 0.5, "tx = {}", m[(0, 2)]);
        assert!((m[(1, 2)] - 2.0).abs() < 0.5, "ty = {}", m[(1, 2)]);
    }

    #[test]
    fn test_flat_frames_fail_with_too_few_matches() {
        let flat = Frame::from_u8(64, 64, 1, vec![128; 64 * 64]).unwrap();
        let engine = AlignmentEngine::new(AlignConfig::default()).unwrap();
        let err = engine.align(&flat, &flat, 3).unwrap_err();
        match err {
            StackError::Alignment {
                frame: 3,
                failure: AlignmentFailure::TooFewMatches { found: 0, required: 3 },
            } => {}
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_homography_requires_four_matches() {
        struct ThreeMatches;
        impl FeatureBackend for ThreeMatches {
            fn detect_and_compute(&self, _image: &GrayImage) -> Features {
                Features {
                    keypoints: Vec::new(),
                    descriptors: crate::backend::Descriptors::Binary(Vec::new()),
                }
            }
            fn match_features(
                &self,
                _query: &Features,
                _train: &Features,
                _method: MatchMethod,
                _threshold: f32,
            ) -> Vec<DMatch> {
                vec![
                    DMatch {
                        query: 0,
                        train: 0,
                        distance: 0.0
                    };
                    3
                ]
            }
        }
        struct Never;
        impl TransformSolver for Never {
            fn estimate(
                &self,
                _src: &[Point2<f64>],
                _dst: &[Point2<f64>],
                _kind: TransformKind,
                _threshold: f64,
            ) -> Option<Estimate> {
                None
            }
        }

        let frame = textured_frame(32, 32, 1);
        let config = AlignConfig {
            transform: TransformKind::Homography,
            ..AlignConfig::default()
        };
        let engine =
            AlignmentEngine::with_backend(config, Box::new(ThreeMatches), Box::new(Never)).unwrap();
        let err = engine.align(&frame, &frame, 2).unwrap_err();
        assert!(matches!(
            err,
            StackError::Alignment {
                failure: AlignmentFailure::TooFewMatches {
                    found: 3,
                    required: 4
                },
                ..
            }
        ));
    }

    #[test]
    fn test_replicate_blur_fills_uncovered_border() {
        let frame = Frame::from_u8(40, 40, 1, vec![200; 1600]).unwrap();
        let engine = AlignmentEngine::new(AlignConfig {
            border_mode: BorderMode::Constant,
            ..AlignConfig::default()
        })
        .unwrap();
        let mut shift = Matrix3::identity();
        shift[(0, 2)] = 10.0;
        let warped = engine.warp(&frame, &shift).unwrap();
        assert_eq!(warped.sample(39, 0), 0);

        let engine = AlignmentEngine::new(AlignConfig::default()).unwrap();
        let warped = engine.warp(&frame, &shift).unwrap();
        assert_eq!(warped.sample(39, 0), 200);
    }
}
