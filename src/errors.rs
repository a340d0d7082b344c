//! Error taxonomy for the stacking pipeline
//!
//! Every fatal condition in a job surfaces as a [`StackError`]. Cancellation
//! travels through the same channel but is not a failure; callers separate the
//! two with [`StackError::is_cancellation`].

use crate::types::{BitDepth, Shape};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StackError>;

/// Why a single frame could not be registered against the reference
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignmentFailure {
    /// Matching produced fewer correspondences than the transform needs
    #[error("not enough matches ({found} found, {required} required)")]
    TooFewMatches { found: usize, required: usize },
    /// The robust estimator found no consensus model
    #[error("no transform found from {matches} matches")]
    NoTransform { matches: usize },
    /// The estimated matrix cannot be inverted for warping
    #[error("estimated transform is singular")]
    DegenerateTransform,
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("Invalid configuration: {option} = {value}")]
    Configuration { option: String, value: String },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("Bit depth mismatch: expected {expected}, got {got}")]
    BitDepthMismatch { expected: BitDepth, got: BitDepth },

    #[error("Frame data corruption: got {frame_size} samples, expected {expected_size}")]
    DataCorruption {
        frame_size: usize,
        expected_size: usize,
    },

    #[error("Alignment failed for frame {frame}: {failure}")]
    Alignment {
        frame: usize,
        failure: AlignmentFailure,
    },

    #[error("Failed to load {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Failed to write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Insufficient frames: need {required}, got {provided}")]
    InsufficientFrames { required: usize, provided: usize },

    #[error("Reference frame {index} is not available")]
    ReferenceUnavailable { index: usize },

    #[error("Noise map marks {count} hot pixels, at most {limit} can be repaired")]
    TooManyHotPixels { count: usize, limit: usize },

    #[error("Cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackError {
    pub fn configuration(option: impl Into<String>, value: impl ToString) -> Self {
        Self::Configuration {
            option: option.into(),
            value: value.to_string(),
        }
    }

    pub fn alignment(frame: usize, failure: AlignmentFailure) -> Self {
        Self::Alignment { frame, failure }
    }

    /// A cancellation is a requested unwind, not a failed job
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_message_names_frame_and_counts() {
        let err = StackError::alignment(
            7,
            AlignmentFailure::TooFewMatches {
                found: 2,
                required: 4,
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("frame 7"));
        assert!(msg.contains("2 found"));
        assert!(msg.contains("4 required"));
    }

    #[test]
    fn test_cancellation_is_not_a_failure_kind() {
        assert!(StackError::Cancelled {
            stage: "align".into()
        }
        .is_cancellation());
        assert!(!StackError::configuration("method", "bogus").is_cancellation());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StackError = io.into();
        assert!(matches!(err, StackError::Io(_)));
    }
}
