#[cfg(test)]
mod error_tests {
    use focusstack::errors::{AlignmentFailure, StackError};
    use focusstack::types::{BitDepth, Shape};
    use std::error::Error;
    use std::path::PathBuf;

    fn shape(width: u32, height: u32, channels: u8) -> Shape {
        Shape {
            width,
            height,
            channels,
        }
    }

    #[test]
    fn test_configuration_error() {
        let error = StackError::configuration("transform", "affine");
        assert_eq!(
            error.to_string(),
            "Invalid configuration: transform = affine"
        );
    }

    #[test]
    fn test_shape_mismatch_error() {
        let error = StackError::ShapeMismatch {
            expected: shape(640, 480, 3),
            got: shape(640, 480, 1),
        };
        assert_eq!(
            error.to_string(),
            "Shape mismatch: expected 640x480x3, got 640x480x1"
        );
    }

    #[test]
    fn test_bit_depth_mismatch_error() {
        let error = StackError::BitDepthMismatch {
            expected: BitDepth::Eight,
            got: BitDepth::Sixteen,
        };
        assert!(error.to_string().contains("8-bit"));
        assert!(error.to_string().contains("16-bit"));
    }

    #[test]
    fn test_alignment_failures() {
        let error = StackError::alignment(3, AlignmentFailure::NoTransform { matches: 12 });
        assert!(error.to_string().contains("frame 3"));
        assert!(error.to_string().contains("12 matches"));

        let error = StackError::alignment(1, AlignmentFailure::DegenerateTransform);
        assert!(error.to_string().contains("singular"));
    }

    #[test]
    fn test_alignment_failure_is_an_error_on_its_own() {
        let failure = AlignmentFailure::TooFewMatches {
            found: 2,
            required: 4,
        };
        assert_eq!(
            failure.to_string(),
            "not enough matches (2 found, 4 required)"
        );
        let boxed: Box<dyn std::error::Error> = Box::new(failure);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn test_load_and_write_errors_name_the_path() {
        let error = StackError::Load {
            path: PathBuf::from("raw/IMG_0001.JPG"),
            reason: "unsupported format".to_string(),
        };
        assert!(error.to_string().contains("IMG_0001.JPG"));
        assert!(error.to_string().contains("unsupported format"));

        let error = StackError::Write {
            path: PathBuf::from("stacked/stack.png"),
            reason: "disk full".to_string(),
        };
        assert!(error.to_string().contains("stack.png"));
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        let cancelled = StackError::Cancelled {
            stage: "stack".to_string(),
        };
        assert!(cancelled.is_cancellation());
        assert_eq!(cancelled.to_string(), "Cancelled during stack");

        let failed = StackError::InsufficientFrames {
            required: 1,
            provided: 0,
        };
        assert!(!failed.is_cancellation());
        assert!(!StackError::ReferenceUnavailable { index: 4 }.is_cancellation());
    }

    #[test]
    fn test_io_error_source_is_kept() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = StackError::from(io);
        assert!(error.source().is_some());
        assert!(error.to_string().starts_with("IO error"));
    }

    #[test]
    fn test_error_debug_format() {
        let error = StackError::DataCorruption {
            frame_size: 10,
            expected_size: 12,
        };
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("DataCorruption"));
    }

    #[test]
    fn test_errors_convert_into_anyhow() {
        fn run() -> anyhow::Result<()> {
            let result: Result<(), StackError> = Err(StackError::configuration("levels", 0));
            result?;
            Ok(())
        }
        assert!(run().unwrap_err().to_string().contains("levels"));
    }
}
