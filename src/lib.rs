//! focusstack: focus stacking for image sequences
//!
//! Composites frames taken at different focus distances into one image that
//! is sharp throughout. Frames are registered onto a reference, balanced to
//! its brightness and blended through Laplacian pyramids weighted by a
//! per-pixel focus energy.
//!
//! # Usage
//! ```rust,no_run
//! use focusstack::config::JobConfig;
//! use focusstack::progress::NoProgress;
//!
//! focusstack::init_logging();
//! let mut job = JobConfig::standard("bug", "/data/bug", "raw", true, true)
//!     .build()
//!     .unwrap();
//! let report = job.run(&mut NoProgress).unwrap();
//! println!("{}", report.stages.len());
//! ```
pub mod backend;
pub mod config;
pub mod errors;
pub mod focus_stack;
pub mod invariant_ppt;
pub mod io;
pub mod progress;
pub mod types;

// Testing utilities - synthetic frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use config::{JobConfig, StackConfig, StageConfig};
pub use errors::{AlignmentFailure, Result, StackError};
pub use focus_stack::{
    AlignmentEngine, BalanceEngine, DepthMapStack, FrameActions, JobRunner, MaskNoise, MultiLayer,
    NoiseDetection, StackJob,
};
pub use types::{BitDepth, Frame, FrameMeta, Shape};

/// Initialize logging; `RUST_LOG` overrides the default `focusstack=info`
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "focusstack=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        assert_eq!(NAME, "focusstack");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
