//! Testing utilities for focusstack
//!
//! Procedural frames for offline tests and benchmarks: block textures that
//! give the feature detector something to lock onto, shifted copies, and
//! focus stacks whose frames differ only in local contrast.

pub mod synthetic_data;

pub use synthetic_data::{
    contrast_patch_stack, gradient_frame, shifted_frame, textured_frame, textured_rgb_frame,
    write_frames, StopAfter,
};
