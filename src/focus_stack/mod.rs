/// Focus stacking pipeline
///
/// Composites a sequence of frames taken at different focus distances:
/// 1. Walk the frames outward from a reference ([`sequence`])
/// 2. Register every frame onto its reference ([`align`])
/// 3. Match brightness to the reference ([`balance`])
/// 4. Blend sharp regions through Laplacian pyramids ([`merge`])
///
/// Steps 2 and 3 run as [`FrameAction`]s inside a [`FrameActions`] stage;
/// step 4 is a [`DepthMapStack`] stage. Stages are chained by a [`StackJob`].
/// Hot pixel mapping ([`noise`]) and layered TIFF output ([`multilayer`]) are
/// side stages next to the chain.
pub mod actions;
pub mod align;
pub mod balance;
pub mod frames;
pub mod job;
pub mod merge;
pub mod multilayer;
pub mod noise;
pub mod sequence;

pub use actions::{ActionSummary, FrameAction, FrameActions, SequenceContext, StepInput};
pub use align::{AlignConfig, Aligned, AlignmentEngine, BorderMode, FeatureConfig, Transform};
pub use balance::{
    BalanceChannel, BalanceConfig, BalanceEngine, Correction, CorrectionKind, CorrectionMap,
};
pub use frames::{FrameDirectory, FrameSelection};
pub use job::{JobReport, JobRunner, JobStatus, RunReport, Stage, StageReport, StackJob};
pub use merge::{DepthMapConfig, DepthMapStack, EnergyKind, FloatPrecision, WeightMode};
pub use multilayer::MultiLayer;
pub use noise::{
    HotPixelMap, Interpolation, MaskNoise, MaskNoiseConfig, NoiseConfig, NoiseDetection,
};
pub use sequence::{SequenceConfig, SequencePlan, SequenceState, Step};
