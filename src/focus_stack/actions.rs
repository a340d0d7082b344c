//! Per-frame action chains driven by the sequencer
//!
//! A [`FrameActions`] stage walks the frame list in the order produced by
//! [`SequencePlan`], runs every frame through its ordered [`FrameAction`]s and
//! writes whatever comes out the other end.

use super::job::{Stage, StageReport};
use super::sequence::{SequenceConfig, SequencePlan, Step};
use crate::assert_invariant;
use crate::errors::{Result, StackError};
use crate::io::{ImageSource, OutputSink};
use crate::progress::{poll, ProgressSink};
use crate::types::Frame;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// What every action sees once before the pass starts
pub struct SequenceContext<'a> {
    pub frames: &'a [String],
    pub plan: &'a SequencePlan,
    /// The sequence reference frame as read from the source
    pub reference: &'a Frame,
}

/// One step of the pass
pub struct StepInput<'a> {
    pub step: Step,
    pub name: &'a str,
    pub reference_index: usize,
    /// Effective reference: the sequence reference, or in step mode the
    /// processed output of the previous step
    pub reference: &'a Frame,
}

impl StepInput<'_> {
    pub fn is_reference(&self) -> bool {
        self.step.index == self.reference_index
    }
}

/// Diagnostics of one action; for per-frame actions `values[i]` belongs to frame `i`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub action: String,
    pub metric: String,
    pub values: Vec<Vec<f64>>,
}

pub trait FrameAction: Send {
    fn name(&self) -> &str;

    fn begin(&mut self, _ctx: &SequenceContext<'_>) -> Result<()> {
        Ok(())
    }

    /// `None` drops the frame from the output
    fn run_frame(&mut self, input: &StepInput<'_>, frame: Frame) -> Result<Option<Frame>>;

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn summary(&self) -> ActionSummary;
}

/// Result of one pass
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub written: Vec<String>,
    pub dropped: Vec<String>,
    pub summaries: Vec<ActionSummary>,
}

pub struct FrameActions {
    name: String,
    output: String,
    sequence: SequenceConfig,
    actions: Vec<Box<dyn FrameAction>>,
}

impl FrameActions {
    pub fn new(name: impl Into<String>, output: impl Into<String>, sequence: SequenceConfig) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            sequence,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl FrameAction + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn push(&mut self, action: Box<dyn FrameAction>) {
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[Box<dyn FrameAction>] {
        &self.actions
    }

    /// Run one full pass over `frames`.
    pub fn process(
        &mut self,
        frames: &[String],
        source: &dyn ImageSource,
        sink: &mut dyn OutputSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<PassOutcome> {
        if frames.is_empty() {
            return Err(StackError::InsufficientFrames {
                required: 1,
                provided: 0,
            });
        }
        let plan = SequencePlan::from_config(frames.len(), &self.sequence)?;
        let reference_index = plan.reference();
        let reference = source.read(&frames[reference_index])?;
        let meta = reference.meta();
        log::info!(
            "{}: {} frames, reference {} ({}, {})",
            self.name,
            frames.len(),
            frames[reference_index],
            meta.shape,
            meta.depth
        );

        let ctx = SequenceContext {
            frames,
            plan: &plan,
            reference: &reference,
        };
        for action in self.actions.iter_mut() {
            action.begin(&ctx)?;
        }

        let mut outcome = PassOutcome::default();
        let mut previous: Option<(usize, Frame)> = None;
        let mut reference_output: Option<Frame> = None;

        for step in plan.steps() {
            let name = frames[step.index].as_str();
            log::debug!("{}: frame {} against {}", self.name, step.index, step.reference);

            let frame = if step.index == reference_index {
                reference.clone()
            } else {
                let frame = source.read(name)?;
                meta.validate(&frame)?;
                frame
            };

            let effective = if !plan.step_mode() || step.reference == step.index {
                &reference
            } else {
                match (&previous, &reference_output) {
                    (Some((i, f)), _) if *i == step.reference => f,
                    (_, Some(f)) if step.reference == reference_index => f,
                    _ => {
                        return Err(StackError::ReferenceUnavailable {
                            index: step.reference,
                        })
                    }
                }
            };

            let input = StepInput {
                step,
                name,
                reference_index,
                reference: effective,
            };
            let mut current = Some(frame);
            for action in self.actions.iter_mut() {
                let Some(frame) = current.take() else { break };
                current = action.run_frame(&input, frame)?;
                if current.is_none() {
                    log::warn!("{}: {} produced no output for {}", self.name, action.name(), name);
                }
            }

            match current {
                Some(out) => {
                    sink.write(name, &out)?;
                    outcome.written.push(name.to_string());
                    if plan.step_mode() {
                        if step.index == reference_index {
                            reference_output = Some(out.clone());
                        }
                        previous = Some((step.index, out));
                    }
                }
                None => {
                    outcome.dropped.push(name.to_string());
                    previous = None;
                }
            }

            poll(progress, &self.name, step.index)?;
        }

        assert_invariant!(
            outcome.written.len() + outcome.dropped.len() == frames.len(),
            "Every frame is visited exactly once",
            "FrameActions::process"
        );
        for action in self.actions.iter_mut() {
            action.end()?;
        }
        outcome.summaries = self.actions.iter().map(|a| a.summary()).collect();
        Ok(outcome)
    }
}

impl Stage for FrameActions {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> &str {
        &self.output
    }

    fn run(
        &mut self,
        frames: &[String],
        source: &dyn ImageSource,
        sink: &mut dyn OutputSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<StageReport> {
        let started = Instant::now();
        let outcome = self.process(frames, source, sink, progress)?;
        Ok(StageReport {
            stage: self.name.clone(),
            frames_written: outcome.written.len(),
            frames_dropped: outcome.dropped.len(),
            outputs: outcome.written,
            actions: outcome.summaries,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
