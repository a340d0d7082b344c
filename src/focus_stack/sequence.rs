/// Reference-centred frame traversal
///
/// A pass over `N` frames starts at the reference (step mode) or at frame 0,
/// walks forward to the last frame, then walks backward from just before the
/// start down to frame 0. Every frame is visited exactly once.
///
/// The traversal is an explicit [`SequenceState`] value advanced by the pure
/// [`SequencePlan::advance`] function.
use crate::errors::{Result, StackError};
use serde::{Deserialize, Serialize};

/// Traversal options shared by every action stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Reference frame index; the middle frame when unset
    pub reference_index: Option<usize>,

    /// Align each frame to the previously processed one instead of the reference
    pub step_mode: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            reference_index: None,
            step_mode: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Stepping,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Position of a pass. `reference` is the effective reference of the step at
/// `index` while stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    pub index: usize,
    pub reference: usize,
    pub direction: Direction,
    pub phase: Phase,
}

/// One unit of work handed to the action chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub index: usize,
    pub reference: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePlan {
    count: usize,
    reference: usize,
    step_mode: bool,
}

impl SequencePlan {
    pub fn new(count: usize, reference: Option<usize>, step_mode: bool) -> Result<Self> {
        let reference = reference.unwrap_or(count / 2);
        if count > 0 && reference >= count {
            return Err(StackError::configuration("reference_index", reference));
        }
        Ok(Self {
            count,
            reference,
            step_mode,
        })
    }

    pub fn from_config(count: usize, config: &SequenceConfig) -> Result<Self> {
        Self::new(count, config.reference_index, config.step_mode)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reference(&self) -> usize {
        self.reference
    }

    pub fn step_mode(&self) -> bool {
        self.step_mode
    }

    fn start(&self) -> usize {
        if self.step_mode {
            self.reference
        } else {
            0
        }
    }

    pub fn initial(&self) -> SequenceState {
        SequenceState {
            index: self.start(),
            reference: self.reference,
            direction: Direction::Forward,
            phase: Phase::Idle,
        }
    }

    /// Next state of the traversal; `Done` is absorbing.
    pub fn advance(&self, state: SequenceState) -> SequenceState {
        let done = SequenceState {
            phase: Phase::Done,
            ..state
        };
        let follow = |from: usize| if self.step_mode { from } else { self.reference };

        match (state.phase, state.direction) {
            (Phase::Done, _) => done,
            (Phase::Idle, _) => {
                if self.count == 0 {
                    done
                } else {
                    SequenceState {
                        index: self.start(),
                        reference: self.reference,
                        direction: Direction::Forward,
                        phase: Phase::Stepping,
                    }
                }
            }
            (Phase::Stepping, Direction::Forward) => {
                if state.index + 1 < self.count {
                    SequenceState {
                        index: state.index + 1,
                        reference: follow(state.index),
                        direction: Direction::Forward,
                        phase: Phase::Stepping,
                    }
                } else if self.start() > 0 {
                    SequenceState {
                        index: self.start() - 1,
                        reference: self.reference,
                        direction: Direction::Backward,
                        phase: Phase::Stepping,
                    }
                } else {
                    done
                }
            }
            (Phase::Stepping, Direction::Backward) => {
                if state.index > 0 {
                    SequenceState {
                        index: state.index - 1,
                        reference: follow(state.index),
                        direction: Direction::Backward,
                        phase: Phase::Stepping,
                    }
                } else {
                    done
                }
            }
        }
    }

    pub fn steps(&self) -> Steps {
        Steps {
            plan: *self,
            state: self.initial(),
        }
    }
}

/// Iterator over the steps of a plan
#[derive(Debug, Clone)]
pub struct Steps {
    plan: SequencePlan,
    state: SequenceState,
}

impl Iterator for Steps {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        self.state = self.plan.advance(self.state);
        match self.state.phase {
            Phase::Stepping => Some(Step {
                index: self.state.index,
                reference: self.state.reference,
            }),
            _ => None,
        }
    }
}
