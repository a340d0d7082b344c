//! Progress reporting and cooperative cancellation

use crate::errors::{Result, StackError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observer polled after every processed frame
pub trait ProgressSink {
    fn on_step(&mut self, index: usize);

    /// `false` requests a graceful stop
    fn check_running(&self) -> bool;
}

/// Ignores progress and never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_step(&mut self, _index: usize) {}

    fn check_running(&self) -> bool {
        true
    }
}

/// Shared stop flag, e.g. flipped from a Ctrl-C handler
#[derive(Debug, Clone)]
pub struct CancelFlag {
    running: Arc<AtomicBool>,
    steps: usize,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            steps: 0,
        }
    }

    /// Handle to the flag for another thread
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for CancelFlag {
    fn on_step(&mut self, _index: usize) {
        self.steps += 1;
    }

    fn check_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Logs each step at debug level
#[derive(Debug, Default)]
pub struct LogProgress {
    label: String,
    steps: usize,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: 0,
        }
    }
}

impl ProgressSink for LogProgress {
    fn on_step(&mut self, index: usize) {
        self.steps += 1;
        log::debug!("{}: step {} (frame {})", self.label, self.steps, index);
    }

    fn check_running(&self) -> bool {
        true
    }
}

/// Report `index` and turn a stop request into [`StackError::Cancelled`].
pub fn poll(progress: &mut dyn ProgressSink, stage: &str, index: usize) -> Result<()> {
    progress.on_step(index);
    if progress.check_running() {
        Ok(())
    } else {
        log::info!("{} cancelled after frame {}", stage, index);
        Err(StackError::Cancelled {
            stage: stage.to_string(),
        })
    }
}
