//! Jobs, stages and the batch runner
//!
//! A [`StackJob`] chains stages through directories: stage *k* reads what
//! stage *k - 1* wrote. [`JobRunner`] executes several jobs and keeps going
//! when one of them fails.

use super::actions::ActionSummary;
use super::frames::{FrameDirectory, FrameSelection};
use crate::errors::{Result, StackError};
use crate::io::{DirectorySink, DirectorySource, ImageSource, OutputSink};
use crate::progress::ProgressSink;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One processing step of a job
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Output subdirectory, relative to the job's working directory
    fn output(&self) -> &str;

    /// Side stages write an artefact next to the chain; the stage after them
    /// reads the same input they did.
    fn forwards_input(&self) -> bool {
        false
    }

    fn run(
        &mut self,
        frames: &[String],
        source: &dyn ImageSource,
        sink: &mut dyn OutputSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<StageReport>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub frames_written: usize,
    pub frames_dropped: usize,
    pub outputs: Vec<String>,
    pub actions: Vec<ActionSummary>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub status: JobStatus,
    pub stages: Vec<StageReport>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl JobReport {
    fn ended(job: &str, err: &StackError, stages: Vec<StageReport>, started: Instant) -> Self {
        Self {
            job: job.to_string(),
            status: if err.is_cancellation() {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            },
            stages,
            error: Some(err.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct StackJob {
    name: String,
    working_dir: PathBuf,
    input: String,
    selection: FrameSelection,
    stages: Vec<Box<dyn Stage>>,
}

impl StackJob {
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>, input: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            input: input.into(),
            selection: FrameSelection::default(),
            stages: Vec::new(),
        }
    }

    /// Ordering and resampling of the job's input frames
    pub fn with_selection(mut self, selection: FrameSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn push_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage in order. The returned report is `Completed`; a failed
    /// or cancelled job comes back as the error instead.
    pub fn run(&mut self, progress: &mut dyn ProgressSink) -> Result<JobReport> {
        let mut stages = Vec::new();
        let started = Instant::now();
        self.run_stages(progress, &mut stages)?;
        Ok(JobReport {
            job: self.name.clone(),
            status: JobStatus::Completed,
            stages,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Like [`run`](Self::run), but failures become part of the report.
    pub fn run_to_report(&mut self, progress: &mut dyn ProgressSink) -> JobReport {
        let mut stages = Vec::new();
        let started = Instant::now();
        match self.run_stages(progress, &mut stages) {
            Ok(()) => JobReport {
                job: self.name.clone(),
                status: JobStatus::Completed,
                stages,
                error: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            Err(err) => JobReport::ended(&self.name, &err, stages, started),
        }
    }

    fn run_stages(
        &mut self,
        progress: &mut dyn ProgressSink,
        reports: &mut Vec<StageReport>,
    ) -> Result<()> {
        log::info!("Job {}: {} stages", self.name, self.stages.len());
        let mut input_dir = self.working_dir.join(&self.input);
        // Ordering and resampling apply to the job input only
        let mut selection = self.selection.clone();

        for stage in self.stages.iter_mut() {
            let frames = FrameDirectory::new(&input_dir)
                .with_selection(selection.clone())
                .list()?;
            if frames.is_empty() {
                return Err(StackError::InsufficientFrames {
                    required: 1,
                    provided: 0,
                });
            }

            let output_dir = self.working_dir.join(stage.output());
            log::info!(
                "Job {}: stage {} reads {} frames from {:?}",
                self.name,
                stage.name(),
                frames.len(),
                input_dir
            );
            let source = DirectorySource::new(&input_dir);
            let mut sink = DirectorySink::new(&output_dir);
            let report = stage.run(&frames, &source, &mut sink, progress)?;
            reports.push(report);
            if !stage.forwards_input() {
                input_dir = output_dir;
                selection = FrameSelection::default();
            }
        }
        Ok(())
    }
}

/// Reports of every job in a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn completed(&self) -> usize {
        self.count(JobStatus::Completed)
    }

    pub fn cancelled(&self) -> bool {
        self.count(JobStatus::Cancelled) > 0
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StackError::Write {
            path: PathBuf::from("<report>"),
            reason: e.to_string(),
        })
    }
}

#[derive(Default)]
pub struct JobRunner {
    jobs: Vec<StackJob>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, job: StackJob) {
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run all jobs in order. Failures are recorded and the batch continues;
    /// a cancellation stops it.
    pub fn run_all(&mut self, progress: &mut dyn ProgressSink) -> RunReport {
        let mut report = RunReport::default();
        for job in self.jobs.iter_mut() {
            let job_report = job.run_to_report(progress);
            let status = job_report.status;
            match status {
                JobStatus::Completed => log::info!("Job {} completed", job.name()),
                JobStatus::Failed => log::error!(
                    "Job {} failed: {}",
                    job.name(),
                    job_report.error.as_deref().unwrap_or("unknown error")
                ),
                JobStatus::Cancelled => log::warn!("Job {} cancelled", job.name()),
            }
            report.jobs.push(job_report);
            if status == JobStatus::Cancelled {
                break;
            }
        }
        report
    }
}
