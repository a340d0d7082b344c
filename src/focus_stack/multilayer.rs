//! Layered output of a frame sequence
//!
//! Every input frame becomes one page of a TIFF, bottom layer first, so the
//! aligned stack can be retouched by hand in an editor. The next stage reads
//! the same input.

use super::actions::ActionSummary;
use super::job::{Stage, StageReport};
use crate::errors::{Result, StackError};
use crate::io::{ImageSource, OutputSink};
use crate::progress::{poll, ProgressSink};
use crate::types::FrameMeta;
use std::path::Path;
use std::time::Instant;

pub struct MultiLayer {
    name: String,
    output: String,
    output_name: Option<String>,
}

impl MultiLayer {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            output_name: None,
        }
    }

    pub fn with_output_name(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = Some(output_name.into());
        self
    }

    /// `<stem of the last frame>.tif` unless set explicitly
    pub fn output_name(&self, frames: &[String]) -> String {
        if let Some(name) = &self.output_name {
            return name.clone();
        }
        let stem = frames
            .last()
            .and_then(|f| Path::new(f).file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("layers");
        format!("{}.tif", stem)
    }
}

impl Stage for MultiLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&self) -> &str {
        &self.output
    }

    fn forwards_input(&self) -> bool {
        true
    }

    fn run(
        &mut self,
        frames: &[String],
        source: &dyn ImageSource,
        sink: &mut dyn OutputSink,
        progress: &mut dyn ProgressSink,
    ) -> Result<StageReport> {
        let started = Instant::now();
        if frames.is_empty() {
            return Err(StackError::InsufficientFrames {
                required: 1,
                provided: 0,
            });
        }

        let mut meta: Option<FrameMeta> = None;
        let mut layers = Vec::with_capacity(frames.len());
        for (i, name) in frames.iter().enumerate() {
            let frame = source.read(name)?;
            meta.get_or_insert(frame.meta()).validate(&frame)?;
            layers.push(frame);
            poll(progress, &self.name, i)?;
        }

        let file = self.output_name(frames);
        sink.write_layers(&file, &layers)?;
        log::info!("{}: wrote {} layers to {}", self.name, layers.len(), file);

        Ok(StageReport {
            stage: self.name.clone(),
            frames_written: 1,
            frames_dropped: 0,
            outputs: vec![file],
            actions: vec![ActionSummary {
                action: "multilayer".to_string(),
                metric: "layers".to_string(),
                values: vec![vec![layers.len() as f64]],
            }],
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;
    use crate::progress::NoProgress;
    use crate::testing::synthetic_data::textured_frame;
    use crate::types::Frame;

    #[test]
    fn test_frames_become_layers_in_order() {
        let mut source = MemoryStore::new();
        for i in 0..3 {
            source.insert(format!("IMG_{}.png", i), textured_frame(12, 10, i));
        }
        let names = source.names();
        let mut sink = MemoryStore::new();
        let mut stage = MultiLayer::new("layers", "layers");
        let report = stage.run(&names, &source, &mut sink, &mut NoProgress).unwrap();

        assert_eq!(report.outputs, vec!["IMG_2.tif".to_string()]);
        let layers = sink.layers("IMG_2.tif").unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], textured_frame(12, 10, 0));
        assert_eq!(layers[2], textured_frame(12, 10, 2));
    }

    #[test]
    fn test_mismatched_layer_fails() {
        let mut source = MemoryStore::new();
        source.insert("a.png", textured_frame(12, 10, 1));
        source.insert("b.png", Frame::from_u8(12, 10, 3, vec![0; 360]).unwrap());
        let names = source.names();
        let err = MultiLayer::new("layers", "layers")
            .with_output_name("stack.tif")
            .run(&names, &source, &mut MemoryStore::new(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, StackError::ShapeMismatch { .. }));
    }
}
