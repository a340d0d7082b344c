//! Hot pixel detection and repair
//!
//! [`NoiseDetection`] averages a sequence and marks the pixels that stand out
//! from a blurred copy of that mean. [`MaskNoise`] reads the map back and
//! replaces every marked pixel with the mean or median of its neighbourhood.

use super::actions::{ActionSummary, FrameAction, SequenceContext, StepInput};
use super::job::{Stage, StageReport};
use crate::backend::filter::gaussian_blur;
use crate::backend::Plane;
use crate::errors::{Result, StackError};
use crate::io::{read_frame, ImageSource, OutputSink};
use crate::progress::{poll, ProgressSink};
use crate::types::{BitDepth, Frame, FrameMeta, Shape};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

/// Largest map [`MaskNoise`] accepts
pub const MAX_HOT_PIXELS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Gaussian kernel of the blurred mean
    pub blur_size: usize,
    /// Per-channel threshold on `|mean - blurred|`, in 8-bit units
    pub channel_thresholds: Vec<u16>,
    /// Average only the first frames; all of them when unset
    pub max_frames: Option<usize>,
    /// File name of the map inside the stage output directory
    pub file_name: String,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            blur_size: 7,
            channel_thresholds: vec![13, 13, 13],
            max_frames: None,
            file_name: "hot_pixels.png".to_string(),
        }
    }
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.blur_size < 3 || self.blur_size % 2 == 0 {
            return Err(StackError::configuration("blur_size", self.blur_size));
        }
        if self.channel_thresholds.is_empty() {
            return Err(StackError::configuration("channel_thresholds", "empty"));
        }
        if self.max_frames == Some(0) {
            return Err(StackError::configuration("max_frames", 0));
        }
        if self.file_name.is_empty() {
            return Err(StackError::configuration("file_name", "empty"));
        }
        Ok(())
    }

    fn threshold(&self, channel: usize) -> f64 {
        self.channel_thresholds
            .get(channel)
            .or(self.channel_thresholds.last())
            .copied()
            .unwrap_or(0) as f64
    }
}

/// Per-pixel hot flags of a sequence
#[derive(Debug, Clone, PartialEq)]
pub struct HotPixelMap {
    width: usize,
    height: usize,
    hot: Vec<bool>,
    channel_counts: Vec<usize>,
}

impl HotPixelMap {
    /// A pixel is hot when any channel of the mean differs from its blurred
    /// copy by more than that channel's threshold.
    pub fn detect(mean: &[Plane<f64>], depth: BitDepth, config: &NoiseConfig) -> Self {
        let (width, height) = mean
            .first()
            .map(|p| (p.width(), p.height()))
            .unwrap_or((0, 0));
        let scale = 255.0 / depth.max_value() as f64;
        let mut hot = vec![false; width * height];
        let mut channel_counts = Vec::with_capacity(mean.len());

        for (c, plane) in mean.iter().enumerate() {
            let blurred = gaussian_blur(plane, config.blur_size, 0.0);
            let threshold = config.threshold(c);
            let mut count = 0;
            for (p, flag) in hot.iter_mut().enumerate() {
                let m = (plane.data()[p] * scale).round();
                let b = (blurred.data()[p] * scale).round();
                if (m - b).abs() > threshold {
                    *flag = true;
                    count += 1;
                }
            }
            channel_counts.push(count);
        }

        Self {
            width,
            height,
            hot,
            channel_counts,
        }
    }

    /// Any non-zero sample marks the pixel
    pub fn from_frame(frame: &Frame) -> Self {
        let channels = frame.channels() as usize;
        let hot: Vec<bool> = (0..frame.pixel_count())
            .map(|p| (0..channels).any(|c| frame.sample(p, c) > 0))
            .collect();
        let count = hot.iter().filter(|&&h| h).count();
        Self {
            width: frame.width() as usize,
            height: frame.height() as usize,
            hot,
            channel_counts: vec![count],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_hot(&self, x: usize, y: usize) -> bool {
        self.hot[y * self.width + x]
    }

    /// Hot pixels over all channels
    pub fn count(&self) -> usize {
        self.hot.iter().filter(|&&h| h).count()
    }

    pub fn channel_counts(&self) -> &[usize] {
        &self.channel_counts
    }

    /// `(x, y)` of every hot pixel in row order
    pub fn coordinates(&self) -> Vec<(usize, usize)> {
        self.hot
            .iter()
            .enumerate()
            .filter(|(_, h)| **h)
            .map(|(p, _)| (p % self.width, p / self.width))
            .collect()
    }

    /// 8-bit grey mask, 255 where hot
    pub fn to_frame(&self) -> Result<Frame> {
        let data = self.hot.iter().map(|&h| if h { 255 } else { 0 }).collect();
        Frame::from_u8(self.width as u32, self.height as u32, 1, data)
    }
}

/// Per-channel mean of `frames`, floored to whole intensities.
pub fn mean_planes(
    frames: &[String],
    source: &dyn ImageSource,
    progress: &mut dyn ProgressSink,
    stage: &str,
) -> Result<(FrameMeta, Vec<Plane<f64>>)> {
    let mut meta: Option<FrameMeta> = None;
    let mut sums: Vec<Plane<f64>> = Vec::new();
    for (i, name) in frames.iter().enumerate() {
        let frame = source.read(name)?;
        meta.get_or_insert(frame.meta()).validate(&frame)?;
        for c in 0..frame.channels() as usize {
            let plane = frame.channel_plane::<f64>(c);
            match sums.get_mut(c) {
                Some(sum) => sum.add_assign(&plane),
                None => sums.push(plane),
            }
        }
        poll(progress, stage, i)?;
    }
    let meta = meta.ok_or(StackError::InsufficientFrames {
        required: 1,
        provided: 0,
    })?;
    let n = frames.len() as f64;
    let means = sums.iter().map(|s| s.map(|v| (v / n).floor())).collect();
    Ok((meta, means))
}

/// Stage writing the hot pixel map of its input. The next stage reads the
/// same input.
pub struct NoiseDetection {
    name: String,
    output: String,
    config: NoiseConfig,
}

impl NoiseDetection {
    pub fn new(name: impl Into<String>, output: impl Into<String>, config: NoiseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            output: output.into(),
            config,
        })
    }

    pub fn config(&self) -> &NoiseConfig {
        &self.config
    }

    pub fn detect(
        &self,
        frames: &[String],
        source: &dyn ImageSource,
        progress: &mut dyn ProgressSink,
    ) -> Result<HotPixelMap> {
        let frames = match self.config.max_frames {
            Some(max) => &frames[..max.min(frames.len())],
            None => frames,
        };
        log::info!("{}: mapping hot pixels over {} frames", self.name, frames.len());
        let (meta, mean) = mean_planes(frames, source, progress, &self.name)?;
        let map = HotPixelMap::detect(&mean, meta.depth, &self.config);
        log::info!(
            "{}: {} hot pixels, per channel {:?}",
            self.name,
            map.count(),
            map.channel_counts()
        );
        Ok(map)
    }
}

impl Stage for NoiseDetection {
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
        let map = self.detect(frames, source, progress)?;
        sink.write(&self.config.file_name, &map.to_frame()?)?;

        let counts = std::iter::once(map.count())
            .chain(map.channel_counts().iter().copied())
            .map(|c| c as f64)
            .collect();
        Ok(StageReport {
            stage: self.name.clone(),
            frames_written: 1,
            frames_dropped: 0,
            outputs: vec![self.config.file_name.clone()],
            actions: vec![ActionSummary {
                action: "noise_map".to_string(),
                metric: "hot_pixels".to_string(),
                values: vec![counts],
            }],
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// How a hot pixel is filled from its neighbourhood
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Mean,
    Median,
}

impl Interpolation {
    fn pick(self, values: &mut [u16]) -> u16 {
        match self {
            Self::Mean => {
                let sum: u64 = values.iter().map(|&v| v as u64).sum();
                (sum / values.len() as u64) as u16
            }
            Self::Median => {
                values.sort_unstable();
                let mid = values.len() / 2;
                if values.len() % 2 == 1 {
                    values[mid]
                } else {
                    ((values[mid - 1] as u32 + values[mid] as u32) / 2) as u16
                }
            }
        }
    }
}

impl FromStr for Interpolation {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            _ => Err(StackError::configuration("method", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskNoiseConfig {
    /// Hot pixel map; relative paths are taken from the job's working directory
    pub noise_map: PathBuf,
    /// Side of the square neighbourhood
    pub kernel_size: usize,
    pub method: Interpolation,
}

impl Default for MaskNoiseConfig {
    fn default() -> Self {
        Self {
            noise_map: PathBuf::from("noise-map/hot_pixels.png"),
            kernel_size: 3,
            method: Interpolation::Mean,
        }
    }
}

impl MaskNoiseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.noise_map.as_os_str().is_empty() {
            return Err(StackError::configuration("noise_map", "empty"));
        }
        if self.kernel_size < 3 || self.kernel_size % 2 == 0 {
            return Err(StackError::configuration("kernel_size", self.kernel_size));
        }
        Ok(())
    }
}

/// Repairs the pixels of a hot pixel map in every frame, the reference included
pub struct MaskNoise {
    config: MaskNoiseConfig,
    hot: Vec<(usize, usize)>,
    repaired: Vec<Vec<f64>>,
}

impl MaskNoise {
    pub fn new(config: MaskNoiseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hot: Vec::new(),
            repaired: Vec::new(),
        })
    }

    pub fn config(&self) -> &MaskNoiseConfig {
        &self.config
    }

    /// Use `map` for frames of `width` x `height`
    pub fn set_map(&mut self, map: &HotPixelMap, width: usize, height: usize) -> Result<()> {
        if (map.width(), map.height()) != (width, height) {
            let shape = |w: usize, h: usize| Shape {
                width: w as u32,
                height: h as u32,
                channels: 1,
            };
            return Err(StackError::ShapeMismatch {
                expected: shape(width, height),
                got: shape(map.width(), map.height()),
            });
        }
        let count = map.count();
        if count > MAX_HOT_PIXELS {
            return Err(StackError::TooManyHotPixels {
                count,
                limit: MAX_HOT_PIXELS,
            });
        }
        self.hot = map.coordinates();
        Ok(())
    }

    /// Replace every hot sample with the mean or median of the non-zero
    /// samples in its clipped neighbourhood; values come from the input frame.
    pub fn repair(&self, frame: &Frame) -> Result<Frame> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let channels = frame.channels() as usize;
        let r = self.config.kernel_size / 2;
        let mut samples = frame.samples();
        let mut window = Vec::with_capacity(self.config.kernel_size * self.config.kernel_size);

        for &(x, y) in &self.hot {
            for c in 0..channels {
                window.clear();
                for ny in y.saturating_sub(r)..(y + r + 1).min(h) {
                    for nx in x.saturating_sub(r)..(x + r + 1).min(w) {
                        let v = frame.sample(ny * w + nx, c);
                        if v != 0 {
                            window.push(v);
                        }
                    }
                }
                if !window.is_empty() {
                    samples[(y * w + x) * channels + c] = self.config.method.pick(&mut window);
                }
            }
        }
        Frame::from_samples(frame.shape(), frame.depth(), &samples)
    }
}

impl FrameAction for MaskNoise {
    fn name(&self) -> &str {
        "mask_noise"
    }

    fn begin(&mut self, ctx: &SequenceContext<'_>) -> Result<()> {
        let map = HotPixelMap::from_frame(&read_frame(&self.config.noise_map)?);
        self.set_map(&map, ctx.reference.width() as usize, ctx.reference.height() as usize)?;
        self.repaired = vec![vec![0.0]; ctx.frames.len()];
        log::info!(
            "Masking {} hot pixels from {:?}",
            self.hot.len(),
            self.config.noise_map
        );
        Ok(())
    }

    fn run_frame(&mut self, input: &StepInput<'_>, frame: Frame) -> Result<Option<Frame>> {
        let repaired = self.repair(&frame)?;
        if let Some(slot) = self.repaired.get_mut(input.step.index) {
            *slot = vec![self.hot.len() as f64];
        }
        Ok(Some(repaired))
    }

    fn summary(&self) -> ActionSummary {
        ActionSummary {
            action: "mask_noise".to_string(),
            metric: "hot_pixels".to_string(),
            values: self.repaired.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focus_stack::{FrameActions, SequenceConfig};
    use crate::io::MemoryStore;
    use crate::progress::NoProgress;

    fn flat_with_hot(channels: u8, hot_channel: usize) -> Frame {
        let (w, h) = (16usize, 16usize);
        let mut data = vec![100u8; w * h * channels as usize];
        data[(7 * w + 5) * channels as usize + hot_channel] = 250;
        Frame::from_u8(w as u32, h as u32, channels, data).unwrap()
    }

    fn store(frames: &[Frame]) -> (MemoryStore, Vec<String>) {
        let mut store = MemoryStore::new();
        for (i, frame) in frames.iter().enumerate() {
            store.insert(format!("{}.png", i), frame.clone());
        }
        let names = store.names();
        (store, names)
    }

    fn mask(method: Interpolation) -> MaskNoise {
        MaskNoise::new(MaskNoiseConfig {
            method,
            ..MaskNoiseConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_single_hot_pixel_detected() {
        let frame = flat_with_hot(1, 0);
        let (source, names) = store(&[frame.clone(), frame.clone(), frame]);
        let stage = NoiseDetection::new("noise", "noise-map", NoiseConfig::default()).unwrap();
        let map = stage.detect(&names, &source, &mut NoProgress).unwrap();
        assert_eq!(map.count(), 1);
        assert!(map.is_hot(5, 7));
        assert_eq!(map.coordinates(), vec![(5, 7)]);
    }

    #[test]
    fn test_channels_counted_separately() {
        let frame = flat_with_hot(3, 1);
        let (source, names) = store(&[frame.clone(), frame]);
        let stage = NoiseDetection::new("noise", "noise-map", NoiseConfig::default()).unwrap();
        let map = stage.detect(&names, &source, &mut NoProgress).unwrap();
        assert_eq!(map.channel_counts(), &[0, 1, 0]);
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn test_stage_writes_the_map() {
        let frame = flat_with_hot(1, 0);
        let (source, names) = store(&[frame.clone(), frame]);
        let mut stage = NoiseDetection::new("noise", "noise-map", NoiseConfig::default()).unwrap();
        let mut sink = MemoryStore::new();
        let report = stage.run(&names, &source, &mut sink, &mut NoProgress).unwrap();

        assert_eq!(report.outputs, vec!["hot_pixels.png".to_string()]);
        assert_eq!(report.actions[0].values, vec![vec![1.0, 1.0]]);
        let written = sink.get("hot_pixels.png").unwrap();
        assert_eq!(written.sample(7 * 16 + 5, 0), 255);
        assert_eq!(written.sample(0, 0), 0);
        assert!(stage.forwards_input());
    }

    #[test]
    fn test_mean_and_median_fill() {
        let mut data = vec![40u8; 25];
        data[12] = 255;
        let frame = Frame::from_u8(5, 5, 1, data).unwrap();
        let mut map_data = vec![0u8; 25];
        map_data[12] = 255;
        let map = HotPixelMap::from_frame(&Frame::from_u8(5, 5, 1, map_data).unwrap());

        // The window includes the hot sample itself
        let mut mean = mask(Interpolation::Mean);
        mean.set_map(&map, 5, 5).unwrap();
        assert_eq!(mean.repair(&frame).unwrap().sample(12, 0), 63);

        let mut median = mask(Interpolation::Median);
        median.set_map(&map, 5, 5).unwrap();
        let repaired = median.repair(&frame).unwrap();
        assert_eq!(repaired.sample(12, 0), 40);
        assert_eq!(repaired.sample(0, 0), 40);
    }

    #[test]
    fn test_zero_neighbours_ignored_at_the_corner() {
        let mut data = vec![0u8; 9];
        data[0] = 200;
        data[4] = 10;
        let frame = Frame::from_u8(3, 3, 1, data).unwrap();
        let mut map_data = vec![0u8; 9];
        map_data[0] = 1;
        let map = HotPixelMap::from_frame(&Frame::from_u8(3, 3, 1, map_data).unwrap());

        let mut noise = mask(Interpolation::Mean);
        noise.set_map(&map, 3, 3).unwrap();
        assert_eq!(noise.repair(&frame).unwrap().sample(0, 0), 105);
    }

    #[test]
    fn test_map_limits() {
        let crowded = HotPixelMap::from_frame(&Frame::from_u8(40, 30, 1, vec![255; 1200]).unwrap());
        let mut noise = mask(Interpolation::Mean);
        assert!(matches!(
            noise.set_map(&crowded, 40, 30),
            Err(StackError::TooManyHotPixels {
                count: 1200,
                limit: MAX_HOT_PIXELS
            })
        ));
        assert!(matches!(
            noise.set_map(&crowded, 41, 30),
            Err(StackError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_map_fails_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (source, names) = store(&[flat_with_hot(1, 0)]);
        let mut stage = FrameActions::new("clean", "cleaned", SequenceConfig::default())
            .with_action(
                MaskNoise::new(MaskNoiseConfig {
                    noise_map: dir.path().join("absent.png"),
                    ..MaskNoiseConfig::default()
                })
                .unwrap(),
            );
        let err = stage
            .process(&names, &source, &mut MemoryStore::new(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, StackError::Load { .. }));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(NoiseConfig {
            blur_size: 4,
            ..NoiseConfig::default()
        }
        .validate()
        .is_err());
        assert!(NoiseConfig {
            max_frames: Some(0),
            ..NoiseConfig::default()
        }
        .validate()
        .is_err());
        assert!(MaskNoise::new(MaskNoiseConfig {
            kernel_size: 2,
            ..MaskNoiseConfig::default()
        })
        .is_err());
        assert_eq!("MEDIAN".parse::<Interpolation>().unwrap(), Interpolation::Median);
    }
}
