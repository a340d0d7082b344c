/// Depth-map compositing
///
/// Builds a per-frame focus energy map, turns the energies into blending
/// weights and merges the frames through Laplacian pyramids so sharp regions
/// of every frame survive without visible seams.
use super::actions::ActionSummary;
use super::job::{Stage, StageReport};
use crate::backend::filter::{bilateral, gaussian_blur, laplacian, sobel_energy};
use crate::assert_invariant;
use crate::backend::plane::{cast, to_f64};
use crate::backend::pyramid::{collapse, gaussian_pyramid, laplacian_pyramid};
use crate::backend::{Plane, Sample};
use crate::errors::{Result, StackError};
use crate::io::{ImageSource, OutputSink};
use crate::progress::{poll, ProgressSink};
use crate::types::{BitDepth, Frame, FrameMeta};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

/// Colour and spatial sigma of the energy smoothing filter
const SMOOTH_SIGMA: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightMode {
    /// Energies normalised to sum to one per pixel
    Average,
    /// Softmax over energies with a temperature
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyKind {
    Sobel,
    Laplacian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatPrecision {
    F32,
    F64,
}

impl FromStr for WeightMode {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" => Ok(Self::Average),
            "max" => Ok(Self::Max),
            _ => Err(StackError::configuration("map_type", s)),
        }
    }
}

impl FromStr for EnergyKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sobel" => Ok(Self::Sobel),
            "laplacian" => Ok(Self::Laplacian),
            _ => Err(StackError::configuration("energy", s)),
        }
    }
}

impl FromStr for FloatPrecision {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::F32),
            "f64" | "float64" => Ok(Self::F64),
            _ => Err(StackError::configuration("float_type", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthMapConfig {
    pub map_type: WeightMode,
    pub energy: EnergyKind,
    /// Laplacian aperture
    pub kernel_size: usize,
    /// Gaussian pre-blur before the Laplacian; 0 or 1 disables it
    pub blur_size: usize,
    /// Bilateral smoothing diameter of the energy maps; 0 disables it
    pub smooth_size: usize,
    /// Softmax temperature for [`WeightMode::Max`]
    pub temperature: f64,
    /// Pyramid levels including full resolution
    pub levels: usize,
    pub float_type: FloatPrecision,
}

impl Default for DepthMapConfig {
    fn default() -> Self {
        Self {
            map_type: WeightMode::Max,
            energy: EnergyKind::Laplacian,
            kernel_size: 5,
            blur_size: 5,
            smooth_size: 15,
            temperature: 0.1,
            levels: 3,
            float_type: FloatPrecision::F32,
        }
    }
}

impl DepthMapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size % 2 == 0 || self.kernel_size > 31 {
            return Err(StackError::configuration("kernel_size", self.kernel_size));
        }
        if self.blur_size > 1 && self.blur_size % 2 == 0 {
            return Err(StackError::configuration("blur_size", self.blur_size));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(StackError::configuration("temperature", self.temperature));
        }
        if self.levels == 0 {
            return Err(StackError::configuration("levels", 0));
        }
        Ok(())
    }
}

/// Focus energy of a grey plane
pub fn energy_map<F: Sample>(gray: &Plane<F>, config: &DepthMapConfig) -> Plane<F> {
    match config.energy {
        EnergyKind::Sobel => sobel_energy(gray),
        EnergyKind::Laplacian => {
            let blurred = if config.blur_size > 1 {
                gaussian_blur(gray, config.blur_size, 0.0)
            } else {
                gray.clone()
            };
            laplacian(&blurred, config.kernel_size).map(|v| v.abs())
        }
    }
}

/// Scale the whole volume by its global maximum, when that is positive.
pub fn normalize_energies<F: Sample>(energies: &mut [Plane<F>]) {
    let max = energies
        .iter()
        .map(|e| e.max_value())
        .fold(F::zero(), |acc, v| if v > acc { v } else { acc });
    if max > F::zero() {
        for energy in energies.iter_mut() {
            for v in energy.data_mut() {
                *v = *v / max;
            }
        }
    }
}

/// Per-pixel blending weights; they sum to one at every pixel.
pub fn weight_maps<F: Sample>(
    energies: &[Plane<F>],
    mode: WeightMode,
    temperature: f64,
) -> Vec<Plane<F>> {
    let Some(first) = energies.first() else {
        return Vec::new();
    };
    let (w, h) = (first.width(), first.height());
    let n = energies.len();
    let uniform: F = cast(1.0 / n as f64);
    let temperature: F = cast(temperature);
    let mut weights = vec![vec![F::zero(); w * h]; n];

    for p in 0..w * h {
        match mode {
            WeightMode::Average => {
                let sum = energies.iter().fold(F::zero(), |acc, e| acc + e.data()[p]);
                for (i, weight) in weights.iter_mut().enumerate() {
                    weight[p] = if sum > F::zero() {
                        energies[i].data()[p] / sum
                    } else {
                        uniform
                    };
                }
            }
            WeightMode::Max => {
                let peak = energies
                    .iter()
                    .map(|e| e.data()[p])
                    .fold(F::neg_infinity(), |acc, v| if v > acc { v } else { acc });
                let mut sum = F::zero();
                for (i, weight) in weights.iter_mut().enumerate() {
                    let v = ((energies[i].data()[p] - peak) / temperature).exp();
                    weight[p] = v;
                    sum = sum + v;
                }
                for weight in weights.iter_mut() {
                    weight[p] = weight[p] / sum;
                }
            }
        }
    }
    debug_assert!((0..w * h).all(|p| {
        let total = weights.iter().fold(0.0, |acc, w| acc + to_f64(w[p]));
        (total - 1.0).abs() < 1e-3
    }));

    weights
        .into_iter()
        .map(|data| Plane::from_vec(w, h, data))
        .collect()
}

/// Composite plus per-frame mean weight
#[derive(Debug, Clone)]
pub struct Composite {
    pub frame: Frame,
    pub mean_weights: Vec<f64>,
}

pub struct DepthMapStack {
    name: String,
    output: String,
    output_name: Option<String>,
    config: DepthMapConfig,
}

impl DepthMapStack {
    pub fn new(
        name: impl Into<String>,
        output: impl Into<String>,
        config: DepthMapConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            output: output.into(),
            output_name: None,
            config,
        })
    }

    pub fn with_output_name(mut self, output_name: impl Into<String>) -> Self {
        self.output_name = Some(output_name.into());
        self
    }

    pub fn config(&self) -> &DepthMapConfig {
        &self.config
    }

    /// File name of the composite; derived from the first frame's extension
    /// unless set explicitly. 16-bit composites never go to JPEG.
    pub fn output_name(&self, first_frame: &str, depth: BitDepth) -> String {
        if let Some(name) = &self.output_name {
            return name.clone();
        }
        let ext = Path::new(first_frame)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let ext = match (ext.as_str(), depth) {
            ("jpg" | "jpeg", BitDepth::Sixteen) => "tif".to_string(),
            _ => ext,
        };
        format!("{}.{}", self.name, ext)
    }

    /// Two passes over `frames`: energies and weights, then the pyramid blend.
    pub fn composite(
        &self,
        frames: &[String],
        source: &dyn ImageSource,
        progress: &mut dyn ProgressSink,
    ) -> Result<Composite> {
        if frames.is_empty() {
            return Err(StackError::InsufficientFrames {
                required: 1,
                provided: 0,
            });
        }
        match self.config.float_type {
            FloatPrecision::F32 => self.composite_with::<f32>(frames, source, progress),
            FloatPrecision::F64 => self.composite_with::<f64>(frames, source, progress),
        }
    }

    fn composite_with<F: Sample>(
        &self,
        frames: &[String],
        source: &dyn ImageSource,
        progress: &mut dyn ProgressSink,
    ) -> Result<Composite> {
        let n = frames.len();
        log::info!("{}: depth map over {} frames", self.name, n);

        let mut meta: Option<FrameMeta> = None;
        let mut energies: Vec<Plane<F>> = Vec::with_capacity(n);
        for (i, name) in frames.iter().enumerate() {
            let frame = source.read(name)?;
            meta.get_or_insert(frame.meta()).validate(&frame)?;
            energies.push(energy_map(&frame.luma_plane::<F>(), &self.config));
            poll(progress, &self.name, i)?;
        }
        let meta = meta.ok_or(StackError::InsufficientFrames {
            required: 1,
            provided: 0,
        })?;

        normalize_energies(&mut energies);
        if self.config.smooth_size > 0 {
            energies = energies
                .iter()
                .map(|e| bilateral(e, self.config.smooth_size, SMOOTH_SIGMA, SMOOTH_SIGMA))
                .collect();
        }
        let weights = weight_maps(&energies, self.config.map_type, self.config.temperature);
        drop(energies);
        let mean_weights: Vec<f64> = weights
            .iter()
            .map(|w| w.data().iter().map(|&v| to_f64(v)).sum::<f64>() / w.len().max(1) as f64)
            .collect();
        assert_invariant!(
            (mean_weights.iter().sum::<f64>() - 1.0).abs() < 1e-3,
            "Blend weights sum to one",
            "DepthMapStack::composite"
        );
        log::debug!("{}: weights ready", self.name);

        let channels = meta.shape.channels as usize;
        let mut accumulated: Vec<Vec<Plane<F>>> = Vec::new();
        for (i, name) in frames.iter().enumerate() {
            let frame = source.read(name)?;
            meta.validate(&frame)?;
            let weight_pyramid = gaussian_pyramid(&weights[i], self.config.levels);

            for c in 0..channels {
                let gaussian = gaussian_pyramid(&frame.channel_plane::<F>(c), self.config.levels);
                let bands = laplacian_pyramid(&gaussian);
                let weighted: Vec<Plane<F>> = bands
                    .iter()
                    .zip(&weight_pyramid)
                    .map(|(band, weight)| band.zip_map(weight, |a, b| a * b))
                    .collect();
                match accumulated.get_mut(c) {
                    Some(levels) => {
                        for (acc, band) in levels.iter_mut().zip(&weighted) {
                            acc.add_assign(band);
                        }
                    }
                    None => accumulated.push(weighted),
                }
            }
            poll(progress, &self.name, i + n)?;
        }

        let planes = accumulated
            .iter()
            .map(|bands| {
                collapse(bands)
                    .map(|p| p.map(|v| v.abs()))
                    .ok_or_else(|| StackError::configuration("levels", self.config.levels))
            })
            .collect::<Result<Vec<_>>>()?;
        let frame = Frame::from_planes(&planes, meta.depth)?;
        Ok(Composite {
            frame,
            mean_weights,
        })
    }
}

impl Stage for DepthMapStack {
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
        let composite = self.composite(frames, source, progress)?;
        let name = self.output_name(&frames[0], composite.frame.depth());
        sink.write(&name, &composite.frame)?;
        log::info!("{}: wrote {}", self.name, name);

        Ok(StageReport {
            stage: self.name.clone(),
            frames_written: 1,
            frames_dropped: 0,
            outputs: vec![name],
            actions: vec![ActionSummary {
                action: "depth_map".to_string(),
                metric: "mean_weight".to_string(),
                values: composite.mean_weights.iter().map(|&w| vec![w]).collect(),
            }],
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}
