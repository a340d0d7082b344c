//! Photometric balance against the reference frame
//!
//! Histograms of the reference are collected once per pass. Every other frame
//! gets a per-channel correction (a factor, a gamma or a full histogram
//! match), which is turned into a lookup table and applied.

use super::actions::{ActionSummary, FrameAction, SequenceContext, StepInput};
use crate::backend::color::{hls_to_rgb, hsv_to_rgb, rgb_to_hls, rgb_to_hsv};
use crate::errors::{Result, StackError};
use crate::types::{BitDepth, Frame};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const GAMMA_MIN: f64 = 0.1;
const GAMMA_MAX: f64 = 5.0;
const GAMMA_ITERATIONS: usize = 100;

/// Which channels are corrected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceChannel {
    /// One LUT from luma, applied to every channel
    Luminance,
    Rgb,
    /// Saturation and value; hue untouched
    Hsv,
    /// Lightness and saturation; hue untouched
    Hls,
}

impl BalanceChannel {
    pub fn lut_count(self) -> usize {
        match self {
            Self::Luminance => 1,
            Self::Rgb => 3,
            Self::Hsv | Self::Hls => 2,
        }
    }

    pub fn requires_color(self) -> bool {
        self != Self::Luminance
    }
}

impl FromStr for BalanceChannel {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "luminance" | "lumi" => Ok(Self::Luminance),
            "rgb" => Ok(Self::Rgb),
            "hsv" => Ok(Self::Hsv),
            "hls" => Ok(Self::Hls),
            _ => Err(StackError::configuration("channel", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    Linear,
    Gamma,
    MatchHist,
}

impl FromStr for CorrectionKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "gamma" => Ok(Self::Gamma),
            "match_hist" | "histogram" => Ok(Self::MatchHist),
            _ => Err(StackError::configuration("correction", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub channel: BalanceChannel,
    pub correction: CorrectionKind,
    /// Radius of the centred circular mask as a fraction of `min(w, h)`
    pub mask_size: Option<f64>,
    /// Intensity interval used for weighted means
    pub intensity_min: u32,
    pub intensity_max: Option<u32>,
    /// Histogram sampling step; 8 for linear/gamma and 1 for matching when unset
    pub subsample: Option<usize>,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            channel: BalanceChannel::Luminance,
            correction: CorrectionKind::Linear,
            mask_size: None,
            intensity_min: 0,
            intensity_max: None,
            subsample: None,
        }
    }
}

impl BalanceConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(mask) = self.mask_size {
            if !(mask > 0.0 && mask.is_finite()) {
                return Err(StackError::configuration("mask_size", mask));
            }
        }
        if let Some(max) = self.intensity_max {
            if max < self.intensity_min {
                return Err(StackError::configuration("intensity_max", max));
            }
        }
        if self.subsample == Some(0) {
            return Err(StackError::configuration("subsample", 0));
        }
        Ok(())
    }

    pub fn subsample_step(&self) -> usize {
        self.subsample.unwrap_or(match self.correction {
            CorrectionKind::MatchHist => 1,
            _ => 8,
        })
    }

    fn interval(&self, depth: BitDepth) -> Interval {
        let levels = depth.levels();
        let end = self
            .intensity_max
            .map(|m| (m as usize + 1).min(levels))
            .unwrap_or(levels);
        Interval {
            start: (self.intensity_min as usize).min(end),
            end,
        }
    }
}

/// Half-open bin range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

/// Correction value for one channel
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    Identity,
    Factor(f64),
    Gamma(f64),
    /// Candidate cumulative histogram, scaled to `[0, max]`
    Cumulative(Vec<f64>),
}

/// Histogram-weighted mean of `value(i)` over `interval`; `None` when empty
fn weighted_mean(histogram: &[u64], interval: Interval, value: impl Fn(usize) -> f64) -> Option<f64> {
    let end = interval.end.min(histogram.len());
    let (mut sum, mut weight) = (0.0, 0.0);
    for (i, &count) in histogram.iter().enumerate().take(end).skip(interval.start) {
        sum += value(i) * count as f64;
        weight += count as f64;
    }
    (weight > 0.0).then(|| sum / weight)
}

/// `cumsum / total * max`; `None` for an empty histogram
fn cumulative(histogram: &[u64], max: f64) -> Option<Vec<f64>> {
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return None;
    }
    let mut acc = 0u64;
    Some(
        histogram
            .iter()
            .map(|&c| {
                acc += c;
                acc as f64 / total as f64 * max
            })
            .collect(),
    )
}

fn gamma_value(i: usize, max: f64, gamma: f64) -> f64 {
    (i as f64 / max).powf(1.0 / gamma) * max
}

fn quantize(value: f64, max: f64) -> u16 {
    value.round().clamp(0.0, max) as u16
}

/// Reference statistics and the rules turning a candidate histogram into a LUT
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionMap {
    Linear {
        max: f64,
        interval: Interval,
        reference_means: Vec<Option<f64>>,
    },
    Gamma {
        max: f64,
        interval: Interval,
        reference_means: Vec<Option<f64>>,
    },
    MatchHist {
        max: f64,
        reference_cdfs: Vec<Option<Vec<f64>>>,
    },
}

impl CorrectionMap {
    pub fn new(
        kind: CorrectionKind,
        depth: BitDepth,
        interval: Interval,
        reference_histograms: &[Vec<u64>],
    ) -> Self {
        let max = depth.max_value() as f64;
        let means = || {
            reference_histograms
                .iter()
                .map(|h| weighted_mean(h, interval, |i| i as f64))
                .collect::<Vec<_>>()
        };
        match kind {
            CorrectionKind::Linear => Self::Linear {
                max,
                interval,
                reference_means: means(),
            },
            CorrectionKind::Gamma => Self::Gamma {
                max,
                interval,
                reference_means: means(),
            },
            CorrectionKind::MatchHist => Self::MatchHist {
                max,
                reference_cdfs: reference_histograms
                    .iter()
                    .map(|h| cumulative(h, max))
                    .collect(),
            },
        }
    }

    fn max(&self) -> f64 {
        match self {
            Self::Linear { max, .. } | Self::Gamma { max, .. } | Self::MatchHist { max, .. } => *max,
        }
    }

    pub fn compute_correction(&self, channel: usize, histogram: &[u64]) -> Correction {
        match self {
            Self::Linear {
                interval,
                reference_means,
                ..
            } => {
                let reference = reference_means.get(channel).copied().flatten();
                let candidate = weighted_mean(histogram, *interval, |i| i as f64);
                match (reference, candidate) {
                    (Some(r), Some(c)) if c > 0.0 => Correction::Factor(r / c),
                    _ => Correction::Factor(1.0),
                }
            }
            Self::Gamma {
                max,
                interval,
                reference_means,
            } => {
                let reference = reference_means.get(channel).copied().flatten();
                match (reference, weighted_mean(histogram, *interval, |i| i as f64)) {
                    (Some(r), Some(_)) => Correction::Gamma(solve_gamma(histogram, *interval, *max, r)),
                    _ => Correction::Gamma(1.0),
                }
            }
            Self::MatchHist { max, reference_cdfs } => {
                match (reference_cdfs.get(channel).and_then(|c| c.as_ref()), cumulative(histogram, *max)) {
                    (Some(_), Some(cdf)) => Correction::Cumulative(cdf),
                    _ => Correction::Identity,
                }
            }
        }
    }

    /// Rounded lookup table over every intensity of the bit depth
    pub fn build_lut(&self, channel: usize, correction: &Correction) -> Vec<u16> {
        let max = self.max();
        let levels = max as usize + 1;
        match correction {
            Correction::Identity => (0..levels).map(|i| i as u16).collect(),
            Correction::Factor(f) => (0..levels).map(|i| quantize(i as f64 * f, max)).collect(),
            Correction::Gamma(g) => (0..levels)
                .map(|i| quantize(gamma_value(i, max, *g), max))
                .collect(),
            Correction::Cumulative(candidate) => match self {
                Self::MatchHist { reference_cdfs, .. } => {
                    match reference_cdfs.get(channel).and_then(|c| c.as_ref()) {
                        Some(reference) => match_lut(candidate, reference)
                            .into_iter()
                            .map(|v| quantize(v, max))
                            .collect(),
                        None => (0..levels).map(|i| i as u16).collect(),
                    }
                }
                _ => (0..levels).map(|i| i as u16).collect(),
            },
        }
    }

    /// Scalar diagnostic for the correction; 1.0 means unchanged
    pub fn summarize(&self, channel: usize, correction: &Correction) -> f64 {
        match correction {
            Correction::Identity => 1.0,
            Correction::Factor(f) => *f,
            Correction::Gamma(g) => *g,
            Correction::Cumulative(candidate) => {
                let reference = match self {
                    Self::MatchHist { reference_cdfs, .. } => {
                        reference_cdfs.get(channel).and_then(|c| c.as_ref())
                    }
                    _ => None,
                };
                let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
                match reference.map(|r| mean(r)) {
                    Some(r) if r > 0.0 => mean(candidate) / r,
                    _ => 1.0,
                }
            }
        }
    }
}

/// Bisect for the gamma whose corrected weighted mean equals `target`.
fn solve_gamma(histogram: &[u64], interval: Interval, max: f64, target: f64) -> f64 {
    let residual = |g: f64| {
        weighted_mean(histogram, interval, |i| gamma_value(i, max, g)).unwrap_or(target) - target
    };
    if weighted_mean(histogram, interval, |i| i as f64) == Some(target) {
        return 1.0;
    }

    let (mut lo, mut hi) = (GAMMA_MIN, GAMMA_MAX);
    let (mut f_lo, f_hi) = (residual(lo), residual(hi));
    if f_lo == 0.0 {
        return lo;
    }
    if f_hi == 0.0 {
        return hi;
    }
    if f_lo.signum() == f_hi.signum() {
        let nearest = if f_lo.abs() <= f_hi.abs() { lo } else { hi };
        log::warn!(
            "Gamma correction out of range [{}, {}], using {}",
            GAMMA_MIN,
            GAMMA_MAX,
            nearest
        );
        return nearest;
    }

    for _ in 0..GAMMA_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        let f_mid = residual(mid);
        if f_mid == 0.0 {
            return mid;
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Map each candidate cumulative value onto the intensity where the reference
/// cumulative reaches it, then extend clamped head and tail runs linearly.
fn match_lut(candidate: &[f64], reference: &[f64]) -> Vec<f64> {
    let (Some(&r_min), Some(&r_max)) = (reference.first(), reference.last()) else {
        return Vec::new();
    };
    let last = reference.len() - 1;
    let mut lut: Vec<f64> = candidate
        .iter()
        .map(|&c| {
            let v = c.clamp(r_min, r_max);
            let j = reference.partition_point(|&r| r < v);
            if j == 0 {
                0.0
            } else if j > last {
                last as f64
            } else {
                let (c0, c1) = (reference[j - 1], reference[j]);
                if c1 > c0 {
                    (j - 1) as f64 + (v - c0) / (c1 - c0)
                } else {
                    j as f64
                }
            }
        })
        .collect();
    extend_clamped_runs(&mut lut);
    lut
}

fn extend_clamped_runs(lut: &mut [f64]) {
    let (Some(&head), Some(&tail)) = (lut.first(), lut.last()) else {
        return;
    };
    let Some(first) = lut.iter().position(|&v| v != head) else {
        return;
    };
    let Some(last) = lut.iter().rposition(|&v| v != tail) else {
        return;
    };
    if last <= first {
        return;
    }

    // Slope of the two nearest non-clamped samples on each side
    let slope = lut[first + 1] - lut[first];
    for i in 0..first {
        lut[i] = lut[first] - slope * (first - i) as f64;
    }
    let slope = lut[last] - lut[last - 1];
    for i in last + 1..lut.len() {
        lut[i] = lut[last] + slope * (i - last) as f64;
    }
}

/// Linear interpolation into a LUT at a fractional intensity
fn interpolate(lut: &[u16], x: f64) -> f64 {
    let last = lut.len().saturating_sub(1);
    let x = x.clamp(0.0, last as f64);
    let i = x.floor() as usize;
    if i >= last {
        return lut[last] as f64;
    }
    let t = x - i as f64;
    lut[i] as f64 * (1.0 - t) + lut[i + 1] as f64 * t
}

pub struct BalanceEngine {
    config: BalanceConfig,
    map: Option<CorrectionMap>,
    reference_index: usize,
    corrections: Vec<Vec<f64>>,
}

impl BalanceEngine {
    pub fn new(config: BalanceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            map: None,
            reference_index: 0,
            corrections: Vec::new(),
        })
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    pub fn map(&self) -> Option<&CorrectionMap> {
        self.map.as_ref()
    }

    /// Correction summary per frame and LUT channel
    pub fn corrections(&self) -> &[Vec<f64>] {
        &self.corrections
    }

    pub fn establish_reference(&mut self, reference: &Frame) -> Result<()> {
        if self.config.channel.requires_color() && reference.channels() != 3 {
            return Err(StackError::configuration(
                "channel",
                format!("{:?} on a {}-channel frame", self.config.channel, reference.channels()),
            ));
        }
        let histograms = self.histograms(reference);
        self.map = Some(CorrectionMap::new(
            self.config.correction,
            reference.depth(),
            self.config.interval(reference.depth()),
            &histograms,
        ));
        Ok(())
    }

    fn selected(&self, width: usize, height: usize) -> impl Iterator<Item = usize> + '_ {
        let step = self.config.subsample_step().max(1);
        let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
        let radius = self
            .config
            .mask_size
            .map(|m| width.min(height) as f64 * m / 2.0);
        (0..height).step_by(step).flat_map(move |y| {
            (0..width).step_by(step).filter_map(move |x| {
                let inside = radius.map_or(true, |r| {
                    let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                    dx * dx + dy * dy <= r * r
                });
                inside.then_some(y * width + x)
            })
        })
    }

    /// Histograms of the corrected channels under the mask and subsampling
    pub fn histograms(&self, frame: &Frame) -> Vec<Vec<u64>> {
        let levels = frame.depth().levels();
        let max = frame.depth().max_value() as f64;
        let bin = |v: f64| (v.round().clamp(0.0, max)) as usize;
        let channel = self.config.channel;
        let mut histograms = vec![vec![0u64; levels]; channel.lut_count()];

        let rgb = |p: usize| {
            (
                frame.sample(p, 0) as f64,
                frame.sample(p, 1) as f64,
                frame.sample(p, 2) as f64,
            )
        };
        for p in self.selected(frame.width() as usize, frame.height() as usize) {
            match channel {
                BalanceChannel::Luminance => histograms[0][bin(frame.luma_at(p))] += 1,
                BalanceChannel::Rgb => {
                    for (c, h) in histograms.iter_mut().enumerate() {
                        h[frame.sample(p, c) as usize] += 1;
                    }
                }
                BalanceChannel::Hsv => {
                    let (r, g, b) = rgb(p);
                    let (_, s, v) = rgb_to_hsv(r, g, b, max);
                    histograms[0][bin(s)] += 1;
                    histograms[1][bin(v)] += 1;
                }
                BalanceChannel::Hls => {
                    let (r, g, b) = rgb(p);
                    let (_, l, s) = rgb_to_hls(r, g, b, max);
                    histograms[0][bin(l)] += 1;
                    histograms[1][bin(s)] += 1;
                }
            }
        }
        histograms
    }

    /// Correct `frame` towards the reference; returns the corrected frame and
    /// one summary value per LUT channel.
    pub fn balance(&self, frame: &Frame) -> Result<(Frame, Vec<f64>)> {
        let map = self.map.as_ref().ok_or(StackError::ReferenceUnavailable {
            index: self.reference_index,
        })?;
        if self.config.channel.requires_color() && frame.channels() != 3 {
            return Err(StackError::configuration("channel", frame.channels()));
        }

        let histograms = self.histograms(frame);
        let mut luts = Vec::with_capacity(histograms.len());
        let mut summary = Vec::with_capacity(histograms.len());
        for (c, histogram) in histograms.iter().enumerate() {
            let correction = map.compute_correction(c, histogram);
            summary.push(map.summarize(c, &correction));
            luts.push(map.build_lut(c, &correction));
        }

        let max = frame.depth().max_value() as f64;
        let channels = frame.channels() as usize;
        let mut samples = frame.samples();
        match self.config.channel {
            BalanceChannel::Luminance => {
                for v in samples.iter_mut() {
                    *v = luts[0][*v as usize];
                }
            }
            BalanceChannel::Rgb => {
                for (i, v) in samples.iter_mut().enumerate() {
                    *v = luts[i % channels][*v as usize];
                }
            }
            BalanceChannel::Hsv | BalanceChannel::Hls => {
                for px in samples.chunks_exact_mut(3) {
                    let (r, g, b) = (px[0] as f64, px[1] as f64, px[2] as f64);
                    let (r, g, b) = if self.config.channel == BalanceChannel::Hsv {
                        let (h, s, v) = rgb_to_hsv(r, g, b, max);
                        hsv_to_rgb(h, interpolate(&luts[0], s), interpolate(&luts[1], v), max)
                    } else {
                        let (h, l, s) = rgb_to_hls(r, g, b, max);
                        hls_to_rgb(h, interpolate(&luts[0], l), interpolate(&luts[1], s), max)
                    };
                    px[0] = quantize(r, max);
                    px[1] = quantize(g, max);
                    px[2] = quantize(b, max);
                }
            }
        }

        let frame = Frame::from_samples(frame.shape(), frame.depth(), &samples)?;
        Ok((frame, summary))
    }
}

impl FrameAction for BalanceEngine {
    fn name(&self) -> &str {
        "balance"
    }

    fn begin(&mut self, ctx: &SequenceContext<'_>) -> Result<()> {
        self.reference_index = ctx.plan.reference();
        self.corrections = vec![vec![1.0; self.config.channel.lut_count()]; ctx.frames.len()];
        self.establish_reference(ctx.reference)
    }

    fn run_frame(&mut self, input: &StepInput<'_>, frame: Frame) -> Result<Option<Frame>> {
        if input.is_reference() {
            return Ok(Some(frame));
        }
        let (balanced, summary) = self.balance(&frame)?;
        log::debug!("Balanced {}: {:?}", input.name, summary);
        if let Some(slot) = self.corrections.get_mut(input.step.index) {
            *slot = summary;
        }
        Ok(Some(balanced))
    }

    fn summary(&self) -> ActionSummary {
        ActionSummary {
            action: "balance".to_string(),
            metric: "correction".to_string(),
            values: self.corrections.clone(),
        }
    }
}
