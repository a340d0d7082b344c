//! Frame buffers and their metadata

use crate::backend::color::luma;
use crate::backend::plane::{cast, to_f64, Plane, Sample};
use crate::errors::{Result, StackError};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits per channel of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    pub fn bits(self) -> u32 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    /// Number of representable intensities (`2^bits`)
    pub fn levels(self) -> usize {
        1usize << self.bits()
    }

    /// Largest representable intensity (`2^bits - 1`)
    pub fn max_value(self) -> u16 {
        match self {
            Self::Eight => u8::MAX as u16,
            Self::Sixteen => u16::MAX,
        }
    }
}

impl fmt::Display for BitDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Width, height and channel count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl Shape {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn sample_count(&self) -> usize {
        self.pixel_count() * self.channels as usize
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Metadata every frame of a sequence must share with the first one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub shape: Shape,
    pub depth: BitDepth,
}

impl FrameMeta {
    /// Depth is compared first, then shape.
    pub fn validate(&self, frame: &Frame) -> Result<()> {
        if frame.depth() != self.depth {
            return Err(StackError::BitDepthMismatch {
                expected: self.depth,
                got: frame.depth(),
            });
        }
        if frame.shape() != self.shape {
            return Err(StackError::ShapeMismatch {
                expected: self.shape,
                got: frame.shape(),
            });
        }
        Ok(())
    }
}

/// Interleaved samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(d) => d.len(),
            Self::U16(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> u16 {
        match self {
            Self::U8(d) => d[index] as u16,
            Self::U16(d) => d[index],
        }
    }
}

/// An owned image: 1 (grey) or 3 (RGB) interleaved channels at 8 or 16 bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    channels: u8,
    data: PixelData,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, data: PixelData) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(StackError::configuration("channels", channels));
        }
        let expected_size = width as usize * height as usize * channels as usize;
        if data.len() != expected_size {
            return Err(StackError::DataCorruption {
                frame_size: data.len(),
                expected_size,
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_u8(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, channels, PixelData::U8(data))
    }

    pub fn from_u16(width: u32, height: u32, channels: u8, data: Vec<u16>) -> Result<Self> {
        Self::new(width, height, channels, PixelData::U16(data))
    }

    /// Build a frame from native-range samples, clamping into the depth's range.
    pub fn from_samples(shape: Shape, depth: BitDepth, samples: &[u16]) -> Result<Self> {
        let max = depth.max_value();
        let data = match depth {
            BitDepth::Eight => PixelData::U8(samples.iter().map(|&v| v.min(max) as u8).collect()),
            BitDepth::Sixteen => PixelData::U16(samples.to_vec()),
        };
        Self::new(shape.width, shape.height, shape.channels, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &PixelData {
        &self.data
    }

    pub fn shape(&self) -> Shape {
        Shape {
            width: self.width,
            height: self.height,
            channels: self.channels,
        }
    }

    pub fn depth(&self) -> BitDepth {
        match self.data {
            PixelData::U8(_) => BitDepth::Eight,
            PixelData::U16(_) => BitDepth::Sixteen,
        }
    }

    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            shape: self.shape(),
            depth: self.depth(),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn sample(&self, pixel: usize, channel: usize) -> u16 {
        self.data.get(pixel * self.channels as usize + channel)
    }

    /// All samples widened to `u16`
    pub fn samples(&self) -> Vec<u16> {
        match &self.data {
            PixelData::U8(d) => d.iter().map(|&v| v as u16).collect(),
            PixelData::U16(d) => d.clone(),
        }
    }

    /// Luma of one pixel in the native range
    #[inline]
    pub fn luma_at(&self, pixel: usize) -> f64 {
        if self.channels == 1 {
            self.sample(pixel, 0) as f64
        } else {
            luma(
                self.sample(pixel, 0) as f64,
                self.sample(pixel, 1) as f64,
                self.sample(pixel, 2) as f64,
            )
        }
    }

    /// One channel as a float plane in the native range
    pub fn channel_plane<F: Sample>(&self, channel: usize) -> Plane<F> {
        let data = (0..self.pixel_count())
            .map(|p| cast(self.sample(p, channel) as f64))
            .collect();
        Plane::from_vec(self.width as usize, self.height as usize, data)
    }

    /// Luma as a float plane in the native range
    pub fn luma_plane<F: Sample>(&self) -> Plane<F> {
        let data = (0..self.pixel_count())
            .map(|p| cast(self.luma_at(p)))
            .collect();
        Plane::from_vec(self.width as usize, self.height as usize, data)
    }

    /// 8-bit luma for feature detection; 16-bit samples are scaled by 1/257.
    pub fn to_gray8(&self) -> GrayImage {
        let scale = match self.depth() {
            BitDepth::Eight => 1.0,
            BitDepth::Sixteen => 1.0 / 257.0,
        };
        let data = (0..self.pixel_count())
            .map(|p| (self.luma_at(p) * scale).round().clamp(0.0, 255.0) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, data)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Reassemble per-channel planes, rounding and clamping to `depth`.
    pub fn from_planes<F: Sample>(planes: &[Plane<F>], depth: BitDepth) -> Result<Self> {
        let first = planes.first().ok_or_else(|| StackError::configuration("channels", 0))?;
        let (w, h) = (first.width(), first.height());
        let channels = planes.len();
        let max = depth.max_value() as f64;
        let mut samples = Vec::with_capacity(w * h * channels);
        for p in 0..w * h {
            for plane in planes {
                let v = to_f64(plane.data()[p]).round().clamp(0.0, max);
                samples.push(v as u16);
            }
        }
        let shape = Shape {
            width: w as u32,
            height: h as u32,
            channels: channels as u8,
        };
        Self::from_samples(shape, depth, &samples)
    }

    pub fn from_dynamic(image: DynamicImage) -> Result<Self> {
        let (w, h) = (image.width(), image.height());
        match image {
            DynamicImage::ImageLuma8(buf) => Self::from_u8(w, h, 1, buf.into_raw()),
            DynamicImage::ImageRgb8(buf) => Self::from_u8(w, h, 3, buf.into_raw()),
            DynamicImage::ImageLuma16(buf) => Self::from_u16(w, h, 1, buf.into_raw()),
            DynamicImage::ImageRgb16(buf) => Self::from_u16(w, h, 3, buf.into_raw()),
            DynamicImage::ImageLumaA16(_) => Self::from_u16(w, h, 1, image.into_luma16().into_raw()),
            DynamicImage::ImageRgba16(_) => Self::from_u16(w, h, 3, image.into_rgb16().into_raw()),
            DynamicImage::ImageLumaA8(_) => Self::from_u8(w, h, 1, image.into_luma8().into_raw()),
            other => Self::from_u8(w, h, 3, other.into_rgb8().into_raw()),
        }
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage> {
        let corrupt = || StackError::DataCorruption {
            frame_size: self.data.len(),
            expected_size: self.shape().sample_count(),
        };
        let (w, h) = (self.width, self.height);
        let image = match (&self.data, self.channels) {
            (PixelData::U8(d), 1) => DynamicImage::ImageLuma8(
                ImageBuffer::<Luma<u8>, _>::from_raw(w, h, d.clone()).ok_or_else(corrupt)?,
            ),
            (PixelData::U8(d), _) => DynamicImage::ImageRgb8(
                ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, d.clone()).ok_or_else(corrupt)?,
            ),
            (PixelData::U16(d), 1) => DynamicImage::ImageLuma16(
                ImageBuffer::<Luma<u16>, _>::from_raw(w, h, d.clone()).ok_or_else(corrupt)?,
            ),
            (PixelData::U16(d), _) => DynamicImage::ImageRgb16(
                ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, d.clone()).ok_or_else(corrupt)?,
            ),
        };
        Ok(image)
    }
}
