//! Procedural test frames

use crate::errors::Result;
use crate::io::{DirectorySink, OutputSink};
use crate::progress::ProgressSink;
use crate::types::Frame;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Edge length of the random blocks in [`textured_frame`]
const BLOCK: u32 = 4;

fn block_values(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let (bw, bh) = (width.div_ceil(BLOCK), height.div_ceil(BLOCK));
    let mut rng = StdRng::seed_from_u64(seed);
    let blocks: Vec<u8> = (0..bw * bh).map(|_| rng.random_range(0..=255u8)).collect();
    (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .map(|(x, y)| blocks[((y / BLOCK) * bw + x / BLOCK) as usize])
        .collect()
}

/// 8-bit grey frame of random 4x4 blocks
pub fn textured_frame(width: u32, height: u32, seed: u64) -> Frame {
    Frame::from_u8(width, height, 1, block_values(width, height, seed))
        .unwrap_or_else(|e| panic!("synthetic frame: {}", e))
}

/// 8-bit RGB frame; each channel is an independent block texture
pub fn textured_rgb_frame(width: u32, height: u32, seed: u64) -> Frame {
    let planes: Vec<Vec<u8>> = (0..3)
        .map(|c| block_values(width, height, seed.wrapping_add(c)))
        .collect();
    let data = (0..(width * height) as usize)
        .flat_map(|p| planes.iter().map(move |plane| plane[p]))
        .collect();
    Frame::from_u8(width, height, 3, data).unwrap_or_else(|e| panic!("synthetic frame: {}", e))
}

/// Horizontal ramp from 0 to the full 8-bit range
pub fn gradient_frame(width: u32, height: u32) -> Frame {
    let span = (width.max(2) - 1) as f64;
    let data = (0..height)
        .flat_map(|_| (0..width).map(move |x| (x as f64 / span * 255.0).round() as u8))
        .collect();
    Frame::from_u8(width, height, 1, data).unwrap_or_else(|e| panic!("synthetic frame: {}", e))
}

/// Content moved by `(dx, dy)`: output `(x, y)` holds input `(x - dx, y - dy)`,
/// with edges replicated.
pub fn shifted_frame(frame: &Frame, dx: i32, dy: i32) -> Frame {
    let (w, h) = (frame.width() as i32, frame.height() as i32);
    let channels = frame.channels() as usize;
    let mut samples = Vec::with_capacity(frame.shape().sample_count());
    for y in 0..h {
        for x in 0..w {
            let sx = (x - dx).clamp(0, w - 1);
            let sy = (y - dy).clamp(0, h - 1);
            let p = (sy * w + sx) as usize;
            for c in 0..channels {
                samples.push(frame.sample(p, c));
            }
        }
    }
    Frame::from_samples(frame.shape(), frame.depth(), &samples)
        .unwrap_or_else(|e| panic!("synthetic frame: {}", e))
}

/// Frames sharing one noise texture. Inside the centred `patch` square the
/// texture amplitude is scaled by `contrasts[k]`; outside it is fixed at half.
pub fn contrast_patch_stack(size: u32, patch: u32, contrasts: &[f64], seed: u64) -> Vec<Frame> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise: Vec<f64> = (0..size * size)
        .map(|_| rng.random_range(-100.0..100.0))
        .collect();
    let lo = (size - patch) / 2;
    let inside = |x: u32, y: u32| (lo..lo + patch).contains(&x) && (lo..lo + patch).contains(&y);

    contrasts
        .iter()
        .map(|&contrast| {
            let data = (0..size * size)
                .map(|i| {
                    let (x, y) = (i % size, i / size);
                    let amplitude = if inside(x, y) { contrast } else { 0.5 };
                    (128.0 + noise[i as usize] * amplitude).round().clamp(0.0, 255.0) as u8
                })
                .collect();
            Frame::from_u8(size, size, 1, data).unwrap_or_else(|e| panic!("synthetic frame: {}", e))
        })
        .collect()
}

/// Write `frames` as `frame_000.png`, `frame_001.png`, ... and return the names.
pub fn write_frames(dir: &Path, frames: &[Frame]) -> Result<Vec<String>> {
    let mut sink = DirectorySink::new(dir);
    let mut names = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        let name = format!("frame_{:03}.png", i);
        sink.write(&name, frame)?;
        names.push(name);
    }
    Ok(names)
}

/// Progress sink that requests a stop after a fixed number of steps
#[derive(Debug, Clone)]
pub struct StopAfter {
    remaining: usize,
    pub seen: Vec<usize>,
}

impl StopAfter {
    pub fn new(steps: usize) -> Self {
        Self {
            remaining: steps,
            seen: Vec::new(),
        }
    }
}

impl ProgressSink for StopAfter {
    fn on_step(&mut self, index: usize) {
        self.seen.push(index);
        self.remaining = self.remaining.saturating_sub(1);
    }

    fn check_running(&self) -> bool {
        self.remaining > 0
    }
}
