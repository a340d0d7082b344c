//! Keypoint detection, description and brute-force matching
//!
//! Detectors and descriptors are independent: any detector can feed either
//! descriptor. Binary BRIEF strings compare by Hamming distance, normalised
//! patch vectors by Euclidean distance.

use super::filter::{deriv_kernel, gaussian_blur, sep_filter};
use super::plane::Plane;
use crate::errors::{Result, StackError};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// Keypoints closer than this to the border cannot be described
pub const DESCRIPTOR_MARGIN: usize = 16;

const BRIEF_BITS: usize = 256;
const BRIEF_PATCH_RADIUS: i32 = 15;
const BRIEF_SEED: u64 = 0x5eed_b41e;
const PATCH_GRID: i32 = 9;
const PATCH_STEP: i32 = 2;
const HARRIS_K: f32 = 0.04;
const HARRIS_QUALITY: f32 = 0.01;

/// Bresenham circle of radius 3, clockwise from the top
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];
const FAST_ARC: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Fast,
    Harris,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// 256-bit binary intensity comparisons
    Brief,
    /// Normalised 9x9 intensity grid
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Two nearest neighbours with a distance-ratio test
    Knn,
    /// Cross-checked nearest neighbour under Hamming distance
    Hamming,
}

impl FromStr for DetectorKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "harris" => Ok(Self::Harris),
            _ => Err(StackError::configuration("detector", s)),
        }
    }
}

impl FromStr for DescriptorKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "brief" => Ok(Self::Brief),
            "patch" => Ok(Self::Patch),
            _ => Err(StackError::configuration("descriptor", s)),
        }
    }
}

impl FromStr for MatchMethod {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "knn" => Ok(Self::Knn),
            "hamming" => Ok(Self::Hamming),
            _ => Err(StackError::configuration("match_method", s)),
        }
    }
}

impl DescriptorKind {
    /// Hamming matching needs bit strings
    pub fn supports(self, method: MatchMethod) -> bool {
        !(self == Self::Patch && method == MatchMethod::Hamming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub response: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    Binary(Vec<[u8; BRIEF_BITS / 8]>),
    Float(Vec<Vec<f32>>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(d) => d.len(),
            Self::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distance between descriptor `i` of `self` and `j` of `other`.
    /// Descriptors of different kinds never match.
    fn distance(&self, i: usize, other: &Self, j: usize) -> f32 {
        match (self, other) {
            (Self::Binary(a), Self::Binary(b)) => hamming(&a[i], &b[j]) as f32,
            (Self::Float(a), Self::Float(b)) => a[i]
                .iter()
                .zip(b[j].iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            _ => f32::INFINITY,
        }
    }
}

#[inline]
fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
}

/// Correspondence between query descriptor and train descriptor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

pub fn gray_plane(image: &GrayImage) -> Plane<f32> {
    Plane::from_vec(
        image.width() as usize,
        image.height() as usize,
        image.as_raw().iter().map(|&v| v as f32).collect(),
    )
}

/// FAST-9 corners with 3x3 non-maximum suppression
pub fn fast_detect(image: &GrayImage, threshold: u8, max_keypoints: usize) -> Vec<KeyPoint> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w <= 2 * DESCRIPTOR_MARGIN || h <= 2 * DESCRIPTOR_MARGIN {
        return Vec::new();
    }
    let raw = image.as_raw();
    let mut scores: Plane<f32> = Plane::new(w, h);
    let t = threshold as i32;

    scores
        .data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            if y < DESCRIPTOR_MARGIN || y >= h - DESCRIPTOR_MARGIN {
                return;
            }
            for x in DESCRIPTOR_MARGIN..w - DESCRIPTOR_MARGIN {
                let p = raw[y * w + x] as i32;
                let mut ring = [0i32; 16];
                for (k, &(dx, dy)) in FAST_CIRCLE.iter().enumerate() {
                    let px = (x as i32 + dx) as usize;
                    let py = (y as i32 + dy) as usize;
                    ring[k] = raw[py * w + px] as i32 - p;
                }
                row[x] = fast_score(&ring, t);
            }
        });

    suppress_and_collect(&scores, 0.0, max_keypoints)
}

/// Sum of threshold excess along the best qualifying arc, or 0
fn fast_score(ring: &[i32; 16], t: i32) -> f32 {
    let mut best = 0i32;
    for sign in [1i32, -1] {
        let mut run = 0usize;
        let mut run_sum = 0i32;
        // walk the ring twice so arcs wrapping past index 15 are seen
        for k in 0..32 {
            let d = sign * ring[k % 16];
            if d > t {
                run += 1;
                run_sum += d - t;
                if run >= FAST_ARC && run <= 16 {
                    best = best.max(run_sum);
                }
            } else {
                run = 0;
                run_sum = 0;
            }
        }
    }
    best as f32
}

/// Harris corner response with a relative quality cut
pub fn harris_detect(image: &GrayImage, max_keypoints: usize) -> Vec<KeyPoint> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w <= 2 * DESCRIPTOR_MARGIN || h <= 2 * DESCRIPTOR_MARGIN {
        return Vec::new();
    }
    let plane = gray_plane(image);
    let smooth = deriv_kernel(3, 0);
    let diff = deriv_kernel(3, 1);
    let ix = sep_filter(&plane, &diff, &smooth);
    let iy = sep_filter(&plane, &smooth, &diff);
    let ixx = gaussian_blur(&ix.zip_map(&ix, |a, b| a * b), 5, 0.0);
    let iyy = gaussian_blur(&iy.zip_map(&iy, |a, b| a * b), 5, 0.0);
    let ixy = gaussian_blur(&ix.zip_map(&iy, |a, b| a * b), 5, 0.0);

    let mut response = Plane::from_fn(w, h, |x, y| {
        let (a, b, c) = (ixx.get(x, y), iyy.get(x, y), ixy.get(x, y));
        let trace = a + b;
        a * b - c * c - HARRIS_K * trace * trace
    });
    for y in 0..h {
        for x in 0..w {
            if x < DESCRIPTOR_MARGIN
                || y < DESCRIPTOR_MARGIN
                || x >= w - DESCRIPTOR_MARGIN
                || y >= h - DESCRIPTOR_MARGIN
            {
                response.set(x, y, 0.0);
            }
        }
    }
    let max_response = response.max_value();
    if max_response <= 0.0 {
        return Vec::new();
    }
    suppress_and_collect(&response, HARRIS_QUALITY * max_response, max_keypoints)
}

/// Keep strict 3x3 local maxima above `min_score`, strongest first.
fn suppress_and_collect(scores: &Plane<f32>, min_score: f32, max_keypoints: usize) -> Vec<KeyPoint> {
    let (w, h) = (scores.width(), scores.height());
    let mut keypoints = Vec::new();
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let s = scores.get(x, y);
            if s <= min_score || s <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'window: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let n = scores.get((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                    // ties resolve toward the earlier pixel in scan order
                    if n > s || (n == s && (dy < 0 || (dy == 0 && dx < 0))) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                keypoints.push(KeyPoint {
                    x: x as f32,
                    y: y as f32,
                    response: s,
                });
            }
        }
    }
    keypoints.sort_by(|a, b| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(Ordering::Equal)
            .then(a.y.partial_cmp(&b.y).unwrap_or(Ordering::Equal))
            .then(a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal))
    });
    keypoints.truncate(max_keypoints);
    keypoints
}

/// Fixed BRIEF sampling pattern, identical for every image
#[derive(Debug, Clone)]
pub struct BriefPattern {
    pairs: Vec<[(i32, i32); 2]>,
}

impl BriefPattern {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let r = BRIEF_PATCH_RADIUS;
        let pairs = (0..BRIEF_BITS)
            .map(|_| {
                [
                    (rng.random_range(-r..=r), rng.random_range(-r..=r)),
                    (rng.random_range(-r..=r), rng.random_range(-r..=r)),
                ]
            })
            .collect();
        Self { pairs }
    }

    pub fn compute(&self, smoothed: &Plane<f32>, keypoints: &[KeyPoint]) -> Descriptors {
        let descriptors = keypoints
            .par_iter()
            .map(|kp| {
                let (x, y) = (kp.x.round() as isize, kp.y.round() as isize);
                let mut bits = [0u8; BRIEF_BITS / 8];
                for (i, pair) in self.pairs.iter().enumerate() {
                    let a = smoothed.get_reflect(x + pair[0].0 as isize, y + pair[0].1 as isize);
                    let b = smoothed.get_reflect(x + pair[1].0 as isize, y + pair[1].1 as isize);
                    if a < b {
                        bits[i / 8] |= 1 << (i % 8);
                    }
                }
                bits
            })
            .collect();
        Descriptors::Binary(descriptors)
    }
}

impl Default for BriefPattern {
    fn default() -> Self {
        Self::new(BRIEF_SEED)
    }
}

/// Zero-mean, unit-norm intensity grid around each keypoint
pub fn patch_compute(smoothed: &Plane<f32>, keypoints: &[KeyPoint]) -> Descriptors {
    let half = PATCH_GRID / 2;
    let descriptors = keypoints
        .par_iter()
        .map(|kp| {
            let (x, y) = (kp.x.round() as isize, kp.y.round() as isize);
            let mut values = Vec::with_capacity((PATCH_GRID * PATCH_GRID) as usize);
            for gy in -half..=half {
                for gx in -half..=half {
                    values.push(smoothed.get_reflect(
                        x + (gx * PATCH_STEP) as isize,
                        y + (gy * PATCH_STEP) as isize,
                    ));
                }
            }
            let mean = values.iter().sum::<f32>() / values.len() as f32;
            for v in &mut values {
                *v -= mean;
            }
            let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 1e-6 {
                for v in &mut values {
                    *v /= norm;
                }
            }
            values
        })
        .collect();
    Descriptors::Float(descriptors)
}

/// Best and second-best train distance for every query descriptor
fn two_nearest(query: &Descriptors, train: &Descriptors) -> Vec<Option<(usize, f32, Option<f32>)>> {
    (0..query.len())
        .into_par_iter()
        .map(|qi| {
            let mut best: Option<(usize, f32)> = None;
            let mut second: Option<f32> = None;
            for ti in 0..train.len() {
                let d = query.distance(qi, train, ti);
                match best {
                    Some((_, bd)) if d >= bd => {
                        if second.map_or(true, |s| d < s) {
                            second = Some(d);
                        }
                    }
                    Some((_, bd)) => {
                        second = Some(bd);
                        best = Some((ti, d));
                    }
                    None => best = Some((ti, d)),
                }
            }
            best.map(|(ti, d)| (ti, d, second))
        })
        .collect()
}

/// k=2 nearest neighbours, accepted when `d1 < ratio * d2`
pub fn knn_ratio_match(query: &Descriptors, train: &Descriptors, ratio: f32) -> Vec<DMatch> {
    two_nearest(query, train)
        .into_iter()
        .enumerate()
        .filter_map(|(qi, nearest)| {
            let (ti, d1, d2) = nearest?;
            let d2 = d2?;
            (d1 < ratio * d2).then_some(DMatch {
                query: qi,
                train: ti,
                distance: d1,
            })
        })
        .collect()
}

/// Mutual nearest neighbours, sorted by ascending distance
pub fn cross_check_match(query: &Descriptors, train: &Descriptors) -> Vec<DMatch> {
    let forward = two_nearest(query, train);
    let backward = two_nearest(train, query);
    let mut matches: Vec<DMatch> = forward
        .into_iter()
        .enumerate()
        .filter_map(|(qi, nearest)| {
            let (ti, d, _) = nearest?;
            let (back, _, _) = backward.get(ti).copied().flatten()?;
            (back == qi).then_some(DMatch {
                query: qi,
                train: ti,
                distance: d,
            })
        })
        .collect();
    matches.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    matches
}

/// Smoothing applied before sampling descriptors
pub fn descriptor_smoothing(image: &GrayImage) -> Plane<f32> {
    gaussian_blur(&gray_plane(image), 9, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let v = ((x / cell + y / cell) % 2) as u8 * 200 + 20;
            image::Luma([v])
        })
    }

    fn blocks(w: u32, h: u32) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(9);
        let cells: Vec<u8> = (0..((w / 6 + 1) * (h / 6 + 1)))
            .map(|_| rng.random_range(0..=255))
            .collect();
        GrayImage::from_fn(w, h, |x, y| image::Luma([cells[((y / 6) * (w / 6 + 1) + x / 6) as usize]]))
    }

    #[test]
    fn test_fast_finds_corners_in_texture() {
        let kps = fast_detect(&blocks(96, 96), 20, 500);
        assert!(kps.len() > 10);
        for kp in &kps {
            assert!(kp.x >= DESCRIPTOR_MARGIN as f32 && kp.x < (96 - DESCRIPTOR_MARGIN) as f32);
        }
        for pair in kps.windows(2) {
            assert!(pair[0].response >= pair[1].response);
        }
    }

    #[test]
    fn test_fast_ignores_flat_image() {
        let flat = GrayImage::from_pixel(64, 64, image::Luma([128]));
        assert!(fast_detect(&flat, 10, 100).is_empty());
        assert!(harris_detect(&flat, 100).is_empty());
    }

    #[test]
    fn test_harris_finds_checker_corners() {
        let kps = harris_detect(&checker(80, 80, 8), 200);
        assert!(!kps.is_empty());
    }

    #[test]
    fn test_keypoint_cap() {
        let kps = fast_detect(&blocks(128, 128), 10, 5);
        assert!(kps.len() <= 5);
    }

    #[test]
    fn test_brief_pattern_is_deterministic() {
        let a = BriefPattern::default();
        let b = BriefPattern::default();
        assert_eq!(a.pairs, b.pairs);
    }

    #[test]
    fn test_identical_images_match_one_to_one() {
        let img = blocks(96, 96);
        let kps = fast_detect(&img, 20, 300);
        let smoothed = descriptor_smoothing(&img);
        let desc = BriefPattern::default().compute(&smoothed, &kps);
        let matches = cross_check_match(&desc, &desc);
        assert!(!matches.is_empty());
        for m in &matches {
            assert_eq!(m.distance, 0.0);
        }
        let patch = patch_compute(&smoothed, &kps);
        let knn = knn_ratio_match(&patch, &patch, 0.75);
        assert!(knn.iter().all(|m| m.query == m.train));
    }

    #[test]
    fn test_ratio_test_needs_second_neighbour() {
        let one = Descriptors::Binary(vec![[0u8; 32]]);
        assert!(knn_ratio_match(&one, &one, 0.75).is_empty());
    }

    #[test]
    fn test_cross_check_sorted_ascending() {
        let q = Descriptors::Binary(vec![[0u8; 32], [0xff; 32], [0x0f; 32]]);
        let mut t0 = [0u8; 32];
        t0[0] = 0b111;
        let mut t1 = [0xffu8; 32];
        t1[0] = 0xfe;
        let t = Descriptors::Binary(vec![t0, t1, [0x0f; 32]]);
        let m = cross_check_match(&q, &t);
        assert_eq!(m.len(), 3);
        assert!(m.windows(2).all(|p| p[0].distance <= p[1].distance));
        assert_eq!(m[0].distance, 0.0);
    }

    #[test]
    fn test_patch_descriptor_rejects_hamming() {
        assert!(!DescriptorKind::Patch.supports(MatchMethod::Hamming));
        assert!(DescriptorKind::Patch.supports(MatchMethod::Knn));
        assert!(DescriptorKind::Brief.supports(MatchMethod::Hamming));
    }

    #[test]
    fn test_parse_options() {
        assert_eq!("FAST".parse::<DetectorKind>().unwrap(), DetectorKind::Fast);
        assert_eq!("knn".parse::<MatchMethod>().unwrap(), MatchMethod::Knn);
        assert!("SIFT".parse::<DescriptorKind>().is_err());
    }
}
