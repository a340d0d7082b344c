//! Robust transform estimation
//!
//! Seeded RANSAC over minimal samples:
//! 1. Draw a minimal sample without replacement
//! 2. Reject degenerate samples and fit a candidate model
//! 3. Count correspondences within the reprojection threshold
//! 4. Shrink the iteration budget as the best inlier ratio improves
//! 5. Refit the winning model on all of its inliers

use crate::errors::{Result, StackError};
use nalgebra::{DMatrix, Matrix3, Point2, SVD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Rotation, uniform scale and translation (4 degrees of freedom)
    Rigid,
    /// Full projective transform
    Homography,
}

impl TransformKind {
    /// Matches required before estimation is attempted
    pub fn min_matches(self) -> usize {
        match self {
            Self::Rigid => 3,
            Self::Homography => 4,
        }
    }

    /// Points in one minimal sample
    pub fn sample_size(self) -> usize {
        match self {
            Self::Rigid => 2,
            Self::Homography => 4,
        }
    }
}

impl FromStr for TransformKind {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rigid" => Ok(Self::Rigid),
            "homography" => Ok(Self::Homography),
            _ => Err(StackError::configuration("transform", s)),
        }
    }
}

/// Winning model and which correspondences support it
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub matrix: Matrix3<f64>,
    pub inliers: Vec<bool>,
}

impl Estimate {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&i| i).count()
    }
}

#[derive(Debug, Clone)]
pub struct RansacSolver {
    pub max_iterations: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacSolver {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            confidence: 0.995,
            seed: 0,
        }
    }
}

impl RansacSolver {
    pub fn new(max_iterations: usize, confidence: f64, seed: u64) -> Self {
        Self {
            max_iterations,
            confidence,
            seed,
        }
    }

    /// Fit `kind` mapping `src` onto `dst`, or `None` without consensus.
    pub fn fit(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
        kind: TransformKind,
        threshold: f64,
    ) -> Option<Estimate> {
        let n = src.len().min(dst.len());
        let k = kind.sample_size();
        if n < k {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let threshold_sq = threshold * threshold;

        let mut best: Option<(Matrix3<f64>, usize)> = None;
        let mut sample = Vec::with_capacity(k);
        let mut sample_src = Vec::with_capacity(k);
        let mut sample_dst = Vec::with_capacity(k);
        let mut budget = self.max_iterations;
        let mut iteration = 0;

        while iteration < budget {
            iteration += 1;
            random_sample_into(&mut rng, n, k, &mut sample);
            sample_src.clear();
            sample_dst.clear();
            for &i in &sample {
                sample_src.push(src[i]);
                sample_dst.push(dst[i]);
            }
            if is_degenerate(&sample_src, &sample_dst, kind) {
                continue;
            }
            let Some(model) = fit_model(&sample_src, &sample_dst, kind) else {
                continue;
            };
            let count = count_inliers(&model, src, dst, threshold_sq);
            if best.as_ref().map_or(true, |&(_, c)| count > c) {
                best = Some((model, count));
                let ratio = count as f64 / n as f64;
                budget = budget.min(adaptive_iterations(ratio, k, self.confidence));
                if count == n {
                    break;
                }
            }
        }

        let (model, count) = best?;
        if count < k {
            return None;
        }
        let mut matrix = model;
        let mut inliers = inlier_mask(&matrix, src, dst, threshold_sq);

        let (in_src, in_dst): (Vec<_>, Vec<_>) = src
            .iter()
            .zip(dst)
            .zip(&inliers)
            .filter(|(_, keep)| **keep)
            .map(|((s, d), _)| (*s, *d))
            .unzip();
        if let Some(refined) = fit_model(&in_src, &in_dst, kind) {
            let refined_mask = inlier_mask(&refined, src, dst, threshold_sq);
            if count_true(&refined_mask) >= count {
                matrix = refined;
                inliers = refined_mask;
            }
        }

        if !is_usable(&matrix) {
            return None;
        }
        log::debug!(
            "RANSAC {:?}: {} of {} inliers after {} iterations",
            kind,
            count_true(&inliers),
            n,
            iteration
        );
        Some(Estimate { matrix, inliers })
    }
}

fn count_true(mask: &[bool]) -> usize {
    mask.iter().filter(|&&b| b).count()
}

/// Iterations needed to draw one all-inlier sample with the given confidence
pub fn adaptive_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_outlier = (1.0 - w_n).ln();
    if log_outlier >= 0.0 {
        return usize::MAX;
    }
    ((1.0 - confidence).ln() / log_outlier).ceil().max(1.0) as usize
}

/// Floyd's sampling of `k` distinct indices from `0..n`
fn random_sample_into<R: Rng>(rng: &mut R, n: usize, k: usize, buffer: &mut Vec<usize>) {
    buffer.clear();
    for j in (n - k)..n {
        let t = rng.random_range(0..=j);
        if buffer.contains(&t) {
            buffer.push(j);
        } else {
            buffer.push(t);
        }
    }
}

fn is_degenerate(src: &[Point2<f64>], dst: &[Point2<f64>], kind: TransformKind) -> bool {
    match kind {
        TransformKind::Rigid => {
            (src[0] - src[1]).norm_squared() < 1e-6 || (dst[0] - dst[1]).norm_squared() < 1e-6
        }
        TransformKind::Homography => {
            let collinear = |p: &[Point2<f64>]| {
                for a in 0..4 {
                    for b in (a + 1)..4 {
                        for c in (b + 1)..4 {
                            let u = p[b] - p[a];
                            let v = p[c] - p[a];
                            if (u.x * v.y - u.y * v.x).abs() < 1e-6 {
                                return true;
                            }
                        }
                    }
                }
                false
            };
            collinear(src) || collinear(dst)
        }
    }
}

fn fit_model(src: &[Point2<f64>], dst: &[Point2<f64>], kind: TransformKind) -> Option<Matrix3<f64>> {
    match kind {
        TransformKind::Rigid => estimate_similarity(src, dst),
        TransformKind::Homography => estimate_homography(src, dst),
    }
}

#[inline]
pub fn apply(m: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let w = m[(2, 0)] * p.x + m[(2, 1)] * p.y + m[(2, 2)];
    if w.abs() < 1e-12 {
        return None;
    }
    Some(Point2::new(
        (m[(0, 0)] * p.x + m[(0, 1)] * p.y + m[(0, 2)]) / w,
        (m[(1, 0)] * p.x + m[(1, 1)] * p.y + m[(1, 2)]) / w,
    ))
}

fn inlier_mask(
    m: &Matrix3<f64>,
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    threshold_sq: f64,
) -> Vec<bool> {
    src.iter()
        .zip(dst)
        .map(|(s, d)| apply(m, s).map_or(false, |p| (p - d).norm_squared() <= threshold_sq))
        .collect()
}

fn count_inliers(
    m: &Matrix3<f64>,
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    threshold_sq: f64,
) -> usize {
    count_true(&inlier_mask(m, src, dst, threshold_sq))
}

fn is_usable(m: &Matrix3<f64>) -> bool {
    m.iter().all(|v| v.is_finite()) && m.determinant().abs() > 1e-12
}

fn centroid(points: &[Point2<f64>]) -> Point2<f64> {
    let n = points.len().max(1) as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2::new(sx / n, sy / n)
}

/// Closed-form least-squares similarity (rotation, uniform scale, shift)
pub fn estimate_similarity(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() < 2 || src.len() != dst.len() {
        return None;
    }
    let sc = centroid(src);
    let dc = centroid(dst);
    let (mut a, mut b, mut var) = (0.0, 0.0, 0.0);
    for (s, d) in src.iter().zip(dst) {
        let (sx, sy) = (s.x - sc.x, s.y - sc.y);
        let (dx, dy) = (d.x - dc.x, d.y - dc.y);
        a += sx * dx + sy * dy;
        b += sx * dy - sy * dx;
        var += sx * sx + sy * sy;
    }
    if var < 1e-10 {
        return None;
    }
    // a = s*cos * var, b = s*sin * var
    let (c, s) = (a / var, b / var);
    if c * c + s * s < 1e-12 {
        return None;
    }
    let tx = dc.x - (c * sc.x - s * sc.y);
    let ty = dc.y - (s * sc.x + c * sc.y);
    Some(Matrix3::new(c, -s, tx, s, c, ty, 0.0, 0.0, 1.0))
}

/// Hartley normalisation: centroid to origin, mean distance `sqrt(2)`
fn normalize_points(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let c = centroid(points);
    let mean_dist =
        points.iter().map(|p| (p - c).norm()).sum::<f64>() / points.len().max(1) as f64;
    if mean_dist < 1e-10 {
        return (points.to_vec(), Matrix3::identity());
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - c.x) * scale, (p.y - c.y) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -c.x * scale,
        0.0,
        scale,
        -c.y * scale,
        0.0,
        0.0,
        1.0,
    );
    (normalized, t)
}

/// Normalised DLT homography with `h33 = 1`
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() < 4 || src.len() != dst.len() {
        return None;
    }
    let (src_n, src_t) = normalize_points(src);
    let (dst_n, dst_t) = normalize_points(dst);
    let n = src_n.len();

    let rows = (2 * n).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src_n.iter().zip(&dst_n).enumerate() {
        let r = 2 * i;
        let row0 = [-s.x, -s.y, -1.0, 0.0, 0.0, 0.0, s.x * d.x, s.y * d.x, d.x];
        let row1 = [0.0, 0.0, 0.0, -s.x, -s.y, -1.0, s.x * d.y, s.y * d.y, d.y];
        for c in 0..9 {
            a[(r, c)] = row0[c];
            a[(r + 1, c)] = row1[c];
        }
    }

    let svd = SVD::new(a, false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.partial_cmp(y.1).unwrap_or(std::cmp::Ordering::Equal))?;
    let h = v_t.row(min_idx);
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let dst_t_inv = dst_t.try_inverse()?;
    let h_full = dst_t_inv * h_norm * src_t;
    let scale = h_full[(2, 2)];
    if scale.abs() < 1e-10 {
        return None;
    }
    let h_full = h_full / scale;
    if h_full.iter().all(|v| v.is_finite()) {
        Some(h_full)
    } else {
        None
    }
}
