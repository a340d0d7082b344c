//! Inverse-mapped projective warping with bilinear sampling

use super::plane::{cast, Plane, Sample};
use nalgebra::Matrix3;
use rayon::prelude::*;

/// How samples outside the source raster are synthesised
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Border<F> {
    Constant(F),
    Replicate,
}

#[inline]
fn project(m: &Matrix3<f64>, x: f64, y: f64) -> Option<(f64, f64)> {
    let w = m[(2, 0)] * x + m[(2, 1)] * y + m[(2, 2)];
    if !w.is_finite() || w.abs() < 1e-12 {
        return None;
    }
    let sx = (m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)]) / w;
    let sy = (m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)]) / w;
    if sx.is_finite() && sy.is_finite() {
        Some((sx, sy))
    } else {
        None
    }
}

#[inline]
fn tap<F: Sample>(src: &Plane<F>, x: isize, y: isize, border: Border<F>) -> F {
    let (w, h) = (src.width() as isize, src.height() as isize);
    if x >= 0 && y >= 0 && x < w && y < h {
        return src.get(x as usize, y as usize);
    }
    match border {
        Border::Constant(value) => value,
        Border::Replicate => src.get(x.clamp(0, w - 1) as usize, y.clamp(0, h - 1) as usize),
    }
}

/// Warp `src` into a raster of the same size. `inverse` maps destination
/// coordinates to source coordinates.
pub fn warp_plane<F: Sample>(src: &Plane<F>, inverse: &Matrix3<f64>, border: Border<F>) -> Plane<F> {
    let (w, h) = (src.width(), src.height());
    let mut dst = Plane::new(w, h);
    if w == 0 || h == 0 {
        return dst;
    }
    let fallback = match border {
        Border::Constant(value) => value,
        Border::Replicate => F::zero(),
    };
    dst.data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let Some((sx, sy)) = project(inverse, x as f64, y as f64) else {
                    *out = fallback;
                    continue;
                };
                let x0 = sx.floor();
                let y0 = sy.floor();
                let fx: F = cast(sx - x0);
                let fy: F = cast(sy - y0);
                let (ix, iy) = (x0 as isize, y0 as isize);
                let one = F::one();
                let top = tap(src, ix, iy, border) * (one - fx) + tap(src, ix + 1, iy, border) * fx;
                let bottom = tap(src, ix, iy + 1, border) * (one - fx)
                    + tap(src, ix + 1, iy + 1, border) * fx;
                *out = top * (one - fy) + bottom * fy;
            }
        });
    dst
}

/// Pixels whose bilinear footprint is at least half inside the source.
///
/// This is the rounded result of warping an all-ones raster with a zero
/// constant border.
pub fn coverage_mask(width: usize, height: usize, inverse: &Matrix3<f64>) -> Vec<bool> {
    let ones: Plane<f64> = Plane::filled(width, height, 1.0);
    warp_plane(&ones, inverse, Border::Constant(0.0))
        .into_vec()
        .into_iter()
        .map(|coverage| coverage >= 0.5)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture() -> Plane<f64> {
        Plane::from_fn(12, 9, |x, y| ((x * 31 + y * 17) % 97) as f64)
    }

    #[test]
    fn test_identity_warp_is_exact() {
        let src = texture();
        let out = warp_plane(&src, &Matrix3::identity(), Border::Replicate);
        assert_eq!(out, src);
    }

    #[test]
    fn test_integer_shift_with_constant_border() {
        let src = texture();
        // destination x samples source x + 2
        let mut inv = Matrix3::identity();
        inv[(0, 2)] = 2.0;
        let out = warp_plane(&src, &inv, Border::Constant(-1.0));
        assert_eq!(out.get(0, 3), src.get(2, 3));
        assert_eq!(out.get(11, 3), -1.0);
    }

    #[test]
    fn test_replicate_border_clamps() {
        let src = texture();
        let mut inv = Matrix3::identity();
        inv[(0, 2)] = -3.0;
        let out = warp_plane(&src, &inv, Border::Replicate);
        assert_eq!(out.get(0, 4), src.get(0, 4));
        assert_eq!(out.get(1, 4), src.get(0, 4));
    }

    #[test]
    fn test_coverage_mask_marks_uncovered_columns() {
        let mut inv = Matrix3::identity();
        inv[(0, 2)] = 4.0;
        let mask = coverage_mask(10, 3, &inv);
        assert!(mask[0]);
        assert!(mask[5]);
        assert!(!mask[6]);
        assert!(!mask[9]);
    }
}
