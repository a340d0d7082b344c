//! Gaussian and Laplacian pyramids
//!
//! Levels are stored finest first. Downsampling halves with rounding up
//! (`(w + 1) / 2`), so upsampling always takes the finer level's exact size.

use super::filter::sep_filter;
use super::plane::{cast, reflect101, Plane, Sample};
use rayon::prelude::*;

const PYR_KERNEL: [f64; 5] = [0.0625, 0.25, 0.375, 0.25, 0.0625];

/// Blur with the 5-tap binomial kernel and drop every other row and column.
pub fn pyr_down<F: Sample>(src: &Plane<F>) -> Plane<F> {
    let (w, h) = (src.width(), src.height());
    if w == 0 || h == 0 {
        return src.clone();
    }
    let blurred = sep_filter(src, &PYR_KERNEL, &PYR_KERNEL);
    let (dw, dh) = ((w + 1) / 2, (h + 1) / 2);
    Plane::from_fn(dw, dh, |x, y| blurred.get(2 * x, 2 * y))
}

/// Upsample to exactly `width x height` by zero insertion and smoothing.
pub fn pyr_up<F: Sample>(src: &Plane<F>, width: usize, height: usize) -> Plane<F> {
    if src.is_empty() || width == 0 || height == 0 {
        return Plane::new(width, height);
    }
    let kernel: Vec<F> = PYR_KERNEL.iter().map(|&k| cast(2.0 * k)).collect();
    let (sw, sh) = (src.width(), src.height());

    // Value of the zero-inserted signal at position `i` of a line of length `len`
    let tap = |i: isize, len: usize, src_len: usize| -> Option<usize> {
        let r = reflect101(i, len);
        if r % 2 == 0 && r / 2 < src_len {
            Some(r / 2)
        } else {
            None
        }
    };

    let mut horizontal = Plane::new(width, sh);
    horizontal
        .data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = src.row(y);
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = F::zero();
                for (k, &kv) in kernel.iter().enumerate() {
                    if let Some(sx) = tap(x as isize + k as isize - 2, width, sw) {
                        acc = acc + src_row[sx] * kv;
                    }
                }
                *out = acc;
            }
        });

    let mut dst = Plane::new(width, height);
    dst.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = F::zero();
                for (k, &kv) in kernel.iter().enumerate() {
                    if let Some(sy) = tap(y as isize + k as isize - 2, height, sh) {
                        acc = acc + horizontal.get(x, sy) * kv;
                    }
                }
                *out = acc;
            }
        });
    dst
}

/// `levels` Gaussian levels including the input itself
pub fn gaussian_pyramid<F: Sample>(src: &Plane<F>, levels: usize) -> Vec<Plane<F>> {
    let mut pyramid = Vec::with_capacity(levels.max(1));
    pyramid.push(src.clone());
    while pyramid.len() < levels {
        let next = match pyramid.last() {
            Some(level) => pyr_down(level),
            None => break,
        };
        pyramid.push(next);
    }
    pyramid
}

/// Band-pass levels `G[i] - up(G[i + 1])`, with the coarsest Gaussian level
/// kept as the last entry.
pub fn laplacian_pyramid<F: Sample>(gaussian: &[Plane<F>]) -> Vec<Plane<F>> {
    let mut bands = Vec::with_capacity(gaussian.len());
    for pair in gaussian.windows(2) {
        let (fine, coarse) = (&pair[0], &pair[1]);
        let expanded = pyr_up(coarse, fine.width(), fine.height());
        bands.push(fine.zip_map(&expanded, |a, b| a - b));
    }
    if let Some(top) = gaussian.last() {
        bands.push(top.clone());
    }
    bands
}

/// Upsample-and-add from the coarsest level down to full resolution.
pub fn collapse<F: Sample>(bands: &[Plane<F>]) -> Option<Plane<F>> {
    let mut levels = bands.iter().rev();
    let mut result = levels.next()?.clone();
    for band in levels {
        let mut expanded = pyr_up(&result, band.width(), band.height());
        expanded.add_assign(band);
        result = expanded;
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: usize, h: usize) -> Plane<f64> {
        Plane::from_fn(w, h, |x, y| ((x * 7 + y * 13) % 50) as f64)
    }

    #[test]
    fn test_pyr_down_rounds_up() {
        let p = ramp(9, 6);
        let d = pyr_down(&p);
        assert_eq!((d.width(), d.height()), (5, 3));
    }

    #[test]
    fn test_pyr_up_preserves_constant() {
        let p: Plane<f64> = Plane::filled(5, 3, 3.0);
        for (w, h) in [(10, 6), (9, 5), (10, 5)] {
            let u = pyr_up(&p, w, h);
            assert!(u.data().iter().all(|&v| (v - 3.0).abs() < 1e-12), "{}x{}", w, h);
        }
    }

    #[test]
    fn test_pyramid_round_trip_is_exact_to_rounding() {
        let p = ramp(37, 23);
        for levels in 1..6 {
            let g = gaussian_pyramid(&p, levels);
            assert_eq!(g.len(), levels);
            let l = laplacian_pyramid(&g);
            let r = collapse(&l).unwrap();
            for (a, b) in r.data().iter().zip(p.data()) {
                assert!((a - b).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_collapse_of_empty_is_none() {
        let bands: Vec<Plane<f32>> = Vec::new();
        assert!(collapse(&bands).is_none());
    }
}
