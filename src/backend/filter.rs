//! Linear and edge-preserving filters over [`Plane`]s
//!
//! All filters use the mirrored-without-edge border (`reflect101`) and are
//! separable where the kernel allows it. Rows are processed in parallel; every
//! output row depends only on the input, so results are deterministic.

use super::plane::{cast, reflect101, Plane, Sample};
use image::GrayImage;
use rayon::prelude::*;

/// Normalised 1-D Gaussian. A non-positive `sigma` is derived from the kernel
/// size, and the small sizes use the fixed binomial tables.
pub fn gaussian_kernel(ksize: usize, sigma: f64) -> Vec<f64> {
    let ksize = ksize.max(1) | 1;
    if sigma <= 0.0 {
        match ksize {
            1 => return vec![1.0],
            3 => return vec![0.25, 0.5, 0.25],
            5 => return vec![0.0625, 0.25, 0.375, 0.25, 0.0625],
            7 => {
                return vec![
                    0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125,
                ]
            }
            _ => {}
        }
    }
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let center = (ksize / 2) as f64;
    let mut kernel: Vec<f64> = (0..ksize)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Binomial derivative kernel of the given order (`order = 0` smooths).
///
/// `ksize = 3, order = 2` gives `[1, -2, 1]`; `ksize = 5, order = 0` gives
/// `[1, 4, 6, 4, 1]`.
pub fn deriv_kernel(ksize: usize, order: usize) -> Vec<f64> {
    let mut kernel = vec![1.0];
    let smooth_steps = ksize.saturating_sub(order + 1);
    for _ in 0..smooth_steps {
        kernel = convolve_1d(&kernel, &[1.0, 1.0]);
    }
    for _ in 0..order {
        kernel = convolve_1d(&kernel, &[-1.0, 1.0]);
    }
    kernel
}

fn convolve_1d(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &x) in a.iter().enumerate() {
        for (j, &y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Correlate with `kx` along rows, then `ky` along columns.
pub fn sep_filter<F: Sample>(src: &Plane<F>, kx: &[f64], ky: &[f64]) -> Plane<F> {
    let (w, h) = (src.width(), src.height());
    if w == 0 || h == 0 {
        return src.clone();
    }
    let kx: Vec<F> = kx.iter().map(|&k| cast(k)).collect();
    let ky: Vec<F> = ky.iter().map(|&k| cast(k)).collect();
    let rx = (kx.len() / 2) as isize;
    let ry = (ky.len() / 2) as isize;

    let mut tmp = Plane::new(w, h);
    tmp.data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = src.row(y);
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = F::zero();
                for (i, &k) in kx.iter().enumerate() {
                    let sx = reflect101(x as isize + i as isize - rx, w);
                    acc = acc + src_row[sx] * k;
                }
                *out = acc;
            }
        });

    let mut dst = Plane::new(w, h);
    dst.data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = F::zero();
                for (i, &k) in ky.iter().enumerate() {
                    let sy = reflect101(y as isize + i as isize - ry, h);
                    acc = acc + tmp.get(x, sy) * k;
                }
                *out = acc;
            }
        });
    dst
}

pub fn gaussian_blur<F: Sample>(src: &Plane<F>, ksize: usize, sigma: f64) -> Plane<F> {
    let kernel = gaussian_kernel(ksize, sigma);
    sep_filter(src, &kernel, &kernel)
}

/// `|Gx| + |Gy|` with the 3x3 Sobel operator
pub fn sobel_energy<F: Sample>(src: &Plane<F>) -> Plane<F> {
    let smooth = deriv_kernel(3, 0);
    let diff = deriv_kernel(3, 1);
    let gx = sep_filter(src, &diff, &smooth);
    let gy = sep_filter(src, &smooth, &diff);
    gx.zip_map(&gy, |a, b| a.abs() + b.abs())
}

/// Sum of second derivatives. `ksize = 1` is the 4-neighbour stencil.
pub fn laplacian<F: Sample>(src: &Plane<F>, ksize: usize) -> Plane<F> {
    let (d2, smooth) = if ksize <= 1 {
        (vec![1.0, -2.0, 1.0], vec![0.0, 1.0, 0.0])
    } else {
        (deriv_kernel(ksize, 2), deriv_kernel(ksize, 0))
    };
    let dxx = sep_filter(src, &d2, &smooth);
    let dyy = sep_filter(src, &smooth, &d2);
    dxx.zip_map(&dyy, |a, b| a + b)
}

/// Edge-preserving smoothing over a circular window of the given diameter.
pub fn bilateral<F: Sample>(
    src: &Plane<F>,
    diameter: usize,
    sigma_color: f64,
    sigma_space: f64,
) -> Plane<F> {
    let (w, h) = (src.width(), src.height());
    if w == 0 || h == 0 || diameter == 0 {
        return src.clone();
    }
    let radius = (diameter / 2).max(1) as isize;
    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let space_coeff = -0.5 / (sigma_space * sigma_space);

    let mut offsets: Vec<(isize, isize, f64)> = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f64;
            if r2.sqrt() > radius as f64 {
                continue;
            }
            offsets.push((dx, dy, (r2 * space_coeff).exp()));
        }
    }

    let mut dst = Plane::new(w, h);
    dst.data_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let center = src.get(x, y).to_f64().unwrap_or(0.0);
                let mut sum = 0.0;
                let mut norm = 0.0;
                for &(dx, dy, space_w) in &offsets {
                    let v = src
                        .get_reflect(x as isize + dx, y as isize + dy)
                        .to_f64()
                        .unwrap_or(0.0);
                    let d = v - center;
                    let weight = space_w * (d * d * color_coeff).exp();
                    sum += v * weight;
                    norm += weight;
                }
                *out = cast(if norm > 0.0 { sum / norm } else { center });
            }
        });
    dst
}

/// Block-average downscale by an integer factor
pub fn box_downscale(src: &GrayImage, factor: u32) -> GrayImage {
    if factor <= 1 {
        return src.clone();
    }
    let w = (src.width() / factor).max(1);
    let h = (src.height() / factor).max(1);
    GrayImage::from_fn(w, h, |x, y| {
        let mut sum = 0u32;
        let mut count = 0u32;
        for sy in (y * factor)..((y + 1) * factor).min(src.height()) {
            for sx in (x * factor)..((x + 1) * factor).min(src.width()) {
                sum += src.get_pixel(sx, sy)[0] as u32;
                count += 1;
            }
        }
        image::Luma([(sum as f32 / count.max(1) as f32).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_kernel_normalised() {
        for ksize in [3, 5, 9, 21] {
            let k = gaussian_kernel(ksize, 0.0);
            assert_eq!(k.len(), ksize);
            assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        let wide = gaussian_kernel(21, 50.0);
        assert!((wide.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(wide[0] > 0.9 * wide[10]);
    }

    #[test]
    fn test_deriv_kernels() {
        assert_eq!(deriv_kernel(3, 0), vec![1.0, 2.0, 1.0]);
        assert_eq!(deriv_kernel(3, 1), vec![-1.0, 0.0, 1.0]);
        assert_eq!(deriv_kernel(3, 2), vec![1.0, -2.0, 1.0]);
        assert_eq!(deriv_kernel(5, 2), vec![1.0, 0.0, -2.0, 0.0, 1.0]);
        assert_eq!(deriv_kernel(5, 0), vec![1.0, 4.0, 6.0, 4.0, 1.0]);
    }

    #[test]
    fn test_blur_preserves_constant() {
        let p: Plane<f64> = Plane::filled(7, 5, 42.0);
        let b = gaussian_blur(&p, 5, 0.0);
        assert!(b.data().iter().all(|&v| (v - 42.0).abs() < 1e-9));
    }

    #[test]
    fn test_energy_of_flat_image_is_zero() {
        let p: Plane<f32> = Plane::filled(9, 9, 100.0);
        assert!(sobel_energy(&p).data().iter().all(|&v| v.abs() < 1e-4));
        assert!(laplacian(&p, 1).data().iter().all(|&v| v.abs() < 1e-4));
        assert!(laplacian(&p, 5).data().iter().all(|&v| v.abs() < 1e-3));
    }

    #[test]
    fn test_sobel_responds_to_vertical_edge() {
        let p: Plane<f32> = Plane::from_fn(8, 8, |x, _| if x < 4 { 0.0 } else { 10.0 });
        let e = sobel_energy(&p);
        assert!(e.get(4, 4) > 0.0);
        assert_eq!(e.get(1, 4), 0.0);
    }

    #[test]
    fn test_laplacian_point_response() {
        let mut p: Plane<f64> = Plane::new(5, 5);
        p.set(2, 2, 1.0);
        let l = laplacian(&p, 1);
        assert_eq!(l.get(2, 2), -4.0);
        assert_eq!(l.get(1, 2), 1.0);
        assert_eq!(l.get(1, 1), 0.0);
    }

    #[test]
    fn test_bilateral_keeps_step_edge() {
        let p: Plane<f64> = Plane::from_fn(10, 4, |x, _| if x < 5 { 0.0 } else { 1000.0 });
        let s = bilateral(&p, 5, 25.0, 25.0);
        assert!(s.get(4, 1) < 1.0);
        assert!(s.get(5, 1) > 999.0);
    }

    #[test]
    fn test_box_downscale_averages_blocks() {
        let img = GrayImage::from_fn(4, 2, |x, _| image::Luma([if x < 2 { 10 } else { 30 }]));
        let small = box_downscale(&img, 2);
        assert_eq!(small.dimensions(), (2, 1));
        assert_eq!(small.get_pixel(0, 0)[0], 10);
        assert_eq!(small.get_pixel(1, 0)[0], 30);
    }
}
