//! Colour-space conversions on native-range samples
//!
//! Saturation, value and lightness are scaled to `[0, max]` so the balance
//! histograms share their bin layout with plain intensities. Hue is in degrees.

/// Rec. 601 luma weights
pub fn luma(r: f64, g: f64, b: f64) -> f64 {
    0.299 * r + 0.587 * g + 0.114 * b
}

pub fn rgb_to_hsv(r: f64, g: f64, b: f64, max: f64) -> (f64, f64, f64) {
    let (r, g, b) = (r / max, g / max, b / max);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = v - min;
    let s = if v > 0.0 { delta / v } else { 0.0 };
    (hue(r, g, b, v, delta), s * max, v * max)
}

pub fn hsv_to_rgb(h: f64, s: f64, v: f64, max: f64) -> (f64, f64, f64) {
    let (s, v) = ((s / max).clamp(0.0, 1.0), (v / max).clamp(0.0, 1.0));
    let c = v * s;
    let (r, g, b) = hue_sector(h, c);
    let m = v - c;
    ((r + m) * max, (g + m) * max, (b + m) * max)
}

pub fn rgb_to_hls(r: f64, g: f64, b: f64, max: f64) -> (f64, f64, f64) {
    let (r, g, b) = (r / max, g / max, b / max);
    let hi = r.max(g).max(b);
    let lo = r.min(g).min(b);
    let delta = hi - lo;
    let l = (hi + lo) / 2.0;
    let s = if delta <= 0.0 {
        0.0
    } else if l < 0.5 {
        delta / (hi + lo)
    } else {
        delta / (2.0 - hi - lo)
    };
    (hue(r, g, b, hi, delta), l * max, s * max)
}

pub fn hls_to_rgb(h: f64, l: f64, s: f64, max: f64) -> (f64, f64, f64) {
    let (l, s) = ((l / max).clamp(0.0, 1.0), (s / max).clamp(0.0, 1.0));
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let (r, g, b) = hue_sector(h, c);
    let m = l - c / 2.0;
    ((r + m) * max, (g + m) * max, (b + m) * max)
}

fn hue(r: f64, g: f64, b: f64, hi: f64, delta: f64) -> f64 {
    if delta <= 0.0 {
        return 0.0;
    }
    let h = if hi == r {
        60.0 * ((g - b) / delta)
    } else if hi == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    if h < 0.0 {
        h + 360.0
    } else {
        h
    }
}

/// Chroma placed in the hue sector, before the lightness offset
fn hue_sector(h: f64, c: f64) -> (f64, f64, f64) {
    let hp = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f64, f64, f64), b: (f64, f64, f64)) -> bool {
        (a.0 - b.0).abs() < 1e-6 && (a.1 - b.1).abs() < 1e-6 && (a.2 - b.2).abs() < 1e-6
    }

    #[test]
    fn test_luma_of_grey_is_grey() {
        assert!((luma(100.0, 100.0, 100.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_hsv_primaries() {
        assert!(close(rgb_to_hsv(255.0, 0.0, 0.0, 255.0), (0.0, 255.0, 255.0)));
        assert!(close(rgb_to_hsv(0.0, 255.0, 0.0, 255.0), (120.0, 255.0, 255.0)));
        assert!(close(rgb_to_hsv(0.0, 0.0, 0.0, 255.0), (0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_colour_spaces_invert() {
        let samples = [
            (12.0, 200.0, 77.0),
            (255.0, 255.0, 255.0),
            (0.0, 0.0, 0.0),
            (90.0, 30.0, 240.0),
            (128.0, 128.0, 64.0),
        ];
        for &(r, g, b) in &samples {
            let (h, s, v) = rgb_to_hsv(r, g, b, 255.0);
            assert!(close(hsv_to_rgb(h, s, v, 255.0), (r, g, b)));
            let (h, l, s) = rgb_to_hls(r, g, b, 255.0);
            assert!(close(hls_to_rgb(h, l, s, 255.0), (r, g, b)));
        }
    }

    #[test]
    fn test_sixteen_bit_range() {
        let (_, l, _) = rgb_to_hls(65535.0, 65535.0, 65535.0, 65535.0);
        assert!((l - 65535.0).abs() < 1e-6);
    }
}
