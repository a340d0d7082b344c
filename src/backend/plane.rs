//! Single-channel float raster used by every numeric routine
//!
//! The accumulation precision of the compositor is a runtime option, so the
//! raster is generic over `f32` and `f64` through the [`Sample`] alias.

use crate::assert_invariant;
use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::Debug;

/// Float type a [`Plane`] can hold
pub trait Sample:
    Float + FromPrimitive + ToPrimitive + Default + Debug + Send + Sync + 'static
{
}

impl<T> Sample for T where
    T: Float + FromPrimitive + ToPrimitive + Default + Debug + Send + Sync + 'static
{
}

/// Convert an `f64` constant into the sample type.
#[inline]
pub fn cast<F: Sample>(value: f64) -> F {
    F::from_f64(value).unwrap_or_else(F::zero)
}

/// Convert a sample back to `f64` for bookkeeping.
#[inline]
pub fn to_f64<F: Sample>(value: F) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Mirror an out-of-range index back into `0..len` without repeating the edge
/// sample (`gfedcb|abcdefgh|gfedcba`).
#[inline]
pub fn reflect101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = index;
    while i < 0 || i > last {
        if i < 0 {
            i = -i;
        }
        if i > last {
            i = 2 * last - i;
        }
    }
    i as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plane<F> {
    width: usize,
    height: usize,
    data: Vec<F>,
}

impl<F: Sample> Plane<F> {
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, F::zero())
    }

    pub fn filled(width: usize, height: usize, value: F) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<F>) -> Self {
        assert_invariant!(
            data.len() == width * height,
            "Plane buffer length matches its dimensions",
            "Plane::from_vec"
        );
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> F) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[F] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [F] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<F> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> F {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: F) {
        self.data[y * self.width + x] = value;
    }

    #[inline]
    pub fn get_reflect(&self, x: isize, y: isize) -> F {
        self.get(reflect101(x, self.width), reflect101(y, self.height))
    }

    pub fn row(&self, y: usize) -> &[F] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn map(&self, f: impl Fn(F) -> F) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Element-wise combination of two planes of equal size
    pub fn zip_map(&self, other: &Self, f: impl Fn(F, F) -> F) -> Self {
        assert_invariant!(
            self.width == other.width && self.height == other.height,
            "Combined planes share dimensions",
            "Plane::zip_map"
        );
        Self {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }

    pub fn add_assign(&mut self, other: &Self) {
        assert_invariant!(
            self.width == other.width && self.height == other.height,
            "Combined planes share dimensions",
            "Plane::add_assign"
        );
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a = *a + b;
        }
    }

    pub fn max_value(&self) -> F {
        self.data
            .iter()
            .copied()
            .fold(F::neg_infinity(), |acc, v| if v > acc { v } else { acc })
    }

    /// Same raster in another precision
    pub fn convert<G: Sample>(&self) -> Plane<G> {
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| cast::<G>(to_f64(v))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect101_mirrors_without_edge_repeat() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 5), 3);
        assert_eq!(reflect101(-3, 1), 0);
    }

    #[test]
    fn test_reflect101_small_lengths_terminate() {
        for i in -10..10 {
            assert!(reflect101(i, 2) < 2);
            assert!(reflect101(i, 3) < 3);
        }
    }

    #[test]
    fn test_from_fn_row_major() {
        let p: Plane<f32> = Plane::from_fn(3, 2, |x, y| (y * 10 + x) as f32);
        assert_eq!(p.row(1), &[10.0, 11.0, 12.0]);
        assert_eq!(p.get(2, 0), 2.0);
    }

    #[test]
    fn test_convert_precision() {
        let p: Plane<f32> = Plane::filled(2, 2, 0.5);
        let q: Plane<f64> = p.convert();
        assert!(q.data().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_max_value() {
        let p: Plane<f64> = Plane::from_vec(2, 2, vec![1.0, -3.0, 7.5, 2.0]);
        assert_eq!(p.max_value(), 7.5);
    }
}
