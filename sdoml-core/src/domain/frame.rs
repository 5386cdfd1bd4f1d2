//! Decoded 2-D pixel arrays.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("frame of {rows}x{cols} cannot hold {len} pixels")]
pub struct FrameShapeError {
    pub rows: usize,
    pub cols: usize,
    pub len: usize,
}

/// Non-empty `f32` image, always held in standard (row-major) layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array2<f32>,
}

impl Frame {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, FrameShapeError> {
        let len = data.len();
        let err = FrameShapeError { rows, cols, len };
        if rows == 0 || cols == 0 {
            return Err(err);
        }
        // Rejects overflowing shapes as well as length mismatches.
        let pixels = Array2::from_shape_vec((rows, cols), data).map_err(|_| err)?;
        Ok(Self { pixels })
    }

    /// Wrap an array of any memory order.
    pub fn from_array(pixels: Array2<f32>) -> Result<Self, FrameShapeError> {
        let (rows, cols) = pixels.dim();
        if rows == 0 || cols == 0 {
            return Err(FrameShapeError { rows, cols, len: 0 });
        }
        let pixels = if pixels.is_standard_layout() {
            pixels
        } else {
            pixels.as_standard_layout().into_owned()
        };
        Ok(Self { pixels })
    }

    pub fn filled(rows: usize, cols: usize, value: f32) -> Self {
        Self {
            pixels: Array2::from_elem((rows, cols), value),
        }
    }

    pub fn rows(&self) -> usize {
        self.pixels.nrows()
    }

    pub fn cols(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.pixels
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.pixels.view()
    }

    /// Pixels in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.pixels.iter()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.pixels.get((row, col)).copied()
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Frame {
        Frame {
            pixels: self.pixels.mapv(f),
        }
    }

    /// Smallest and largest finite values, if any pixel is finite.
    pub fn finite_min_max(&self) -> Option<(f32, f32)> {
        self.pixels
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn shape_must_match_data() {
        assert!(Frame::new(2, 2, vec![0.0; 3]).is_err());
        assert!(Frame::new(0, 0, vec![]).is_err());
        let f = Frame::new(2, 3, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(f.get(1, 2), Some(5.0));
        assert_eq!(f.get(2, 0), None);
    }

    #[test]
    fn overflowing_shape_is_an_error() {
        let err = Frame::new(usize::MAX / 2, 4, vec![0.0; 8]).unwrap_err();
        assert_eq!(err.len, 8);
        assert!(err.to_string().contains("cannot hold 8 pixels"));
    }

    #[test]
    fn fortran_arrays_are_stored_row_major() {
        let f = Frame::from_array(array![[1.0, 2.0], [3.0, 4.0]].reversed_axes()).unwrap();
        assert!(f.as_array().is_standard_layout());
        assert_eq!(f.iter().copied().collect::<Vec<_>>(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn min_max_skips_non_finite() {
        let f = Frame::new(1, 4, vec![f32::NAN, -1.0, 3.0, f32::INFINITY]).unwrap();
        assert_eq!(f.finite_min_max(), Some((-1.0, 3.0)));
        assert_eq!(Frame::filled(1, 1, f32::NAN).finite_min_max(), None);
    }
}
