use rayon::prelude::*;

use crate::errors::{
    Result,
    UniDecError,
};

/// Dense 2D array over a contiguous buffer.
///
/// `values` is a flattened array of values
/// `ncols` is the number of values in each row
/// `nrows` is the number of rows
///
/// Note on memory layout:
///
/// Values that belong to the same row are adjacent
/// in memory. The deconvolution grids are (m/z point × charge), so every
/// row holds all the charge states of a single spectrum point.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid2D<T: Copy> {
    values: Vec<T>,
    ncols: usize,
    nrows: usize,
}

impl<T: Copy + Send + Sync> Grid2D<T> {
    pub fn new_filled(nrows: usize, ncols: usize, value: T) -> Self {
        Grid2D {
            values: vec![value; nrows * ncols],
            ncols,
            nrows,
        }
    }

    pub fn from_flat_vector(values: Vec<T>, nrows: usize, ncols: usize) -> Result<Self> {
        if values.len() != nrows * ncols {
            return Err(UniDecError::ExpectedSlicesSameLength {
                expected: nrows * ncols,
                other: values.len(),
                context: "Grid2D::from_flat_vector".to_string(),
            });
        }
        Ok(Grid2D {
            values,
            ncols,
            nrows,
        })
    }

    #[inline(always)]
    pub fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.nrows, "row {} out of {}", row, self.nrows);
        debug_assert!(col < self.ncols, "col {} out of {}", col, self.ncols);
        row * self.ncols + col
    }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.values[self.index(row, col)]
    }

    #[inline(always)]
    pub fn insert(&mut self, row: usize, col: usize, value: T) {
        let idx = self.index(row, col);
        self.values[idx] = value;
    }

    pub fn get_row(&self, index: usize) -> Option<&[T]> {
        let start = index * self.ncols;
        let end = start + self.ncols;
        if end > self.values.len() || start >= self.values.len() {
            return None;
        }
        Some(&self.values[start..end])
    }

    /// Apply a function to each row of the array
    pub fn row_apply<'a: 'b, 'b, W, F: FnMut(&[T]) -> W + 'b>(
        &'a self,
        f: F,
    ) -> impl Iterator<Item = W> + 'b {
        self.values.chunks(self.ncols.max(1)).map(f)
    }

    /// Rows with their index, in parallel.
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = (usize, &mut [T])> {
        self.values.par_chunks_mut(self.ncols.max(1)).enumerate()
    }

    pub fn par_rows(&self) -> impl IndexedParallelIterator<Item = (usize, &[T])> {
        self.values.par_chunks(self.ncols.max(1)).enumerate()
    }

    /// Copies column `col` into a new vector.
    pub fn column(&self, col: usize) -> Vec<T> {
        (0..self.nrows).map(|r| self.get(r, col)).collect()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn fill(&mut self, value: T) {
        self.values.iter_mut().for_each(|x| *x = value);
    }

    /// Copy all values from `other`, which must have the same shape.
    pub fn copy_from(&mut self, other: &Grid2D<T>) {
        debug_assert_eq!(self.nrows, other.nrows);
        debug_assert_eq!(self.ncols, other.ncols);
        self.values.copy_from_slice(&other.values);
    }
}

/// Dense 3D array, the last dimension is contiguous in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid3D<T: Copy> {
    values: Vec<T>,
    dims: (usize, usize, usize),
}

impl<T: Copy + Send + Sync> Grid3D<T> {
    pub fn new_filled(dims: (usize, usize, usize), value: T) -> Self {
        Grid3D {
            values: vec![value; dims.0 * dims.1 * dims.2],
            dims,
        }
    }

    #[inline(always)]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.dims.0 && j < self.dims.1 && k < self.dims.2);
        (i * self.dims.1 + j) * self.dims.2 + k
    }

    #[inline(always)]
    pub fn get(&self, i: usize, j: usize, k: usize) -> T {
        self.values[self.index(i, j, k)]
    }

    /// The innermost run of values at `(i, j)`.
    pub fn lane(&self, i: usize, j: usize) -> &[T] {
        let start = self.index(i, j, 0);
        &self.values[start..start + self.dims.2]
    }

    /// Mutable lanes grouped by their first index, in parallel.
    pub fn par_planes_mut(&mut self) -> impl IndexedParallelIterator<Item = (usize, &mut [T])> {
        let plane = (self.dims.1 * self.dims.2).max(1);
        self.values.par_chunks_mut(plane).enumerate()
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }
}

/// Index of `offset` relative to `origin` on a ring of `length` elements.
#[inline(always)]
pub fn index_mod(length: usize, origin: usize, offset: isize) -> usize {
    (offset - origin as isize).rem_euclid(length as isize) as usize
}

/// Mirrors an index that fell outside `[0, length)` back into range.
///
/// Negative indices reflect about the first element and indices past the
/// end reflect about the last one. Windows wider than the data are clamped
/// after the reflection.
#[inline(always)]
pub fn reflect_index(k: isize, length: usize) -> usize {
    let last = length as isize - 1;
    let mut k = k.abs();
    if k > last {
        k = 2 * last - k;
    }
    k.clamp(0, last.max(0)) as usize
}
