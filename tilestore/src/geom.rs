use std::cmp;

use serde::{Deserialize, Serialize};

use super::helpers::rearrange;

/// Axis indexes into 5 dimensional coordinates, ordered slowest to fastest varying.
pub const T: usize = 0;
pub const C: usize = 1;
pub const Z: usize = 2;
pub const Y: usize = 3;
pub const X: usize = 4;

pub const DIMENSION_NAMES: [&str; 5] = ["t", "c", "z", "y", "x"];

/// A half open rectangle in the y/x plane.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
    _private: (),
}

impl Rect {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        let (top, bottom) = rearrange(top, bottom);
        let (left, right) = rearrange(left, right);
        Self {
            top,
            bottom,
            left,
            right,
            _private: (),
        }
    }

    pub fn rows(&self) -> usize {
        self.bottom - self.top
    }

    pub fn cols(&self) -> usize {
        self.right - self.left
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows(), self.cols()]
    }

    pub fn cells(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0 || self.cols() == 0
    }

    /// Multiply every bound by `factor`, then clip to a `rows` x `cols` plane.
    ///
    pub fn scale(&self, factor: usize, rows: usize, cols: usize) -> Self {
        Self::new(
            cmp::min(self.top * factor, rows),
            cmp::min(self.bottom * factor, rows),
            cmp::min(self.left * factor, cols),
            cmp::min(self.right * factor, cols),
        )
    }

    pub fn iter(&self) -> RectIter {
        RectIter {
            row: self.top,
            col: self.left,
            left: self.left,
            bottom: if self.is_empty() { self.top } else { self.bottom },
            right: self.right,
        }
    }
}

pub struct RectIter {
    row: usize,
    col: usize,
    left: usize,
    bottom: usize,
    right: usize,
}

impl Iterator for RectIter {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.row < self.bottom {
            let coord = (self.row, self.col);
            self.col += 1;
            if self.col == self.right {
                self.col = self.left;
                self.row += 1;
            }

            Some(coord)
        } else {
            None
        }
    }
}

/// The address of a tile: a rectangle in the y/x plane of a single (t, c, z) slice.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileCoord {
    pub t: usize,
    pub c: usize,
    pub z: usize,
    pub rect: Rect,
}

impl TileCoord {
    pub fn new(t: usize, c: usize, z: usize, rect: Rect) -> Self {
        Self { t, c, z, rect }
    }

    pub fn region(&self) -> Region {
        Region::new(
            [self.t, self.c, self.z, self.rect.top, self.rect.left],
            [
                self.t + 1,
                self.c + 1,
                self.z + 1,
                self.rect.bottom,
                self.rect.right,
            ],
        )
    }
}

/// A half open box in (t, c, z, y, x) space.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub start: [usize; 5],
    pub end: [usize; 5],
}

impl Region {
    pub fn new(start: [usize; 5], end: [usize; 5]) -> Self {
        let mut region = Self { start, end };
        for i in 0..5 {
            let (lower, upper) = rearrange(start[i], end[i]);
            region.start[i] = lower;
            region.end[i] = upper;
        }

        region
    }

    /// The region starting at the origin with the given shape.
    ///
    pub fn from_shape(shape: [usize; 5]) -> Self {
        Self::new([0; 5], shape)
    }

    pub fn shape(&self) -> [usize; 5] {
        let mut shape = [0; 5];
        for i in 0..5 {
            shape[i] = self.end[i] - self.start[i];
        }

        shape
    }

    pub fn cells(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.cells() == 0
    }

    /// Whether `other` lies entirely inside this region.
    ///
    pub fn contains(&self, other: &Region) -> bool {
        (0..5).all(|i| self.start[i] <= other.start[i] && other.end[i] <= self.end[i])
    }

    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let mut start = [0; 5];
        let mut end = [0; 5];
        for i in 0..5 {
            start[i] = cmp::max(self.start[i], other.start[i]);
            end[i] = cmp::min(self.end[i], other.end[i]);
            if start[i] >= end[i] {
                return None;
            }
        }

        Some(Region { start, end })
    }

    /// The smallest region containing both this region and `other`.
    ///
    pub fn bounding(&self, other: &Region) -> Region {
        let mut start = [0; 5];
        let mut end = [0; 5];
        for i in 0..5 {
            start[i] = cmp::min(self.start[i], other.start[i]);
            end[i] = cmp::max(self.end[i], other.end[i]);
        }

        Region { start, end }
    }

    /// The y/x rectangle of this region.
    ///
    pub fn rect(&self) -> Rect {
        Rect::new(self.start[Y], self.end[Y], self.start[X], self.end[X])
    }

    /// Row major strides, in cells, for a buffer laid out over this region.
    ///
    pub(crate) fn strides(&self) -> [usize; 5] {
        let shape = self.shape();
        let mut strides = [1; 5];
        for i in (0..4).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }

        strides
    }

    /// Offset, in cells, of an absolute coordinate in a buffer laid out over this region.
    ///
    pub(crate) fn offset_of(&self, point: [usize; 5]) -> usize {
        let strides = self.strides();
        (0..5).map(|i| (point[i] - self.start[i]) * strides[i]).sum()
    }
}

/// Copy the cells of `window` from `src`, laid out over `src_region`, into `dst`, laid out over
/// `dst_region`.
///
/// Buffers are raw bytes with `cell_size` bytes per cell. `window` must lie inside both regions.
/// Rows along the x axis are contiguous in both buffers, so they're copied a row at a time.
///
pub(crate) fn copy_window(
    src: &[u8],
    src_region: &Region,
    dst: &mut [u8],
    dst_region: &Region,
    window: &Region,
    cell_size: usize,
) {
    let row_bytes = (window.end[X] - window.start[X]) * cell_size;
    for t in window.start[T]..window.end[T] {
        for c in window.start[C]..window.end[C] {
            for z in window.start[Z]..window.end[Z] {
                for y in window.start[Y]..window.end[Y] {
                    let point = [t, c, z, y, window.start[X]];
                    let src_start = src_region.offset_of(point) * cell_size;
                    let dst_start = dst_region.offset_of(point) * cell_size;
                    dst[dst_start..dst_start + row_bytes]
                        .copy_from_slice(&src[src_start..src_start + row_bytes]);
                }
            }
        }
    }
}
