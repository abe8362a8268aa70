//! Local transport cost model.
//!
//! For every source pixel, the candidate destinations are the cells of a
//! k×k window centered on it, enumerated row-major. The cost of an edge is
//! the squared Euclidean distance between the two pixel positions. Window
//! slots that fall outside the image keep their place in the fixed-size
//! representation but carry the [`INF_COST`] sentinel, so any positive cost
//! multiplier prices them out of the plan.

use anyhow::bail;
use ndarray::Array2;

use crate::config::INF_COST;

/// Per-geometry cost matrix and reindexing maps. Built once per image
/// geometry and shared read-only across the batch and across iterations.
pub struct CostMatrix {
    /// Image height in pixels.
    pub height: usize,

    /// Image width in pixels.
    pub width: usize,

    /// Side of the square transport window. Odd.
    pub kernel_size: usize,

    /// `[n_pixels, kernel²]` squared pixel distances, `INF_COST` for slots
    /// outside the image.
    pub costs: Array2<f32>,

    /// Destination pixel of each `(pixel, slot)` edge, `-1` if outside.
    pub dest_pixel: Array2<i64>,

    /// Gather map between the source-major and destination-major
    /// flattenings of the plan. The window offsets are centrally symmetric,
    /// so reversing an edge mirrors its slot index and the map is its own
    /// inverse: the same gather performs both the transpose and the
    /// detranspose. `-1` marks slots whose partner lies outside the image.
    pub transpose_idx: Array2<i64>,
}

impl CostMatrix {
    /// Builds the cost matrix and index maps for the given geometry.
    /// Pure function of geometry; rejects degenerate inputs.
    pub fn build(height: usize, width: usize, kernel_size: usize) -> anyhow::Result<Self> {
        if height == 0 || width == 0 {
            bail!("image geometry must be positive, got {height}x{width}");
        }
        if kernel_size == 0 || kernel_size % 2 == 0 {
            bail!("kernel size must be odd and positive, got {kernel_size}");
        }

        let n = height * width;
        let window = kernel_size * kernel_size;
        let offsets = Self::offsets(kernel_size);

        let mut costs = Array2::from_elem((n, window), INF_COST);
        let mut dest_pixel = Array2::from_elem((n, window), -1i64);
        let mut transpose_idx = Array2::from_elem((n, window), -1i64);

        for y in 0..height {
            for x in 0..width {
                let p = y * width + x;
                for (l, &(dy, dx)) in offsets.iter().enumerate() {
                    let ty = y as i64 + dy;
                    let tx = x as i64 + dx;
                    if ty < 0 || ty >= height as i64 || tx < 0 || tx >= width as i64 {
                        continue;
                    }
                    let t = ty as usize * width + tx as usize;
                    costs[[p, l]] = (dy * dy + dx * dx) as f32;
                    dest_pixel[[p, l]] = t as i64;
                    transpose_idx[[p, l]] = (t * window + (window - 1 - l)) as i64;
                }
            }
        }

        Ok(Self {
            height,
            width,
            kernel_size,
            costs,
            dest_pixel,
            transpose_idx,
        })
    }

    /// Number of pixels per channel.
    pub fn n_pixels(&self) -> usize {
        self.height * self.width
    }

    /// Number of window slots per pixel (kernel²).
    pub fn window(&self) -> usize {
        self.kernel_size * self.kernel_size
    }

    /// Slot whose offset is (0, 0): mass that stays on its source pixel.
    pub fn center_slot(&self) -> usize {
        self.window() / 2
    }

    /// Destination pixel of an edge, or `None` if it leaves the image.
    pub fn destination(&self, pixel: usize, slot: usize) -> Option<usize> {
        let d = self.dest_pixel[[pixel, slot]];
        (d >= 0).then_some(d as usize)
    }

    /// Row-major window offsets, `(dy, dx)` each in `[-r, r]`.
    fn offsets(kernel_size: usize) -> Vec<(i64, i64)> {
        let r = kernel_size as i64 / 2;
        let mut offs = Vec::with_capacity(kernel_size * kernel_size);
        for dy in -r..=r {
            for dx in -r..=r {
                offs.push((dy, dx));
            }
        }
        offs
    }
}
