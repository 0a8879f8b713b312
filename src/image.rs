//! Pixel grids for reconstructed images and masking of pixels outside the body.

use fixedbitset as fb;
use nalgebra as na;

use crate::{GreitError, Mesh, Vec2, VoltageVector};

/// A regular `n × n` grid of pixel centers spanning a mesh's bounding box.
///
/// Pixels are indexed row-major with rows along the y axis:
/// pixel `k` is at row `k / n`, column `k % n`,
/// with x coordinate `xs[k % n]` and y coordinate `ys[k / n]`.
/// The grid includes the edges of the bounding box.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelGrid {
    side: usize,
    xs: Vec<f64>,
    ys: Vec<f64>,
    /// pixels whose center lies inside the meshed domain
    inside: fb::FixedBitSet,
}

impl PixelGrid {
    /// Create a grid with `side × side` pixels over the bounding box of `mesh`
    /// and find which pixels lie inside it.
    ///
    /// Fails with [`GreitError::InvalidParameter`] if `side` is less than 2.
    pub fn new(mesh: &Mesh, side: usize) -> Result<Self, GreitError> {
        if side < 2 {
            return Err(GreitError::InvalidParameter {
                name: "n",
                value: side as f64,
            });
        }
        let bounds = mesh.bounds();
        let linspace = |min: f64, max: f64| -> Vec<f64> {
            (0..side)
                .map(|i| min + (max - min) * i as f64 / (side - 1) as f64)
                .collect()
        };
        let xs = linspace(bounds.min.x, bounds.max.x);
        let ys = linspace(bounds.min.y, bounds.max.y);

        let mut grid = Self {
            side,
            xs,
            ys,
            inside: fb::FixedBitSet::with_capacity(side * side),
        };
        let inside: fb::FixedBitSet = (0..grid.len())
            .filter(|&k| mesh.contains_point(grid.center(k)))
            .collect();
        grid.inside.union_with(&inside);
        Ok(grid)
    }

    /// Number of pixels along each side.
    #[inline]
    pub fn side(&self) -> usize {
        self.side
    }

    /// Total number of pixels.
    #[inline]
    pub fn len(&self) -> usize {
        self.side * self.side
    }

    /// Whether the grid has no pixels. Never true for a constructed grid.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.side == 0
    }

    /// Position of the center of pixel `k`.
    #[inline]
    pub fn center(&self, k: usize) -> Vec2 {
        Vec2::new(self.xs[k % self.side], self.ys[k / self.side])
    }

    /// Iterate over all pixel centers in pixel order.
    pub fn centers(&self) -> impl '_ + Iterator<Item = Vec2> {
        (0..self.len()).map(|k| self.center(k))
    }

    /// The set of pixels whose center lies inside the mesh.
    #[inline]
    pub fn inside(&self) -> &fb::FixedBitSet {
        &self.inside
    }

    /// x coordinates of the pixel centers as an image-shaped matrix.
    pub fn x(&self) -> na::DMatrix<f64> {
        na::DMatrix::from_fn(self.side, self.side, |_, col| self.xs[col])
    }

    /// y coordinates of the pixel centers as an image-shaped matrix.
    pub fn y(&self) -> na::DMatrix<f64> {
        na::DMatrix::from_fn(self.side, self.side, |row, _| self.ys[row])
    }

    /// Arrange a vector of per-pixel values into an image-shaped matrix.
    pub(crate) fn to_image(&self, pixels: &na::DVector<f64>) -> na::DMatrix<f64> {
        na::DMatrix::from_row_slice(self.side, self.side, pixels.as_slice())
    }
}

/// A reconstructed conductivity change image.
///
/// `values[(row, col)]` is the value of the pixel at
/// [`PixelGrid::center`]`(row * n + col)`.
/// Nothing is masked; see [`apply_mask`] and
/// [`Greit::mask_value`][crate::Greit::mask_value].
#[derive(Clone, Debug, PartialEq)]
pub struct ReconstructedImage {
    /// Pixel values, rows along the y axis.
    pub values: na::DMatrix<f64>,
}

impl ReconstructedImage {
    /// Pixel index and value of the largest magnitude value
    /// among the given set of pixels.
    ///
    /// Returns `None` if the set is empty.
    pub fn peak(&self, within: &fb::FixedBitSet) -> Option<(usize, f64)> {
        let side = self.values.ncols();
        within
            .ones()
            .filter(|&k| k < self.values.len())
            .map(|k| (k, self.values[(k / side, k % side)]))
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
    }
}

/// Reconstructions of the real and imaginary parts of a complex voltage change.
#[derive(Clone, Debug, PartialEq)]
pub struct ComplexImage {
    /// Image of the in-phase (real) part.
    pub real: ReconstructedImage,
    /// Image of the quadrature (imaginary) part.
    pub imag: ReconstructedImage,
}

/// An image with pixels outside the valid region replaced by a marker value,
/// along with the pixel coordinates for plotting.
#[derive(Clone, Debug)]
pub struct MaskedImage {
    /// x coordinate of each pixel.
    pub x: na::DMatrix<f64>,
    /// y coordinate of each pixel.
    pub y: na::DMatrix<f64>,
    /// Pixel values, with masked pixels set to the marker value.
    pub values: na::DMatrix<f64>,
}

/// Replace the value of every pixel not in `valid` with `mask_value`.
///
/// Pixels are indexed row-major as in [`PixelGrid`].
/// Masking an already masked image with the same mask and value changes nothing.
///
/// ```
/// # use eitrs::{image::apply_mask, na};
/// # use fixedbitset::FixedBitSet;
/// let values = na::DMatrix::from_element(2, 2, 1.0);
/// let valid: FixedBitSet = [0, 3].into_iter().collect();
/// let masked = apply_mask(&values, &valid, f64::NAN);
/// assert_eq!(masked[(0, 0)], 1.0);
/// assert!(masked[(0, 1)].is_nan());
/// ```
pub fn apply_mask(
    values: &na::DMatrix<f64>,
    valid: &fb::FixedBitSet,
    mask_value: f64,
) -> na::DMatrix<f64> {
    let cols = values.ncols();
    na::DMatrix::from_fn(values.nrows(), values.ncols(), |row, col| {
        if valid.contains(row * cols + col) {
            values[(row, col)]
        } else {
            mask_value
        }
    })
}

/// Mean of each voltage frame,
/// the average transfer impedance used to plot a capture over time.
///
/// Empty frames have a mean of zero.
pub fn frame_means(frames: &[VoltageVector]) -> Vec<f64> {
    frames
        .iter()
        .map(|frame| if frame.is_empty() { 0.0 } else { frame.mean() })
        .collect()
}
