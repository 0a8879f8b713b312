//! The GREIT reconstruction algorithm
//! (Graz consensus Reconstruction algorithm for EIT).
//!
//! GREIT is a linear time-difference method:
//! a reconstruction matrix `R` is trained once so that
//! it maps simulated voltage changes of small training anomalies
//! as closely as possible to desired images of those anomalies.
//! Reconstructing a frame is then a single matrix-vector product.
//!
//! The solver goes through three states, tracked in its type:
//! [`Uninitialized`] → [`Configured`] → [`Ready`].
//! Only a [`Ready`] solver can reconstruct images,
//! so using a solver before it's trained is a compile error:
//!
//! ```compile_fail
//! # use eitrs::{ExclusionPolicy, Greit, Mesh, Protocol, VoltageVector};
//! let mesh = Mesh::create(16, 0.2).unwrap();
//! let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
//! let solver = Greit::new(&mesh, &protocol);
//! let v = VoltageVector::zeros(protocol.len());
//! let image = solver.solve(&v, &v, false);
//! ```

use fixedbitset as fb;
use nalgebra as na;
use nalgebra::Normed;

use crate::{
    image::apply_mask, ComplexImage, ComplexVoltageVector, ConductivityField, ForwardError,
    ForwardModel, JacobianMatrix, MaskedImage, Mesh, PixelGrid, Protocol, ReconstructedImage,
    VoltageVector,
};

mod training;

/// Linear map from voltage changes to pixel values, pixels (rows) × measurements (columns).
///
/// Pixel `k` is at row `k / n`, column `k % n` of the image.
pub type ReconstructionMatrix = na::DMatrix<f64>;

/// Error in setting up or running a GREIT solver.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GreitError {
    /// A parameter is outside of its valid range.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// Name of the parameter.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },
    /// Computing the forward model failed.
    #[error(transparent)]
    Forward(#[from] ForwardError),
    /// No training anomaly fit inside the mesh.
    #[error("Training set is empty")]
    EmptyTrainingSet,
    /// The regularized calibration system could not be solved reliably.
    #[error("Ill-conditioned training system (reciprocal condition estimate {rcond:e})")]
    IllConditionedTraining {
        /// Estimated reciprocal condition number, zero if the factorization failed.
        rcond: f64,
    },
    /// A voltage frame doesn't have one value per protocol entry.
    #[error("Expected {expected} voltages, got {actual}")]
    DimensionMismatch {
        /// Length of the protocol.
        expected: usize,
        /// Length of the given frame.
        actual: usize,
    },
    /// A reference voltage used for normalization is zero.
    #[error("Reference voltage {index} is zero")]
    ZeroReference {
        /// Index of the measurement with a zero reference.
        index: usize,
    },
}

/// The anomalies a GREIT reconstruction matrix is trained on.
#[derive(Clone, Debug, PartialEq)]
pub enum TrainingSet {
    /// Small disk-shaped conductivity changes
    /// centered on a regular lattice of points inside the mesh.
    CircularAnomalies {
        /// Disk radii relative to the radius of the domain
        /// (half of the larger bounding box extent).
        /// Every center gets one sample per radius.
        radii: Vec<f64>,
        /// Number of lattice points along each axis of the bounding box.
        grid: usize,
    },
    /// A unit change in each mesh element separately,
    /// with the element centroid as the anomaly center.
    Elements,
}

impl Default for TrainingSet {
    fn default() -> Self {
        Self::CircularAnomalies {
            radii: vec![0.05, 0.1],
            grid: 24,
        }
    }
}

/// Parameters of a GREIT solver.
#[derive(Clone, Debug, PartialEq)]
pub struct GreitParams {
    /// Exponent of the noise-figure weighting of the regularization,
    /// in `[0, 1]`.
    pub p: f64,
    /// Regularization strength, positive.
    pub lamb: f64,
    /// Number of pixels along each side of the image, at least 2.
    pub n: usize,
    /// Steepness of the desired image point-spread function, positive.
    pub s: f64,
    /// Relative radius of the desired image point-spread function,
    /// also used as the coverage threshold of the validity mask.
    /// In `(0, 1)`.
    pub ratio: f64,
    /// Whether to divide each Jacobian row by its reference voltage.
    /// Use together with normalized [`solve`][Greit::solve].
    pub jac_normalized: bool,
    /// The anomalies to train on.
    pub training: TrainingSet,
}

impl Default for GreitParams {
    fn default() -> Self {
        Self {
            p: 0.2,
            lamb: 1e-2,
            n: 32,
            s: 20.0,
            ratio: 0.1,
            jac_normalized: false,
            training: TrainingSet::default(),
        }
    }
}

impl GreitParams {
    fn validate(&self) -> Result<(), GreitError> {
        let invalid = |name, value| Err(GreitError::InvalidParameter { name, value });
        if !(0.0..=1.0).contains(&self.p) {
            return invalid("p", self.p);
        }
        if !(self.lamb > 0.0 && self.lamb.is_finite()) {
            return invalid("lamb", self.lamb);
        }
        if self.n < 2 {
            return invalid("n", self.n as f64);
        }
        if !(self.s > 0.0 && self.s.is_finite()) {
            return invalid("s", self.s);
        }
        if !(self.ratio > 0.0 && self.ratio < 1.0) {
            return invalid("ratio", self.ratio);
        }
        if let TrainingSet::CircularAnomalies { radii, grid } = &self.training {
            if *grid == 0 {
                return invalid("grid", 0.0);
            }
            if radii.is_empty() {
                return Err(GreitError::EmptyTrainingSet);
            }
            if let Some(&r) = radii.iter().find(|r| !(**r > 0.0 && r.is_finite())) {
                return invalid("radii", r);
            }
        }
        Ok(())
    }
}

//
// solver states
//

/// State of a solver that has only been given its mesh and protocol.
#[derive(Clone, Copy, Debug)]
pub struct Uninitialized;

/// State of a solver whose forward model and pixel grid have been computed.
#[derive(Clone, Debug)]
pub struct Configured {
    params: GreitParams,
    grid: PixelGrid,
    jacobian: JacobianMatrix,
    reference: VoltageVector,
}

/// State of a trained solver, ready to reconstruct images.
#[derive(Clone, Debug)]
pub struct Ready {
    model: Configured,
    reconstruction: ReconstructionMatrix,
    valid: fb::FixedBitSet,
}

/// Trait for solver states that have a configured forward model,
/// giving access to it in both [`Configured`] and [`Ready`] solvers.
///
/// Not intended to be implemented by users,
/// so methods are hidden from docs.
pub trait ModelState {
    /// Access the configured forward model and grid.
    #[doc(hidden)]
    fn model(&self) -> &Configured;
}

impl ModelState for Configured {
    #[inline]
    fn model(&self) -> &Configured {
        self
    }
}

impl ModelState for Ready {
    #[inline]
    fn model(&self) -> &Configured {
        &self.model
    }
}

/// A GREIT solver for a mesh and a measurement protocol.
///
/// Create with [`new`][Self::new], then [`configure`][Self::configure]
/// and [`train`][Self::train] (or do both with [`setup`][Self::setup]).
/// See the [crate-level docs][crate] for an example.
///
/// A trained solver is immutable; reconstructions take `&self`
/// and can run concurrently from multiple threads.
#[derive(Clone, Debug)]
pub struct Greit<'a, State> {
    mesh: &'a Mesh,
    protocol: &'a Protocol,
    state: State,
}

impl<'a> Greit<'a, Uninitialized> {
    /// Create a solver for the given mesh and protocol.
    pub fn new(mesh: &'a Mesh, protocol: &'a Protocol) -> Self {
        Self {
            mesh,
            protocol,
            state: Uninitialized,
        }
    }

    /// Validate parameters, compute the Jacobian and reference voltages
    /// at unit conductivity, and lay out the pixel grid.
    pub fn configure(self, params: GreitParams) -> Result<Greit<'a, Configured>, GreitError> {
        params.validate()?;
        let model = ForwardModel::new(self.mesh, self.protocol)?;
        let (mut jacobian, reference) =
            model.build_jacobian(&ConductivityField::uniform(self.mesh, 1.0))?;

        if params.jac_normalized {
            check_reference(reference.iter().map(|v| v.abs()))?;
            for (mut row, &v) in jacobian.row_iter_mut().zip(reference.iter()) {
                row /= v;
            }
        }

        let grid = PixelGrid::new(self.mesh, params.n)?;
        log::debug!(
            "configured GREIT: {} measurements, {} elements, {n}x{n} pixels",
            jacobian.nrows(),
            jacobian.ncols(),
            n = params.n,
        );

        Ok(Greit {
            mesh: self.mesh,
            protocol: self.protocol,
            state: Configured {
                params,
                grid,
                jacobian,
                reference,
            },
        })
    }

    /// [`configure`][Self::configure] and [`train`][Greit::train] in one go.
    pub fn setup(self, params: GreitParams) -> Result<Greit<'a, Ready>, GreitError> {
        self.configure(params)?.train()
    }
}

impl<'a> Greit<'a, Configured> {
    /// Train the reconstruction matrix and compute the validity mask.
    pub fn train(self) -> Result<Greit<'a, Ready>, GreitError> {
        let model = self.state;
        let data = training::generate(self.mesh, &model.grid, &model.jacobian, &model.params)?;
        let reconstruction = training::calibrate(
            &data.response,
            &data.desired,
            model.params.lamb,
            model.params.p,
        )?;
        let valid = training::valid_pixels(&model.grid, &data.desired, model.params.ratio);
        log::info!(
            "trained GREIT on {} samples, {} of {} pixels valid",
            data.response.ncols(),
            valid.count_ones(..),
            model.grid.len(),
        );

        Ok(Greit {
            mesh: self.mesh,
            protocol: self.protocol,
            state: Ready {
                model,
                reconstruction,
                valid,
            },
        })
    }
}

impl<'a, State: ModelState> Greit<'a, State> {
    /// The parameters the solver was configured with.
    #[inline]
    pub fn params(&self) -> &GreitParams {
        &self.state.model().params
    }

    /// The pixel grid of reconstructed images.
    #[inline]
    pub fn grid(&self) -> &PixelGrid {
        &self.state.model().grid
    }

    /// The Jacobian at unit conductivity,
    /// normalized by the reference voltages if `jac_normalized` was set.
    #[inline]
    pub fn jacobian(&self) -> &JacobianMatrix {
        &self.state.model().jacobian
    }

    /// Simulated voltages at unit conductivity.
    #[inline]
    pub fn reference_voltages(&self) -> &VoltageVector {
        &self.state.model().reference
    }
}

impl<'a> Greit<'a, Ready> {
    /// The trained reconstruction matrix.
    #[inline]
    pub fn reconstruction_matrix(&self) -> &ReconstructionMatrix {
        &self.state.reconstruction
    }

    /// Pixels considered part of the reconstructed domain.
    #[inline]
    pub fn validity_mask(&self) -> &fb::FixedBitSet {
        &self.state.valid
    }

    /// Reconstruct a conductivity change image
    /// from a measured frame `v1` and a reference frame `v0`.
    ///
    /// If `normalize` is set, the voltage change is divided by `v0`
    /// elementwise before reconstruction.
    pub fn solve(
        &self,
        v1: &VoltageVector,
        v0: &VoltageVector,
        normalize: bool,
    ) -> Result<ReconstructedImage, GreitError> {
        self.check_frame_lengths(v1.len(), v0.len())?;
        let dv = if normalize {
            check_reference(v0.iter().map(|v| v.abs()))?;
            (v1 - v0).component_div(v0)
        } else {
            v1 - v0
        };
        Ok(self.reconstruct(&dv))
    }

    /// Reconstruct from complex-valued frames,
    /// such as demodulated measurements that keep the quadrature component.
    ///
    /// The voltage change (normalized by the complex `v0` if `normalize` is set)
    /// is split into real and imaginary parts,
    /// and each part is reconstructed on its own.
    pub fn solve_complex(
        &self,
        v1: &ComplexVoltageVector,
        v0: &ComplexVoltageVector,
        normalize: bool,
    ) -> Result<ComplexImage, GreitError> {
        self.check_frame_lengths(v1.len(), v0.len())?;
        let dv = if normalize {
            check_reference(v0.iter().map(|v| v.norm()))?;
            (v1 - v0).component_div(v0)
        } else {
            v1 - v0
        };
        Ok(ComplexImage {
            real: self.reconstruct(&dv.map(|v| v.re)),
            imag: self.reconstruct(&dv.map(|v| v.im)),
        })
    }

    fn check_frame_lengths(&self, v1: usize, v0: usize) -> Result<(), GreitError> {
        let expected = self.protocol.len();
        match [v1, v0].into_iter().find(|&len| len != expected) {
            Some(actual) => Err(GreitError::DimensionMismatch { expected, actual }),
            None => Ok(()),
        }
    }

    fn reconstruct(&self, dv: &VoltageVector) -> ReconstructedImage {
        let pixels = &self.state.reconstruction * dv;
        ReconstructedImage {
            values: self.state.model.grid.to_image(&pixels),
        }
    }

    /// Reconstruct every frame of a capture against the same reference.
    pub fn solve_series(
        &self,
        frames: &[VoltageVector],
        v0: &VoltageVector,
        normalize: bool,
    ) -> Vec<Result<ReconstructedImage, GreitError>> {
        frames
            .iter()
            .map(|frame| self.solve(frame, v0, normalize))
            .collect()
    }

    /// Replace pixels outside the [validity mask][Self::validity_mask] with `value`
    /// and pair the image with pixel coordinates.
    pub fn mask_value(&self, image: &ReconstructedImage, value: f64) -> MaskedImage {
        let grid = &self.state.model.grid;
        MaskedImage {
            x: grid.x(),
            y: grid.y(),
            values: apply_mask(&image.values, &self.state.valid, value),
        }
    }
}

/// Check that no reference voltage magnitude is zero relative to the largest one.
fn check_reference(magnitudes: impl Iterator<Item = f64>) -> Result<(), GreitError> {
    let magnitudes: Vec<f64> = magnitudes.collect();
    let scale = magnitudes.iter().copied().fold(0.0, f64::max);
    match magnitudes
        .iter()
        .position(|v| !v.is_finite() || *v <= f64::EPSILON * scale)
    {
        Some(index) => Err(GreitError::ZeroReference { index }),
        None => Ok(()),
    }
}
