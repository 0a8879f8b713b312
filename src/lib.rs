//! Two-dimensional electrical impedance tomography (EIT)
//! with the GREIT reconstruction algorithm.
//!
//! The pipeline goes as follows:
//! 1. build a [`Mesh`] of the body cross-section with electrodes on its boundary
//!    (generated with [`Mesh::create`] or loaded with [`gmsh::load_trimesh_2d`]),
//! 2. generate the excitation and measurement sequence with [`Protocol::create`],
//! 3. set up a [`Greit`] solver, which computes the forward sensitivities
//!    with a [`ForwardModel`] and trains a linear reconstruction matrix,
//! 4. reconstruct conductivity change images from pairs of voltage frames
//!    and mask out pixels that fall outside the body.
//!
//! ```
//! use eitrs::{ExclusionPolicy, Greit, GreitParams, Mesh, Protocol};
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mesh = Mesh::create(16, 0.2)?;
//! let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent)?;
//! let solver = Greit::new(&mesh, &protocol).setup(GreitParams {
//!     n: 16,
//!     jac_normalized: true,
//!     ..Default::default()
//! })?;
//!
//! // in practice these come from a measurement device
//! let v0 = solver.reference_voltages().clone();
//! let v1 = v0.map(|v| v * 1.01);
//! let image = solver.solve(&v1, &v0, true)?;
//! let masked = solver.mask_value(&image, f64::NAN);
//! assert_eq!(masked.values.shape(), (16, 16));
//! # Ok(())
//! # }
//! # run().expect("reconstruction failed");
//! ```

#![warn(missing_docs)]

pub mod mesh;
#[doc(inline)]
pub use mesh::{BoundingBox, Mesh, MeshGenerationError};

pub mod gmsh;

pub mod protocol;
#[doc(inline)]
pub use protocol::{
    ExclusionPolicy, InvalidProtocolError, MeasurementStart, Protocol, ProtocolEntry,
};

pub mod conductivity;
#[doc(inline)]
pub use conductivity::ConductivityField;

pub mod forward;
#[doc(inline)]
pub use forward::{
    ComplexVoltageVector, ForwardError, ForwardModel, JacobianMatrix, VoltageVector,
};

pub mod greit;
#[doc(inline)]
pub use greit::{Greit, GreitError, GreitParams, ReconstructionMatrix, TrainingSet};

pub mod image;
#[doc(inline)]
pub use image::{frame_means, ComplexImage, MaskedImage, PixelGrid, ReconstructedImage};

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 2D `nalgebra` vector.
pub type Vec2 = na::Vector2<f64>;
