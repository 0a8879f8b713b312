//! Training data generation and calibration of the reconstruction matrix.

use fixedbitset as fb;
use nalgebra as na;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::{GreitError, GreitParams, ReconstructionMatrix, TrainingSet};
use crate::{conductivity::disk_coverage, JacobianMatrix, Mesh, PixelGrid, Vec2};

/// Smallest acceptable ratio of the smallest to the largest
/// squared Cholesky pivot of the calibration system.
const MIN_PIVOT_RATIO: f64 = 1e-14;

/// Simulated responses of the training anomalies and the images we'd like to see of them.
pub(super) struct TrainingData {
    /// measurements × samples
    pub response: na::DMatrix<f64>,
    /// pixels × samples
    pub desired: na::DMatrix<f64>,
}

/// Simulate the linearized response of every training anomaly
/// and build the corresponding desired images.
pub(super) fn generate(
    mesh: &Mesh,
    grid: &PixelGrid,
    jacobian: &JacobianMatrix,
    params: &GreitParams,
) -> Result<TrainingData, GreitError> {
    let (centers, response) = match &params.training {
        TrainingSet::Elements => (mesh.centroids().to_vec(), jacobian.clone()),
        TrainingSet::CircularAnomalies {
            radii,
            grid: lattice,
        } => circular_anomalies(mesh, jacobian, radii, *lattice)?,
    };
    if centers.is_empty() {
        return Err(GreitError::EmptyTrainingSet);
    }
    let desired = desired_images(grid, &centers, params.s, params.ratio);
    Ok(TrainingData { response, desired })
}

/// Disks of each radius centered on the lattice points inside the mesh.
fn circular_anomalies(
    mesh: &Mesh,
    jacobian: &JacobianMatrix,
    radii: &[f64],
    lattice: usize,
) -> Result<(Vec<Vec2>, na::DMatrix<f64>), GreitError> {
    let bounds = mesh.bounds();
    let extents = bounds.extents();
    let domain_radius = 0.5 * extents.max();

    let centers: Vec<Vec2> = itertools::iproduct!(0..lattice, 0..lattice)
        .map(|(row, col)| {
            let rel = Vec2::new(col as f64 + 0.5, row as f64 + 0.5) / lattice as f64;
            bounds.min + rel.component_mul(&extents)
        })
        .filter(|c| mesh.contains_point(*c))
        .collect();
    let samples: Vec<(Vec2, f64)> = itertools::iproduct!(centers, radii)
        .map(|(c, &r)| (c, r * domain_radius))
        .collect();
    if samples.is_empty() {
        return Err(GreitError::EmptyTrainingSet);
    }

    let respond =
        |&(center, radius): &(Vec2, f64)| anomaly_response(mesh, jacobian, center, radius);
    #[cfg(feature = "parallel")]
    let columns: Vec<na::DVector<f64>> = samples.par_iter().map(respond).collect();
    #[cfg(not(feature = "parallel"))]
    let columns: Vec<na::DVector<f64>> = samples.iter().map(respond).collect();

    let centers = samples.into_iter().map(|(c, _)| c).collect();
    Ok((centers, na::DMatrix::from_columns(&columns)))
}

/// Linearized voltage change caused by a unit conductivity change inside a disk.
fn anomaly_response(
    mesh: &Mesh,
    jacobian: &JacobianMatrix,
    center: Vec2,
    radius: f64,
) -> na::DVector<f64> {
    let mut perturbation = disk_coverage(mesh, center, radius);
    // disks smaller than the sampling resolution still perturb the element they're in
    if perturbation.iter().all(|&c| c == 0.0) {
        if let Some(el) = mesh.locate_point(center) {
            perturbation[el] = 1.0;
        }
    }

    let mut response = na::DVector::zeros(jacobian.nrows());
    for (el, &amount) in perturbation.iter().enumerate() {
        if amount != 0.0 {
            response.axpy(amount, &jacobian.column(el), 1.0);
        }
    }
    response
}

/// Desired image of each training sample:
/// a sigmoid blob around the sample center, sharpness `s` and relative radius `ratio`.
fn desired_images(grid: &PixelGrid, centers: &[Vec2], s: f64, ratio: f64) -> na::DMatrix<f64> {
    let pixels: Vec<Vec2> = grid.centers().collect();
    let d_max = itertools::iproduct!(&pixels, centers)
        .map(|(p, c)| (p - c).norm())
        .fold(f64::MIN_POSITIVE, f64::max);

    na::DMatrix::from_fn(pixels.len(), centers.len(), |k, t| {
        let d = (pixels[k] - centers[t]).norm();
        1.0 / (1.0 + (s * (5.0 * d / d_max - 5.0 * ratio)).exp())
    })
}

/// Solve `R (A Aᵗ + lamb · diag(A Aᵗ)^p) = D Aᵗ` for the reconstruction matrix `R`.
pub(super) fn calibrate(
    response: &na::DMatrix<f64>,
    desired: &na::DMatrix<f64>,
    lamb: f64,
    p: f64,
) -> Result<ReconstructionMatrix, GreitError> {
    let ill_conditioned = |rcond| GreitError::IllConditionedTraining { rcond };

    let gram = response * response.transpose();
    let mut system = gram.clone();
    for (i, &d) in gram.diagonal().iter().enumerate() {
        if !(d > 0.0 && d.is_finite()) {
            return Err(ill_conditioned(0.0));
        }
        system[(i, i)] += lamb * d.powf(p);
    }

    let chol = na::Cholesky::new(system).ok_or(ill_conditioned(0.0))?;
    let (min_pivot, max_pivot) = chol
        .l_dirty()
        .diagonal()
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let rcond = (min_pivot / max_pivot).powi(2);
    if !(rcond >= MIN_PIVOT_RATIO) {
        return Err(ill_conditioned(rcond));
    }

    // the system is symmetric, so Rᵗ = system⁻¹ (A Dᵗ)
    let rhs = response * desired.transpose();
    Ok(chol.solve(&rhs).transpose())
}

/// Pixels inside the mesh whose training coverage
/// reaches `ratio` times the best covered pixel's.
pub(super) fn valid_pixels(
    grid: &PixelGrid,
    desired: &na::DMatrix<f64>,
    ratio: f64,
) -> fb::FixedBitSet {
    let coverage: Vec<f64> = desired.row_iter().map(|row| row.max()).collect();
    let peak = grid
        .inside()
        .ones()
        .map(|k| coverage[k])
        .fold(0.0, f64::max);

    let mut valid: fb::FixedBitSet = grid
        .inside()
        .ones()
        .filter(|&k| coverage[k] >= ratio * peak)
        .collect();
    valid.grow(grid.len());
    valid
}
