//! Utilities for loading meshes generated with [`gmsh`](https://www.gmsh.info/).
//!
//! Only version 4.1 of the MSH format is supported,
//! as per the [`mshio`] library.

use std::f64::consts::TAU;

use crate::{Mesh, MeshGenerationError, Vec2};

/// Error in loading a mesh from a Gmsh .msh file.
#[derive(thiserror::Error, Debug)]
pub enum GmshError {
    /// Error parsing the .msh file.
    ///
    /// (Implementation note: parser error converted to string
    /// to avoid lifetime issues with the byte slices it contains)
    #[error("Parsing the .msh data failed: {0}")]
    ParseError(String),
    /// The given .msh file contains no nodes.
    #[error("Invalid .msh data: no nodes")]
    MissingNodes,
    /// The given .msh file contains no elements of the supported type.
    #[error("Invalid .msh data: no elements of the correct type")]
    MissingElements,
    /// The mesh boundary doesn't have enough distinct nodes
    /// to place every electrode on its own node.
    #[error("Cannot place {electrodes} electrodes on {boundary_nodes} boundary nodes")]
    ElectrodePlacement {
        /// Number of electrodes requested.
        electrodes: usize,
        /// Number of nodes on the mesh boundary.
        boundary_nodes: usize,
    },
    /// The loaded triangles don't form a valid mesh.
    #[error(transparent)]
    InvalidMesh(#[from] MeshGenerationError),
}

/// Load a 2D triangle mesh from a `.msh` file
/// and place `electrode_count` electrodes on its boundary.
///
/// First-order triangle elements in the file are interpreted as the triangles of the mesh.
/// These must be of type `Tri3` (see [`ElementType`][mshio::ElementType]).
/// The `z` coordinate of vertices is dropped to project the mesh to 2D space.
///
/// Electrode `k` is placed on the boundary node whose angle
/// around the center of the mesh bounding box
/// is closest to `2πk / electrode_count`,
/// matching the electrode layout of [`Mesh::create`].
/// This works for star-shaped domains like thorax cross-sections;
/// use [`Mesh::new`] directly for anything more exotic.
///
/// ```
/// # use eitrs::gmsh::{load_trimesh_2d, GmshError};
/// # fn load() -> Result<(), GmshError> {
/// let msh_bytes = include_bytes!("gmsh/diamond.msh");
/// let mesh = load_trimesh_2d(msh_bytes, 4)?;
/// assert_eq!(mesh.electrode_count(), 4);
/// # Ok(())
/// # }
/// # load().expect("Failed to load mesh");
/// ```
pub fn load_trimesh_2d(bytes: &[u8], electrode_count: usize) -> Result<Mesh, GmshError> {
    if electrode_count < 4 {
        return Err(MeshGenerationError::TooFewElectrodes(electrode_count).into());
    }

    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| GmshError::ParseError(format!("{}", e)))?;
    let nodes = msh.data.nodes.ok_or(GmshError::MissingNodes)?;
    let elements = msh.data.elements.ok_or(GmshError::MissingElements)?;

    let vertices: Vec<Vec2> = nodes
        .node_blocks
        .iter()
        .flat_map(|block| block.nodes.iter())
        .map(|node| Vec2::new(node.x, node.y))
        .collect();
    if vertices.is_empty() {
        return Err(GmshError::MissingNodes);
    }

    let triangles: Vec<[usize; 3]> = elements
        .element_blocks
        .iter()
        .filter(|block| block.element_type == mshio::ElementType::Tri3)
        .flat_map(|block| block.elements.iter())
        .filter(|el| el.nodes.len() == 3)
        // gmsh tags start at 1, subtract 1 to get the index in the array.
        // (this assumes tags are sequential and in order!
        // empirically this seems to be true even in the presence of sparse ids,
        // as these only affect entities)
        .map(|el| [0, 1, 2].map(|i| el.nodes[i] as usize - 1))
        .collect();
    if triangles.is_empty() {
        return Err(GmshError::MissingElements);
    }

    let electrode_nodes = place_electrodes(&vertices, &triangles, electrode_count)?;
    let mesh = Mesh::new(vertices, triangles, electrode_nodes)?;
    log::debug!(
        "loaded gmsh mesh: {} nodes, {} elements",
        mesh.node_count(),
        mesh.element_count()
    );
    Ok(mesh)
}

/// Pick the boundary node closest in angle to each equally spaced electrode position.
fn place_electrodes(
    vertices: &[Vec2],
    triangles: &[[usize; 3]],
    electrode_count: usize,
) -> Result<Vec<usize>, GmshError> {
    let boundary: Vec<usize> = crate::mesh::boundary_nodes(triangles, vertices.len())
        .ones()
        .collect();
    let placement_error = GmshError::ElectrodePlacement {
        electrodes: electrode_count,
        boundary_nodes: boundary.len(),
    };
    if boundary.len() < electrode_count {
        return Err(placement_error);
    }

    let (min, max) = vertices.iter().fold(
        (Vec2::repeat(f64::INFINITY), Vec2::repeat(f64::NEG_INFINITY)),
        |(min, max), v| (min.inf(v), max.sup(v)),
    );
    let center = 0.5 * (min + max);
    let angles: Vec<f64> = boundary
        .iter()
        .map(|&i| {
            let rel = vertices[i] - center;
            rel.y.atan2(rel.x).rem_euclid(TAU)
        })
        .collect();
    let angle_dist = |a: f64, b: f64| {
        let d = (a - b).rem_euclid(TAU);
        d.min(TAU - d)
    };

    let spacing = TAU / electrode_count as f64;
    let mut electrodes: Vec<usize> = Vec::with_capacity(electrode_count);
    for k in 0..electrode_count {
        let target = k as f64 * spacing;
        let (closest, dist) = boundary
            .iter()
            .zip(&angles)
            .map(|(&node, &angle)| (node, angle_dist(angle, target)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or(GmshError::MissingNodes)?;
        if electrodes.contains(&closest) {
            return Err(placement_error);
        }
        if dist > 0.5 * spacing {
            log::warn!(
                "electrode {k} placed {:.1} degrees away from its nominal angle",
                dist.to_degrees()
            );
        }
        electrodes.push(closest);
    }

    Ok(electrodes)
}
