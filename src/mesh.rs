//! The triangular finite element mesh of the imaged domain
//! and the electrode sites on its boundary.

/// Low-level mesh construction from raw data and corresponding tests.
mod mesh_construction;
/// Concentric-ring mesh generator for the unit disk.
mod disk;

pub(crate) use mesh_construction::boundary_nodes;

use fixedbitset as fb;
use nalgebra as na;

use crate::Vec2;

/// Error in constructing or generating a mesh.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MeshGenerationError {
    /// At least four electrodes are needed for a meaningful measurement frame.
    #[error("At least 4 electrodes are required, got {0}")]
    TooFewElectrodes(usize),
    /// The target edge length is not a positive finite number,
    /// is too large to produce a single ring of elements,
    /// or is so small that the mesh would exceed a million nodes.
    #[error("Target edge length {0} does not produce a usable mesh")]
    InvalidEdgeLength(f64),
    /// The mesh has no nodes or no elements.
    #[error("Mesh has no {0}")]
    Empty(&'static str),
    /// An element refers to a node that doesn't exist.
    #[error("Element {element} refers to nonexistent node {node}")]
    InvalidNodeIndex {
        /// Index of the offending element.
        element: usize,
        /// The out-of-range node index.
        node: usize,
    },
    /// An element has (near) zero area.
    #[error("Element {0} is degenerate")]
    DegenerateElement(usize),
    /// A node isn't part of any element.
    #[error("Node {0} is not connected to any element")]
    IsolatedNode(usize),
    /// An electrode index is out of range, duplicated,
    /// or doesn't lie on the mesh boundary.
    #[error("Invalid electrode node {node} for electrode {electrode}")]
    InvalidElectrode {
        /// Index of the electrode in the electrode list.
        electrode: usize,
        /// The node the electrode was assigned to.
        node: usize,
    },
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    /// The minimum (bottom left) corner of the box.
    pub min: Vec2,
    /// The maximum (top right) corner of the box.
    pub max: Vec2,
}

impl BoundingBox {
    /// Get the center point of the box.
    #[inline]
    pub fn center(&self) -> Vec2 {
        0.5 * (self.min + self.max)
    }

    /// Get the width and height of the box.
    #[inline]
    pub fn extents(&self) -> Vec2 {
        self.max - self.min
    }
}

/// A 2D mesh of linear triangles with point electrodes on boundary nodes.
///
/// Meshes are immutable after construction;
/// a different geometry is always a new `Mesh`.
/// All derived geometric data is computed once when the mesh is built.
#[derive(Clone, Debug)]
pub struct Mesh {
    nodes: Vec<Vec2>,
    /// node indices of each triangle in counterclockwise order
    elements: Vec<[usize; 3]>,
    electrode_nodes: Vec<usize>,
    areas: Vec<f64>,
    centroids: Vec<Vec2>,
    boundary: fb::FixedBitSet,
    /// node whose potential is fixed to zero in forward solves
    ref_node: usize,
    bounds: BoundingBox,
}

impl Mesh {
    /// Generate a mesh of the unit disk with `electrode_count` electrodes
    /// spaced at equal angles on its boundary.
    ///
    /// Electrode `k` is located at the angle `2πk / electrode_count`
    /// measured counterclockwise from the positive x axis.
    /// `target_edge_length` is the approximate length of element edges;
    /// the mesh consists of `round(1 / target_edge_length)` rings of elements.
    /// Edge lengths giving more than about a million nodes are rejected.
    ///
    /// ```
    /// # use eitrs::Mesh;
    /// let mesh = Mesh::create(16, 0.1).expect("valid parameters");
    /// assert_eq!(mesh.electrode_nodes().len(), 16);
    /// ```
    pub fn create(
        electrode_count: usize,
        target_edge_length: f64,
    ) -> Result<Self, MeshGenerationError> {
        let (nodes, elements, electrode_nodes) =
            disk::generate_disk(electrode_count, target_edge_length)?;
        let mesh = Self::new(nodes, elements, electrode_nodes)?;
        log::debug!(
            "generated disk mesh: {} nodes, {} elements, {} electrodes",
            mesh.node_count(),
            mesh.element_count(),
            mesh.electrode_count()
        );
        Ok(mesh)
    }

    /// Construct a mesh from raw nodes, triangles and electrode node indices.
    ///
    /// Triangles may be given in either winding;
    /// they are reordered to counterclockwise.
    /// Every node must belong to at least one triangle,
    /// and every electrode must be a distinct node on the mesh boundary.
    #[inline]
    pub fn new(
        nodes: Vec<Vec2>,
        elements: Vec<[usize; 3]>,
        electrode_nodes: Vec<usize>,
    ) -> Result<Self, MeshGenerationError> {
        mesh_construction::build_mesh(nodes, elements, electrode_nodes)
    }

    /// Get a slice of all nodes in the mesh.
    #[inline]
    pub fn nodes(&self) -> &[Vec2] {
        &self.nodes
    }

    /// Get the node indices of every triangle, in counterclockwise order.
    #[inline]
    pub fn elements(&self) -> &[[usize; 3]] {
        &self.elements
    }

    /// Get the node index of each electrode, ordered by electrode number.
    #[inline]
    pub fn electrode_nodes(&self) -> &[usize] {
        &self.electrode_nodes
    }

    /// Get the number of nodes in the mesh.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the number of triangles in the mesh.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Get the number of electrodes on the mesh.
    #[inline]
    pub fn electrode_count(&self) -> usize {
        self.electrode_nodes.len()
    }

    /// Get the area of every triangle.
    #[inline]
    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    /// Get the centroid (barycenter) of every triangle.
    #[inline]
    pub fn centroids(&self) -> &[Vec2] {
        &self.centroids
    }

    /// Get the set of nodes on the mesh boundary.
    ///
    /// Iterate over the indices with `boundary_nodes().ones()`.
    #[inline]
    pub fn boundary_nodes(&self) -> &fb::FixedBitSet {
        &self.boundary
    }

    /// Get the node used as the zero potential reference in forward solves.
    /// This is never an electrode node.
    #[inline]
    pub fn ref_node(&self) -> usize {
        self.ref_node
    }

    /// Get a bounding box enclosing the entire mesh.
    #[inline]
    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// Get the corner positions of a triangle.
    #[inline]
    pub fn element_vertices(&self, element: usize) -> [Vec2; 3] {
        self.elements[element].map(|i| self.nodes[i])
    }

    /// Compute the gradients of the three linear basis functions of a triangle,
    /// in the same order as the triangle's node indices.
    ///
    /// The gradients are constant over the triangle.
    pub fn basis_gradients(&self, element: usize) -> [Vec2; 3] {
        let [p0, p1, p2] = self.element_vertices(element);
        let double_area = 2.0 * self.areas[element];
        // gradient of the basis function of vertex i is
        // the opposite edge rotated by 90 degrees, scaled by 1 / 2A
        [p1 - p2, p2 - p0, p0 - p1].map(|edge| Vec2::new(edge.y, -edge.x) / double_area)
    }

    /// Find the triangle containing the given point, if any.
    ///
    /// Points on shared edges resolve to the lowest-indexed triangle.
    pub fn locate_point(&self, point: Vec2) -> Option<usize> {
        if point.x < self.bounds.min.x
            || point.x > self.bounds.max.x
            || point.y < self.bounds.min.y
            || point.y > self.bounds.max.y
        {
            return None;
        }
        (0..self.elements.len()).find(|&el| {
            let bary = self.barycentric_coords(el, point);
            bary.iter().all(|&b| b >= -INSIDE_TOLERANCE)
        })
    }

    /// Check whether a point lies inside the meshed domain.
    #[inline]
    pub fn contains_point(&self, point: Vec2) -> bool {
        self.locate_point(point).is_some()
    }

    fn barycentric_coords(&self, element: usize, point: Vec2) -> na::Vector3<f64> {
        let [p0, p1, p2] = self.element_vertices(element);
        let double_area = 2.0 * self.areas[element];
        let cross = |a: Vec2, b: Vec2, c: Vec2| (b - a).perp(&(c - a));
        na::Vector3::new(
            cross(point, p1, p2) / double_area,
            cross(p0, point, p2) / double_area,
            cross(p0, p1, point) / double_area,
        )
    }
}

/// Barycentric coordinate slack for points on element edges.
const INSIDE_TOLERANCE: f64 = 1e-10;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn electrodes_are_distinct_boundary_nodes() {
        for electrode_count in [4, 5, 8, 16, 32] {
            let mesh = Mesh::create(electrode_count, 0.15).expect("mesh generation failed");
            let electrodes = mesh.electrode_nodes();
            assert_eq!(electrodes.len(), electrode_count);

            let unique: fb::FixedBitSet = electrodes.iter().cloned().collect();
            assert_eq!(unique.count_ones(..), electrode_count, "duplicate electrodes");
            for &el in electrodes {
                assert!(el < mesh.node_count());
                assert!(mesh.boundary_nodes().contains(el));
            }
        }
    }

    #[test]
    fn electrodes_are_at_equal_angles() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        for (k, &node) in mesh.electrode_nodes().iter().enumerate() {
            let angle = 2.0 * std::f64::consts::PI * k as f64 / 16.0;
            let pos = mesh.nodes()[node];
            assert_relative_eq!(pos.x, angle.cos(), epsilon = 1e-12);
            assert_relative_eq!(pos.y, angle.sin(), epsilon = 1e-12);
        }
    }

    #[test]
    fn disk_is_covered_by_elements() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        // the polygonal disk area approaches pi from below
        let total_area: f64 = mesh.areas().iter().sum();
        assert!(total_area < std::f64::consts::PI);
        assert!(total_area > 0.98 * std::f64::consts::PI);
        // roughly uniform element size
        let mean_area = total_area / mesh.element_count() as f64;
        for &area in mesh.areas() {
            assert!(area > 0.2 * mean_area && area < 5.0 * mean_area);
        }
        assert!(mesh.contains_point(Vec2::new(0.0, 0.0)));
        assert!(mesh.contains_point(Vec2::new(0.7, -0.5)));
        assert!(!mesh.contains_point(Vec2::new(0.9, 0.9)));
    }

    #[test]
    fn elements_are_counterclockwise() {
        let mesh = Mesh::create(8, 0.25).unwrap();
        for el in 0..mesh.element_count() {
            let [p0, p1, p2] = mesh.element_vertices(el);
            assert!((p1 - p0).perp(&(p2 - p0)) > 0.0);
        }
    }

    #[test]
    fn ref_node_is_not_an_electrode() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        assert!(!mesh.electrode_nodes().contains(&mesh.ref_node()));
        assert_relative_eq!(mesh.nodes()[mesh.ref_node()].norm(), 0.0);
    }

    #[test]
    fn basis_gradients_sum_to_zero() {
        let mesh = Mesh::create(8, 0.3).unwrap();
        for el in 0..mesh.element_count() {
            let grads = mesh.basis_gradients(el);
            let sum = grads[0] + grads[1] + grads[2];
            assert_relative_eq!(sum.norm(), 0.0, epsilon = 1e-9);
            // each basis function is 1 at its own vertex and 0 at the others
            let verts = mesh.element_vertices(el);
            for (i, grad) in grads.iter().enumerate() {
                let j = (i + 1) % 3;
                assert_relative_eq!(grad.dot(&(verts[i] - verts[j])), 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert_eq!(
            Mesh::create(3, 0.1).unwrap_err(),
            MeshGenerationError::TooFewElectrodes(3)
        );
        // too large for a single ring, or too small for a mesh of reasonable size
        for h0 in [0.0, -0.1, f64::NAN, f64::INFINITY, 5.0, 1e-300, 1e-4] {
            assert!(matches!(
                Mesh::create(16, h0),
                Err(MeshGenerationError::InvalidEdgeLength(_))
            ));
        }
    }
}
