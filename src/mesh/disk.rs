use std::f64::consts::TAU;

use super::MeshGenerationError;
use crate::Vec2;

/// Upper limit on the number of nodes a generated disk may have,
/// estimated as `π / target_edge_length²`.
const MAX_NODE_COUNT: f64 = 1e6;

/// Raw output of a mesh generator: nodes, triangles and electrode nodes.
pub(super) type RawMesh = (Vec<Vec2>, Vec<[usize; 3]>, Vec<usize>);

/// Generate a triangulation of the unit disk made of concentric rings of nodes.
///
/// Ring `i` of `rings` has radius `i / rings`
/// and roughly `2π r / target_edge_length` nodes,
/// so that edges along and across rings are both close to the target length.
/// The outermost ring gets a multiple of `electrode_count` nodes
/// with electrode `k` at the angle `2πk / electrode_count`.
/// The center point is node 0, followed by the rings from the inside out.
pub(super) fn generate_disk(
    electrode_count: usize,
    target_edge_length: f64,
) -> Result<RawMesh, MeshGenerationError> {
    if electrode_count < 4 {
        return Err(MeshGenerationError::TooFewElectrodes(electrode_count));
    }
    let h0 = target_edge_length;
    if !h0.is_finite() || h0 <= 0.0 || std::f64::consts::PI / (h0 * h0) > MAX_NODE_COUNT {
        return Err(MeshGenerationError::InvalidEdgeLength(h0));
    }
    let ring_count = (1.0 / h0).round() as usize;
    if ring_count == 0 {
        return Err(MeshGenerationError::InvalidEdgeLength(h0));
    }

    let mut rings: Vec<Ring> = Vec::with_capacity(ring_count);
    // node 0 is the center, ring nodes start after it
    let mut next_start = 1;
    for ring_idx in 1..=ring_count {
        let radius = ring_idx as f64 / ring_count as f64;
        let natural_count = ((TAU * radius / h0).round() as usize).max(6);
        let is_outer = ring_idx == ring_count;
        let node_count = if is_outer {
            // round up so that electrodes land exactly on nodes
            natural_count.max(electrode_count).div_ceil(electrode_count) * electrode_count
        } else {
            natural_count
        };
        // stagger every other ring by half a step, counting from the outside
        // so the outer ring starts exactly at angle 0
        let offset = if (ring_count - ring_idx) % 2 == 1 {
            0.5
        } else {
            0.0
        };
        rings.push(Ring {
            start: next_start,
            node_count,
            radius,
            offset,
        });
        next_start += node_count;
    }

    let mut nodes = Vec::with_capacity(next_start);
    nodes.push(Vec2::zeros());
    for ring in &rings {
        nodes.extend((0..ring.node_count).map(|j| {
            let angle = ring.angle(j);
            ring.radius * Vec2::new(angle.cos(), angle.sin())
        }));
    }

    let mut elements = Vec::new();
    // fan of triangles around the center
    let first = &rings[0];
    for j in 0..first.node_count {
        elements.push([0, first.node(j), first.node(j + 1)]);
    }
    // strips between consecutive rings
    for (inner, outer) in rings.iter().zip(rings.iter().skip(1)) {
        stitch_rings(inner, outer, &mut elements);
    }

    let outer = &rings[ring_count - 1];
    let electrode_spacing = outer.node_count / electrode_count;
    let electrode_nodes = (0..electrode_count)
        .map(|k| outer.node(k * electrode_spacing))
        .collect();

    Ok((nodes, elements, electrode_nodes))
}

/// A circle of equally spaced nodes.
#[derive(Clone, Copy, Debug)]
struct Ring {
    /// index of the first node of the ring
    start: usize,
    node_count: usize,
    radius: f64,
    /// angular offset in units of the node spacing
    offset: f64,
}

impl Ring {
    /// Angle of the `j`th node, increasing past 2π for `j >= node_count`.
    #[inline]
    fn angle(&self, j: usize) -> f64 {
        TAU * (j as f64 + self.offset) / self.node_count as f64
    }

    /// Mesh node index of the `j`th node, wrapping around the ring.
    #[inline]
    fn node(&self, j: usize) -> usize {
        self.start + j % self.node_count
    }
}

/// Triangulate the annulus between two rings
/// by walking around both in order of increasing angle,
/// always advancing on the ring whose next node comes first.
///
/// Produces `inner.node_count + outer.node_count` counterclockwise triangles.
fn stitch_rings(inner: &Ring, outer: &Ring, elements: &mut Vec<[usize; 3]>) {
    let (mut i, mut o) = (0, 0);
    while i < inner.node_count || o < outer.node_count {
        let advance_inner = o == outer.node_count
            || (i < inner.node_count && inner.angle(i + 1) <= outer.angle(o + 1));
        if advance_inner {
            elements.push([inner.node(i), outer.node(o), inner.node(i + 1)]);
            i += 1;
        } else {
            elements.push([inner.node(i), outer.node(o), outer.node(o + 1)]);
            o += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_matches_ring_structure() {
        let (nodes, elements, electrodes) = generate_disk(16, 0.1).unwrap();
        // ten rings; every node except the center contributes
        // one triangle to the strip inside it and one to the strip outside it,
        // except the outer ring which only has a strip inside
        let outer_count = 64;
        let ring_node_total = nodes.len() - 1;
        assert_eq!(elements.len(), 2 * ring_node_total - outer_count);
        assert_eq!(electrodes.len(), 16);
        assert_eq!(electrodes[1] - electrodes[0], outer_count / 16);
    }

    #[test]
    fn single_ring_is_a_fan() {
        let (nodes, elements, electrodes) = generate_disk(4, 1.5).unwrap();
        // round(2π / 1.5) = 4 nodes, raised to the minimum of 6
        // and then up to a multiple of 4
        assert_eq!(nodes.len(), 1 + 8);
        assert_eq!(elements.len(), 8);
        assert!(elements.iter().all(|el| el[0] == 0));
        assert_eq!(electrodes, vec![1, 3, 5, 7]);
    }
}
