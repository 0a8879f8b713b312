use fixedbitset as fb;
use itertools::Itertools;

use super::{BoundingBox, Mesh, MeshGenerationError};
use crate::Vec2;

/// Elements with an area below this fraction of the mean area are rejected as degenerate.
const DEGENERATE_AREA_RATIO: f64 = 1e-10;

/// Construct a mesh from raw nodes, triangles and electrode nodes,
/// validating the input and computing derived geometry.
pub(super) fn build_mesh(
    nodes: Vec<Vec2>,
    mut elements: Vec<[usize; 3]>,
    electrode_nodes: Vec<usize>,
) -> Result<Mesh, MeshGenerationError> {
    if nodes.is_empty() {
        return Err(MeshGenerationError::Empty("nodes"));
    }
    if elements.is_empty() {
        return Err(MeshGenerationError::Empty("elements"));
    }

    for (el_idx, el) in elements.iter().enumerate() {
        if let Some(&node) = el.iter().find(|&&n| n >= nodes.len()) {
            return Err(MeshGenerationError::InvalidNodeIndex {
                element: el_idx,
                node,
            });
        }
    }

    // every node must be attached to some element,
    // otherwise the stiffness matrix has an empty row
    let mut used: fb::FixedBitSet = fb::FixedBitSet::with_capacity(nodes.len());
    for el in &elements {
        used.extend(el.iter().cloned());
    }
    if let Some(isolated) = (0..nodes.len()).find(|&i| !used.contains(i)) {
        return Err(MeshGenerationError::IsolatedNode(isolated));
    }

    //
    // orientation and areas
    //

    let mut areas = Vec::with_capacity(elements.len());
    for el in &mut elements {
        let [p0, p1, p2] = el.map(|i| nodes[i]);
        let signed_area = 0.5 * (p1 - p0).perp(&(p2 - p0));
        if signed_area < 0.0 {
            el.swap(1, 2);
        }
        areas.push(signed_area.abs());
    }
    let mean_area = areas.iter().sum::<f64>() / areas.len() as f64;
    if let Some((degenerate, _)) = areas
        .iter()
        .find_position(|&&a| !(a > DEGENERATE_AREA_RATIO * mean_area))
    {
        return Err(MeshGenerationError::DegenerateElement(degenerate));
    }

    let centroids: Vec<Vec2> = elements
        .iter()
        .map(|el| el.iter().fold(Vec2::zeros(), |acc, &i| acc + nodes[i]) / 3.0)
        .collect();

    //
    // boundary and electrodes
    //

    let boundary = boundary_nodes(&elements, nodes.len());

    let mut seen_electrodes = fb::FixedBitSet::with_capacity(nodes.len());
    for (electrode, &node) in electrode_nodes.iter().enumerate() {
        if node >= nodes.len() || !boundary.contains(node) || seen_electrodes.put(node) {
            return Err(MeshGenerationError::InvalidElectrode { electrode, node });
        }
    }

    let bounds = BoundingBox {
        min: nodes
            .iter()
            .fold(Vec2::repeat(f64::INFINITY), |acc, n| acc.inf(n)),
        max: nodes
            .iter()
            .fold(Vec2::repeat(f64::NEG_INFINITY), |acc, n| acc.sup(n)),
    };

    // ground the potential at the non-electrode node closest to the middle of the domain
    let center = bounds.center();
    let ref_node = (0..nodes.len())
        .filter(|&i| !seen_electrodes.contains(i))
        .min_by(|&a, &b| {
            let da = (nodes[a] - center).norm_squared();
            let db = (nodes[b] - center).norm_squared();
            da.total_cmp(&db)
        })
        .ok_or(MeshGenerationError::Empty("non-electrode nodes"))?;

    Ok(Mesh {
        nodes,
        elements,
        electrode_nodes,
        areas,
        centroids,
        boundary,
        ref_node,
        bounds,
    })
}

/// Identify the nodes on the boundary of a triangle mesh.
///
/// An edge that belongs to only one triangle is on the boundary,
/// and so are both of its end points.
pub(crate) fn boundary_nodes(elements: &[[usize; 3]], node_count: usize) -> fb::FixedBitSet {
    let mut boundary = fb::FixedBitSet::with_capacity(node_count);

    // sort the edges lexicographically by vertex indices
    // so that shared edges end up next to each other
    let edges = elements
        .iter()
        .flat_map(|el| [(el[0], el[1]), (el[1], el[2]), (el[2], el[0])])
        .map(|(a, b)| if a < b { (a, b) } else { (b, a) })
        .sorted_unstable();

    for (count, (a, b)) in edges.dedup_with_count() {
        if count == 1 {
            boundary.insert(a);
            boundary.insert(b);
        }
    }

    boundary
}
