//! Finite element forward model of the conductivity equation
//! and the sensitivity (Jacobian) matrix of a measurement protocol.
//!
//! Potentials are approximated with linear basis functions on the mesh triangles.
//! Electrodes are modeled as points at mesh nodes,
//! and the potential is fixed to zero at the mesh's [reference node][Mesh::ref_node].
//! Since current injected into the domain always also leaves it,
//! the choice of reference doesn't affect any potential differences.
//!
//! Every protocol measurement is a linear combination of four
//! unit-current responses, one per electrode.
//! These are solved from a single factorization of the stiffness matrix,
//! after which voltages and sensitivities for any protocol
//! are cheap combinations of them.

use itertools::iproduct;
use nalgebra as na;
use nalgebra_sparse as nas;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{ConductivityField, Mesh, Protocol, Vec2};

/// Boundary voltages for one frame, one value per protocol entry.
pub type VoltageVector = na::DVector<f64>;

/// Complex boundary voltages for one frame, one value per protocol entry,
/// as produced by devices that report both in-phase and quadrature components.
pub type ComplexVoltageVector = na::DVector<na::Complex<f64>>;

/// Sensitivity of each protocol measurement (rows)
/// to the conductivity of each mesh element (columns).
pub type JacobianMatrix = na::DMatrix<f64>;

/// Error in solving the forward problem.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ForwardError {
    /// The protocol uses a different number of electrodes than the mesh has.
    #[error("Protocol is for {protocol} electrodes but the mesh has {mesh}")]
    ElectrodeCountMismatch {
        /// Electrodes on the mesh.
        mesh: usize,
        /// Electrodes in the protocol.
        protocol: usize,
    },
    /// The conductivity field has the wrong number of values.
    #[error("Conductivity has {actual} values but the mesh has {expected} elements")]
    ConductivityLength {
        /// Number of mesh elements.
        expected: usize,
        /// Number of values given.
        actual: usize,
    },
    /// A conductivity value is zero, negative or not finite,
    /// which makes the stiffness matrix singular or indefinite.
    #[error("Singular system: conductivity of element {element} is {value}")]
    NonPositiveConductivity {
        /// Index of the offending element.
        element: usize,
        /// Its conductivity.
        value: f64,
    },
    /// Factorizing the stiffness matrix failed.
    #[error("Singular system: stiffness matrix is not positive definite")]
    SingularSystem,
}

impl ForwardError {
    /// Whether the error means the linear system could not be solved.
    pub fn is_singular(&self) -> bool {
        matches!(
            self,
            Self::NonPositiveConductivity { .. } | Self::SingularSystem
        )
    }
}

/// Forward model of a measurement protocol on a mesh.
///
/// ```
/// # use eitrs::{ConductivityField, ExclusionPolicy, ForwardModel, Mesh, Protocol};
/// let mesh = Mesh::create(16, 0.2).unwrap();
/// let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
/// let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
/// let sigma = ConductivityField::uniform(&mesh, 1.0);
/// let (jac, v0) = fwd.build_jacobian(&sigma).unwrap();
/// assert_eq!(jac.shape(), (protocol.len(), mesh.element_count()));
/// assert_eq!(v0.len(), protocol.len());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ForwardModel<'a> {
    mesh: &'a Mesh,
    protocol: &'a Protocol,
}

impl<'a> ForwardModel<'a> {
    /// Create a forward model, checking that the protocol fits the mesh.
    pub fn new(mesh: &'a Mesh, protocol: &'a Protocol) -> Result<Self, ForwardError> {
        if mesh.electrode_count() != protocol.electrode_count() {
            return Err(ForwardError::ElectrodeCountMismatch {
                mesh: mesh.electrode_count(),
                protocol: protocol.electrode_count(),
            });
        }
        Ok(Self { mesh, protocol })
    }

    /// The mesh this model solves on.
    #[inline]
    pub fn mesh(&self) -> &'a Mesh {
        self.mesh
    }

    /// The protocol this model simulates.
    #[inline]
    pub fn protocol(&self) -> &'a Protocol {
        self.protocol
    }

    /// Compute the Jacobian of the protocol's measurements
    /// with respect to element conductivities at `reference`,
    /// along with the simulated voltages at `reference`.
    ///
    /// Entry `(i, e)` is the derivative of measurement `i`
    /// with respect to the conductivity of element `e`,
    /// computed with the adjoint method as
    /// `-area(e) ∇u_exc · ∇u_meas`,
    /// where `u_exc` is the potential of measurement `i`'s excitation
    /// and `u_meas` the potential that would result from
    /// driving unit current through its sense electrodes.
    pub fn build_jacobian(
        &self,
        reference: &ConductivityField,
    ) -> Result<(JacobianMatrix, VoltageVector), ForwardError> {
        let fields = self.electrode_fields(reference)?;
        let voltages = self.measure(&fields);

        let column = |el: usize| self.jacobian_column(el, &fields);
        #[cfg(feature = "parallel")]
        let columns: Vec<na::DVector<f64>> =
            (0..self.mesh.element_count()).into_par_iter().map(column).collect();
        #[cfg(not(feature = "parallel"))]
        let columns: Vec<na::DVector<f64>> = (0..self.mesh.element_count()).map(column).collect();

        log::debug!(
            "computed {}x{} jacobian",
            self.protocol.len(),
            columns.len()
        );
        Ok((na::DMatrix::from_columns(&columns), voltages))
    }

    /// Simulate the protocol's boundary voltages for a conductivity distribution.
    pub fn simulate(&self, conductivity: &ConductivityField) -> Result<VoltageVector, ForwardError> {
        let fields = self.electrode_fields(conductivity)?;
        Ok(self.measure(&fields))
    }

    /// Solve the nodal potentials of every excitation in the protocol.
    ///
    /// Column `k` of the result is the potential field
    /// of [`excitations()[k]`][Protocol::excitations]
    /// driven with unit current.
    pub fn excitation_potentials(
        &self,
        conductivity: &ConductivityField,
    ) -> Result<na::DMatrix<f64>, ForwardError> {
        let fields = self.electrode_fields(conductivity)?;
        let excitations = self.protocol.excitations();
        let mut potentials = na::DMatrix::zeros(self.mesh.node_count(), excitations.len());
        for (mut col, &(a, b)) in potentials.column_iter_mut().zip(excitations) {
            col.copy_from(&(fields.column(a) - fields.column(b)));
        }
        Ok(potentials)
    }

    /// Solve the potential field of unit current injected at each electrode
    /// and drawn out of the reference node.
    ///
    /// Column `k` of the result corresponds to electrode `k`.
    fn electrode_fields(
        &self,
        conductivity: &ConductivityField,
    ) -> Result<na::DMatrix<f64>, ForwardError> {
        let stiffness = self.assemble_stiffness(conductivity)?;
        // factorize once, reuse for every electrode
        let factor = nas::factorization::CscCholesky::factor(&stiffness)
            .map_err(|_| ForwardError::SingularSystem)?;

        let mut rhs = na::DMatrix::zeros(self.mesh.node_count(), self.mesh.electrode_count());
        for (electrode, &node) in self.mesh.electrode_nodes().iter().enumerate() {
            rhs[(node, electrode)] = 1.0;
        }
        Ok(factor.solve(&rhs))
    }

    /// Assemble the global stiffness matrix for a conductivity distribution,
    /// with the reference node's row and column replaced by the identity
    /// to ground the potential there.
    fn assemble_stiffness(
        &self,
        conductivity: &ConductivityField,
    ) -> Result<nas::CscMatrix<f64>, ForwardError> {
        let mesh = self.mesh;
        if conductivity.len() != mesh.element_count() {
            return Err(ForwardError::ConductivityLength {
                expected: mesh.element_count(),
                actual: conductivity.len(),
            });
        }
        if let Some((element, &value)) = conductivity
            .values
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v > 0.0))
        {
            return Err(ForwardError::NonPositiveConductivity { element, value });
        }

        let ref_node = mesh.ref_node();
        let n = mesh.node_count();
        let mut coo = nas::CooMatrix::new(n, n);
        for (el, (nodes, (&area, &sigma))) in mesh
            .elements()
            .iter()
            .zip(mesh.areas().iter().zip(conductivity.values.iter()))
            .enumerate()
        {
            let grads = mesh.basis_gradients(el);
            for (i, j) in iproduct!(0..3, 0..3) {
                let (row, col) = (nodes[i], nodes[j]);
                if row == ref_node || col == ref_node {
                    continue;
                }
                coo.push(row, col, sigma * area * grads[i].dot(&grads[j]));
            }
        }
        coo.push(ref_node, ref_node, 1.0);

        // duplicate entries are summed in the conversion
        Ok(nas::CscMatrix::from(&coo))
    }

    /// Combine electrode fields into the protocol's voltage measurements.
    fn measure(&self, fields: &na::DMatrix<f64>) -> VoltageVector {
        let el_nodes = self.mesh.electrode_nodes();
        // potential at electrode node `p` due to unit current at electrode `a`
        let transfer = |p: usize, a: usize| fields[(el_nodes[p], a)];
        VoltageVector::from_iterator(
            self.protocol.len(),
            self.protocol.entries().iter().map(|e| {
                transfer(e.sense_pos, e.src_pos) - transfer(e.sense_pos, e.src_neg)
                    - transfer(e.sense_neg, e.src_pos)
                    + transfer(e.sense_neg, e.src_neg)
            }),
        )
    }

    /// Sensitivities of every measurement to the conductivity of one element.
    fn jacobian_column(&self, el: usize, fields: &na::DMatrix<f64>) -> na::DVector<f64> {
        let nodes = self.mesh.elements()[el];
        let grads = self.mesh.basis_gradients(el);
        let area = self.mesh.areas()[el];

        // gradient of each electrode field over this element (constant on linear elements)
        let field_grads: Vec<Vec2> = (0..self.mesh.electrode_count())
            .map(|k| {
                grads
                    .iter()
                    .zip(nodes)
                    .fold(Vec2::zeros(), |acc, (g, node)| acc + g * fields[(node, k)])
            })
            .collect();

        na::DVector::from_iterator(
            self.protocol.len(),
            self.protocol.entries().iter().map(|e| {
                let exc = field_grads[e.src_pos] - field_grads[e.src_neg];
                let meas = field_grads[e.sense_pos] - field_grads[e.sense_neg];
                -area * exc.dot(&meas)
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExclusionPolicy;
    use approx::assert_relative_eq;

    fn setup(electrodes: usize, h0: f64) -> (Mesh, Protocol) {
        let mesh = Mesh::create(electrodes, h0).unwrap();
        let protocol =
            Protocol::create(electrodes, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        (mesh, protocol)
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let (mesh, protocol) = setup(8, 0.2);
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
        let sigma = ConductivityField::uniform(&mesh, 1.0);
        let (jac, v0) = fwd.build_jacobian(&sigma).unwrap();

        let step = 1e-6;
        for el in [0, mesh.element_count() / 2, mesh.element_count() - 1] {
            let mut perturbed = sigma.clone();
            perturbed.values[el] += step;
            let v1 = fwd.simulate(&perturbed).unwrap();
            let fd = (v1 - &v0) / step;
            for (analytic, numeric) in jac.column(el).iter().zip(fd.iter()) {
                assert_relative_eq!(*analytic, *numeric, epsilon = 1e-5, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn voltages_scale_inversely_with_conductivity() {
        let (mesh, protocol) = setup(16, 0.15);
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
        let v1 = fwd.simulate(&ConductivityField::uniform(&mesh, 1.0)).unwrap();
        let v2 = fwd.simulate(&ConductivityField::uniform(&mesh, 2.0)).unwrap();
        assert_relative_eq!(v1, 2.0 * v2, epsilon = 1e-10);
    }

    #[test]
    fn homogeneous_disk_voltage_profile() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        let protocol = Protocol::create(16, 1, 1, ExclusionPolicy::None).unwrap();
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
        let v = fwd.simulate(&ConductivityField::uniform(&mesh, 1.0)).unwrap();

        for exc in 0..16 {
            let frame = v.rows(exc * 16, 16);
            // adjacent differences around the whole ring telescope to zero
            assert_relative_eq!(frame.sum(), 0.0, epsilon = 1e-10);
            // the drive pair itself sees the largest voltage
            assert_eq!(frame.iamax(), 0);
        }

        // the pair opposite the drive sees the smallest voltage
        let first_frame = v.rows(0, 16);
        let smallest = first_frame.iamin();
        assert!((7..=9).contains(&smallest), "smallest at {smallest}");
    }

    #[test]
    fn reciprocity() {
        let mesh = Mesh::create(8, 0.2).unwrap();
        let protocol = Protocol::create(8, 2, 3, ExclusionPolicy::None).unwrap();
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
        let sigma = ConductivityField::uniform(&mesh, 1.0)
            .with_circular_anomaly(&mesh, Vec2::new(0.3, 0.3), 0.3, 5.0);
        let fields = fwd.electrode_fields(&sigma).unwrap();
        let el_nodes = mesh.electrode_nodes();
        for (a, b) in iproduct!(0..8, 0..8) {
            assert_relative_eq!(
                fields[(el_nodes[a], b)],
                fields[(el_nodes[b], a)],
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn excitation_potentials_match_measurements() {
        let (mesh, protocol) = setup(8, 0.25);
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();
        let sigma = ConductivityField::uniform(&mesh, 1.0);
        let potentials = fwd.excitation_potentials(&sigma).unwrap();
        let v = fwd.simulate(&sigma).unwrap();
        assert_eq!(potentials.ncols(), protocol.excitations().len());
        for (i, (entry, &exc)) in protocol
            .entries()
            .iter()
            .zip(protocol.excitation_of_entry())
            .enumerate()
        {
            let pos = potentials[(mesh.electrode_nodes()[entry.sense_pos], exc)];
            let neg = potentials[(mesh.electrode_nodes()[entry.sense_neg], exc)];
            assert_relative_eq!(pos - neg, v[i], epsilon = 1e-12);
        }
        // grounded at the reference node
        for exc in 0..potentials.ncols() {
            assert!(potentials[(mesh.ref_node(), exc)].abs() < 1e-14);
        }
    }

    #[test]
    fn invalid_inputs() {
        let (mesh, protocol) = setup(16, 0.2);
        let fwd = ForwardModel::new(&mesh, &protocol).unwrap();

        let mut sigma = ConductivityField::uniform(&mesh, 1.0);
        sigma.values[3] = 0.0;
        let err = fwd.build_jacobian(&sigma).unwrap_err();
        assert_eq!(
            err,
            ForwardError::NonPositiveConductivity {
                element: 3,
                value: 0.0
            }
        );
        assert!(err.is_singular());

        sigma.values[3] = -1.0;
        assert!(fwd.simulate(&sigma).unwrap_err().is_singular());

        let short = ConductivityField {
            values: na::DVector::from_element(5, 1.0),
        };
        assert!(matches!(
            fwd.simulate(&short),
            Err(ForwardError::ConductivityLength { actual: 5, .. })
        ));

        let wrong_protocol = Protocol::create(8, 1, 1, ExclusionPolicy::ExcludeAdjacent).unwrap();
        assert_eq!(
            ForwardModel::new(&mesh, &wrong_protocol).unwrap_err(),
            ForwardError::ElectrodeCountMismatch {
                mesh: 16,
                protocol: 8
            }
        );
    }
}
