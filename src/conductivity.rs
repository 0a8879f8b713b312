//! Conductivity distributions, i.e. one value per mesh element.

use nalgebra as na;

use crate::{Mesh, Vec2};

/// A conductivity value for each element of a mesh.
///
/// Used both as the reference distribution forward models are linearized around
/// and as perturbed distributions for simulating measurements.
/// Construct these with [`uniform`][Self::uniform]
/// and modify them with [`with_circular_anomaly`][Self::with_circular_anomaly].
#[derive(Clone, Debug, PartialEq)]
pub struct ConductivityField {
    /// The underlying vector of values, indexed by element.
    ///
    /// Changing the length of this vector
    /// makes the field incompatible with its mesh,
    /// which forward solves report as an error.
    pub values: na::DVector<f64>,
}

impl ConductivityField {
    /// A homogeneous conductivity over the whole mesh.
    pub fn uniform(mesh: &Mesh, value: f64) -> Self {
        Self {
            values: na::DVector::from_element(mesh.element_count(), value),
        }
    }

    /// Set the conductivity of elements whose centroid lies inside a disk.
    ///
    /// ```
    /// # use eitrs::{ConductivityField, Mesh, Vec2};
    /// let mesh = Mesh::create(16, 0.1).unwrap();
    /// let sigma = ConductivityField::uniform(&mesh, 1.0)
    ///     .with_circular_anomaly(&mesh, Vec2::new(0.5, 0.0), 0.1, 10.0);
    /// assert!(sigma.values.iter().any(|&v| v == 10.0));
    /// ```
    pub fn with_circular_anomaly(
        mut self,
        mesh: &Mesh,
        center: Vec2,
        radius: f64,
        value: f64,
    ) -> Self {
        for (val, centroid) in self.values.iter_mut().zip(mesh.centroids()) {
            if (centroid - center).norm() < radius {
                *val = value;
            }
        }
        self
    }

    /// Number of elements the field covers.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the field is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Fraction of each element's area that lies inside a disk, estimated by sampling.
///
/// Each triangle is split into `SUBDIVISION²` congruent sub-triangles
/// and the fraction of sub-triangle centroids inside the disk is returned.
pub(crate) fn disk_coverage(mesh: &Mesh, center: Vec2, radius: f64) -> na::DVector<f64> {
    const SUBDIVISION: usize = 4;
    let sample_count = (SUBDIVISION * SUBDIVISION) as f64;
    let radius_sq = radius * radius;

    na::DVector::from_iterator(
        mesh.element_count(),
        (0..mesh.element_count()).map(|el| {
            let [p0, p1, p2] = mesh.element_vertices(el);
            // quick rejection for elements far away from the disk
            let reach = (p1 - p0).norm().max((p2 - p0).norm());
            if (p0 - center).norm() > radius + reach {
                return 0.0;
            }
            let (e1, e2) = ((p1 - p0) / SUBDIVISION as f64, (p2 - p0) / SUBDIVISION as f64);
            let mut inside = 0usize;
            for i in 0..SUBDIVISION {
                for j in 0..SUBDIVISION - i {
                    // upward sub-triangle at (i, j) and, where it exists, the downward one next to it
                    let up = p0 + (i as f64 + 1.0 / 3.0) * e1 + (j as f64 + 1.0 / 3.0) * e2;
                    inside += usize::from((up - center).norm_squared() < radius_sq);
                    if i + j + 1 < SUBDIVISION {
                        let down = p0 + (i as f64 + 2.0 / 3.0) * e1 + (j as f64 + 2.0 / 3.0) * e2;
                        inside += usize::from((down - center).norm_squared() < radius_sq);
                    }
                }
            }
            inside as f64 / sample_count
        }),
    )
}

// arithmetic between fields of the same mesh

impl std::ops::Sub for &ConductivityField {
    type Output = ConductivityField;

    fn sub(self, rhs: Self) -> Self::Output {
        ConductivityField {
            values: &self.values - &rhs.values,
        }
    }
}

impl std::ops::Add for &ConductivityField {
    type Output = ConductivityField;

    fn add(self, rhs: Self) -> Self::Output {
        ConductivityField {
            values: &self.values + &rhs.values,
        }
    }
}

impl std::ops::Mul<f64> for ConductivityField {
    type Output = ConductivityField;

    fn mul(mut self, rhs: f64) -> Self::Output {
        self.values *= rhs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn anomaly_only_changes_nearby_elements() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        let background = ConductivityField::uniform(&mesh, 1.0);
        let center = Vec2::new(-0.3, 0.4);
        let perturbed = background
            .clone()
            .with_circular_anomaly(&mesh, center, 0.2, 2.0);
        let diff = &perturbed - &background;

        let mut changed = 0;
        for (d, centroid) in diff.values.iter().zip(mesh.centroids()) {
            if *d != 0.0 {
                changed += 1;
                assert_relative_eq!(*d, 1.0);
                assert!((centroid - center).norm() < 0.2);
            }
        }
        // the disk covers about 4% of the unit disk
        let changed_ratio = changed as f64 / mesh.element_count() as f64;
        assert!(changed_ratio > 0.02 && changed_ratio < 0.06);
    }

    #[test]
    fn field_arithmetic() {
        let mesh = Mesh::create(8, 0.5).unwrap();
        let background = ConductivityField::uniform(&mesh, 1.0);
        let perturbed = background
            .clone()
            .with_circular_anomaly(&mesh, Vec2::zeros(), 0.3, 3.0);

        // a scaled difference added back onto the background interpolates between the two
        let halfway = &background + &((&perturbed - &background) * 0.5);
        assert_eq!(halfway.len(), mesh.element_count());
        for ((h, b), p) in halfway
            .values
            .iter()
            .zip(background.values.iter())
            .zip(perturbed.values.iter())
        {
            assert_relative_eq!(*h, 0.5 * (b + p));
        }
        assert!(halfway.values.iter().any(|&v| v == 2.0));

        let doubled = background * 2.0;
        assert!(doubled.values.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn coverage_approximates_disk_area() {
        let mesh = Mesh::create(16, 0.1).unwrap();
        let radius = 0.25;
        let coverage = disk_coverage(&mesh, Vec2::new(0.2, -0.1), radius);
        let covered_area: f64 = coverage
            .iter()
            .zip(mesh.areas())
            .map(|(c, a)| c * a)
            .sum();
        let disk_area = std::f64::consts::PI * radius * radius;
        assert_relative_eq!(covered_area, disk_area, max_relative = 0.1);
        assert!(coverage.iter().all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn sub_triangle_samples_are_inside_element() {
        // a disk containing the whole element covers it fully
        let mesh = Mesh::create(8, 0.5).unwrap();
        let coverage = disk_coverage(&mesh, Vec2::zeros(), 10.0);
        for c in coverage.iter() {
            assert_relative_eq!(*c, 1.0);
        }
    }
}
