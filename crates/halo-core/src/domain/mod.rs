pub mod errors;

pub use errors::{FinderResult, HaloError, HaloErrorCategory, HaloResult, PipelineResult};

use crate::common::constants::RHO_CRIT_G_CM3_H2;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Field address inside a dataset, `(field_type, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub field_type: String,
    pub name: String,
}

impl FieldKey {
    pub fn new(field_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            field_type: field_type.into(),
            name: name.into(),
        }
    }
}

impl Display for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "('{}', '{}')", self.field_type, self.name)
    }
}

/// Simulation domain in code-length units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainGeometry {
    pub left_edge: [f64; 3],
    pub right_edge: [f64; 3],
    #[serde(default = "all_periodic")]
    pub periodicity: [bool; 3],
}

fn all_periodic() -> [bool; 3] {
    [true; 3]
}

impl DomainGeometry {
    pub fn new(left_edge: [f64; 3], right_edge: [f64; 3]) -> Self {
        Self {
            left_edge,
            right_edge,
            periodicity: all_periodic(),
        }
    }

    pub fn unit_box() -> Self {
        Self::new([0.0; 3], [1.0; 3])
    }

    pub fn width(&self) -> [f64; 3] {
        std::array::from_fn(|axis| self.right_edge[axis] - self.left_edge[axis])
    }

    /// Length of one `unitary`: the widest domain axis.
    pub fn max_width(&self) -> f64 {
        self.width().into_iter().fold(0.0, f64::max)
    }

    pub fn center(&self) -> [f64; 3] {
        std::array::from_fn(|axis| 0.5 * (self.right_edge[axis] + self.left_edge[axis]))
    }

    /// Wraps a point back into `[left_edge, right_edge)` along periodic axes.
    pub fn wrap(&self, point: [f64; 3]) -> [f64; 3] {
        let width = self.width();
        std::array::from_fn(|axis| {
            if !self.periodicity[axis] || width[axis] <= 0.0 {
                return point[axis];
            }
            let shifted = (point[axis] - self.left_edge[axis]).rem_euclid(width[axis]);
            shifted + self.left_edge[axis]
        })
    }

    /// Minimum-image separation along each axis.
    pub fn separation(&self, a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        let width = self.width();
        std::array::from_fn(|axis| {
            let delta = (a[axis] - b[axis]).abs();
            if self.periodicity[axis] {
                delta.min(width[axis] - delta)
            } else {
                delta
            }
        })
    }

    pub fn periodic_distance(&self, a: [f64; 3], b: [f64; 3]) -> f64 {
        let [dx, dy, dz] = self.separation(a, b);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl Default for DomainGeometry {
    fn default() -> Self {
        Self::unit_box()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cosmology {
    pub hubble_constant: f64,
    pub omega_matter: f64,
    #[serde(default)]
    pub omega_lambda: f64,
    pub current_redshift: f64,
}

impl Cosmology {
    /// Reference density used for halo overdensities, in g/cm^3.
    ///
    /// Carries the `omega_matter` factor so overdensities are measured
    /// against the mean matter density scaled to redshift `z`.
    pub fn reference_density_cgs(&self) -> f64 {
        RHO_CRIT_G_CM3_H2
            * self.hubble_constant.powi(2)
            * self.omega_matter
            * (1.0 + self.current_redshift).powi(3)
    }
}

impl Default for Cosmology {
    fn default() -> Self {
        Self {
            hubble_constant: 0.7,
            omega_matter: 0.3,
            omega_lambda: 0.7,
            current_redshift: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cosmology, DomainGeometry, FieldKey};

    #[test]
    fn field_key_renders_as_tuple() {
        let key = FieldKey::new("halos", "particle_mass");
        assert_eq!(key.to_string(), "('halos', 'particle_mass')");
    }

    #[test]
    fn periodic_distance_uses_minimum_image() {
        let geometry = DomainGeometry::unit_box();
        let distance = geometry.periodic_distance([0.001, 0.5, 0.5], [0.999, 0.5, 0.5]);
        assert!((distance - 0.002).abs() < 1.0e-12);
    }

    #[test]
    fn wrap_returns_points_into_domain() {
        let geometry = DomainGeometry::new([-1.0; 3], [1.0; 3]);
        let wrapped = geometry.wrap([1.5, -1.25, 0.0]);
        assert!((wrapped[0] + 0.5).abs() < 1.0e-12);
        assert!((wrapped[1] - 0.75).abs() < 1.0e-12);
        assert_eq!(wrapped[2], 0.0);
    }

    #[test]
    fn reference_density_scales_with_redshift() {
        let today = Cosmology::default();
        let earlier = Cosmology {
            current_redshift: 1.0,
            ..today
        };
        let ratio = earlier.reference_density_cgs() / today.reference_density_cgs();
        assert!((ratio - 8.0).abs() < 1.0e-12);
    }
}
