use crate::common::constants::{DEFAULT_VIRIAL_BINS, DEFAULT_VIRIAL_OVERDENSITY, NOT_VIRIALIZED};
use crate::domain::{Cosmology, DomainGeometry};
use crate::numerics::RadialProfile;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Particle arrays a halo list was built from.
///
/// Positions are in code length and may sit up to one padding width outside
/// the domain; velocities are cm/s and masses grams.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleStore {
    pub geometry: DomainGeometry,
    pub cosmology: Cosmology,
    pub length_cgs: f64,
    pub positions: Vec<[f64; 3]>,
    pub velocities: Vec<[f64; 3]>,
    pub masses: Vec<f64>,
    pub particle_index: Vec<i64>,
    pub densities: Vec<f64>,
}

impl ParticleStore {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaloKind {
    FriendsOfFriends,
    Hop,
}

/// Scalars known ahead of time; each one skips the matching computation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HaloSummary {
    pub size: Option<usize>,
    pub group_total_mass: Option<f64>,
    pub max_radius: Option<f64>,
    pub bulk_velocity: Option<[f64; 3]>,
    pub center_of_mass: Option<[f64; 3]>,
    pub max_dens_point: Option<(f64, [f64; 3])>,
}

#[derive(Debug)]
pub struct FoundHalo {
    pub id: usize,
    indices: Vec<usize>,
    kind: HaloKind,
    peak: (f64, [f64; 3]),
    store: Arc<ParticleStore>,
    summary: HaloSummary,
    center_of_mass: OnceLock<[f64; 3]>,
    bulk_velocity: OnceLock<[f64; 3]>,
    profiles: Mutex<HashMap<usize, Option<Arc<RadialProfile>>>>,
}

impl FoundHalo {
    pub fn new(
        id: usize,
        indices: Vec<usize>,
        kind: HaloKind,
        peak: (f64, [f64; 3]),
        store: Arc<ParticleStore>,
    ) -> Self {
        Self {
            id,
            indices,
            kind,
            peak,
            store,
            summary: HaloSummary::default(),
            center_of_mass: OnceLock::new(),
            bulk_velocity: OnceLock::new(),
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_summary(mut self, summary: HaloSummary) -> Self {
        self.summary = summary;
        self
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub const fn kind(&self) -> HaloKind {
        self.kind
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub(crate) fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn scale_peak_density(&mut self, divisor: f64) {
        self.peak.0 /= divisor;
    }

    pub fn size(&self) -> usize {
        self.summary.size.unwrap_or(self.indices.len())
    }

    /// Catalog indices of the member particles.
    pub fn member_ids(&self) -> Vec<i64> {
        self.indices
            .iter()
            .map(|index| self.store.particle_index[*index])
            .collect()
    }

    pub fn total_mass(&self) -> f64 {
        self.summary
            .group_total_mass
            .unwrap_or_else(|| self.indices.iter().map(|i| self.store.masses[*i]).sum())
    }

    /// Mass-weighted center in code length, unwrapped across periodic edges.
    pub fn center_of_mass(&self) -> [f64; 3] {
        if let Some(center) = self.summary.center_of_mass {
            return center;
        }
        *self.center_of_mass.get_or_init(|| self.compute_center_of_mass())
    }

    fn compute_center_of_mass(&self) -> [f64; 3] {
        let geometry = &self.store.geometry;
        let width = geometry.width();
        let total: f64 = self.indices.iter().map(|i| self.store.masses[*i]).sum();
        std::array::from_fn(|axis| {
            let shifted: Vec<f64> = self
                .indices
                .iter()
                .map(|i| self.store.positions[*i][axis] - geometry.left_edge[axis])
                .collect();
            let min = shifted.iter().copied().fold(f64::INFINITY, f64::min);
            let max = shifted.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let straddles = max - min >= width[axis] / 2.0;
            let weighted: f64 = shifted
                .iter()
                .zip(&self.indices)
                .map(|(c, i)| {
                    let c = if straddles && *c <= width[axis] / 2.0 {
                        c + width[axis]
                    } else {
                        *c
                    };
                    c * self.store.masses[*i]
                })
                .sum();
            let center = if total > 0.0 { weighted / total } else { 0.0 };
            center.rem_euclid(width[axis]) + geometry.left_edge[axis]
        })
    }

    /// Peak density recorded while parsing, relative to the mean of the full volume.
    pub fn maximum_density(&self) -> f64 {
        self.summary.max_dens_point.map_or(self.peak.0, |(density, _)| density)
    }

    /// Densest point for density-linked halos; the center of mass otherwise.
    pub fn maximum_density_location(&self) -> [f64; 3] {
        if let Some((_, point)) = self.summary.max_dens_point {
            return point;
        }
        match self.kind {
            HaloKind::Hop => self.peak.1,
            HaloKind::FriendsOfFriends => self.center_of_mass(),
        }
    }

    /// Mass-weighted mean velocity in cm/s.
    pub fn bulk_velocity(&self) -> [f64; 3] {
        if let Some(velocity) = self.summary.bulk_velocity {
            return velocity;
        }
        *self.bulk_velocity.get_or_init(|| {
            let total: f64 = self.indices.iter().map(|i| self.store.masses[*i]).sum();
            std::array::from_fn(|axis| {
                let momentum: f64 = self
                    .indices
                    .iter()
                    .map(|i| self.store.velocities[*i][axis] * self.store.masses[*i])
                    .sum();
                if total > 0.0 { momentum / total } else { 0.0 }
            })
        })
    }

    /// Mass-weighted RMS velocity about the bulk motion, in cm/s.
    ///
    /// Scaled by the particle count, matching long-standing catalog output.
    pub fn rms_velocity(&self) -> f64 {
        if self.indices.is_empty() {
            return 0.0;
        }
        let bulk = self.bulk_velocity();
        let total: f64 = self.indices.iter().map(|i| self.store.masses[*i]).sum();
        let mean_square = self
            .indices
            .iter()
            .map(|i| {
                let weight = self.store.masses[*i] / total;
                (0..3)
                    .map(|axis| {
                        let v = (self.store.velocities[*i][axis] - bulk[axis]) * weight;
                        v * v
                    })
                    .sum::<f64>()
            })
            .sum::<f64>()
            / self.indices.len() as f64;
        mean_square.sqrt() * self.indices.len() as f64
    }

    /// Largest member distance from the center of mass or the density peak, in code length.
    pub fn maximum_radius(&self, from_center_of_mass: bool) -> f64 {
        if let Some(radius) = self.summary.max_radius {
            return radius;
        }
        let center = if from_center_of_mass {
            self.center_of_mass()
        } else {
            self.maximum_density_location()
        };
        self.indices
            .iter()
            .map(|i| self.store.geometry.periodic_distance(self.store.positions[*i], center))
            .fold(0.0, f64::max)
    }

    /// Cumulative mass profile about the center of mass, cached per bin count.
    pub fn virial_info(&self, bins: usize) -> Option<Arc<RadialProfile>> {
        let mut profiles = self
            .profiles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        profiles
            .entry(bins)
            .or_insert_with(|| {
                let center = self.center_of_mass();
                let distances: Vec<f64> = self
                    .indices
                    .iter()
                    .map(|i| {
                        self.store
                            .geometry
                            .periodic_distance(center, self.store.positions[*i])
                            * self.store.length_cgs
                    })
                    .collect();
                let masses: Vec<f64> = self.indices.iter().map(|i| self.store.masses[*i]).collect();
                RadialProfile::build(
                    &distances,
                    &masses,
                    bins,
                    self.store.cosmology.reference_density_cgs(),
                )
                .map(Arc::new)
            })
            .clone()
    }

    pub fn virial_bin(&self, overdensity: f64, bins: usize) -> Option<usize> {
        self.virial_info(bins)?.virial_bin(overdensity)
    }

    /// Virial mass in grams, or the not-virialized sentinel.
    pub fn virial_mass(&self, overdensity: f64, bins: usize) -> f64 {
        self.virial_info(bins)
            .map_or(NOT_VIRIALIZED, |profile| profile.virial(overdensity).mass)
    }

    /// Virial radius in cm, or the not-virialized sentinel.
    pub fn virial_radius(&self, overdensity: f64, bins: usize) -> f64 {
        self.virial_info(bins)
            .map_or(NOT_VIRIALIZED, |profile| profile.virial(overdensity).radius)
    }

    pub fn default_virial_mass(&self) -> f64 {
        self.virial_mass(DEFAULT_VIRIAL_OVERDENSITY, DEFAULT_VIRIAL_BINS)
    }

    pub fn default_virial_radius(&self) -> f64 {
        self.virial_radius(DEFAULT_VIRIAL_OVERDENSITY, DEFAULT_VIRIAL_BINS)
    }
}

#[cfg(test)]
mod tests {
    use super::{FoundHalo, HaloKind, HaloSummary, ParticleStore};
    use crate::common::constants::{KPC_CGS, MASS_SUN_CGS, NOT_VIRIALIZED};
    use crate::domain::{Cosmology, DomainGeometry};
    use std::sync::Arc;

    fn store(positions: Vec<[f64; 3]>, velocities: Vec<[f64; 3]>, masses: Vec<f64>) -> Arc<ParticleStore> {
        let count = positions.len();
        Arc::new(ParticleStore {
            geometry: DomainGeometry::unit_box(),
            cosmology: Cosmology::default(),
            length_cgs: 1.0e3 * KPC_CGS,
            positions,
            velocities,
            masses,
            particle_index: (0..count as i64).map(|i| i + 100).collect(),
            densities: vec![-1.0; count],
        })
    }

    fn halo(store: Arc<ParticleStore>) -> FoundHalo {
        let indices = (0..store.len()).collect();
        FoundHalo::new(0, indices, HaloKind::FriendsOfFriends, (-1.0, [0.0; 3]), store)
    }

    #[test]
    fn center_of_mass_unwraps_periodic_halo() {
        let positions = vec![[0.99, 0.5, 0.5], [0.01, 0.5, 0.5], [0.98, 0.5, 0.5], [0.02, 0.5, 0.5]];
        let halo = halo(store(positions, vec![[0.0; 3]; 4], vec![1.0; 4]));
        let center = halo.center_of_mass();
        let offset = center[0].min(1.0 - center[0]);
        assert!(offset < 1.0e-9, "center {center:?}");
        assert!((center[1] - 0.5).abs() < 1.0e-12);
        assert_eq!(halo.member_ids(), vec![100, 101, 102, 103]);
    }

    #[test]
    fn rms_velocity_keeps_particle_count_scaling() {
        let velocities = vec![[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]];
        let halo = halo(store(vec![[0.5; 3]; 2], velocities, vec![1.0, 1.0]));
        assert_eq!(halo.bulk_velocity(), [0.0, 0.0, 0.0]);
        // each weighted deviation is 0.5, mean square 0.25, scaled by N = 2
        assert!((halo.rms_velocity() - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn maximum_radius_uses_minimum_image() {
        let positions = vec![[0.99, 0.5, 0.5], [0.03, 0.5, 0.5]];
        let halo = halo(store(positions, vec![[0.0; 3]; 2], vec![1.0, 1.0]));
        assert!((halo.maximum_radius(true) - 0.02).abs() < 1.0e-9);
    }

    #[test]
    fn sparse_halo_reports_virial_sentinel() {
        let positions = vec![[0.1, 0.1, 0.1], [0.4, 0.4, 0.4]];
        let halo = halo(store(positions, vec![[0.0; 3]; 2], vec![MASS_SUN_CGS; 2]));
        assert_eq!(halo.default_virial_mass(), NOT_VIRIALIZED);
        assert_eq!(halo.default_virial_radius(), NOT_VIRIALIZED);
        assert_eq!(halo.virial_bin(200.0, 300), None);
    }

    #[test]
    fn dense_halo_is_virialized_and_profile_is_cached() {
        let positions: Vec<[f64; 3]> = (0..40)
            .map(|i| [0.5 + 1.0e-5 * (i as f64).sin(), 0.5 + 1.0e-5 * (i as f64).cos(), 0.5])
            .collect();
        let halo = halo(store(positions, vec![[0.0; 3]; 40], vec![1.0e12 * MASS_SUN_CGS; 40]));
        let first = halo.virial_info(50).expect("profile should build");
        let second = halo.virial_info(50).expect("profile should be cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(halo.virial_mass(200.0, 50) > 0.0);
        assert!(halo.virial_radius(200.0, 50) > 0.0);
    }

    #[test]
    fn precomputed_summary_short_circuits() {
        let halo = halo(store(vec![[0.5; 3]; 3], vec![[0.0; 3]; 3], vec![1.0; 3])).with_summary(
            HaloSummary {
                size: Some(99),
                group_total_mass: Some(7.0),
                max_radius: Some(0.25),
                bulk_velocity: Some([1.0, 2.0, 3.0]),
                center_of_mass: Some([0.1, 0.2, 0.3]),
                max_dens_point: Some((5.0, [0.4, 0.5, 0.6])),
            },
        );
        assert_eq!(halo.size(), 99);
        assert_eq!(halo.total_mass(), 7.0);
        assert_eq!(halo.maximum_radius(true), 0.25);
        assert_eq!(halo.bulk_velocity(), [1.0, 2.0, 3.0]);
        assert_eq!(halo.center_of_mass(), [0.1, 0.2, 0.3]);
        assert_eq!(halo.maximum_density(), 5.0);
        assert_eq!(halo.maximum_density_location(), [0.4, 0.5, 0.6]);
    }
}
