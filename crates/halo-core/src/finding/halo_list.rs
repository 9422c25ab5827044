use super::found_halo::{FoundHalo, HaloKind, ParticleStore};
use crate::common::constants::{KM_CGS, KPC_CGS, MASS_SUN_CGS, NOT_VIRIALIZED};
use crate::data::{CatalogFile, PARTICLE_POSITION_FIELDS, PARTICLE_VELOCITY_FIELDS};
use crate::domain::{HaloError, HaloResult};
use crate::parallel::{Communicator, Subvolume, all_gather};
use crate::units::{UnitArray, UnitRegistry};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Halos parsed from per-particle labels.
#[derive(Debug)]
pub struct HaloList {
    kind: HaloKind,
    store: Arc<ParticleStore>,
    halos: Vec<FoundHalo>,
    save_particles: bool,
}

impl HaloList {
    /// Groups particles by label, skipping `-1`, in ascending label order.
    ///
    /// Each group's peak is its densest member; ties go to the first member
    /// in label-sorted order.
    pub fn from_labels(store: Arc<ParticleStore>, labels: &[i64], kind: HaloKind) -> HaloResult<Self> {
        if labels.len() != store.len() {
            return Err(HaloError::internal(
                "RUN.LABELS",
                format!("{} labels for {} particles", labels.len(), store.len()),
            ));
        }
        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.sort_by_key(|index| labels[*index]);

        let mut halos = Vec::new();
        for run in order.chunk_by(|a, b| labels[*a] == labels[*b]) {
            let label = labels[run[0]];
            if label < 0 {
                continue;
            }
            let densest = run
                .iter()
                .copied()
                .reduce(|best, index| {
                    if store.densities[index] > store.densities[best] {
                        index
                    } else {
                        best
                    }
                })
                .unwrap_or(run[0]);
            let peak = (store.densities[densest], store.positions[densest]);
            let id = usize::try_from(label).unwrap_or_default();
            halos.push(FoundHalo::new(id, run.to_vec(), kind, peak, Arc::clone(&store)));
        }
        debug!(groups = halos.len(), particles = store.len(), "parsed halo labels");

        Ok(Self {
            kind,
            store,
            halos,
            save_particles: true,
        })
    }

    pub fn with_save_particles(mut self, save_particles: bool) -> Self {
        self.save_particles = save_particles;
        self
    }

    pub const fn kind(&self) -> HaloKind {
        self.kind
    }

    pub const fn save_particles(&self) -> bool {
        self.save_particles
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.halos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FoundHalo> {
        self.halos.iter()
    }

    pub fn get(&self, index: usize) -> Option<&FoundHalo> {
        self.halos.get(index)
    }

    /// Keeps halos whose density peak lies in the unpadded bounds and renumbers
    /// them from zero; recorded peak densities are divided by `threshold_adjustment`.
    pub fn retain_owned(&mut self, bounds: &Subvolume, threshold_adjustment: f64) {
        let before = self.halos.len();
        let kept: Vec<FoundHalo> = std::mem::take(&mut self.halos)
            .into_iter()
            .filter(|halo| bounds.owns(halo.maximum_density_location()))
            .enumerate()
            .map(|(id, mut halo)| {
                halo.scale_peak_density(threshold_adjustment);
                halo.with_id(id)
            })
            .collect();
        debug!(before, after = kept.len(), "dropped halos peaking in padding");
        self.halos = kept;
    }

    /// Offsets local ids by the halo counts of lower ranks. Collective.
    pub fn join(&mut self, comm: &dyn Communicator) -> HaloResult<()> {
        let counts = all_gather(comm, &self.halos.len())?;
        let offset: usize = counts[..comm.rank()].iter().sum();
        for halo in &mut self.halos {
            halo.id += offset;
        }
        info!(
            rank = comm.rank(),
            local = self.halos.len(),
            total = counts.iter().sum::<usize>(),
            "joined halo lists"
        );
        Ok(())
    }

    /// Catalog columns in `""`, `Msun`, `kpc`, `unitary` and `km/s`, plus the
    /// particle membership block when particles are saved.
    pub fn to_catalog(
        &self,
        registry: &UnitRegistry,
        attributes: Map<String, Value>,
    ) -> HaloResult<CatalogFile> {
        let mut catalog = CatalogFile::new(self.halos.len(), attributes);
        let unitary = self.store.geometry.max_width();
        let column = |values: Vec<f64>, symbol: &str| -> HaloResult<UnitArray> {
            let units = if symbol.is_empty() {
                None
            } else {
                Some(registry.unit(symbol)?)
            };
            Ok(UnitArray::new(values, units))
        };
        let sentinel_or = |value: f64, scale: f64| {
            if value == NOT_VIRIALIZED {
                NOT_VIRIALIZED
            } else {
                value / scale
            }
        };

        catalog.push_array(
            "particle_identifier",
            "halos",
            &column(self.halos.iter().map(|h| h.id as f64).collect(), "")?,
        );
        catalog.push_array(
            "particle_mass",
            "halos",
            &column(
                self.halos
                    .iter()
                    .map(|h| sentinel_or(h.default_virial_mass(), MASS_SUN_CGS))
                    .collect(),
                "Msun",
            )?,
        );
        catalog.push_array(
            "virial_radius",
            "halos",
            &column(
                self.halos
                    .iter()
                    .map(|h| sentinel_or(h.default_virial_radius(), KPC_CGS))
                    .collect(),
                "kpc",
            )?,
        );
        for (axis, name) in PARTICLE_POSITION_FIELDS.iter().enumerate() {
            let values = self
                .halos
                .iter()
                .map(|h| h.center_of_mass()[axis] / unitary)
                .collect();
            catalog.push_array(*name, "halos", &column(values, "unitary")?);
        }
        for (axis, name) in PARTICLE_VELOCITY_FIELDS.iter().enumerate() {
            let values = self
                .halos
                .iter()
                .map(|h| h.bulk_velocity()[axis] / KM_CGS)
                .collect();
            catalog.push_array(*name, "halos", &column(values, "km/s")?);
        }

        if self.save_particles {
            let numbers: Vec<i64> = self.halos.iter().map(|h| h.indices().len() as i64).collect();
            let starts: Vec<i64> = numbers
                .iter()
                .scan(0_i64, |offset, count| {
                    let start = *offset;
                    *offset += count;
                    Some(start)
                })
                .collect();
            let ids: Vec<i64> = self.halos.iter().flat_map(|h| h.member_ids()).collect();
            catalog.push_integers("ids", "particles", ids);
            catalog.push_integers("particle_number", "halos", numbers);
            catalog.push_integers("particle_index_start", "halos", starts);
        }
        Ok(catalog)
    }
}
