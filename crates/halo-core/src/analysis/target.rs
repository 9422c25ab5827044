use crate::data::{DataSource, PARTICLE_POSITION_FIELDS};
use crate::domain::{DomainGeometry, FieldKey, HaloError, HaloResult};
use crate::numerics::{KdTree, RadialProfile};
use crate::units::{Quantity, Unit};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

/// Simulation particles selected around a halo, in the data source's code length.
#[derive(Debug, Clone, PartialEq)]
pub struct SphereSelection {
    pub center: [f64; 3],
    pub radius: f64,
    /// Particle type the rows index.
    pub ptype: String,
    /// Rows of the simulation particle fields, ascending.
    pub indices: Vec<usize>,
}

impl SphereSelection {
    /// Rows of `ptype` inside the sphere; reselected when `ptype` differs from the selection's.
    pub fn rows_for(&self, ptype: &str, particles: &ParticleIndex) -> Vec<usize> {
        if ptype == self.ptype {
            return self.indices.clone();
        }
        let mut rows = if self.radius > 0.0 {
            particles.tree.within(self.center, self.radius)
        } else {
            Vec::new()
        };
        rows.sort_unstable();
        rows
    }
}

/// Cumulative mass profile of a sphere selection, radii in cm and masses in g.
#[derive(Debug, Clone, PartialEq)]
pub struct MassProfile {
    pub profile: Option<RadialProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HaloAttribute {
    Sphere(Arc<SphereSelection>),
    Profile(Arc<MassProfile>),
}

/// One row of the halo data source travelling through an action chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Halo {
    /// Row in the halo data source.
    pub index: usize,
    pub quantities: HashMap<String, Quantity>,
    attributes: HashMap<String, HaloAttribute>,
}

impl Halo {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            quantities: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn quantity(&self, name: &str) -> HaloResult<&Quantity> {
        self.quantities.get(name).ok_or_else(|| {
            HaloError::lookup(
                "LOOKUP.QUANTITY",
                format!("halo {} does not contain {name} quantity", self.index),
            )
        })
    }

    pub fn set_quantity(&mut self, name: impl Into<String>, value: Quantity) {
        self.quantities.insert(name.into(), value);
    }

    /// `particle_identifier` when pulled, otherwise the row index.
    pub fn identifier(&self) -> i64 {
        self.quantities
            .get("particle_identifier")
            .map_or(self.index as i64, |quantity| quantity.value.round() as i64)
    }

    /// Halo center from the `particle_position_*` quantities.
    pub fn position_in(&self, target: &Unit) -> HaloResult<[f64; 3]> {
        let mut position = [0.0; 3];
        for (axis, name) in PARTICLE_POSITION_FIELDS.iter().enumerate() {
            position[axis] = self.quantity(name)?.in_units(target)?.value;
        }
        Ok(position)
    }

    pub fn attribute(&self, name: &str) -> Option<&HaloAttribute> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: HaloAttribute) {
        self.attributes.insert(name.into(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<HaloAttribute> {
        self.attributes.remove(name)
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.attributes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn sphere(&self) -> HaloResult<&Arc<SphereSelection>> {
        match self.attributes.get("sphere") {
            Some(HaloAttribute::Sphere(sphere)) => Ok(sphere),
            _ => Err(missing_attribute(self.index, "sphere")),
        }
    }

    pub fn profile(&self) -> HaloResult<&Arc<MassProfile>> {
        match self.attributes.get("virial_profile") {
            Some(HaloAttribute::Profile(profile)) => Ok(profile),
            _ => Err(missing_attribute(self.index, "virial_profile")),
        }
    }
}

fn missing_attribute(index: usize, name: &str) -> HaloError {
    HaloError::lookup(
        "LOOKUP.ATTRIBUTE",
        format!("halo {index} has no '{name}' attribute; add the callback that creates it first"),
    )
}

/// Simulation particles indexed for sphere queries.
#[derive(Debug)]
pub struct ParticleIndex {
    pub tree: KdTree,
    pub positions: Vec<[f64; 3]>,
    /// Grams.
    pub masses: Vec<f64>,
    pub particle_index: Vec<i64>,
    pub geometry: DomainGeometry,
    pub length_cgs: f64,
}

/// Lazily built lookups shared by every target of one run.
#[derive(Debug, Default)]
pub struct TargetCache {
    parent_map: OnceLock<HashMap<i64, i64>>,
    /// Keyed by particle type.
    particles: Mutex<HashMap<String, Arc<ParticleIndex>>>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cached<T>(cell: &OnceLock<T>, build: impl FnOnce() -> HaloResult<T>) -> HaloResult<&T> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = build()?;
    Ok(cell.get_or_init(|| value))
}

/// Everything an operator may read while processing one target.
pub struct TargetContext<'a> {
    pub halos: &'a dyn DataSource,
    pub data: Option<&'a dyn DataSource>,
    pub halo_field_type: &'a str,
    /// Pipeline output directory, `<output root>/<basename>`.
    pub output_dir: &'a Path,
    pub rank: usize,
    cache: &'a TargetCache,
}

impl<'a> TargetContext<'a> {
    pub fn new(
        halos: &'a dyn DataSource,
        data: Option<&'a dyn DataSource>,
        halo_field_type: &'a str,
        output_dir: &'a Path,
        rank: usize,
        cache: &'a TargetCache,
    ) -> Self {
        Self {
            halos,
            data,
            halo_field_type,
            output_dir,
            rank,
            cache,
        }
    }

    pub fn data_source(&self) -> HaloResult<&'a dyn DataSource> {
        self.data.ok_or_else(|| {
            HaloError::configuration(
                "CONFIG.DATA_SOURCE",
                "this operator needs a simulation dataset; none is attached to the catalog",
            )
        })
    }

    pub fn parent_map(
        &self,
        build: impl FnOnce() -> HaloResult<HashMap<i64, i64>>,
    ) -> HaloResult<&HashMap<i64, i64>> {
        cached(&self.cache.parent_map, build)
    }

    /// Particle positions and masses of one particle type, built on first use of that type.
    pub fn particles(&self, ptype: &str) -> HaloResult<Arc<ParticleIndex>> {
        let data = self.data_source()?;
        let mut indexes = self.cache.particles.lock().expect("particle cache lock poisoned");
        if let Some(index) = indexes.get(ptype) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(index_particles(data, ptype)?);
        indexes.insert(ptype.to_string(), Arc::clone(&index));
        Ok(index)
    }
}

fn index_particles(data: &dyn DataSource, ptype: &str) -> HaloResult<ParticleIndex> {
    let registry = data.unit_registry();
    let code_length = registry.unit("code_length")?;
    let mut axes = Vec::with_capacity(3);
    for name in PARTICLE_POSITION_FIELDS {
        axes.push(data.full_field(&FieldKey::new(ptype, name))?.in_units(&code_length)?.values);
    }
    let positions: Vec<[f64; 3]> = (0..axes[0].len())
        .map(|row| [axes[0][row], axes[1][row], axes[2][row]])
        .collect();
    let masses = data
        .full_field(&FieldKey::new(ptype, "particle_mass"))?
        .in_units(&registry.unit("g")?)?
        .values;
    let index_key = FieldKey::new(ptype, "particle_index");
    let particle_index = if data.has_field(&index_key) {
        data.full_field(&index_key)?
            .values
            .iter()
            .map(|value| *value as i64)
            .collect()
    } else {
        (0..positions.len() as i64).collect()
    };
    let geometry = data.geometry();
    Ok(ParticleIndex {
        tree: KdTree::new(&positions, geometry),
        positions,
        masses,
        particle_index,
        geometry,
        length_cgs: code_length.cgs_factor(),
    })
}

#[cfg(test)]
mod tests {
    use super::{Halo, HaloAttribute, SphereSelection, TargetCache, TargetContext};
    use crate::data::ParticleSnapshot;
    use crate::domain::{DomainGeometry, HaloErrorCategory};
    use crate::units::{Quantity, UnitRegistry};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn quantities_and_attributes_round_through_the_target() {
        let registry = UnitRegistry::default();
        let mut halo = Halo::new(4);
        assert_eq!(halo.identifier(), 4);
        halo.set_quantity("particle_identifier", Quantity::plain(17.0));
        assert_eq!(halo.identifier(), 17);

        let error = halo.position_in(&registry.unit("cm").expect("cm")).expect_err("no position");
        assert_eq!(error.category(), HaloErrorCategory::Lookup);

        for name in ["particle_position_x", "particle_position_y", "particle_position_z"] {
            halo.set_quantity(name, Quantity::new(0.5, registry.unit("unitary").expect("unitary")));
        }
        let position = halo.position_in(&registry.unit("cm").expect("cm")).expect("position");
        assert_eq!(position, [0.5; 3]);

        halo.set_attribute(
            "sphere",
            HaloAttribute::Sphere(Arc::new(SphereSelection {
                center: [0.5; 3],
                radius: 0.1,
                ptype: "all".to_string(),
                indices: vec![1, 2],
            })),
        );
        assert_eq!(halo.sphere().expect("sphere").indices, vec![1, 2]);
        assert!(halo.profile().is_err());
        assert!(halo.remove_attribute("sphere").is_some());
        assert!(halo.attribute_names().is_empty());
    }

    #[test]
    fn caches_build_once() {
        let data = ParticleSnapshot::new("DD0001", DomainGeometry::unit_box(), vec![[0.1; 3], [0.9; 3]])
            .into_dataset()
            .expect("snapshot should build");
        let cache = TargetCache::new();
        let context = TargetContext::new(&data, Some(&data), "halos", Path::new("."), 0, &cache);

        let particles = context.particles("all").expect("particles should index");
        assert_eq!(particles.positions.len(), 2);
        assert_eq!(particles.particle_index, vec![0, 1]);

        let first = context
            .parent_map(|| Ok(HashMap::from([(0, -1)])))
            .expect("parent map");
        assert_eq!(first.get(&0), Some(&-1));
        let second = context
            .parent_map(|| Ok(HashMap::new()))
            .expect("cached parent map");
        assert_eq!(second.len(), 1);
    }
}
