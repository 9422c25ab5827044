use super::{DataSource, PARTICLE_POSITION_FIELDS, PARTICLE_VELOCITY_FIELDS, missing_field};
use crate::domain::{Cosmology, DomainGeometry, FieldKey, HaloError, HaloResult};
use crate::units::{CodeUnits, UnitArray, UnitRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

/// Columnar dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    name: String,
    geometry: DomainGeometry,
    cosmology: Option<Cosmology>,
    code_units: CodeUnits,
    registry: UnitRegistry,
    fields: BTreeMap<FieldKey, UnitArray>,
    attributes: Map<String, Value>,
    chunk_size: usize,
}

impl InMemoryDataset {
    pub fn new(name: impl Into<String>, geometry: DomainGeometry) -> Self {
        let code_units = CodeUnits::cgs();
        Self {
            name: name.into(),
            geometry,
            cosmology: None,
            code_units,
            registry: UnitRegistry::new(code_units, geometry.max_width(), None),
            fields: BTreeMap::new(),
            attributes: Map::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_cosmology(mut self, cosmology: Cosmology) -> Self {
        self.cosmology = Some(cosmology);
        self.rebuild_registry();
        self
    }

    pub fn with_code_units(mut self, code_units: CodeUnits) -> Self {
        self.code_units = code_units;
        self.rebuild_registry();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub const fn code_units(&self) -> CodeUnits {
        self.code_units
    }

    fn rebuild_registry(&mut self) {
        self.registry = UnitRegistry::new(
            self.code_units,
            self.geometry.max_width(),
            self.cosmology.as_ref(),
        );
    }

    /// Adds a column; columns sharing a field type must share a length.
    pub fn insert_field(&mut self, key: FieldKey, data: UnitArray) -> HaloResult<()> {
        let existing = self
            .fields
            .iter()
            .find(|(k, _)| k.field_type == key.field_type && **k != key)
            .map(|(_, stored)| stored.len());
        if let Some(existing) = existing.filter(|rows| *rows != data.len()) {
            return Err(HaloError::configuration(
                "CONFIG.FIELD_LENGTH",
                format!(
                    "field {key} has {} rows but '{}' fields have {existing}",
                    data.len(),
                    key.field_type
                ),
            ));
        }
        self.fields.insert(key, data);
        Ok(())
    }

    /// Adds a column whose units are given as a symbol resolved by this dataset.
    pub fn insert_values(
        &mut self,
        key: FieldKey,
        values: Vec<f64>,
        units: Option<&str>,
    ) -> HaloResult<()> {
        let units = units
            .filter(|symbol| !symbol.is_empty())
            .map(|symbol| self.registry.unit(symbol))
            .transpose()?;
        self.insert_field(key, UnitArray::new(values, units))
    }

    pub fn remove_field(&mut self, key: &FieldKey) -> Option<UnitArray> {
        self.fields.remove(key)
    }

    fn stored(&self, key: &FieldKey) -> HaloResult<&UnitArray> {
        self.fields
            .get(key)
            .ok_or_else(|| missing_field(&self.name, key))
    }
}

impl DataSource for InMemoryDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> DomainGeometry {
        self.geometry
    }

    fn cosmology(&self) -> Option<Cosmology> {
        self.cosmology
    }

    fn unit_registry(&self) -> &UnitRegistry {
        &self.registry
    }

    fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    fn field_keys(&self) -> Vec<FieldKey> {
        self.fields.keys().cloned().collect()
    }

    fn has_field(&self, key: &FieldKey) -> bool {
        self.fields.contains_key(key)
    }

    fn row_count(&self, field_type: &str) -> usize {
        self.fields
            .iter()
            .find(|(key, _)| key.field_type == field_type)
            .map_or(0, |(_, data)| data.len())
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn field(&self, key: &FieldKey, rows: Range<usize>) -> HaloResult<UnitArray> {
        let stored = self.stored(key)?;
        let values = stored.values.get(rows.clone()).ok_or_else(|| {
            HaloError::lookup(
                "LOOKUP.FIELD_ROWS",
                format!(
                    "rows {}..{} out of range for field {key} with {} rows",
                    rows.start,
                    rows.end,
                    stored.len()
                ),
            )
        })?;
        Ok(UnitArray::new(values.to_vec(), stored.units.clone()))
    }

    fn field_at(&self, key: &FieldKey, indices: &[usize]) -> HaloResult<UnitArray> {
        let stored = self.stored(key)?;
        if let Some(bad) = indices.iter().find(|index| **index >= stored.len()) {
            return Err(HaloError::lookup(
                "LOOKUP.FIELD_ROWS",
                format!("row {bad} out of range for field {key} with {} rows", stored.len()),
            ));
        }
        Ok(stored.select(indices))
    }
}

/// Particle snapshot exchanged as JSON, values in code units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleSnapshot {
    #[serde(default = "default_snapshot_name")]
    pub name: String,
    #[serde(default)]
    pub geometry: DomainGeometry,
    #[serde(default)]
    pub cosmology: Option<Cosmology>,
    #[serde(default)]
    pub code_units: CodeUnits,
    #[serde(default = "default_particle_type")]
    pub particle_type: String,
    pub positions: Vec<[f64; 3]>,
    #[serde(default)]
    pub velocities: Vec<[f64; 3]>,
    #[serde(default)]
    pub masses: Vec<f64>,
    #[serde(default)]
    pub particle_index: Vec<i64>,
}

fn default_snapshot_name() -> String {
    "snapshot".to_string()
}

fn default_particle_type() -> String {
    "all".to_string()
}

impl ParticleSnapshot {
    pub fn new(name: impl Into<String>, geometry: DomainGeometry, positions: Vec<[f64; 3]>) -> Self {
        Self {
            name: name.into(),
            geometry,
            cosmology: None,
            code_units: CodeUnits::cgs(),
            particle_type: default_particle_type(),
            positions,
            velocities: Vec::new(),
            masses: Vec::new(),
            particle_index: Vec::new(),
        }
    }

    pub fn from_path(path: &Path) -> HaloResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            HaloError::io_system(
                "IO.SNAPSHOT_READ",
                format!("failed to read '{}': {source}", path.display()),
            )
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Builds the dataset; missing velocities default to zero, masses to one code mass.
    pub fn into_dataset(self) -> HaloResult<InMemoryDataset> {
        let count = self.positions.len();
        let check = |label: &str, len: usize| {
            if len != 0 && len != count {
                Err(HaloError::configuration(
                    "CONFIG.SNAPSHOT_SHAPE",
                    format!("snapshot has {count} positions but {len} {label}"),
                ))
            } else {
                Ok(())
            }
        };
        check("velocities", self.velocities.len())?;
        check("masses", self.masses.len())?;
        check("particle indices", self.particle_index.len())?;

        let mut dataset = InMemoryDataset::new(self.name, self.geometry)
            .with_code_units(self.code_units);
        if let Some(cosmology) = self.cosmology {
            dataset = dataset.with_cosmology(cosmology);
        }

        let ptype = self.particle_type;
        for axis in 0..3 {
            let positions = self.positions.iter().map(|p| p[axis]).collect();
            dataset.insert_values(
                FieldKey::new(ptype.as_str(), PARTICLE_POSITION_FIELDS[axis]),
                positions,
                Some("code_length"),
            )?;
            let velocities = if self.velocities.is_empty() {
                vec![0.0; count]
            } else {
                self.velocities.iter().map(|v| v[axis]).collect()
            };
            dataset.insert_values(
                FieldKey::new(ptype.as_str(), PARTICLE_VELOCITY_FIELDS[axis]),
                velocities,
                Some("code_velocity"),
            )?;
        }
        let masses = if self.masses.is_empty() {
            vec![1.0; count]
        } else {
            self.masses
        };
        dataset.insert_values(
            FieldKey::new(ptype.as_str(), "particle_mass"),
            masses,
            Some("code_mass"),
        )?;
        let indices = if self.particle_index.is_empty() {
            (0..count).map(|i| i as f64).collect()
        } else {
            self.particle_index.iter().map(|i| *i as f64).collect()
        };
        dataset.insert_values(FieldKey::new(ptype.as_str(), "particle_index"), indices, None)?;
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryDataset, ParticleSnapshot};
    use crate::data::DataSource;
    use crate::domain::{DomainGeometry, FieldKey};
    use crate::units::{CodeUnits, UnitArray};

    #[test]
    fn snapshot_defaults_fill_missing_columns() {
        let snapshot: ParticleSnapshot = serde_json::from_str(
            r#"{ "positions": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]] }"#,
        )
        .expect("snapshot should parse");
        let dataset = snapshot.into_dataset().expect("dataset should build");

        assert_eq!(dataset.row_count("all"), 2);
        let mass = dataset
            .full_field(&FieldKey::new("all", "particle_mass"))
            .expect("mass should exist");
        assert_eq!(mass.values, vec![1.0, 1.0]);
        assert_eq!(mass.units.as_ref().map(|u| u.symbol()), Some("code_mass"));
        let index = dataset
            .full_field(&FieldKey::new("all", "particle_index"))
            .expect("index should exist");
        assert_eq!(index.values, vec![0.0, 1.0]);
    }

    #[test]
    fn mismatched_snapshot_columns_are_rejected() {
        let mut snapshot = ParticleSnapshot::new("bad", DomainGeometry::unit_box(), vec![[0.5; 3]; 3]);
        snapshot.masses = vec![1.0, 2.0];
        let error = snapshot.into_dataset().expect_err("shape mismatch should fail");
        assert_eq!(error.placeholder(), "CONFIG.SNAPSHOT_SHAPE");
    }

    #[test]
    fn field_lengths_are_checked_per_type() {
        let mut dataset = InMemoryDataset::new("lengths", DomainGeometry::unit_box());
        dataset
            .insert_field(FieldKey::new("halos", "a"), UnitArray::new(vec![1.0, 2.0], None))
            .expect("first field should insert");
        dataset
            .insert_field(FieldKey::new("particles", "ids"), UnitArray::new(vec![1.0; 5], None))
            .expect("other field types may differ");
        let error = dataset
            .insert_field(FieldKey::new("halos", "b"), UnitArray::new(vec![1.0], None))
            .expect_err("length mismatch should fail");
        assert_eq!(error.placeholder(), "CONFIG.FIELD_LENGTH");
    }

    #[test]
    fn code_units_drive_symbol_resolution() {
        let code_units = CodeUnits {
            length_cgs: 2.0,
            mass_cgs: 3.0,
            time_cgs: 1.0,
        };
        let mut dataset =
            InMemoryDataset::new("units", DomainGeometry::unit_box()).with_code_units(code_units);
        dataset
            .insert_values(FieldKey::new("all", "x"), vec![1.0], Some("code_length"))
            .expect("field should insert");
        let data = dataset
            .field_at(&FieldKey::new("all", "x"), &[0])
            .expect("row should exist");
        let cm = dataset.unit_registry().unit("cm").expect("cm should resolve");
        assert_eq!(data.in_units(&cm).expect("convertible").values, vec![2.0]);
        assert!(dataset.field_at(&FieldKey::new("all", "x"), &[4]).is_err());
    }
}
