//! Narrow field-access contract consumed by the finders and the pipeline.

mod catalog_io;
mod memory;

pub use catalog_io::{
    CatalogColumn, CatalogFile, ColumnValues, HALO_CATALOG_DATA_TYPE, catalog_path,
    load_catalog, load_catalog_series, source_attributes, write_catalog,
};
pub use memory::{InMemoryDataset, ParticleSnapshot};

use crate::domain::{Cosmology, DomainGeometry, FieldKey, HaloError, HaloResult};
use crate::units::{UnitArray, UnitRegistry};
use serde_json::{Map, Value};
use std::ops::Range;
use std::sync::Arc;

pub const PARTICLE_POSITION_FIELDS: [&str; 3] = [
    "particle_position_x",
    "particle_position_y",
    "particle_position_z",
];
pub const PARTICLE_VELOCITY_FIELDS: [&str; 3] = [
    "particle_velocity_x",
    "particle_velocity_y",
    "particle_velocity_z",
];

pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn geometry(&self) -> DomainGeometry;

    fn cosmology(&self) -> Option<Cosmology>;

    fn unit_registry(&self) -> &UnitRegistry;

    fn attributes(&self) -> &Map<String, Value>;

    fn field_keys(&self) -> Vec<FieldKey>;

    fn has_field(&self, key: &FieldKey) -> bool {
        self.field_keys().contains(key)
    }

    /// Number of rows stored under `field_type`; zero for unknown types.
    fn row_count(&self, field_type: &str) -> usize;

    fn chunk_size(&self) -> usize;

    /// Row ranges iterated by the pipeline, in order.
    fn chunks(&self, field_type: &str) -> Vec<Range<usize>> {
        let rows = self.row_count(field_type);
        let step = self.chunk_size().max(1);
        (0..rows)
            .step_by(step)
            .map(|start| start..(start + step).min(rows))
            .collect()
    }

    fn field(&self, key: &FieldKey, rows: Range<usize>) -> HaloResult<UnitArray>;

    fn field_at(&self, key: &FieldKey, indices: &[usize]) -> HaloResult<UnitArray>;

    /// Batched retrieval; a missing key is a lookup error.
    fn fields(&self, keys: &[FieldKey], rows: Range<usize>) -> HaloResult<Vec<UnitArray>> {
        keys.iter().map(|key| self.field(key, rows.clone())).collect()
    }

    fn full_field(&self, key: &FieldKey) -> HaloResult<UnitArray> {
        self.field(key, 0..self.row_count(&key.field_type))
    }
}

pub(crate) fn missing_field(source: &str, key: &FieldKey) -> HaloError {
    HaloError::lookup(
        "LOOKUP.FIELD",
        format!("field {key} is not available in '{source}'"),
    )
}

/// Ordered datasets processed one after another by the finding methods.
#[derive(Clone, Default)]
pub struct DatasetSeries {
    datasets: Vec<Arc<dyn DataSource>>,
}

impl DatasetSeries {
    pub fn new(datasets: Vec<Arc<dyn DataSource>>) -> Self {
        Self { datasets }
    }

    pub fn single(dataset: Arc<dyn DataSource>) -> Self {
        Self::new(vec![dataset])
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DataSource>> {
        self.datasets.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn DataSource>> {
        self.datasets.get(index)
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|ds| ds.name().to_string()).collect()
    }
}

impl std::fmt::Debug for DatasetSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetSeries")
            .field("datasets", &self.names())
            .finish()
    }
}
