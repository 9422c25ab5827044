use super::{DataSource, InMemoryDataset};
use crate::common::logging::quiet;
use crate::domain::{Cosmology, DomainGeometry, FieldKey, HaloError, HaloResult};
use crate::units::{CodeUnits, UnitArray};
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

pub const HALO_CATALOG_DATA_TYPE: &str = "halo_catalog";

const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl ColumnValues {
    /// Integer storage when every value is an exactly representable whole number.
    pub fn from_f64(values: &[f64], allow_integer: bool) -> Self {
        let integral = allow_integer
            && values
                .iter()
                .all(|v| v.is_finite() && v.fract() == 0.0 && v.abs() < MAX_EXACT_INTEGER);
        if integral {
            Self::Int(values.iter().map(|v| *v as i64).collect())
        } else {
            Self::Float(values.to_vec())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int(values) => values.len(),
            Self::Float(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Self::Int(values) => values.iter().map(|v| *v as f64).collect(),
            Self::Float(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogColumn {
    pub name: String,
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    pub values: ColumnValues,
}

/// On-disk halo catalog written once per rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub data_type: String,
    pub num_halos: usize,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub columns: Vec<CatalogColumn>,
}

impl CatalogFile {
    pub fn new(num_halos: usize, attributes: Map<String, Value>) -> Self {
        Self {
            data_type: HALO_CATALOG_DATA_TYPE.to_string(),
            num_halos,
            attributes,
            columns: Vec::new(),
        }
    }

    pub fn push_array(&mut self, name: impl Into<String>, field_type: impl Into<String>, data: &UnitArray) {
        let units = data
            .units
            .as_ref()
            .map(|unit| unit.symbol().to_string())
            .filter(|symbol| !symbol.is_empty());
        let values = ColumnValues::from_f64(&data.values, units.is_none());
        self.columns.push(CatalogColumn {
            name: name.into(),
            field_type: field_type.into(),
            units,
            values,
        });
    }

    pub fn push_integers(&mut self, name: impl Into<String>, field_type: impl Into<String>, values: Vec<i64>) {
        self.columns.push(CatalogColumn {
            name: name.into(),
            field_type: field_type.into(),
            units: None,
            values: ColumnValues::Int(values),
        });
    }

    pub fn column(&self, name: &str) -> Option<&CatalogColumn> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    fn attribute<T: serde::de::DeserializeOwned>(&self, name: &str) -> HaloResult<Option<T>> {
        self.attributes
            .get(name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(HaloError::from)
    }

    /// Reopens the catalog as a dataset, restoring geometry and units from attributes.
    pub fn into_dataset(self, name: impl Into<String>) -> HaloResult<InMemoryDataset> {
        if self.data_type != HALO_CATALOG_DATA_TYPE {
            return Err(HaloError::io_system(
                "IO.CATALOG_TYPE",
                format!(
                    "expected data_type '{HALO_CATALOG_DATA_TYPE}', found '{}'",
                    self.data_type
                ),
            ));
        }
        let geometry: DomainGeometry = self.attribute("geometry")?.unwrap_or_default();
        let cosmology: Option<Cosmology> = self.attribute("cosmology")?;
        let code_units: CodeUnits = self.attribute("code_units")?.unwrap_or_default();

        let mut dataset = InMemoryDataset::new(name, geometry).with_code_units(code_units);
        if let Some(cosmology) = cosmology {
            dataset = dataset.with_cosmology(cosmology);
        }
        for (key, value) in &self.attributes {
            dataset = dataset.with_attribute(key.clone(), value.clone());
        }
        dataset = dataset
            .with_attribute("data_type", Value::from(self.data_type.clone()))
            .with_attribute("num_halos", Value::from(self.num_halos));

        for column in self.columns {
            dataset.insert_values(
                FieldKey::new(column.field_type, column.name),
                column.values.to_f64(),
                column.units.as_deref(),
            )?;
        }
        Ok(dataset)
    }
}

/// Attributes describing the dataset a catalog was built from.
pub fn source_attributes(source: &dyn DataSource) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("source_dataset".to_string(), Value::from(source.name()));
    if let Ok(geometry) = serde_json::to_value(source.geometry()) {
        attributes.insert("geometry".to_string(), geometry);
    }
    if let Some(value) = source
        .cosmology()
        .and_then(|cosmology| serde_json::to_value(cosmology).ok())
    {
        attributes.insert("cosmology".to_string(), value);
    }
    if let Ok(code_units) = serde_json::to_value(source.unit_registry().code_units()) {
        attributes.insert("code_units".to_string(), code_units);
    }
    attributes
}

/// `<output_dir>/<basename>.<rank>.json`
pub fn catalog_path(output_dir: &Path, basename: &str, rank: usize) -> PathBuf {
    output_dir.join(format!("{basename}.{rank}.json"))
}

/// Writes the catalog with logging quieted below ERROR.
pub fn write_catalog(path: &Path, catalog: &CatalogFile) -> HaloResult<()> {
    quiet(|| {
        info!(path = %path.display(), num_halos = catalog.num_halos, "saving halo catalog");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| {
                HaloError::io_system(
                    "IO.CATALOG_WRITE",
                    format!("failed to create '{}': {source}", parent.display()),
                )
            })?;
        }
        let text = serde_json::to_string_pretty(catalog)?;
        std::fs::write(path, text).map_err(|source| {
            HaloError::io_system(
                "IO.CATALOG_WRITE",
                format!("failed to write '{}': {source}", path.display()),
            )
        })
    })
}

fn read_catalog_file(path: &Path) -> HaloResult<CatalogFile> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        HaloError::io_system(
            "IO.CATALOG_READ",
            format!("failed to read '{}': {source}", path.display()),
        )
    })?;
    Ok(serde_json::from_str(&text)?)
}

fn dataset_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "halo_catalog".to_string())
}

pub fn load_catalog(path: &Path) -> HaloResult<InMemoryDataset> {
    read_catalog_file(path)?.into_dataset(dataset_name(path))
}

/// Loads every `<basename>.<rank>.json` under `dir`, concatenated rank-major.
pub fn load_catalog_series(dir: &Path, basename: &str) -> HaloResult<InMemoryDataset> {
    let matcher = Glob::new(&format!("{basename}.*.json"))
        .map_err(|source| {
            HaloError::configuration(
                "CONFIG.CATALOG_GLOB",
                format!("invalid catalog basename '{basename}': {source}"),
            )
        })?
        .compile_matcher();

    let entries = std::fs::read_dir(dir).map_err(|source| {
        HaloError::io_system(
            "IO.CATALOG_READ",
            format!("failed to list '{}': {source}", dir.display()),
        )
    })?;
    let mut ranked: Vec<(usize, PathBuf)> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_string();
            if !matcher.is_match(&file_name) {
                return None;
            }
            let rank = file_name
                .strip_prefix(basename)?
                .strip_prefix('.')?
                .strip_suffix(".json")?
                .parse::<usize>()
                .ok()?;
            Some((rank, path))
        })
        .collect();
    ranked.sort_by_key(|(rank, _)| *rank);

    let mut files = ranked.into_iter().map(|(_, path)| read_catalog_file(&path));
    let Some(first) = files.next() else {
        return Err(HaloError::lookup(
            "LOOKUP.CATALOG_FILES",
            format!("no '{basename}.<rank>.json' files under '{}'", dir.display()),
        ));
    };
    let mut combined = first?;
    for file in files {
        append_catalog(&mut combined, file?)?;
    }
    combined.into_dataset(basename)
}

fn append_catalog(combined: &mut CatalogFile, next: CatalogFile) -> HaloResult<()> {
    // Ranks that kept no targets write no columns.
    if combined.columns.is_empty() {
        combined.num_halos += next.num_halos;
        combined.columns = next.columns;
        return Ok(());
    }
    let particle_offset = combined
        .column("ids")
        .map_or(0, |column| column.values.len()) as i64;
    combined.num_halos += next.num_halos;

    for column in next.columns {
        let Some(target) = combined
            .columns
            .iter_mut()
            .find(|existing| existing.name == column.name)
        else {
            return Err(HaloError::io_system(
                "IO.CATALOG_SCHEMA",
                format!("column '{}' is missing from the first catalog file", column.name),
            ));
        };
        let shift = if column.name == "particle_index_start" {
            particle_offset
        } else {
            0
        };
        target.values = match (std::mem::replace(&mut target.values, ColumnValues::Int(Vec::new())), column.values) {
            (ColumnValues::Int(mut head), ColumnValues::Int(tail)) => {
                head.extend(tail.into_iter().map(|v| v + shift));
                ColumnValues::Int(head)
            }
            (head, tail) => {
                let mut values = head.to_f64();
                values.extend(tail.to_f64().into_iter().map(|v| v + shift as f64));
                ColumnValues::Float(values)
            }
        };
    }
    Ok(())
}
