//! The halo catalog: an analysis pipeline bound to a halo dataset, a
//! simulation dataset, or a finder that produces the halo dataset first.

use super::operators::{BoundOperator, FindingContext, FindingMethodFn, OperatorArgs, Registries};
use super::pipeline::{AnalysisPipeline, CatalogRun};
use crate::common::config::{Jobs, RunOptions};
use crate::data::{DataSource, DatasetSeries, PARTICLE_POSITION_FIELDS, PARTICLE_VELOCITY_FIELDS};
use crate::domain::{FieldKey, HaloError, HaloResult};
use crate::parallel::{Communicator, agree};
use crate::rockstar::RockstarHandler;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_CATALOG_DIR: &str = "halo_catalogs";
pub const DEFAULT_HALO_FIELD_TYPE: &str = "halos";

/// Quantities pulled straight from the halo dataset when it has them.
pub fn default_halo_fields() -> Vec<&'static str> {
    let mut fields = vec!["particle_identifier", "particle_mass", "virial_radius"];
    fields.extend(PARTICLE_POSITION_FIELDS);
    fields.extend(PARTICLE_VELOCITY_FIELDS);
    fields
}

#[derive(Default)]
pub struct HaloCatalogBuilder {
    registries: Option<Arc<Registries>>,
    halos: Option<Arc<dyn DataSource>>,
    data: Option<DatasetSeries>,
    finder_method: Option<String>,
    finder_args: OperatorArgs,
    output_dir: Option<PathBuf>,
    halo_field_type: Option<String>,
    rockstar: Option<Arc<dyn RockstarHandler>>,
}

impl HaloCatalogBuilder {
    pub fn registries(mut self, registries: Arc<Registries>) -> Self {
        self.registries = Some(registries);
        self
    }

    pub fn halos(mut self, halos: Arc<dyn DataSource>) -> Self {
        self.halos = Some(halos);
        self
    }

    pub fn data(mut self, data: Arc<dyn DataSource>) -> Self {
        self.data = Some(DatasetSeries::single(data));
        self
    }

    pub fn data_series(mut self, series: DatasetSeries) -> Self {
        self.data = Some(series);
        self
    }

    pub fn finder(mut self, method: impl Into<String>, args: OperatorArgs) -> Self {
        self.finder_method = Some(method.into());
        self.finder_args = args;
        self
    }

    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn halo_field_type(mut self, field_type: impl Into<String>) -> Self {
        self.halo_field_type = Some(field_type.into());
        self
    }

    pub fn rockstar_handler(mut self, handler: Arc<dyn RockstarHandler>) -> Self {
        self.rockstar = Some(handler);
        self
    }

    pub fn build(self) -> HaloResult<HaloCatalog> {
        if self.halos.is_none() {
            if self.data.as_ref().is_none_or(DatasetSeries::is_empty) {
                return Err(HaloError::configuration(
                    "CONFIG.CATALOG_SOURCE",
                    "Must specify a halos_ds, data_ds, or both.",
                ));
            }
            if self.finder_method.is_none() {
                return Err(HaloError::configuration(
                    "CONFIG.CATALOG_SOURCE",
                    "Must specify a halos_ds or a finder_method.",
                ));
            }
        }

        let registries = self.registries.unwrap_or_else(|| Registries::with_builtins().shared());
        let finder_args = self.finder_args;
        let finder = self
            .finder_method
            .map(|name| registries.finding_methods.find(&name, finder_args))
            .transpose()?;
        let output_dir = self.output_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_DIR));
        let field_type = self
            .halo_field_type
            .unwrap_or_else(|| DEFAULT_HALO_FIELD_TYPE.to_string());
        let mut pipeline = AnalysisPipeline::new(registries, output_dir).with_halo_field_type(field_type);

        if let Some(halos) = &self.halos {
            add_default_quantities(&mut pipeline, halos.as_ref());
        }
        Ok(HaloCatalog {
            pipeline,
            halos: self.halos,
            data: self.data.unwrap_or_default(),
            finder,
            rockstar: self.rockstar,
        })
    }
}

fn add_default_quantities(pipeline: &mut AnalysisPipeline, halos: &dyn DataSource) {
    let field_type = pipeline.halo_field_type().to_string();
    for field in default_halo_fields() {
        if !halos.has_field(&FieldKey::new(field_type.as_str(), field)) {
            warn!("Halo dataset {} has no field ({field_type}, {field}).", halos.name());
            continue;
        }
        pipeline.add_field_quantity(field, Some(&field_type));
    }
}

/// Halo dataset plus optional simulation data, or a finder that builds the former.
pub struct HaloCatalog {
    pipeline: AnalysisPipeline,
    halos: Option<Arc<dyn DataSource>>,
    data: DatasetSeries,
    finder: Option<BoundOperator<FindingMethodFn>>,
    rockstar: Option<Arc<dyn RockstarHandler>>,
}

impl HaloCatalog {
    pub fn builder() -> HaloCatalogBuilder {
        HaloCatalogBuilder::default()
    }

    pub fn halos(&self) -> Option<&Arc<dyn DataSource>> {
        self.halos.as_ref()
    }

    pub fn data(&self) -> &DatasetSeries {
        &self.data
    }

    pub fn finder_name(&self) -> Option<&str> {
        self.finder.as_ref().map(|finder| finder.name.as_str())
    }

    /// Runs the pipeline and writes the catalog, or runs the finder when no
    /// halo dataset is bound. Collective.
    pub fn create(&mut self, comm: &dyn Communicator, njobs: Jobs, dynamic: bool) -> HaloResult<CatalogRun> {
        self.run(comm, RunOptions::create().with_jobs(njobs, dynamic))
    }

    /// Runs the pipeline keeping every surviving target in memory. Collective.
    pub fn load(&mut self, comm: &dyn Communicator, njobs: Jobs, dynamic: bool) -> HaloResult<CatalogRun> {
        self.run(comm, RunOptions::load().with_jobs(njobs, dynamic))
    }

    pub fn run(&mut self, comm: &dyn Communicator, options: RunOptions) -> HaloResult<CatalogRun> {
        let outcome = agree(comm, self.run_inner(comm, options));
        comm.barrier();
        outcome
    }

    fn run_inner(&mut self, comm: &dyn Communicator, options: RunOptions) -> HaloResult<CatalogRun> {
        let Some(halos) = self.halos.clone() else {
            let finder = self.finder.as_ref().ok_or_else(|| {
                HaloError::internal("RUN.CATALOG_FINDER", "catalog has neither halos nor a finder")
            })?;
            info!(method = %finder.name, datasets = self.data.len(), "running halo finder");
            let context = FindingContext {
                series: &self.data,
                comm,
                output_dir: self.pipeline.output_root(),
                rockstar: self.rockstar.as_deref(),
            };
            (finder.function)(&context, &finder.args)?;
            return Ok(CatalogRun::default());
        };
        let data = self.data.get(0).cloned();
        self.pipeline
            .run(halos.as_ref(), data.as_deref(), comm, options)
    }
}

impl Deref for HaloCatalog {
    type Target = AnalysisPipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl DerefMut for HaloCatalog {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::{HaloCatalog, default_halo_fields};
    use crate::analysis::operators::OperatorArgs;
    use crate::common::config::Jobs;
    use crate::data::{DataSource, InMemoryDataset, ParticleSnapshot, load_catalog_series};
    use crate::domain::{DomainGeometry, FieldKey, HaloErrorCategory};
    use crate::parallel::SerialCommunicator;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn halos() -> Arc<dyn DataSource> {
        let mut dataset = InMemoryDataset::new("halos_0005.0", DomainGeometry::unit_box());
        for (name, units) in [
            ("particle_identifier", None),
            ("particle_mass", Some("Msun")),
            ("particle_position_x", Some("unitary")),
            ("particle_position_y", Some("unitary")),
            ("particle_position_z", Some("unitary")),
        ] {
            dataset
                .insert_values(FieldKey::new("halos", name), vec![0.0, 1.0, 2.0], units)
                .expect("column should insert");
        }
        Arc::new(dataset)
    }

    fn particles() -> Arc<dyn DataSource> {
        let positions = (0..40)
            .map(|i| {
                let t = i as f64;
                [0.5 + 0.003 * (t * 0.7).sin(), 0.5 + 0.003 * t.cos(), 0.5 + 0.003 * (t * 1.7).sin()]
            })
            .collect();
        Arc::new(
            ParticleSnapshot::new("DD0040", DomainGeometry::unit_box(), positions)
                .into_dataset()
                .expect("snapshot should build"),
        )
    }

    #[test]
    fn sources_are_validated_when_built() {
        let error = HaloCatalog::builder().build().err().expect("nothing bound");
        assert_eq!(error.category(), HaloErrorCategory::Configuration);
        assert_eq!(error.message(), "Must specify a halos_ds, data_ds, or both.");

        let error = HaloCatalog::builder().data(particles()).build().err().expect("no finder");
        assert_eq!(error.message(), "Must specify a halos_ds or a finder_method.");

        let error = HaloCatalog::builder()
            .data(particles())
            .finder("subfind", OperatorArgs::new())
            .build()
            .err()
            .expect("unknown finder");
        assert_eq!(error.category(), HaloErrorCategory::Lookup);
    }

    #[test]
    fn default_quantities_skip_missing_fields() {
        let catalog = HaloCatalog::builder()
            .halos(halos())
            .output_dir("unused")
            .build()
            .expect("catalog should build");
        assert_eq!(default_halo_fields().len(), 9);
        assert_eq!(
            catalog.quantity_keys(),
            &[
                "particle_identifier",
                "particle_mass",
                "particle_position_x",
                "particle_position_y",
                "particle_position_z",
            ]
        );
    }

    #[test]
    fn finder_catalog_feeds_a_second_catalog() {
        let output = TempDir::new().expect("tempdir should be created");
        let mut finder = HaloCatalog::builder()
            .data(particles())
            .finder("fof", OperatorArgs::new().kwarg("link", -0.02))
            .output_dir(output.path())
            .build()
            .expect("finder catalog should build");
        assert_eq!(finder.finder_name(), Some("fof"));
        let run = finder
            .create(&SerialCommunicator, Jobs::Auto, false)
            .expect("finder should run");
        assert!(run.is_empty());

        let found = load_catalog_series(&output.path().join("DD0040"), "DD0040")
            .expect("finder catalog should reload");
        let mut analysis = HaloCatalog::builder()
            .halos(Arc::new(found))
            .data(particles())
            .output_dir(output.path().join("analysis"))
            .build()
            .expect("analysis catalog should build");
        analysis
            .add_filter(
                "quantity_value",
                OperatorArgs::new().arg("particle_identifier").arg(">=").arg(0.0).arg(""),
            )
            .expect("filter should resolve");
        let run = analysis
            .load(&SerialCommunicator, Jobs::Auto, false)
            .expect("analysis should run");
        assert_eq!(run.len(), 1);
        assert!(run.output_path.is_none());
        assert_eq!(run.targets[0].identifier(), 0);
    }
}
