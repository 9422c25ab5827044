//! Ordered action chain applied to every row of a halo data source.

use super::operators::{BoundOperator, CallbackFn, FilterFn, OperatorArgs, QuantityFn, Registries};
use super::target::{Halo, TargetCache, TargetContext};
use crate::common::config::{ActionKindSpec, PipelineSpec, RunOptions};
use crate::data::{CatalogFile, DataSource, catalog_path, source_attributes, write_catalog};
use crate::domain::{FieldKey, HaloError, PipelineResult};
use crate::parallel::{Communicator, TargetAssignment, agree, broadcast, parallel_objects};
use crate::units::{Dimension, Quantity, Unit, UnitArray};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_ANALYSIS_DIR: &str = "analysis";

#[derive(Debug, Clone)]
pub enum QuantitySource {
    Operator(BoundOperator<QuantityFn>),
    /// Pulled from the halo data source's fetched chunk.
    Field(FieldKey),
}

#[derive(Debug, Clone)]
pub enum Action {
    Callback(BoundOperator<CallbackFn>),
    Filter(BoundOperator<FilterFn>),
    Quantity { key: String, source: QuantitySource },
}

/// Catalog name derived from a dataset name: everything before the first `.`.
pub fn output_basename(dataset_name: &str) -> String {
    let stem = dataset_name.split('.').next().unwrap_or_default();
    if stem.is_empty() {
        DEFAULT_ANALYSIS_DIR.to_string()
    } else {
        stem.to_string()
    }
}

/// Result of one pipeline run on this rank.
#[derive(Debug, Default)]
pub struct CatalogRun {
    /// Quantities of surviving targets, in base units.
    pub catalog: Vec<HashMap<String, Quantity>>,
    /// Surviving targets, kept only when `save_objects` is set.
    pub targets: Vec<Halo>,
    pub output_path: Option<PathBuf>,
}

impl CatalogRun {
    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Values of one quantity across the catalog.
    pub fn column(&self, key: &str) -> PipelineResult<UnitArray> {
        let values = self
            .catalog
            .iter()
            .map(|row| {
                row.get(key).ok_or_else(|| {
                    HaloError::lookup("LOOKUP.QUANTITY", format!("catalog has no {key} quantity"))
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        Ok(UnitArray::from_quantities(values)?)
    }
}

#[derive(Serialize, Deserialize)]
struct WireColumn {
    values: Vec<f64>,
    units: Option<(String, f64, Dimension)>,
}

impl WireColumn {
    fn from_array(array: UnitArray) -> Self {
        Self {
            units: array
                .units
                .map(|unit| (unit.symbol().to_string(), unit.cgs_factor(), unit.dimension())),
            values: array.values,
        }
    }

    fn into_array(self) -> UnitArray {
        let units = self
            .units
            .map(|(symbol, factor, dimension)| Unit::new(symbol, factor, dimension));
        UnitArray::new(self.values, units)
    }
}

/// Fields fetched by rank 0 for one chunk; a fetch error is shipped to every rank.
#[derive(Serialize, Deserialize)]
struct PulledChunk {
    columns: Vec<WireColumn>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    registries: Arc<Registries>,
    actions: Vec<Action>,
    quantity_keys: Vec<String>,
    field_quantities: Vec<FieldKey>,
    output_root: PathBuf,
    halo_field_type: String,
}

impl AnalysisPipeline {
    pub fn new(registries: Arc<Registries>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            registries,
            actions: Vec::new(),
            quantity_keys: Vec::new(),
            field_quantities: Vec::new(),
            output_root: output_root.into(),
            halo_field_type: "halos".to_string(),
        }
    }

    pub fn with_halo_field_type(mut self, field_type: impl Into<String>) -> Self {
        self.halo_field_type = field_type.into();
        self
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Catalog column order.
    pub fn quantity_keys(&self) -> &[String] {
        &self.quantity_keys
    }

    pub fn field_quantities(&self) -> &[FieldKey] {
        &self.field_quantities
    }

    pub fn halo_field_type(&self) -> &str {
        &self.halo_field_type
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// `<output root>/<basename of the halo dataset>`.
    pub fn output_dir(&self, dataset_name: &str) -> PathBuf {
        self.output_root.join(output_basename(dataset_name))
    }

    pub fn add_callback(&mut self, name: &str, args: OperatorArgs) -> PipelineResult<()> {
        let callback = self.registries.callbacks.find(name, args)?;
        self.actions.push(Action::Callback(callback));
        Ok(())
    }

    pub fn add_filter(&mut self, name: &str, args: OperatorArgs) -> PipelineResult<()> {
        let filter = self.registries.filters.find(name, args)?;
        self.actions.push(Action::Filter(filter));
        Ok(())
    }

    /// Adds the quantity operator registered as `key`, or a field pull when the
    /// `from_data_source` keyword is true (`field_type` defaults to the halo type).
    pub fn add_quantity(&mut self, key: &str, mut args: OperatorArgs) -> PipelineResult<()> {
        let from_data_source = matches!(args.take_keyword("from_data_source"), Some(Value::Bool(true)));
        let field_type = args.take_keyword("field_type");
        if from_data_source {
            let field_type = field_type.as_ref().and_then(Value::as_str);
            self.add_field_quantity(key, field_type);
            return Ok(());
        }
        self.add_operator_quantity(key, key, args)
    }

    /// Stores the result of quantity operator `operator` under `key`.
    pub fn add_operator_quantity(
        &mut self,
        key: &str,
        operator: &str,
        args: OperatorArgs,
    ) -> PipelineResult<()> {
        let quantity = self.registries.quantities.find(operator, args)?;
        self.push_quantity(key, QuantitySource::Operator(quantity));
        Ok(())
    }

    pub fn add_field_quantity(&mut self, key: &str, field_type: Option<&str>) {
        let field = FieldKey::new(field_type.unwrap_or(&self.halo_field_type), key);
        if !self.field_quantities.contains(&field) {
            self.field_quantities.push(field.clone());
        }
        self.push_quantity(key, QuantitySource::Field(field));
    }

    fn push_quantity(&mut self, key: &str, source: QuantitySource) {
        if !self.quantity_keys.iter().any(|existing| existing == key) {
            self.quantity_keys.push(key.to_string());
        }
        self.actions.push(Action::Quantity {
            key: key.to_string(),
            source,
        });
    }

    /// Expands the recipe into actions on this pipeline.
    pub fn add_recipe(&mut self, name: &str, args: OperatorArgs) -> PipelineResult<()> {
        let recipe = self.registries.recipes.find(name, args)?;
        (recipe.function)(self, &recipe.args)
    }

    pub fn apply_spec(&mut self, spec: &PipelineSpec) -> PipelineResult<()> {
        for action in &spec.actions {
            let args = OperatorArgs::from_parts(action.args.clone(), action.kwargs.clone());
            match action.kind {
                ActionKindSpec::Callback => self.add_callback(&action.name, args)?,
                ActionKindSpec::Filter => self.add_filter(&action.name, args)?,
                ActionKindSpec::Quantity => self.add_quantity(&action.name, args)?,
                ActionKindSpec::Recipe => self.add_recipe(&action.name, args)?,
            }
        }
        Ok(())
    }

    /// Creates callback `output_dir`s under the pipeline output directory and
    /// rebinds the argument to the created path. Running it twice is harmless.
    pub fn preprocess(&mut self, dataset_name: &str) -> PipelineResult<()> {
        let output_dir = self.output_dir(dataset_name);
        for action in &mut self.actions {
            let Action::Callback(callback) = action else {
                continue;
            };
            let Some(requested) = callback.args.keyword.get("output_dir").and_then(Value::as_str) else {
                continue;
            };
            let requested = PathBuf::from(requested);
            let target = if requested.starts_with(&output_dir) {
                requested
            } else {
                output_dir.join(requested)
            };
            std::fs::create_dir_all(&target).map_err(|source| {
                HaloError::io_system(
                    "IO.OUTPUT_DIR",
                    format!("failed to create '{}': {source}", target.display()),
                )
            })?;
            debug!(callback = %callback.name, path = %target.display(), "callback output directory ready");
            callback
                .args
                .set_keyword("output_dir", target.to_string_lossy().into_owned());
        }
        Ok(())
    }

    /// Runs the action chain over every halo row. Collective.
    pub fn run(
        &mut self,
        halos: &dyn DataSource,
        data: Option<&dyn DataSource>,
        comm: &dyn Communicator,
        options: RunOptions,
    ) -> PipelineResult<CatalogRun> {
        let prepared = self.preprocess(halos.name());
        agree(comm, prepared)?;

        let cache = TargetCache::new();
        let output_dir = self.output_dir(halos.name());
        let context = TargetContext::new(
            halos,
            data,
            &self.halo_field_type,
            &output_dir,
            comm.rank(),
            &cache,
        );
        let assignment = TargetAssignment::resolve(options.njobs, options.dynamic, comm.size());
        debug!(
            rank = comm.rank(),
            strategy = ?assignment.strategy,
            partitions = assignment.partitions,
            "scheduling halo targets"
        );

        let mut run = CatalogRun::default();
        for rows in halos.chunks(&self.halo_field_type) {
            let pulled = self.pull_fields(halos, comm, rows.clone())?;
            let visited = parallel_objects(comm, rows.len(), assignment, |local| {
                let Some(halo) = self.process_target(rows.start + local, local, &pulled, &context)? else {
                    return Ok(());
                };
                run.catalog.push(halo.quantities.clone());
                if options.save_objects {
                    run.targets.push(halo);
                }
                Ok(())
            });
            agree(comm, visited)?;
        }
        info!(rank = comm.rank(), kept = run.catalog.len(), "finished halo analysis");

        if options.save_output {
            let saved = self.save(halos, &run, comm.rank());
            run.output_path = Some(agree(comm, saved)?);
        }
        Ok(run)
    }

    /// Fetches the direct-pull fields for `rows` on rank 0 and broadcasts them.
    fn pull_fields(
        &self,
        halos: &dyn DataSource,
        comm: &dyn Communicator,
        rows: Range<usize>,
    ) -> PipelineResult<Vec<(FieldKey, UnitArray)>> {
        if self.field_quantities.is_empty() {
            return Ok(Vec::new());
        }
        let fetched = if comm.is_root() {
            let chunk = match halos.fields(&self.field_quantities, rows) {
                Ok(columns) => PulledChunk {
                    columns: columns.into_iter().map(WireColumn::from_array).collect(),
                    error: None,
                },
                Err(error) => PulledChunk {
                    columns: Vec::new(),
                    error: Some(error.to_string()),
                },
            };
            Some(chunk)
        } else {
            None
        };
        let chunk = if comm.size() > 1 {
            broadcast(comm, 0, fetched.as_ref())?
        } else {
            fetched.unwrap_or(PulledChunk {
                columns: Vec::new(),
                error: None,
            })
        };
        if let Some(message) = chunk.error {
            return Err(HaloError::lookup("LOOKUP.FIELD", message));
        }
        Ok(self
            .field_quantities
            .iter()
            .cloned()
            .zip(chunk.columns.into_iter().map(WireColumn::into_array))
            .collect())
    }

    /// Applies every action to one target; `None` when a filter rejects it.
    pub fn process_target(
        &self,
        index: usize,
        chunk_row: usize,
        pulled: &[(FieldKey, UnitArray)],
        context: &TargetContext<'_>,
    ) -> PipelineResult<Option<Halo>> {
        let mut halo = Halo::new(index);
        for action in &self.actions {
            match action {
                Action::Callback(callback) => (callback.function)(&mut halo, context, &callback.args)?,
                Action::Filter(filter) => {
                    if !(filter.function)(&halo, context, &filter.args)? {
                        debug!(index, filter = %filter.name, "target rejected");
                        return Ok(None);
                    }
                }
                Action::Quantity { key, source } => {
                    let value = match source {
                        QuantitySource::Operator(quantity) => {
                            (quantity.function)(&halo, context, &quantity.args)?
                        }
                        QuantitySource::Field(field) => pulled
                            .iter()
                            .find(|(key, _)| key == field)
                            .and_then(|(_, column)| column.get(chunk_row))
                            .ok_or_else(|| {
                                HaloError::internal(
                                    "RUN.FIELD_PULL",
                                    format!("field {field} was not fetched for row {index}"),
                                )
                            })?,
                    };
                    halo.set_quantity(key.clone(), value);
                }
            }
        }
        for quantity in halo.quantities.values_mut() {
            quantity.convert_to_base();
        }
        Ok(Some(halo))
    }

    fn save(&self, halos: &dyn DataSource, run: &CatalogRun, rank: usize) -> PipelineResult<PathBuf> {
        let basename = output_basename(halos.name());
        let path = catalog_path(&self.output_root.join(&basename), &basename, rank);
        let mut catalog = CatalogFile::new(run.len(), source_attributes(halos));
        if !run.is_empty() {
            for key in &self.quantity_keys {
                catalog.push_array(key.clone(), self.halo_field_type.clone(), &run.column(key)?);
            }
        }
        info!("Saving analysis ({} targets): {}.", run.len(), path.display());
        write_catalog(&path, &catalog)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, AnalysisPipeline, output_basename};
    use crate::analysis::operators::{FilterFn, OperatorArgs, QuantityFn, Registries};
    use crate::common::config::{Jobs, PipelineSpec, RunOptions};
    use crate::data::{DataSource, InMemoryDataset, load_catalog};
    use crate::domain::{DomainGeometry, FieldKey, HaloError, HaloErrorCategory};
    use crate::parallel::{PEER_FAILURE, SerialCommunicator, ThreadGroup};
    use crate::units::Quantity;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn halos(count: usize) -> InMemoryDataset {
        let mut dataset = InMemoryDataset::new("halos_0010.0", DomainGeometry::unit_box()).with_chunk_size(4);
        dataset
            .insert_values(
                FieldKey::new("halos", "particle_identifier"),
                (0..count).map(|i| i as f64).collect(),
                None,
            )
            .expect("ids should insert");
        dataset
            .insert_values(
                FieldKey::new("halos", "particle_mass"),
                (0..count).map(|i| (i as f64 + 1.0) * 1.0e12).collect(),
                Some("Msun"),
            )
            .expect("masses should insert");
        dataset
    }

    fn pipeline(registries: Registries, root: &TempDir) -> AnalysisPipeline {
        let mut pipeline = AnalysisPipeline::new(Arc::new(registries), root.path());
        pipeline.add_field_quantity("particle_identifier", None);
        pipeline.add_field_quantity("particle_mass", None);
        pipeline
    }

    #[test]
    fn basename_stops_at_first_dot() {
        assert_eq!(output_basename("halos_0010.0.json"), "halos_0010");
        assert_eq!(output_basename(""), "analysis");
    }

    #[test]
    fn unknown_operators_fail_when_added() {
        let root = TempDir::new().expect("tempdir should be created");
        let mut pipeline = pipeline(Registries::with_builtins(), &root);
        let error = pipeline
            .add_filter("no_such_filter", OperatorArgs::new())
            .expect_err("unknown filter should fail");
        assert_eq!(error.category(), HaloErrorCategory::Lookup);
        assert!(pipeline.add_callback("no_such_callback", OperatorArgs::new()).is_err());
        assert!(pipeline.add_recipe("no_such_recipe", OperatorArgs::new()).is_err());
        assert_eq!(pipeline.actions().len(), 2);
    }

    #[test]
    fn false_filter_short_circuits_later_actions() {
        let root = TempDir::new().expect("tempdir should be created");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registries = Registries::with_builtins();
        let counted = Arc::clone(&calls);
        let counter: QuantityFn = Arc::new(move |_, _, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Quantity::plain(1.0))
        });
        registries.quantities.register("counter", counter);

        let mut pipeline = pipeline(registries, &root);
        pipeline
            .add_filter(
                "quantity_value",
                OperatorArgs::new().arg("particle_mass").arg(">").arg(3.5e12).arg("Msun"),
            )
            .expect("filter should resolve");
        pipeline
            .add_quantity("counter", OperatorArgs::new())
            .expect("quantity should resolve");

        let run = pipeline
            .run(&halos(6), None, &SerialCommunicator, RunOptions::load())
            .expect("run should succeed");
        assert_eq!(run.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.targets.len(), 3);
        assert!(run.output_path.is_none());
        let ids = run.column("particle_identifier").expect("ids column");
        assert_eq!(ids.values, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn create_writes_a_reloadable_catalog_in_base_units() {
        let root = TempDir::new().expect("tempdir should be created");
        let mut pipeline = pipeline(Registries::with_builtins(), &root);
        let run = pipeline
            .run(&halos(5), None, &SerialCommunicator, RunOptions::create())
            .expect("run should succeed");
        let path = run.output_path.expect("catalog should be written");
        assert!(path.ends_with("halos_0010/halos_0010.0.json"));

        let reloaded = load_catalog(&path).expect("catalog should reload");
        let masses = reloaded
            .full_field(&FieldKey::new("halos", "particle_mass"))
            .expect("mass column");
        assert_eq!(masses.units.as_ref().map(|unit| unit.symbol()), Some("g"));
        assert_eq!(masses.len(), 5);
        assert_eq!(reloaded.attributes()["num_halos"], json!(5));
    }

    #[test]
    fn preprocess_rebinds_output_dir_once() {
        let root = TempDir::new().expect("tempdir should be created");
        let mut pipeline = pipeline(Registries::with_builtins(), &root);
        pipeline
            .add_callback("save_members", OperatorArgs::new().kwarg("output_dir", "members"))
            .expect("callback should resolve");
        pipeline.preprocess("halos_0010.0").expect("preprocess should succeed");
        pipeline.preprocess("halos_0010.0").expect("preprocess is idempotent");

        let expected = root.path().join("halos_0010").join("members");
        assert!(expected.is_dir());
        let Some(Action::Callback(callback)) = pipeline.actions().last() else {
            panic!("last action should be the callback");
        };
        assert_eq!(
            callback.args.keyword["output_dir"],
            json!(expected.to_string_lossy())
        );
    }

    #[test]
    fn spec_actions_and_recipes_expand_in_order() {
        let root = TempDir::new().expect("tempdir should be created");
        let mut pipeline = pipeline(Registries::with_builtins(), &root);
        let spec: PipelineSpec = serde_json::from_value(json!({
            "actions": [
                { "kind": "quantity", "name": "virial_radius", "kwargs": { "from_data_source": true } },
                { "kind": "recipe", "name": "calculate_virial_quantities", "args": [["radius"]] }
            ]
        }))
        .expect("spec should parse");
        pipeline.apply_spec(&spec).expect("spec should apply");
        assert_eq!(
            pipeline.quantity_keys(),
            &["particle_identifier", "particle_mass", "virial_radius", "radius_200"]
        );
        assert_eq!(pipeline.field_quantities().len(), 3);
    }

    #[test]
    fn parallel_runs_partition_targets_without_overlap() {
        let dataset = halos(11);
        for (workers, njobs, dynamic) in [(2, Jobs::Auto, false), (3, Jobs::Auto, false), (4, Jobs::Count(3), true)] {
            let root = TempDir::new().expect("tempdir should be created");
            let always: FilterFn = Arc::new(|_, _, _| Ok(true));
            let mut registries = Registries::with_builtins();
            registries.filters.register("always", always);
            let registries = Arc::new(registries);

            let per_rank = ThreadGroup::new(workers).run(|comm| {
                let mut pipeline = AnalysisPipeline::new(Arc::clone(&registries), root.path());
                pipeline.add_field_quantity("particle_identifier", None);
                pipeline
                    .add_filter("always", OperatorArgs::new())
                    .expect("filter should resolve");
                let run = pipeline
                    .run(&dataset, None, comm, RunOptions::create().with_jobs(njobs, dynamic))
                    .expect("run should succeed");
                run.column("particle_identifier")
                    .map(|column| column.values)
                    .unwrap_or_default()
            });
            let mut ids: Vec<f64> = per_rank.into_iter().flatten().collect();
            ids.sort_by(f64::total_cmp);
            assert_eq!(ids, (0..11).map(|i| i as f64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn failing_target_on_one_rank_fails_every_rank() {
        let dataset = halos(8);
        let failing: QuantityFn = Arc::new(|halo, _, _| {
            if halo.index == 0 {
                Err(HaloError::computation("RUN.TEST_QUANTITY", "first halo is broken"))
            } else {
                Ok(Quantity::plain(halo.index as f64))
            }
        });
        let mut registries = Registries::with_builtins();
        registries.quantities.register("fragile", failing);
        let registries = Arc::new(registries);

        for dynamic in [false, true] {
            let root = TempDir::new().expect("tempdir should be created");
            let per_rank = ThreadGroup::new(2).run(|comm| {
                let mut pipeline = AnalysisPipeline::new(Arc::clone(&registries), root.path());
                pipeline.add_field_quantity("particle_identifier", None);
                pipeline
                    .add_quantity("fragile", OperatorArgs::new())
                    .expect("quantity should resolve");
                pipeline.run(&dataset, None, comm, RunOptions::create().with_jobs(Jobs::Auto, dynamic))
            });
            let errors: Vec<HaloError> = per_rank
                .into_iter()
                .map(|result| result.expect_err("every rank should fail"))
                .collect();
            let (own, peers): (Vec<_>, Vec<_>) = errors
                .iter()
                .partition(|error| error.placeholder() == "RUN.TEST_QUANTITY");
            assert_eq!(own.len(), 1, "dynamic = {dynamic}");
            assert_eq!(peers[0].placeholder(), PEER_FAILURE);
            assert!(peers[0].message().contains("first halo is broken"));
            assert!(!root.path().join("halos_0010").join("halos_0010.0.json").exists());
        }
    }
}
