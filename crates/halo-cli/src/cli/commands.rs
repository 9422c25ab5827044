use super::CliError;
use super::helpers::{load_halos, load_snapshot_series, read_json, run_workers};
use clap::Args;
use halo_core::analysis::{CatalogRun, DEFAULT_CATALOG_DIR, HaloCatalog, OperatorArgs, output_basename};
use halo_core::common::config::{Jobs, PipelineSpec};
use halo_core::data::DataSource;
use halo_core::domain::{FieldKey, HaloError};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Args)]
pub(super) struct FindArgs {
    /// Particle snapshot JSON file; repeat for a time series
    #[arg(long = "snapshot", required = true, value_name = "FILE")]
    snapshots: Vec<PathBuf>,

    /// Finding method: fof, hop or rockstar
    #[arg(long, default_value = "fof")]
    method: String,

    /// JSON object of finder keyword arguments
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_CATALOG_DIR)]
    output_dir: PathBuf,

    /// Number of worker ranks
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

#[derive(Debug, Args)]
pub(super) struct AnalysisArgs {
    /// Halo catalog file, or a directory of per-rank catalog files
    #[arg(long, value_name = "PATH")]
    halos: PathBuf,

    /// Particle snapshot backing sphere and profile callbacks
    #[arg(long, value_name = "FILE")]
    data: Option<PathBuf>,

    /// JSON pipeline description
    #[arg(long, value_name = "FILE")]
    pipeline: Option<PathBuf>,

    /// Overrides the pipeline's output_dir
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Target partitions: auto or a positive integer
    #[arg(long, default_value = "auto")]
    njobs: Jobs,

    /// Hand out targets on demand instead of in contiguous per-rank slices
    #[arg(long)]
    dynamic: bool,
}

#[derive(Debug, Args)]
pub(super) struct InspectArgs {
    #[arg(long, value_name = "PATH")]
    catalog: PathBuf,
}

pub(super) fn run_find_command(args: FindArgs) -> Result<i32, CliError> {
    let keywords: Map<String, Value> = match &args.config {
        Some(path) => read_json(path)?,
        None => Map::new(),
    };
    let series = load_snapshot_series(&args.snapshots)?;
    let finder_args = OperatorArgs::from_parts(Vec::new(), keywords);

    run_workers(args.workers, |comm| {
        let mut catalog = HaloCatalog::builder()
            .data_series(series.clone())
            .finder(args.method.as_str(), finder_args.clone())
            .output_dir(&args.output_dir)
            .build()?;
        catalog.create(comm, Jobs::Auto, false)
    })?;

    let catalogs = series
        .names()
        .iter()
        .map(|name| args.output_dir.join(output_basename(name)))
        .collect::<Vec<_>>();
    info!(method = %args.method, catalogs = catalogs.len(), "halo finding complete");
    print_json(&json!({
        "method": args.method,
        "catalogs": catalogs,
    }))?;
    Ok(0)
}

pub(super) fn run_analysis_command(args: AnalysisArgs, load: bool) -> Result<i32, CliError> {
    let spec: PipelineSpec = match &args.pipeline {
        Some(path) => read_json(path)?,
        None => PipelineSpec::default(),
    };
    let halos = load_halos(&args.halos)?;
    let data = args
        .data
        .as_ref()
        .map(|path| load_snapshot_series(std::slice::from_ref(path)))
        .transpose()?;
    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| spec.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_DIR));

    let runs = run_workers(args.workers, |comm| {
        let mut builder = HaloCatalog::builder().halos(halos.clone()).output_dir(&output_dir);
        if let Some(series) = &data {
            builder = builder.data_series(series.clone());
        }
        if let Some(field_type) = &spec.halo_field_type {
            builder = builder.halo_field_type(field_type.as_str());
        }
        let mut catalog = builder.build()?;
        catalog.apply_spec(&spec)?;
        if load {
            catalog.load(comm, args.njobs, args.dynamic)
        } else {
            catalog.create(comm, args.njobs, args.dynamic)
        }
    })?;

    let summary = if load {
        json!({ "targets": runs.iter().flat_map(target_summary).collect::<Vec<_>>() })
    } else {
        let kept: usize = runs.iter().map(CatalogRun::len).sum();
        let output_paths = runs
            .iter()
            .filter_map(|run| run.output_path.clone())
            .collect::<Vec<_>>();
        info!(kept, ranks = runs.len(), "analysis complete");
        json!({ "kept": kept, "output_paths": output_paths })
    };
    print_json(&summary)?;
    Ok(0)
}

fn target_summary(run: &CatalogRun) -> Vec<Value> {
    run.targets
        .iter()
        .map(|halo| {
            let mut keys = halo.quantities.keys().collect::<Vec<_>>();
            keys.sort();
            let quantities = keys
                .into_iter()
                .map(|key| {
                    let quantity = &halo.quantities[key];
                    let units = quantity.units.as_ref().map(|unit| unit.symbol().to_string());
                    (key.clone(), json!({ "value": quantity.value, "units": units }))
                })
                .collect::<Map<_, _>>();
            json!({ "identifier": halo.identifier(), "quantities": quantities })
        })
        .collect()
}

pub(super) fn run_inspect_command(args: InspectArgs) -> Result<i32, CliError> {
    let catalog = load_halos(&args.catalog)?;
    let mut field_types = catalog
        .field_keys()
        .into_iter()
        .map(|key| key.field_type)
        .collect::<Vec<_>>();
    field_types.sort();
    field_types.dedup();
    let counts = field_types
        .iter()
        .map(|field_type| (field_type.clone(), json!(catalog.row_count(field_type))))
        .collect::<Map<_, _>>();
    let fields = catalog
        .field_keys()
        .iter()
        .map(FieldKey::to_string)
        .collect::<Vec<_>>();
    print_json(&json!({
        "name": catalog.name(),
        "num_halos": catalog.attributes().get("num_halos").cloned().unwrap_or(Value::Null),
        "rows": counts,
        "fields": fields,
    }))?;
    Ok(0)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(HaloError::from)?;
    println!("{text}");
    Ok(())
}
