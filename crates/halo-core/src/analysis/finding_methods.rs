//! Finding methods: run a finder over every dataset of a series and persist
//! one halo catalog per dataset.

use super::operators::{FindingContext, FindingMethodFn, OperatorArgs, OperatorRegistry};
use super::pipeline::output_basename;
use crate::common::config::{FofConfig, HopConfig, RockstarConfig};
use crate::data::{DataSource, catalog_path, source_attributes, write_catalog};
use crate::domain::{HaloError, HaloResult};
use crate::finding::{HaloList, fof_halo_list, hop_halo_list};
use crate::parallel::agree;
use crate::rockstar::RockstarFinder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub fn register(registry: &mut OperatorRegistry<FindingMethodFn>) {
    registry.register("fof", Arc::new(fof) as FindingMethodFn);
    registry.register("hop", Arc::new(hop) as FindingMethodFn);
    registry.register("rockstar", Arc::new(rockstar) as FindingMethodFn);
}

/// Finder settings from the keyword arguments; omitted keys keep their defaults.
fn finder_config<T: DeserializeOwned>(method: &str, args: &OperatorArgs) -> HaloResult<T> {
    serde_json::from_value(Value::Object(args.keyword.clone())).map_err(|source| {
        HaloError::configuration(
            "CONFIG.FINDER_ARGS",
            format!("invalid {method} arguments: {source}"),
        )
    })
}

fn fof(context: &FindingContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let config: FofConfig = finder_config("fof", args)?;
    for dataset in context.series.iter() {
        let list = fof_halo_list(dataset.as_ref(), context.comm, &config)?;
        agree(context.comm, save_halo_list(context, dataset.as_ref(), &list))?;
    }
    Ok(())
}

fn hop(context: &FindingContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let config: HopConfig = finder_config("hop", args)?;
    for dataset in context.series.iter() {
        let list = hop_halo_list(dataset.as_ref(), context.comm, &config)?;
        agree(context.comm, save_halo_list(context, dataset.as_ref(), &list))?;
    }
    Ok(())
}

/// Writes this worker's part of `list` to `<output_dir>/<basename>/<basename>.<rank>.json`.
pub fn save_halo_list(
    context: &FindingContext<'_>,
    dataset: &dyn DataSource,
    list: &HaloList,
) -> HaloResult<PathBuf> {
    let basename = output_basename(dataset.name());
    let path = catalog_path(&context.output_dir.join(&basename), &basename, context.comm.rank());
    let catalog = list.to_catalog(dataset.unit_registry(), source_attributes(dataset))?;
    info!("Saving {} halos: {}.", list.len(), path.display());
    write_catalog(&path, &catalog)?;
    Ok(path)
}

/// Runs the external Rockstar finder; its own output lands in `outbase`.
fn rockstar(context: &FindingContext<'_>, args: &OperatorArgs) -> HaloResult<()> {
    let config: RockstarConfig = finder_config("rockstar", args)?;
    let handler = context.rockstar.ok_or_else(|| {
        HaloError::configuration(
            "CONFIG.ROCKSTAR_HANDLER",
            "the rockstar finding method needs a Rockstar handler; none was supplied",
        )
    })?;
    let finder = RockstarFinder::new(context.series, config, Some(context.output_dir), context.comm)?;
    finder.run(context.comm, handler)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{fof, hop, rockstar};
    use crate::analysis::operators::{FindingContext, OperatorArgs};
    use crate::data::{DataSource, DatasetSeries, ParticleSnapshot, load_catalog_series};
    use crate::domain::{DomainGeometry, FieldKey, HaloErrorCategory};
    use crate::parallel::SerialCommunicator;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn snapshot(name: &str, center: f64) -> Arc<dyn DataSource> {
        let mut positions: Vec<[f64; 3]> = (0..60)
            .map(|i| {
                let t = i as f64;
                [
                    center + 0.004 * (t * 0.9).sin(),
                    center + 0.004 * (t * 1.3).cos(),
                    center + 0.004 * (t * 0.4).sin(),
                ]
            })
            .collect();
        positions.extend([[0.1, 0.8, 0.3], [0.8, 0.2, 0.9]]);
        Arc::new(
            ParticleSnapshot::new(name, DomainGeometry::unit_box(), positions)
                .into_dataset()
                .expect("snapshot should build"),
        )
    }

    #[test]
    fn fof_writes_one_catalog_per_dataset() {
        let output = TempDir::new().expect("tempdir should be created");
        let series = DatasetSeries::new(vec![snapshot("DD0001", 0.3), snapshot("DD0002.hdf5", 0.6)]);
        let context = FindingContext {
            series: &series,
            comm: &SerialCommunicator,
            output_dir: output.path(),
            rockstar: None,
        };
        fof(&context, &OperatorArgs::new().kwarg("link", -0.02)).expect("fof should run");

        for basename in ["DD0001", "DD0002"] {
            let catalog = load_catalog_series(&output.path().join(basename), basename)
                .expect("catalog should reload");
            let sizes = catalog
                .full_field(&FieldKey::new("halos", "particle_identifier"))
                .expect("ids");
            assert!(!sizes.is_empty());
        }
    }

    #[test]
    fn bad_arguments_and_missing_handler_are_configuration_errors() {
        let output = TempDir::new().expect("tempdir should be created");
        let series = DatasetSeries::single(snapshot("DD0001", 0.3));
        let context = FindingContext {
            series: &series,
            comm: &SerialCommunicator,
            output_dir: output.path(),
            rockstar: None,
        };
        let error = hop(&context, &OperatorArgs::new().kwarg("threshold", "high"))
            .expect_err("threshold must be numeric");
        assert_eq!(error.category(), HaloErrorCategory::Configuration);
        let error = rockstar(&context, &OperatorArgs::new()).expect_err("no handler");
        assert_eq!(error.category(), HaloErrorCategory::Configuration);
    }
}
