use super::CliError;
use anyhow::Context;
use halo_core::data::{DataSource, DatasetSeries, ParticleSnapshot, load_catalog, load_catalog_series};
use halo_core::domain::{HaloError, HaloResult};
use halo_core::parallel::{Communicator, PEER_FAILURE, SerialCommunicator, ThreadGroup};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub(super) fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A subscriber installed by an embedding process wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(super) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&text).map_err(|source| {
        CliError::Compute(HaloError::configuration(
            "CONFIG.JSON",
            format!("'{}' is not valid: {source}", path.display()),
        ))
    })
}

pub(super) fn load_snapshot_series(paths: &[impl AsRef<Path>]) -> HaloResult<DatasetSeries> {
    let datasets = paths
        .iter()
        .map(|path| {
            let dataset = ParticleSnapshot::from_path(path.as_ref())?.into_dataset()?;
            Ok(Arc::new(dataset) as Arc<dyn DataSource>)
        })
        .collect::<HaloResult<Vec<_>>>()?;
    Ok(DatasetSeries::new(datasets))
}

/// A catalog file, or a directory of `<dir name>.<rank>.json` files.
pub(super) fn load_halos(path: &Path) -> HaloResult<Arc<dyn DataSource>> {
    let dataset = if path.is_dir() {
        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        load_catalog_series(path, &basename)?
    } else {
        load_catalog(path)?
    };
    Ok(Arc::new(dataset))
}

/// Runs `worker` on `workers` ranks and returns every rank's result in rank order.
///
/// On failure the originating rank's error wins over the peer-failure errors
/// the other ranks report.
pub(super) fn run_workers<T, F>(workers: usize, worker: F) -> HaloResult<Vec<T>>
where
    F: Fn(&dyn Communicator) -> HaloResult<T> + Sync,
    T: Send,
{
    if workers <= 1 {
        return worker(&SerialCommunicator).map(|result| vec![result]);
    }
    let mut results = Vec::with_capacity(workers);
    let mut peer_failure = None;
    for outcome in ThreadGroup::new(workers).run(worker) {
        match outcome {
            Ok(result) => results.push(result),
            Err(error) if error.placeholder() == PEER_FAILURE => {
                peer_failure.get_or_insert(error);
            }
            Err(error) => return Err(error),
        }
    }
    match peer_failure {
        Some(error) => Err(error),
        None => Ok(results),
    }
}
