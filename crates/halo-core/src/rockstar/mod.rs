//! Coordination layer for an external, socket-driven Rockstar finder.
//!
//! The finder itself lives behind [`RockstarHandler`]. This module decides
//! which worker plays which role (server, reader, writer), computes the setup
//! parameters every role needs, and handles restart bookkeeping in the
//! output directory.

mod restart;
mod runner;

pub use restart::{DATASETS_FILE, RESTART_FILE, RestartError, RestartState, datasets_index};
pub use runner::{Backoff, Role, RockstarFinder, SetupParameters, Topology};

use crate::data::DatasetSeries;
use crate::domain::HaloResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the external finder is configured with before its roles start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RockstarSetup {
    pub server_address: String,
    pub port: u16,
    /// Snapshots in the full series, including ones skipped by a restart.
    pub num_outputs: usize,
    pub restart_num: usize,
    pub parallel: bool,
    pub num_readers: usize,
    pub num_writers: usize,
    pub block_ratio: usize,
    pub outbase: PathBuf,
    pub particle_type: String,
    pub mass_field: String,
    pub star_types: Vec<i64>,
    pub initial_metric_scaling: f64,
    pub non_dm_metric_scaling: f64,
    pub suppress_galaxies: i32,
    pub min_halo_size: usize,
    pub parameters: SetupParameters,
}

/// Entry points of the external finder, one per role.
pub trait RockstarHandler: Send + Sync {
    fn start_server(&self, setup: &RockstarSetup) -> HaloResult<()>;

    /// Streams particles of every remaining snapshot to the server.
    fn start_reader(&self, setup: &RockstarSetup, series: &DatasetSeries) -> HaloResult<()>;

    fn start_writer(&self, setup: &RockstarSetup) -> HaloResult<()>;

    /// Runs every role inside the calling worker.
    fn run_serial(&self, setup: &RockstarSetup, series: &DatasetSeries) -> HaloResult<()>;
}
