use super::restart::{DATASETS_FILE, RestartState, datasets_index};
use super::{RockstarHandler, RockstarSetup};
use crate::common::config::RockstarConfig;
use crate::data::{DatasetSeries, PARTICLE_POSITION_FIELDS};
use crate::domain::{FieldKey, HaloError, HaloResult};
use crate::parallel::{Communicator, broadcast};
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_OUTBASE: &str = "rockstar_halos";
const ROCKSTAR_CITATION: &str = "http://adsabs.harvard.edu/abs/2013ApJ...762..109B";

/// Fraction of the mean interparticle spacing used when no force resolution is given.
const FORCE_RESOLUTION_FRACTION: f64 = 1.0 / 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Reader,
    Writer,
}

/// Assignment of workers to finder roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// A single worker runs the whole finder in-process.
    Serial,
    /// Every worker reads and writes; worker 0 also hosts the server.
    Inline { size: usize },
    /// Worker 0 is the server, then `num_readers` readers, then the writers.
    Standalone { num_readers: usize, num_writers: usize },
}

impl Topology {
    pub fn resolve(config: &RockstarConfig, size: usize) -> HaloResult<Self> {
        if size <= 1 {
            return Ok(Self::Serial);
        }
        if config.inline {
            return Ok(Self::Inline { size });
        }
        let num_readers = config.num_readers;
        let num_writers = match config.num_writers {
            Some(requested) => requested.min(size),
            None => size.saturating_sub(num_readers + 1),
        };
        if num_readers + num_writers + 1 != size {
            return Err(HaloError::configuration(
                "CONFIG.ROCKSTAR_TOPOLOGY",
                format!(
                    "the number of workers ({size}) does not equal the number of readers \
                     ({num_readers}) plus the number of writers ({num_writers}) plus 1 server"
                ),
            ));
        }
        Ok(Self::Standalone {
            num_readers,
            num_writers,
        })
    }

    pub const fn num_readers(&self) -> usize {
        match *self {
            Self::Serial => 1,
            Self::Inline { size } => size,
            Self::Standalone { num_readers, .. } => num_readers,
        }
    }

    pub const fn num_writers(&self) -> usize {
        match *self {
            Self::Serial => 1,
            Self::Inline { size } => size,
            Self::Standalone { num_writers, .. } => num_writers,
        }
    }

    /// Worker that computes the setup parameters.
    pub const fn first_reader(&self) -> usize {
        match self {
            Self::Serial | Self::Inline { .. } => 0,
            Self::Standalone { .. } => 1,
        }
    }

    /// Roles started by `rank`, in start order.
    pub fn roles(&self, rank: usize) -> Vec<Role> {
        match *self {
            Self::Serial => vec![Role::Server, Role::Writer, Role::Reader],
            Self::Inline { .. } if rank == 0 => vec![Role::Server, Role::Writer, Role::Reader],
            Self::Inline { .. } => vec![Role::Writer, Role::Reader],
            Self::Standalone { .. } if rank == 0 => vec![Role::Server],
            Self::Standalone { num_readers, .. } if rank <= num_readers => vec![Role::Reader],
            Self::Standalone { .. } => vec![Role::Writer],
        }
    }
}

/// Staggered start delays so clients connect after the server listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    /// Added per rank for inline roles.
    pub per_rank: Duration,
}

impl Backoff {
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            per_rank: Duration::ZERO,
        }
    }

    pub fn delay(&self, topology: Topology, role: Role, rank: usize) -> Duration {
        match (topology, role) {
            (_, Role::Server) => Duration::ZERO,
            (Topology::Standalone { .. }, Role::Reader) => self.base,
            (Topology::Standalone { .. }, Role::Writer) => self.base * 2,
            _ => self.base + self.per_rank * rank as u32,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            per_rank: Duration::from_millis(100),
        }
    }
}

/// Values the first reader derives from the first snapshot, shared with every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupParameters {
    pub total_particles: u64,
    /// Msun/h.
    pub particle_mass: f64,
    /// Mpccm/h.
    pub left_edge: [f64; 3],
    pub right_edge: [f64; 3],
    pub center: [f64; 3],
    /// Mpccm/h.
    pub force_res: f64,
}

impl SetupParameters {
    pub fn compute(series: &DatasetSeries, config: &RockstarConfig) -> HaloResult<Self> {
        let first = series.get(0).ok_or_else(empty_series)?;
        let ptype = config.particle_type.as_str();
        let position_key = FieldKey::new(ptype, PARTICLE_POSITION_FIELDS[0]);
        if !first.has_field(&position_key) {
            return Err(HaloError::lookup(
                "LOOKUP.PARTICLE_TYPE",
                format!("particle type {ptype} not found in '{}'", first.name()),
            ));
        }

        let registry = first.unit_registry();
        let msun_h = registry.unit("Msun/h")?;
        let particle_mass = match config.particle_mass {
            Some(mass) => mass,
            None => {
                let masses = first
                    .full_field(&FieldKey::new(ptype, config.mass_field.as_str()))?
                    .in_units(&msun_h)?
                    .values;
                masses
                    .into_iter()
                    .filter(|mass| *mass > 0.0)
                    .reduce(f64::min)
                    .ok_or_else(|| {
                        HaloError::computation(
                            "RUN.PARTICLE_MASS",
                            format!("no particle in '{}' has a non-zero mass", first.name()),
                        )
                    })?
            }
        };
        let total_particles = match config.total_particles {
            Some(total) => total,
            None => {
                let total = first.row_count(ptype) as u64;
                info!("Total Particle Count: {total}.");
                total
            }
        };

        let to_mpccm_h = registry
            .unit("code_length")?
            .conversion_factor(&registry.unit("Mpccm/h")?)?;
        let geometry = first.geometry();
        let scaled = |edge: [f64; 3]| edge.map(|value| value * to_mpccm_h);
        let force_res = match config.force_res {
            Some(force_res) => force_res,
            None => default_force_resolution(series, total_particles)?,
        };
        Ok(Self {
            total_particles,
            particle_mass,
            left_edge: scaled(geometry.left_edge),
            right_edge: scaled(geometry.right_edge),
            center: scaled(geometry.center()),
            force_res,
        })
    }
}

/// Mean interparticle spacing of the last snapshot, scaled down, in Mpccm/h.
fn default_force_resolution(series: &DatasetSeries, total_particles: u64) -> HaloResult<f64> {
    let last = series.get(series.len().saturating_sub(1)).ok_or_else(empty_series)?;
    let registry = last.unit_registry();
    let to_mpccm_h = registry
        .unit("code_length")?
        .conversion_factor(&registry.unit("Mpccm/h")?)?;
    let width = last.geometry().width()[0] * to_mpccm_h;
    let spacing = width / (total_particles.max(1) as f64).cbrt();
    Ok(spacing * FORCE_RESOLUTION_FRACTION)
}

fn empty_series() -> HaloError {
    HaloError::configuration("CONFIG.DATASET_SERIES", "rockstar needs at least one dataset")
}

/// Address of the server picked by worker 0.
fn discover_server() -> HaloResult<(String, u16)> {
    let address = std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let listener = TcpListener::bind(("0.0.0.0", 0)).map_err(|source| {
        HaloError::io_system("IO.SERVER_PORT", format!("failed to reserve a port: {source}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|source| HaloError::io_system("IO.SERVER_PORT", source.to_string()))?
        .port();
    Ok((address, port))
}

/// Result computed on one worker and shared with the group, errors included.
fn share<T>(comm: &dyn Communicator, root: usize, compute: impl FnOnce() -> HaloResult<T>) -> HaloResult<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let outcome = (comm.rank() == root).then(|| compute().map_err(|error| error.to_string()));
    let shared: Result<T, String> = if comm.size() > 1 {
        broadcast(comm, root, outcome.as_ref())?
    } else {
        outcome.unwrap_or_else(|| Err("no worker computed the shared value".to_string()))
    };
    shared.map_err(|message| HaloError::coordination("SYS.SHARED_SETUP", message))
}

/// Rockstar run over a dataset series.
#[derive(Debug)]
pub struct RockstarFinder<'a> {
    series: &'a DatasetSeries,
    config: RockstarConfig,
    topology: Topology,
    outbase: PathBuf,
    parameters: SetupParameters,
    backoff: Backoff,
}

impl<'a> RockstarFinder<'a> {
    /// Resolves the topology and shares the setup parameters. Collective.
    pub fn new(
        series: &'a DatasetSeries,
        config: RockstarConfig,
        default_outbase: Option<&Path>,
        comm: &dyn Communicator,
    ) -> HaloResult<Self> {
        if comm.is_root() {
            info!("The citation for the Rockstar halo finder can be found at");
            info!("{ROCKSTAR_CITATION}");
        }
        if series.is_empty() {
            return Err(empty_series());
        }
        let topology = Topology::resolve(&config, comm.size())?;
        info!(
            "Rockstar is using {} readers and {} writers",
            topology.num_readers(),
            topology.num_writers()
        );
        let parameters = share(comm, topology.first_reader(), || {
            SetupParameters::compute(series, &config)
        })?;
        let outbase = config
            .outbase
            .clone()
            .or_else(|| default_outbase.map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTBASE));
        Ok(Self {
            series,
            config,
            topology,
            outbase,
            parameters,
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub const fn topology(&self) -> Topology {
        self.topology
    }

    pub fn parameters(&self) -> &SetupParameters {
        &self.parameters
    }

    pub fn outbase(&self) -> &Path {
        &self.outbase
    }

    /// Starts this worker's roles and waits for them. Collective.
    pub fn run(&self, comm: &dyn Communicator, handler: &dyn RockstarHandler) -> HaloResult<RockstarSetup> {
        if self.config.block_ratio != 1 {
            return Err(HaloError::configuration(
                "CONFIG.ROCKSTAR_BLOCK_RATIO",
                format!("block_ratio {} is not supported; use 1", self.config.block_ratio),
            ));
        }
        let (server_address, port) = share(comm, 0, discover_server)?;

        let restart_num = if self.config.restart {
            let state = RestartState::read(&self.outbase)?;
            state.check_writers(self.topology.num_writers())?;
            state.restart_snap.min(self.series.len())
        } else {
            0
        };
        let remaining = DatasetSeries::new(self.series.iter().skip(restart_num).cloned().collect());

        let setup = RockstarSetup {
            server_address,
            port,
            num_outputs: self.series.len(),
            restart_num,
            parallel: comm.size() > 1,
            num_readers: self.topology.num_readers(),
            num_writers: self.topology.num_writers(),
            block_ratio: self.config.block_ratio,
            outbase: self.outbase.clone(),
            particle_type: self.config.particle_type.clone(),
            mass_field: self.config.mass_field.clone(),
            star_types: self.config.star_types.clone(),
            initial_metric_scaling: self.config.initial_metric_scaling,
            non_dm_metric_scaling: self.config.non_dm_metric_scaling,
            suppress_galaxies: self.config.suppress_galaxies,
            min_halo_size: self.config.min_halo_size,
            parameters: self.parameters.clone(),
        };

        // Every worker waits here until the output directory exists.
        share(comm, 0, || {
            if !self.config.restart {
                self.prepare_outbase()?;
            }
            Ok(())
        })?;

        let outcome = if comm.size() == 1 {
            handler.run_serial(&setup, &remaining)
        } else {
            self.start_roles(comm.rank(), handler, &setup, &remaining)
        };
        comm.barrier();
        outcome?;
        info!(rank = comm.rank(), outbase = %self.outbase.display(), "rockstar run finished");
        Ok(setup)
    }

    fn prepare_outbase(&self) -> HaloResult<()> {
        let io_error = |source: std::io::Error| {
            HaloError::io_system(
                "IO.ROCKSTAR_OUTBASE",
                format!("failed to prepare '{}': {source}", self.outbase.display()),
            )
        };
        std::fs::create_dir_all(&self.outbase).map_err(io_error)?;
        std::fs::write(
            self.outbase.join(DATASETS_FILE),
            datasets_index(&self.series.names()),
        )
        .map_err(io_error)
    }

    fn start_roles(
        &self,
        rank: usize,
        handler: &dyn RockstarHandler,
        setup: &RockstarSetup,
        remaining: &DatasetSeries,
    ) -> HaloResult<()> {
        let roles = self.topology.roles(rank);
        debug!(rank, ?roles, "starting rockstar roles");
        let start = |role: Role| -> HaloResult<()> {
            thread::sleep(self.backoff.delay(self.topology, role, rank));
            match role {
                Role::Server => handler.start_server(setup),
                Role::Reader => handler.start_reader(setup, remaining),
                Role::Writer => handler.start_writer(setup),
            }
        };

        // Server and writer run beside the reader, which keeps the calling thread.
        let (background, foreground): (Vec<Role>, Vec<Role>) =
            roles.into_iter().partition(|role| *role != Role::Reader);
        thread::scope(|scope| {
            let handles: Vec<_> = background
                .into_iter()
                .map(|role| scope.spawn(move || start(role)))
                .collect();
            let mut outcome = foreground.into_iter().try_for_each(start);
            for handle in handles {
                let joined = match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                outcome = outcome.and(joined);
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, Role, RockstarFinder, SetupParameters, Topology};
    use crate::common::config::RockstarConfig;
    use crate::data::{DataSource, DatasetSeries, ParticleSnapshot};
    use crate::domain::{Cosmology, DomainGeometry, HaloErrorCategory, HaloResult};
    use crate::parallel::{SerialCommunicator, ThreadGroup};
    use crate::rockstar::{DATASETS_FILE, RESTART_FILE, RockstarHandler, RockstarSetup};
    use crate::units::CodeUnits;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<(Role, usize)>>,
        serial: Mutex<Vec<usize>>,
    }

    impl RecordingHandler {
        fn record(&self, role: Role, setup: &RockstarSetup) {
            self.calls
                .lock()
                .expect("calls lock")
                .push((role, setup.num_writers));
        }
    }

    impl RockstarHandler for RecordingHandler {
        fn start_server(&self, setup: &RockstarSetup) -> HaloResult<()> {
            self.record(Role::Server, setup);
            Ok(())
        }

        fn start_reader(&self, setup: &RockstarSetup, _series: &DatasetSeries) -> HaloResult<()> {
            self.record(Role::Reader, setup);
            Ok(())
        }

        fn start_writer(&self, setup: &RockstarSetup) -> HaloResult<()> {
            self.record(Role::Writer, setup);
            Ok(())
        }

        fn run_serial(&self, setup: &RockstarSetup, series: &DatasetSeries) -> HaloResult<()> {
            assert!(setup.outbase.join(DATASETS_FILE).is_file() || setup.restart_num > 0);
            self.serial.lock().expect("serial lock").push(series.len());
            Ok(())
        }
    }

    fn snapshot(name: &str) -> Arc<dyn DataSource> {
        let mut snapshot = ParticleSnapshot::new(
            name,
            DomainGeometry::unit_box(),
            (0..8).map(|i| [i as f64 / 8.0, 0.5, 0.5]).collect(),
        );
        snapshot.masses = vec![0.0, 2.0e43, 2.0e43, 4.0e43, 2.0e43, 2.0e43, 2.0e43, 2.0e43];
        snapshot.code_units = CodeUnits {
            length_cgs: 3.085_677_581_491_367e25,
            mass_cgs: 1.0,
            time_cgs: 1.0,
        };
        snapshot.cosmology = Some(Cosmology::default());
        Arc::new(snapshot.into_dataset().expect("snapshot should build"))
    }

    fn series() -> DatasetSeries {
        DatasetSeries::new(vec![snapshot("DD0000"), snapshot("DD0001"), snapshot("DD0002")])
    }

    #[test]
    fn standalone_topology_requires_matching_worker_counts() {
        let config = RockstarConfig::default();
        let topology = Topology::resolve(&config, 4).expect("defaults fill the group");
        assert_eq!(topology, Topology::Standalone { num_readers: 1, num_writers: 2 });
        assert_eq!(topology.roles(0), vec![Role::Server]);
        assert_eq!(topology.roles(1), vec![Role::Reader]);
        assert_eq!(topology.roles(3), vec![Role::Writer]);

        let config = RockstarConfig {
            num_writers: Some(3),
            ..RockstarConfig::default()
        };
        let error = Topology::resolve(&config, 4).expect_err("5 roles do not fit 4 workers");
        assert_eq!(error.category(), HaloErrorCategory::Configuration);

        let inline = RockstarConfig {
            inline: true,
            ..RockstarConfig::default()
        };
        let topology = Topology::resolve(&inline, 3).expect("inline always fits");
        assert_eq!((topology.num_readers(), topology.num_writers()), (3, 3));
        assert_eq!(topology.roles(2), vec![Role::Writer, Role::Reader]);
        assert_eq!(Topology::resolve(&config, 1).expect("serial"), Topology::Serial);
    }

    #[test]
    fn inline_backoff_grows_with_rank() {
        let backoff = Backoff::default();
        let inline = Topology::Inline { size: 4 };
        assert_eq!(backoff.delay(inline, Role::Reader, 0), Duration::from_millis(50));
        assert_eq!(backoff.delay(inline, Role::Writer, 2), Duration::from_millis(250));
        let standalone = Topology::Standalone { num_readers: 1, num_writers: 2 };
        assert_eq!(backoff.delay(standalone, Role::Writer, 3), Duration::from_millis(100));
        assert_eq!(backoff.delay(standalone, Role::Server, 0), Duration::ZERO);
    }

    #[test]
    fn setup_parameters_use_the_lightest_massive_particle() {
        let parameters = SetupParameters::compute(&series(), &RockstarConfig::default())
            .expect("setup should compute");
        assert_eq!(parameters.total_particles, 8);
        let expected_mass = 2.0e43 / 1.988_409_870_698_051e33 * 0.7;
        assert!((parameters.particle_mass - expected_mass).abs() <= 1.0e-9 * expected_mass);
        assert!((parameters.right_edge[0] - 7.0).abs() <= 1.0e-9);
        assert!((parameters.center[1] - 3.5).abs() <= 1.0e-9);
        assert!((parameters.force_res - 7.0 / 2.0 / 50.0).abs() <= 1.0e-9);

        let missing = RockstarConfig {
            particle_type: "stars".to_string(),
            ..RockstarConfig::default()
        };
        let error = SetupParameters::compute(&series(), &missing).expect_err("unknown type");
        assert_eq!(error.category(), HaloErrorCategory::Lookup);
    }

    #[test]
    fn serial_run_writes_the_dataset_index() {
        let output = TempDir::new().expect("tempdir should be created");
        let series = series();
        let handler = RecordingHandler::default();
        let finder = RockstarFinder::new(&series, RockstarConfig::default(), Some(output.path()), &SerialCommunicator)
            .expect("finder should set up");
        let setup = finder.run(&SerialCommunicator, &handler).expect("run should finish");
        assert_eq!(setup.num_outputs, 3);
        assert!(setup.port > 0);
        assert_eq!(*handler.serial.lock().expect("serial lock"), vec![3]);
        let index = std::fs::read_to_string(output.path().join(DATASETS_FILE)).expect("index");
        assert!(index.starts_with("# dsname\tindex\nDD0000\t0\n"));
    }

    #[test]
    fn restart_skips_processed_snapshots_and_checks_writers() {
        let output = TempDir::new().expect("tempdir should be created");
        std::fs::write(output.path().join(RESTART_FILE), "RESTART_SNAP = 2\nNUM_WRITERS = 1\n")
            .expect("restart file should be written");
        let series = series();
        let config = RockstarConfig {
            restart: true,
            ..RockstarConfig::default()
        };
        let handler = RecordingHandler::default();
        let finder = RockstarFinder::new(&series, config, Some(output.path()), &SerialCommunicator)
            .expect("finder should set up");
        let setup = finder.run(&SerialCommunicator, &handler).expect("restart should run");
        assert_eq!(setup.restart_num, 2);
        assert_eq!(*handler.serial.lock().expect("serial lock"), vec![1]);
        assert!(!output.path().join(DATASETS_FILE).exists());

        let empty = TempDir::new().expect("tempdir should be created");
        let config = RockstarConfig {
            restart: true,
            ..RockstarConfig::default()
        };
        let finder = RockstarFinder::new(&series, config, Some(empty.path()), &SerialCommunicator)
            .expect("finder should set up");
        let error = finder.run(&SerialCommunicator, &handler).expect_err("restart file is required");
        assert_eq!(error.category(), HaloErrorCategory::IoSystem);
    }

    #[test]
    fn standalone_group_starts_every_role_once() {
        let output = TempDir::new().expect("tempdir should be created");
        let series = series();
        let handler = RecordingHandler::default();
        let setups = ThreadGroup::new(4).run(|comm| {
            let finder = RockstarFinder::new(&series, RockstarConfig::default(), Some(output.path()), comm)
                .expect("finder should set up")
                .with_backoff(Backoff::none());
            finder.run(comm, &handler).expect("run should finish")
        });
        assert!(setups.iter().all(|setup| setup.port == setups[0].port));
        let mut roles: Vec<Role> = handler
            .calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(role, writers)| {
                assert_eq!(*writers, 2);
                *role
            })
            .collect();
        roles.sort_by_key(|role| *role as u8);
        assert_eq!(roles, vec![Role::Server, Role::Reader, Role::Writer, Role::Writer]);
    }

    #[test]
    fn inline_group_runs_a_writer_and_reader_everywhere() {
        let output = TempDir::new().expect("tempdir should be created");
        let series = series();
        let handler = RecordingHandler::default();
        let config = RockstarConfig {
            inline: true,
            ..RockstarConfig::default()
        };
        ThreadGroup::new(2).run(|comm| {
            RockstarFinder::new(&series, config.clone(), Some(output.path()), comm)
                .expect("finder should set up")
                .with_backoff(Backoff::none())
                .run(comm, &handler)
                .expect("run should finish")
        });
        let calls = handler.calls.lock().expect("calls lock");
        let count = |role: Role| calls.iter().filter(|(recorded, _)| *recorded == role).count();
        assert_eq!((count(Role::Server), count(Role::Reader), count(Role::Writer)), (1, 2, 2));
    }
}
