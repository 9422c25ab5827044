//! Serde-backed settings for finders, pipeline runs and the Rockstar adapter.
//!
//! Every struct deserializes from partial JSON; omitted keys fall back to the
//! documented defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FofConfig {
    /// Positive: fraction of the mean interparticle spacing. Negative: absolute
    /// linking length in unit-box coordinates.
    pub link: f64,
    pub padding: f64,
    pub ptype: String,
    pub save_particles: bool,
}

impl Default for FofConfig {
    fn default() -> Self {
        Self {
            link: 0.2,
            padding: 0.02,
            ptype: "all".to_string(),
            save_particles: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HopConfig {
    pub threshold: f64,
    pub padding: f64,
    /// Total particle mass of the full volume in Msun, skips the all-reduce.
    pub total_mass: Option<f64>,
    pub ptype: String,
    pub save_particles: bool,
}

impl Default for HopConfig {
    fn default() -> Self {
        Self {
            threshold: 160.0,
            padding: 0.02,
            total_mass: None,
            ptype: "all".to_string(),
            save_particles: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RockstarConfig {
    pub num_readers: usize,
    pub num_writers: Option<usize>,
    pub outbase: Option<PathBuf>,
    pub particle_type: String,
    pub mass_field: String,
    pub star_types: Vec<i64>,
    /// Force resolution in Mpccm/h.
    pub force_res: Option<f64>,
    pub initial_metric_scaling: f64,
    pub non_dm_metric_scaling: f64,
    pub suppress_galaxies: i32,
    pub total_particles: Option<u64>,
    /// Particle mass in Msun/h used for the mean spacing.
    pub particle_mass: Option<f64>,
    pub min_halo_size: usize,
    pub restart: bool,
    /// Run every role inside the same worker group instead of dedicated pools.
    pub inline: bool,
    pub block_ratio: usize,
}

impl Default for RockstarConfig {
    fn default() -> Self {
        Self {
            num_readers: 1,
            num_writers: None,
            outbase: None,
            particle_type: "all".to_string(),
            mass_field: "particle_mass".to_string(),
            star_types: Vec::new(),
            force_res: None,
            initial_metric_scaling: 1.0,
            non_dm_metric_scaling: 10.0,
            suppress_galaxies: 1,
            total_particles: None,
            particle_mass: None,
            min_halo_size: 25,
            restart: false,
            inline: false,
            block_ratio: 1,
        }
    }
}

/// Number of partitions the halo targets are split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "JobsRepr", into = "JobsRepr")]
pub enum Jobs {
    /// One partition per worker; scheduling strategy picked from the worker count.
    #[default]
    Auto,
    Count(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum JobsRepr {
    Count(usize),
    Text(String),
}

impl TryFrom<JobsRepr> for Jobs {
    type Error = String;

    fn try_from(value: JobsRepr) -> Result<Self, Self::Error> {
        match value {
            JobsRepr::Count(count) => Ok(Self::Count(count)),
            JobsRepr::Text(text) => text.parse(),
        }
    }
}

impl From<Jobs> for JobsRepr {
    fn from(value: Jobs) -> Self {
        match value {
            Jobs::Auto => Self::Text("auto".to_string()),
            Jobs::Count(count) => Self::Count(count),
        }
    }
}

impl FromStr for Jobs {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match trimmed.parse::<usize>() {
            Ok(0) => Err("njobs must be 'auto' or a positive integer, got 0".to_string()),
            Ok(count) => Ok(Self::Count(count)),
            Err(_) => Err(format!(
                "njobs must be 'auto' or a positive integer, got '{trimmed}'"
            )),
        }
    }
}

impl Display for Jobs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Count(count) => write!(f, "{count}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub save_objects: bool,
    pub save_output: bool,
    pub njobs: Jobs,
    pub dynamic: bool,
}

impl RunOptions {
    /// Defaults used by `create`: keep nothing in memory, write the catalog.
    pub const fn create() -> Self {
        Self {
            save_objects: false,
            save_output: true,
            njobs: Jobs::Auto,
            dynamic: false,
        }
    }

    /// Defaults used by `load`: keep every target, write nothing.
    pub const fn load() -> Self {
        Self {
            save_objects: true,
            save_output: false,
            njobs: Jobs::Auto,
            dynamic: false,
        }
    }

    pub const fn with_jobs(mut self, njobs: Jobs, dynamic: bool) -> Self {
        self.njobs = njobs;
        self.dynamic = dynamic;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::create()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKindSpec {
    Callback,
    Filter,
    Quantity,
    Recipe,
}

/// One entry of a JSON pipeline description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKindSpec,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSpec {
    /// Root directory for catalogs and callback output.
    pub output_dir: Option<PathBuf>,
    pub halo_field_type: Option<String>,
    pub actions: Vec<ActionSpec>,
}
