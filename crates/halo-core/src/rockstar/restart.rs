use crate::domain::HaloError;
use std::path::{Path, PathBuf};

pub const RESTART_FILE: &str = "restart.cfg";
pub const DATASETS_FILE: &str = "datasets.txt";

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("restart file {} not found", path.display())]
    Missing { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{key} in {} is not an integer: '{value}'", path.display())]
    Malformed {
        path: PathBuf,
        key: &'static str,
        value: String,
    },
    #[error("{key} is missing from {}", path.display())]
    MissingKey { path: PathBuf, key: &'static str },
    #[error(
        "number of writers in restart has changed from the original run (OLD = {old}, NEW = {new}); choose the same number of writers"
    )]
    WriterMismatch { old: usize, new: usize },
}

impl From<RestartError> for HaloError {
    fn from(source: RestartError) -> Self {
        match source {
            RestartError::Missing { .. } | RestartError::Read { .. } => {
                HaloError::io_system("IO.RESTART", source.to_string())
            }
            RestartError::Malformed { .. } | RestartError::MissingKey { .. } => {
                HaloError::configuration("CONFIG.RESTART", source.to_string())
            }
            RestartError::WriterMismatch { .. } => {
                HaloError::configuration("CONFIG.RESTART_WRITERS", source.to_string())
            }
        }
    }
}

/// Progress recorded by an interrupted run in `<outbase>/restart.cfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartState {
    /// First snapshot that still has to be processed.
    pub restart_snap: usize,
    pub num_writers: usize,
}

impl RestartState {
    pub fn read(outbase: &Path) -> Result<Self, RestartError> {
        let path = outbase.join(RESTART_FILE);
        if !path.is_file() {
            return Err(RestartError::Missing { path });
        }
        let text = std::fs::read_to_string(&path).map_err(|source| RestartError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, &path)
    }

    /// Reads `KEY = value` lines; unrelated keys are ignored.
    pub fn parse(text: &str, path: &Path) -> Result<Self, RestartError> {
        let mut restart_snap = None;
        let mut num_writers = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let slot = match key.trim() {
                "RESTART_SNAP" => (&mut restart_snap, "RESTART_SNAP"),
                "NUM_WRITERS" => (&mut num_writers, "NUM_WRITERS"),
                _ => continue,
            };
            let parsed = value.trim().parse::<usize>().map_err(|_| RestartError::Malformed {
                path: path.to_path_buf(),
                key: slot.1,
                value: value.trim().to_string(),
            })?;
            *slot.0 = Some(parsed);
        }
        let missing = |key| RestartError::MissingKey {
            path: path.to_path_buf(),
            key,
        };
        Ok(Self {
            restart_snap: restart_snap.ok_or_else(|| missing("RESTART_SNAP"))?,
            num_writers: num_writers.ok_or_else(|| missing("NUM_WRITERS"))?,
        })
    }

    pub fn check_writers(&self, num_writers: usize) -> Result<(), RestartError> {
        if self.num_writers == num_writers {
            Ok(())
        } else {
            Err(RestartError::WriterMismatch {
                old: self.num_writers,
                new: num_writers,
            })
        }
    }
}

/// `datasets.txt` body: a header line, then `<name>\t<index>` per snapshot.
pub fn datasets_index(names: &[String]) -> String {
    let mut text = String::from("# dsname\tindex\n");
    for (index, name) in names.iter().enumerate() {
        text.push_str(&format!("{name}\t{index}\n"));
    }
    text
}
