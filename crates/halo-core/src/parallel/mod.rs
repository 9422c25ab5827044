//! Collective-operation runtime shared by the finders and the pipeline.
//!
//! Workers run SPMD-style: every rank executes the same code against its own
//! [`Communicator`] and synchronizes only through the collective calls below.
//! A collective must be entered by every rank of the group, in the same order.

mod decomposition;
mod scheduler;

pub use decomposition::{Subvolume, partition_domain};
pub use scheduler::{SchedulingStrategy, TargetAssignment, parallel_objects};

use crate::domain::{HaloError, HaloErrorCategory, HaloResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self);

    /// Every rank receives the payload supplied by `root`.
    fn broadcast_bytes(&self, root: usize, payload: Option<Vec<u8>>) -> Vec<u8>;

    /// Every rank receives all payloads ordered by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>>;

    /// Counter shared by every rank of the group, freshly zeroed per call.
    fn shared_counter(&self) -> Arc<AtomicUsize>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

pub fn broadcast<T>(comm: &dyn Communicator, root: usize, value: Option<&T>) -> HaloResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let payload = if comm.rank() == root {
        let value = value.ok_or_else(|| {
            HaloError::internal("SYS.BROADCAST", "broadcast root supplied no payload")
        })?;
        Some(serde_json::to_vec(value)?)
    } else {
        None
    };
    let bytes = comm.broadcast_bytes(root, payload);
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn all_gather<T>(comm: &dyn Communicator, value: &T) -> HaloResult<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let payload = serde_json::to_vec(value)?;
    comm.all_gather_bytes(payload)
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(HaloError::from))
        .collect()
}

pub fn all_reduce_sum(comm: &dyn Communicator, value: f64) -> HaloResult<f64> {
    Ok(all_gather(comm, &value)?.into_iter().sum())
}

pub fn all_reduce_sum_usize(comm: &dyn Communicator, value: usize) -> HaloResult<usize> {
    Ok(all_gather(comm, &value)?.into_iter().sum())
}

/// Placeholder of the error raised on ranks that did not fail themselves.
pub const PEER_FAILURE: &str = "SYS.PEER_FAILURE";

#[derive(Serialize, Deserialize)]
struct FailureReport {
    category: HaloErrorCategory,
    placeholder: String,
    message: String,
}

/// Collective: settles a per-rank outcome so every rank fails together.
///
/// A failing rank keeps its own error. The others return a [`PEER_FAILURE`]
/// error carrying the category and message of the lowest failing rank.
pub fn agree<T>(comm: &dyn Communicator, outcome: HaloResult<T>) -> HaloResult<T> {
    if comm.size() <= 1 {
        return outcome;
    }
    let report = outcome.as_ref().err().map(|error| FailureReport {
        category: error.category(),
        placeholder: error.placeholder().to_string(),
        message: error.message().to_string(),
    });
    let reports = all_gather(comm, &report)?;
    let value = outcome?;
    match reports
        .into_iter()
        .enumerate()
        .find_map(|(rank, report)| report.map(|report| (rank, report)))
    {
        Some((rank, report)) => Err(HaloError::new(
            report.category,
            PEER_FAILURE,
            format!("rank {rank} failed: [{}] {}", report.placeholder, report.message),
        )),
        None => Ok(value),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn broadcast_bytes(&self, _root: usize, payload: Option<Vec<u8>>) -> Vec<u8> {
        payload.unwrap_or_default()
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        vec![payload]
    }

    fn shared_counter(&self) -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }
}

struct GroupState {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
    counter: Mutex<Option<Arc<AtomicUsize>>>,
}

/// In-process worker group: one scoped thread per rank.
pub struct ThreadGroup {
    size: usize,
}

impl ThreadGroup {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Runs `worker` on every rank and returns the results ordered by rank.
    pub fn run<F, R>(&self, worker: F) -> Vec<R>
    where
        F: Fn(&dyn Communicator) -> R + Sync,
        R: Send,
    {
        let state = Arc::new(GroupState {
            barrier: Barrier::new(self.size),
            slots: Mutex::new(vec![Vec::new(); self.size]),
            counter: Mutex::new(None),
        });

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.size)
                .map(|rank| {
                    let comm = ThreadCommunicator {
                        rank,
                        size: self.size,
                        state: Arc::clone(&state),
                    };
                    let worker = &worker;
                    scope.spawn(move || worker(&comm))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    state: Arc<GroupState>,
}

impl ThreadCommunicator {
    fn slots(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.state
            .slots
            .lock()
            .expect("worker group exchange slots poisoned")
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.state.barrier.wait();
    }

    fn broadcast_bytes(&self, root: usize, payload: Option<Vec<u8>>) -> Vec<u8> {
        if self.rank == root {
            self.slots()[root] = payload.unwrap_or_default();
        }
        self.barrier();
        let received = self.slots()[root].clone();
        self.barrier();
        received
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Vec<Vec<u8>> {
        self.slots()[self.rank] = payload;
        self.barrier();
        let gathered = self.slots().clone();
        self.barrier();
        gathered
    }

    fn shared_counter(&self) -> Arc<AtomicUsize> {
        if self.rank == 0 {
            *self
                .state
                .counter
                .lock()
                .expect("worker group counter slot poisoned") =
                Some(Arc::new(AtomicUsize::new(0)));
        }
        self.barrier();
        let counter = self
            .state
            .counter
            .lock()
            .expect("worker group counter slot poisoned")
            .clone()
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)));
        self.barrier();
        counter
    }
}
