use super::Communicator;
use crate::common::config::Jobs;
use crate::domain::HaloResult;
use std::ops::Range;
use std::sync::atomic::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Contiguous slices handed out by rank.
    Static,
    /// Shared task counter; each idle worker claims the next target.
    Dynamic,
}

impl SchedulingStrategy {
    /// Worker counts that are odd and above two favour the task queue.
    pub const fn auto(workers: usize) -> Self {
        if workers > 2 && workers % 2 == 1 {
            Self::Dynamic
        } else {
            Self::Static
        }
    }
}

/// How the targets of one chunk are split over the worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetAssignment {
    pub strategy: SchedulingStrategy,
    /// Ranks at or above this index receive no targets.
    pub partitions: usize,
}

impl TargetAssignment {
    pub fn resolve(njobs: Jobs, dynamic: bool, workers: usize) -> Self {
        let workers = workers.max(1);
        match njobs {
            Jobs::Auto => Self {
                strategy: if dynamic {
                    SchedulingStrategy::Dynamic
                } else {
                    SchedulingStrategy::auto(workers)
                },
                partitions: workers,
            },
            Jobs::Count(count) => Self {
                strategy: if dynamic {
                    SchedulingStrategy::Dynamic
                } else {
                    SchedulingStrategy::Static
                },
                partitions: count.clamp(1, workers),
            },
        }
    }

    /// Contiguous slice of `0..count` owned by `rank` under static scheduling.
    pub fn static_range(&self, rank: usize, count: usize) -> Range<usize> {
        if rank >= self.partitions {
            return count..count;
        }
        let base = count / self.partitions;
        let extra = count % self.partitions;
        let start = rank * base + rank.min(extra);
        let len = base + usize::from(rank < extra);
        start..start + len
    }
}

/// Visits the indices `0..count` owned by this rank, in the order assigned.
///
/// Collective: every rank of the group must call it with the same `count`.
pub fn parallel_objects<F>(
    comm: &dyn Communicator,
    count: usize,
    assignment: TargetAssignment,
    mut visit: F,
) -> HaloResult<()>
where
    F: FnMut(usize) -> HaloResult<()>,
{
    let rank = comm.rank();
    match assignment.strategy {
        SchedulingStrategy::Static => {
            let range = assignment.static_range(rank, count);
            debug!(rank, start = range.start, end = range.end, "static target slice");
            range.into_iter().try_for_each(&mut visit)
        }
        SchedulingStrategy::Dynamic => {
            let counter = comm.shared_counter();
            if rank >= assignment.partitions {
                return Ok(());
            }
            loop {
                let next = counter.fetch_add(1, Ordering::SeqCst);
                if next >= count {
                    return Ok(());
                }
                visit(next)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SchedulingStrategy, TargetAssignment, parallel_objects};
    use crate::common::config::Jobs;
    use crate::parallel::{SerialCommunicator, ThreadGroup};

    #[test]
    fn auto_heuristic_prefers_queue_for_odd_groups() {
        for workers in [1, 2, 4, 6] {
            assert_eq!(SchedulingStrategy::auto(workers), SchedulingStrategy::Static);
        }
        for workers in [3, 5, 7] {
            assert_eq!(SchedulingStrategy::auto(workers), SchedulingStrategy::Dynamic);
        }
    }

    #[test]
    fn static_slices_cover_every_index_once() {
        let assignment = TargetAssignment::resolve(Jobs::Auto, false, 4);
        let mut seen = Vec::new();
        for rank in 0..4 {
            seen.extend(assignment.static_range(rank, 10));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(assignment.static_range(0, 10), 0..3);
        assert_eq!(assignment.static_range(3, 10), 8..10);
    }

    #[test]
    fn explicit_job_count_leaves_extra_ranks_idle() {
        let assignment = TargetAssignment::resolve(Jobs::Count(2), false, 4);
        assert_eq!(assignment.partitions, 2);
        assert!(assignment.static_range(2, 10).is_empty());
        assert!(assignment.static_range(3, 10).is_empty());

        let capped = TargetAssignment::resolve(Jobs::Count(16), true, 3);
        assert_eq!(capped.partitions, 3);
        assert_eq!(capped.strategy, SchedulingStrategy::Dynamic);
    }

    #[test]
    fn serial_visits_in_index_order() {
        let mut visited = Vec::new();
        let assignment = TargetAssignment::resolve(Jobs::Auto, false, 1);
        parallel_objects(&SerialCommunicator, 5, assignment, |index| {
            visited.push(index);
            Ok(())
        })
        .expect("serial visit should succeed");
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dynamic_queue_hands_out_each_target_once() {
        let assignment = TargetAssignment::resolve(Jobs::Auto, false, 3);
        assert_eq!(assignment.strategy, SchedulingStrategy::Dynamic);
        let per_rank = ThreadGroup::new(3).run(|comm| {
            let mut visited = Vec::new();
            parallel_objects(comm, 25, assignment, |index| {
                visited.push(index);
                Ok(())
            })
            .expect("dynamic visit should succeed");
            visited
        });
        let mut all: Vec<usize> = per_rank.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..25).collect::<Vec<_>>());
    }
}
