//! Clustering kernels and radial-profile math.
//!
//! Kernels are pure functions of particle arrays and parameters. Positions are
//! interpreted inside the supplied [`DomainGeometry`](crate::domain::DomainGeometry),
//! so periodic wraparound is handled by the geometry rather than by callers.

pub mod fof;
pub mod hop;
pub mod kdtree;
pub mod profile;

pub use fof::friends_of_friends;
pub use hop::{HopParams, HopResult, hop};
pub use kdtree::KdTree;
pub use profile::{RadialProfile, VirialInfo};

use crate::domain::HaloError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClusteringError {
    #[error("{field} has {actual} entries but {expected} particles were supplied")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} must be positive and finite, got {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

impl From<ClusteringError> for HaloError {
    fn from(source: ClusteringError) -> Self {
        HaloError::computation("RUN.CLUSTERING", source.to_string())
    }
}

pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<(), ClusteringError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ClusteringError::InvalidParameter { name, value })
    }
}

/// Union-find over particle indices with path halving.
#[derive(Debug, Clone)]
pub(crate) struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub(crate) fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) -> usize {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return root_a;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => {
                self.parent[root_a] = root_b;
                root_b
            }
            std::cmp::Ordering::Greater => {
                self.parent[root_b] = root_a;
                root_a
            }
            std::cmp::Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
                root_a
            }
        }
    }
}

/// Renumbers group keys to `0..G` by descending size; `None` maps to `-1`.
///
/// Ties keep the order in which groups first appear.
pub(crate) fn relabel_by_size(keys: &[Option<usize>]) -> Vec<i64> {
    let mut sizes: std::collections::HashMap<usize, (usize, usize)> = Default::default();
    for (position, key) in keys.iter().enumerate() {
        if let Some(key) = key {
            sizes.entry(*key).or_insert((0, position)).0 += 1;
        }
    }
    let mut ordered: Vec<(usize, usize, usize)> = sizes
        .into_iter()
        .map(|(key, (size, first))| (key, size, first))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    let labels: std::collections::HashMap<usize, i64> = ordered
        .iter()
        .enumerate()
        .map(|(label, (key, _, _))| (*key, label as i64))
        .collect();
    keys.iter()
        .map(|key| key.and_then(|key| labels.get(&key).copied()).unwrap_or(-1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{DisjointSet, relabel_by_size};

    #[test]
    fn disjoint_set_merges_transitively() {
        let mut set = DisjointSet::new(5);
        set.union(0, 1);
        set.union(3, 4);
        set.union(1, 4);
        assert_eq!(set.find(0), set.find(3));
        assert_ne!(set.find(0), set.find(2));
    }

    #[test]
    fn relabel_orders_groups_by_size() {
        let labels = relabel_by_size(&[Some(7), Some(3), None, Some(3), Some(9), Some(3)]);
        assert_eq!(labels, vec![1, 0, -1, 0, 2, 0]);
    }
}
