use super::kdtree::KdTree;
use super::{ClusteringError, DisjointSet, check_positive, relabel_by_size};
use crate::domain::DomainGeometry;
use rayon::prelude::*;
use tracing::debug;

/// Friends-of-friends labels: particles chained by separations `<= linking_length`
/// share a label. Every particle receives a label; isolated particles form
/// singleton groups. Labels are ordered by descending group size.
pub fn friends_of_friends(
    positions: &[[f64; 3]],
    geometry: &DomainGeometry,
    linking_length: f64,
) -> Result<Vec<i64>, ClusteringError> {
    check_positive("linking_length", linking_length)?;
    if positions.is_empty() {
        return Ok(Vec::new());
    }

    let tree = KdTree::new(positions, *geometry);
    let links: Vec<Vec<usize>> = positions
        .par_iter()
        .enumerate()
        .map(|(index, point)| {
            tree.within(*point, linking_length)
                .into_iter()
                .filter(|neighbour| *neighbour > index)
                .collect()
        })
        .collect();

    let mut groups = DisjointSet::new(positions.len());
    let mut pairs = 0_usize;
    for (index, neighbours) in links.iter().enumerate() {
        for neighbour in neighbours {
            groups.union(index, *neighbour);
            pairs += 1;
        }
    }
    debug!(particles = positions.len(), pairs, "friends-of-friends links");

    let roots: Vec<Option<usize>> = (0..positions.len())
        .map(|index| Some(groups.find(index)))
        .collect();
    Ok(relabel_by_size(&roots))
}
