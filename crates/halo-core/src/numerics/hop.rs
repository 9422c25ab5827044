use super::kdtree::KdTree;
use super::{ClusteringError, DisjointSet, check_positive, relabel_by_size};
use crate::domain::DomainGeometry;
use rayon::prelude::*;
use std::collections::HashMap;
use std::f64::consts::PI;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HopParams {
    /// Outer density threshold; particles below it belong to no group.
    pub threshold: f64,
    pub nsmooth: usize,
    pub nhop: usize,
    pub nmerge: usize,
    /// Boundary density above which two proper groups merge, relative to `threshold`.
    pub saddle_ratio: f64,
    /// Peak density a group needs to stand on its own, relative to `threshold`.
    pub peak_ratio: f64,
}

impl HopParams {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }
}

impl Default for HopParams {
    fn default() -> Self {
        Self {
            threshold: 160.0,
            nsmooth: 64,
            nhop: 16,
            nmerge: 4,
            saddle_ratio: 2.5,
            peak_ratio: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HopResult {
    pub densities: Vec<f64>,
    pub labels: Vec<i64>,
}

/// Cubic-spline kernel with compact support `2h`.
fn spline_kernel(r: f64, h: f64) -> f64 {
    let q = r / h;
    let norm = 1.0 / (PI * h * h * h);
    if q < 1.0 {
        norm * (1.0 - 1.5 * q * q + 0.75 * q * q * q)
    } else if q < 2.0 {
        norm * 0.25 * (2.0 - q).powi(3)
    } else {
        0.0
    }
}

/// Density-linked groups after Eisenstein & Hut.
///
/// Each particle above `threshold` hops to its densest neighbour until it
/// reaches a local peak. Peaks above `peak_ratio * threshold` whose groups
/// touch with boundary density above `saddle_ratio * threshold` are merged;
/// weaker peaks join the neighbour they share the densest boundary with, or
/// are dropped when that boundary falls below `threshold`.
pub fn hop(
    positions: &[[f64; 3]],
    masses: &[f64],
    geometry: &DomainGeometry,
    params: HopParams,
) -> Result<HopResult, ClusteringError> {
    if masses.len() != positions.len() {
        return Err(ClusteringError::LengthMismatch {
            field: "masses",
            expected: positions.len(),
            actual: masses.len(),
        });
    }
    check_positive("threshold", params.threshold)?;
    let count = positions.len();
    if count == 0 {
        return Ok(HopResult {
            densities: Vec::new(),
            labels: Vec::new(),
        });
    }

    let tree = KdTree::new(positions, *geometry);
    let nsmooth = params.nsmooth.clamp(1, count);
    let neighbours: Vec<Vec<(usize, f64)>> = positions
        .par_iter()
        .map(|point| tree.nearest(*point, nsmooth))
        .collect();

    let densities: Vec<f64> = neighbours
        .par_iter()
        .map(|list| {
            let reach = list.last().map_or(0.0, |(_, distance)| *distance);
            if reach <= 0.0 {
                return f64::INFINITY;
            }
            let h = 0.5 * reach;
            list.iter()
                .map(|(index, distance)| masses[*index] * spline_kernel(*distance, h))
                .sum()
        })
        .collect();

    let dense = |index: usize| densities[index] >= params.threshold;

    let nhop = params.nhop.clamp(1, nsmooth);
    let hop_target: Vec<usize> = (0..count)
        .into_par_iter()
        .map(|index| {
            neighbours[index][..nhop]
                .iter()
                .map(|(neighbour, _)| *neighbour)
                .filter(|neighbour| dense(*neighbour))
                .chain(std::iter::once(index))
                .max_by(|a, b| densities[*a].total_cmp(&densities[*b]).then(b.cmp(a)))
                .unwrap_or(index)
        })
        .collect();

    let mut peak_of = vec![None; count];
    for start in (0..count).filter(|index| dense(*index)) {
        let mut current = start;
        let mut steps = 0;
        while hop_target[current] != current && steps <= count {
            current = hop_target[current];
            steps += 1;
        }
        peak_of[start] = Some(current);
    }

    let nmerge = params.nmerge.clamp(1, nsmooth);
    let mut boundaries: HashMap<(usize, usize), f64> = HashMap::new();
    for index in (0..count).filter(|index| dense(*index)) {
        let Some(group) = peak_of[index] else { continue };
        for (neighbour, _) in &neighbours[index][..nmerge] {
            let Some(other) = peak_of[*neighbour] else { continue };
            if other == group {
                continue;
            }
            let pair = (group.min(other), group.max(other));
            let saddle = 0.5 * (densities[index] + densities[*neighbour]);
            let entry = boundaries.entry(pair).or_insert(f64::NEG_INFINITY);
            *entry = entry.max(saddle);
        }
    }

    let peak_density = params.peak_ratio * params.threshold;
    let saddle_density = params.saddle_ratio * params.threshold;
    let mut merged = DisjointSet::new(count);
    let mut proper: Vec<bool> = vec![false; count];
    for peak in peak_of.iter().flatten() {
        proper[*peak] = densities[*peak] >= peak_density;
    }
    for ((a, b), saddle) in &boundaries {
        if proper[*a] && proper[*b] && *saddle >= saddle_density {
            merged.union(*a, *b);
        }
    }

    let mut weak: Vec<usize> = peak_of
        .iter()
        .flatten()
        .copied()
        .filter(|peak| !proper[*peak])
        .collect();
    weak.sort_unstable();
    weak.dedup();
    weak.sort_by(|a, b| densities[*b].total_cmp(&densities[*a]));
    let mut dropped = vec![false; count];
    for (peak, partner) in settle_weak_peaks(&weak, &proper, &boundaries, params.threshold) {
        match partner {
            Some(other) => {
                merged.union(peak, other);
            }
            None => dropped[peak] = true,
        }
    }

    let keys: Vec<Option<usize>> = (0..count)
        .map(|index| {
            peak_of[index]
                .filter(|peak| !dropped[*peak])
                .map(|peak| merged.find(peak))
        })
        .collect();
    let labels = relabel_by_size(&keys);
    debug!(
        particles = count,
        groups = labels.iter().copied().max().map_or(0, |max| max + 1),
        "hop regrouping finished"
    );
    Ok(HopResult { densities, labels })
}

/// Fate of each weak peak: `Some(partner)` joins `partner`'s group, `None` drops it.
///
/// A weak peak follows its densest boundary to a peak that is not dropped and
/// joins once that neighbour is known to survive. Boundaries below `threshold`
/// drop it. Peaks left waiting on each other then join their densest
/// surviving neighbour above `threshold`, or are dropped.
fn settle_weak_peaks(
    weak: &[usize],
    proper: &[bool],
    boundaries: &HashMap<(usize, usize), f64>,
    threshold: f64,
) -> Vec<(usize, Option<usize>)> {
    let mut fate: HashMap<usize, Option<usize>> = HashMap::new();
    let survives = |peak: usize, fate: &HashMap<usize, Option<usize>>| {
        proper[peak] || matches!(fate.get(&peak), Some(Some(_)))
    };
    let densest = |peak: usize, keep: &dyn Fn(usize) -> bool| {
        boundaries
            .iter()
            .filter_map(|(&(a, b), &saddle)| match (a == peak, b == peak) {
                (true, _) => Some((b, saddle)),
                (_, true) => Some((a, saddle)),
                _ => None,
            })
            .filter(|(other, _)| keep(*other))
            .max_by(|x, y| x.1.total_cmp(&y.1).then(y.0.cmp(&x.0)))
    };

    loop {
        let mut changed = false;
        for &peak in weak {
            if fate.contains_key(&peak) {
                continue;
            }
            let best = densest(peak, &|other| fate.get(&other) != Some(&None));
            match best {
                Some((other, saddle)) if saddle >= threshold => {
                    if survives(other, &fate) {
                        fate.insert(peak, Some(other));
                        changed = true;
                    }
                }
                _ => {
                    fate.insert(peak, None);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    loop {
        let mut changed = false;
        for &peak in weak {
            if fate.contains_key(&peak) {
                continue;
            }
            let best = densest(peak, &|other| survives(other, &fate));
            if let Some((other, _)) = best.filter(|(_, saddle)| *saddle >= threshold) {
                fate.insert(peak, Some(other));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    weak.iter()
        .map(|peak| (*peak, fate.get(peak).copied().flatten()))
        .collect()
}
