use crate::domain::DomainGeometry;

/// One worker's slab of the domain plus the padding it reads beyond it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Subvolume {
    pub left_edge: [f64; 3],
    pub right_edge: [f64; 3],
    pub padding: f64,
    /// Axes split across workers; halos there are clustered without wraparound.
    pub split: [bool; 3],
    domain: DomainGeometry,
}

impl Subvolume {
    pub fn whole(domain: DomainGeometry) -> Self {
        Self {
            left_edge: domain.left_edge,
            right_edge: domain.right_edge,
            padding: 0.0,
            split: [false; 3],
            domain,
        }
    }

    /// Whether `point` lies in the unpadded, half-open bounds.
    pub fn owns(&self, point: [f64; 3]) -> bool {
        let point = self.domain.wrap(point);
        (0..3).all(|axis| point[axis] >= self.left_edge[axis] && point[axis] < self.right_edge[axis])
    }

    /// Whether `point` lies within the padded bounds, accounting for wraparound.
    pub fn reads(&self, point: [f64; 3]) -> bool {
        self.localize(point).is_some()
    }

    /// Shifts `point` by whole domain widths so it lands inside the padded bounds.
    pub fn localize(&self, point: [f64; 3]) -> Option<[f64; 3]> {
        let width = self.domain.width();
        let mut local = point;
        for axis in 0..3 {
            if !self.split[axis] {
                continue;
            }
            let low = self.left_edge[axis] - self.padding;
            let high = self.right_edge[axis] + self.padding;
            let candidate = if self.domain.periodicity[axis] && width[axis] > 0.0 {
                low + (point[axis] - low).rem_euclid(width[axis])
            } else {
                point[axis]
            };
            if candidate < low || candidate > high {
                return None;
            }
            local[axis] = candidate;
        }
        Some(local)
    }

    /// Geometry used by the clustering kernels for this slab.
    pub fn clustering_geometry(&self) -> DomainGeometry {
        let mut geometry = self.domain;
        for axis in 0..3 {
            if self.split[axis] {
                geometry.left_edge[axis] = self.left_edge[axis] - self.padding;
                geometry.right_edge[axis] = self.right_edge[axis] + self.padding;
                geometry.periodicity[axis] = false;
            }
        }
        geometry
    }

    pub fn volume_fraction(&self) -> f64 {
        let width = self.domain.width();
        (0..3)
            .map(|axis| (self.right_edge[axis] - self.left_edge[axis]) / width[axis])
            .product()
    }
}

/// Splits the domain into `workers` slabs, padding each by `padding` (unit-box fraction).
pub fn partition_domain(domain: &DomainGeometry, workers: usize, padding: f64) -> Vec<Subvolume> {
    let cuts = factor_cuts(workers.max(1));
    let width = domain.width();
    let mut subvolumes = Vec::with_capacity(cuts.iter().product());
    for ix in 0..cuts[0] {
        for iy in 0..cuts[1] {
            for iz in 0..cuts[2] {
                let index = [ix, iy, iz];
                let mut left = domain.left_edge;
                let mut right = domain.right_edge;
                for axis in 0..3 {
                    let step = width[axis] / cuts[axis] as f64;
                    left[axis] = domain.left_edge[axis] + step * index[axis] as f64;
                    right[axis] = if index[axis] + 1 == cuts[axis] {
                        domain.right_edge[axis]
                    } else {
                        domain.left_edge[axis] + step * (index[axis] + 1) as f64
                    };
                }
                let split = std::array::from_fn(|axis| cuts[axis] > 1);
                let pad = padding * width.iter().copied().fold(0.0, f64::max);
                subvolumes.push(Subvolume {
                    left_edge: left,
                    right_edge: right,
                    padding: if split.iter().any(|s| *s) { pad } else { 0.0 },
                    split,
                    domain: *domain,
                });
            }
        }
    }
    subvolumes
}

/// Near-cubic factorization of the worker count, largest factor on x.
fn factor_cuts(workers: usize) -> [usize; 3] {
    let mut primes = Vec::new();
    let mut remaining = workers;
    let mut divisor = 2;
    while divisor * divisor <= remaining {
        while remaining % divisor == 0 {
            primes.push(divisor);
            remaining /= divisor;
        }
        divisor += 1;
    }
    if remaining > 1 {
        primes.push(remaining);
    }

    let mut cuts = [1_usize; 3];
    for prime in primes.into_iter().rev() {
        let smallest = (0..3).min_by_key(|axis| cuts[*axis]).unwrap_or(0);
        cuts[smallest] *= prime;
    }
    cuts.sort_unstable_by(|a, b| b.cmp(a));
    cuts
}
