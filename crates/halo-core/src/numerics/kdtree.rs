use crate::domain::DomainGeometry;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

const LEAF_SIZE: usize = 16;

#[derive(Debug, Clone)]
struct Node {
    start: usize,
    end: usize,
    lo: [f64; 3],
    hi: [f64; 3],
    children: Option<(usize, usize)>,
}

/// Static 3-d tree answering minimum-image queries inside a domain.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<[f64; 3]>,
    order: Vec<usize>,
    nodes: Vec<Node>,
    geometry: DomainGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance2: f64,
    index: usize,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance2
            .total_cmp(&other.distance2)
            .then(self.index.cmp(&other.index))
    }
}

impl KdTree {
    pub fn new(points: &[[f64; 3]], geometry: DomainGeometry) -> Self {
        let points: Vec<[f64; 3]> = points.iter().map(|p| geometry.wrap(*p)).collect();
        let mut tree = Self {
            order: (0..points.len()).collect(),
            points,
            nodes: Vec::new(),
            geometry,
        };
        if !tree.points.is_empty() {
            tree.build(0, tree.points.len());
        }
        tree
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub const fn geometry(&self) -> &DomainGeometry {
        &self.geometry
    }

    fn build(&mut self, start: usize, end: usize) -> usize {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for &index in &self.order[start..end] {
            for axis in 0..3 {
                lo[axis] = lo[axis].min(self.points[index][axis]);
                hi[axis] = hi[axis].max(self.points[index][axis]);
            }
        }
        let node_index = self.nodes.len();
        self.nodes.push(Node {
            start,
            end,
            lo,
            hi,
            children: None,
        });
        if end - start <= LEAF_SIZE {
            return node_index;
        }

        let axis = (0..3)
            .max_by(|a, b| (hi[*a] - lo[*a]).total_cmp(&(hi[*b] - lo[*b])))
            .unwrap_or(0);
        let mid = start + (end - start) / 2;
        let points = &self.points;
        self.order[start..end].select_nth_unstable_by(mid - start, |a, b| {
            points[*a][axis].total_cmp(&points[*b][axis])
        });
        let left = self.build(start, mid);
        let right = self.build(mid, end);
        self.nodes[node_index].children = Some((left, right));
        node_index
    }

    fn box_distance2(&self, point: [f64; 3], node: &Node) -> f64 {
        let width = self.geometry.width();
        (0..3)
            .map(|axis| {
                let gap = |x: f64| {
                    if x < node.lo[axis] {
                        node.lo[axis] - x
                    } else if x > node.hi[axis] {
                        x - node.hi[axis]
                    } else {
                        0.0
                    }
                };
                let mut d = gap(point[axis]);
                if self.geometry.periodicity[axis] && d > 0.0 {
                    d = d
                        .min(gap(point[axis] + width[axis]))
                        .min(gap(point[axis] - width[axis]));
                }
                d * d
            })
            .sum()
    }

    fn distance2(&self, a: [f64; 3], b: [f64; 3]) -> f64 {
        let [dx, dy, dz] = self.geometry.separation(a, b);
        dx * dx + dy * dy + dz * dz
    }

    /// Indices of all points within `radius` of `center`, unordered.
    pub fn within(&self, center: [f64; 3], radius: f64) -> Vec<usize> {
        let mut found = Vec::new();
        if self.nodes.is_empty() {
            return found;
        }
        let center = self.geometry.wrap(center);
        let radius2 = radius * radius;
        let mut stack = vec![0_usize];
        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index];
            if self.box_distance2(center, node) > radius2 {
                continue;
            }
            match node.children {
                Some((left, right)) => {
                    stack.push(left);
                    stack.push(right);
                }
                None => found.extend(
                    self.order[node.start..node.end]
                        .iter()
                        .copied()
                        .filter(|index| self.distance2(center, self.points[*index]) <= radius2),
                ),
            }
        }
        found
    }

    /// The `k` nearest points to `center` as `(index, distance)`, closest first.
    pub fn nearest(&self, center: [f64; 3], k: usize) -> Vec<(usize, f64)> {
        if self.nodes.is_empty() || k == 0 {
            return Vec::new();
        }
        let center = self.geometry.wrap(center);
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut stack = vec![0_usize];
        while let Some(node_index) = stack.pop() {
            let node = &self.nodes[node_index];
            let bound = self.box_distance2(center, node);
            if heap.len() == k && heap.peek().is_some_and(|worst| bound > worst.distance2) {
                continue;
            }
            match node.children {
                Some((left, right)) => {
                    let left_bound = self.box_distance2(center, &self.nodes[left]);
                    let right_bound = self.box_distance2(center, &self.nodes[right]);
                    if left_bound <= right_bound {
                        stack.push(right);
                        stack.push(left);
                    } else {
                        stack.push(left);
                        stack.push(right);
                    }
                }
                None => {
                    for &index in &self.order[node.start..node.end] {
                        let candidate = Candidate {
                            distance2: self.distance2(center, self.points[index]),
                            index,
                        };
                        if heap.len() < k {
                            heap.push(candidate);
                        } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                            heap.pop();
                            heap.push(candidate);
                        }
                    }
                }
            }
        }
        heap.into_sorted_vec()
            .into_iter()
            .map(|candidate| (candidate.index, candidate.distance2.sqrt()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::KdTree;
    use crate::domain::DomainGeometry;

    fn lattice(n: usize) -> Vec<[f64; 3]> {
        let step = 1.0 / n as f64;
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    points.push([
                        (i as f64 + 0.5) * step,
                        (j as f64 + 0.5) * step,
                        (k as f64 + 0.5) * step,
                    ]);
                }
            }
        }
        points
    }

    #[test]
    fn ball_query_matches_brute_force() {
        let points = lattice(6);
        let geometry = DomainGeometry::unit_box();
        let tree = KdTree::new(&points, geometry);
        let center = [0.02, 0.5, 0.97];
        let radius = 0.2;

        let mut expected: Vec<usize> = (0..points.len())
            .filter(|i| geometry.periodic_distance(center, points[*i]) <= radius)
            .collect();
        let mut found = tree.within(center, radius);
        expected.sort_unstable();
        found.sort_unstable();
        assert_eq!(found, expected);
    }

    #[test]
    fn nearest_wraps_across_boundaries() {
        let points = vec![[0.01, 0.5, 0.5], [0.6, 0.5, 0.5], [0.98, 0.5, 0.5]];
        let tree = KdTree::new(&points, DomainGeometry::unit_box());
        let nearest = tree.nearest([0.995, 0.5, 0.5], 2);
        assert_eq!(nearest[0].0, 2);
        assert_eq!(nearest[1].0, 0);
        assert!((nearest[1].1 - 0.015).abs() < 1.0e-12);
    }

    #[test]
    fn open_boundaries_do_not_wrap() {
        let mut geometry = DomainGeometry::unit_box();
        geometry.periodicity = [false; 3];
        let points = vec![[0.01, 0.5, 0.5], [0.99, 0.5, 0.5]];
        let tree = KdTree::new(&points, geometry);
        assert_eq!(tree.within([0.0, 0.5, 0.5], 0.05), vec![0]);
    }

    #[test]
    fn empty_tree_answers_nothing() {
        let tree = KdTree::new(&[], DomainGeometry::unit_box());
        assert!(tree.is_empty());
        assert!(tree.within([0.5; 3], 1.0).is_empty());
        assert!(tree.nearest([0.5; 3], 3).is_empty());
    }
}
