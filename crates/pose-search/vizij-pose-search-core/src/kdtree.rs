//! Static k-d tree over low-dimensional points with k-nearest-neighbour queries.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// Index of the point in build order.
    pub idx: usize,
    pub distance_sqr: f32,
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_sqr
            .total_cmp(&other.distance_sqr)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        dimension: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug)]
pub struct KdTree {
    dimensions: usize,
    points: Vec<f32>,
    /// Point indices, permuted so each leaf owns a contiguous run.
    order: Vec<usize>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl KdTree {
    /// Builds over row-major `points` (`num_points × dimensions`).
    pub fn build(points: &[f32], dimensions: usize, max_leaf_size: usize) -> Self {
        let num_points = if dimensions == 0 {
            0
        } else {
            points.len() / dimensions
        };
        let mut tree = Self {
            dimensions,
            points: points[..num_points * dimensions].to_vec(),
            order: (0..num_points).collect(),
            nodes: Vec::new(),
            root: None,
        };
        if num_points > 0 {
            tree.root = Some(tree.build_node(0, num_points, max_leaf_size.max(1)));
        }
        tree
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn point(&self, idx: usize) -> &[f32] {
        &self.points[idx * self.dimensions..(idx + 1) * self.dimensions]
    }

    fn build_node(&mut self, start: usize, end: usize, max_leaf_size: usize) -> usize {
        if end - start <= max_leaf_size {
            self.nodes.push(Node::Leaf { start, end });
            return self.nodes.len() - 1;
        }

        // split on the dimension of widest spread, at the median
        let dimension = (0..self.dimensions)
            .map(|d| {
                let (lo, hi) = self.order[start..end].iter().fold(
                    (f32::INFINITY, f32::NEG_INFINITY),
                    |(lo, hi), &idx| {
                        let v = self.points[idx * self.dimensions + d];
                        (lo.min(v), hi.max(v))
                    },
                );
                (d, hi - lo)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(d, _)| d)
            .unwrap_or(0);

        let mid = start + (end - start) / 2;
        let dims = self.dimensions;
        let points = &self.points;
        self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a * dims + dimension].total_cmp(&points[b * dims + dimension])
        });
        let value = self.points[self.order[mid] * dims + dimension];

        let left = self.build_node(start, mid, max_leaf_size);
        let right = self.build_node(mid, end, max_leaf_size);
        self.nodes.push(Node::Split {
            dimension,
            value,
            left,
            right,
        });
        self.nodes.len() - 1
    }

    /// The `k` nearest points to `query`, closest first.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 || query.len() != self.dimensions {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.search(root, query, k, &mut heap);
        heap.into_sorted_vec()
    }

    fn search(&self, node: usize, query: &[f32], k: usize, heap: &mut BinaryHeap<Neighbor>) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &idx in &self.order[start..end] {
                    let distance_sqr = self
                        .point(idx)
                        .iter()
                        .zip(query)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    heap.push(Neighbor { idx, distance_sqr });
                    if heap.len() > k {
                        heap.pop();
                    }
                }
            }
            Node::Split {
                dimension,
                value,
                left,
                right,
            } => {
                let delta = query[dimension] - value;
                let (near, far) = if delta < 0.0 { (left, right) } else { (right, left) };
                self.search(near, query, k, heap);
                let worst = heap.peek().map(|n| n.distance_sqr).unwrap_or(f32::INFINITY);
                if heap.len() < k || delta * delta <= worst {
                    self.search(far, query, k, heap);
                }
            }
        }
    }
}
