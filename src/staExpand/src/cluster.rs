
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::geometry::Point;


struct DisjointSet {
	parents: Vec<usize>,
	sizes: Vec<usize>
}

impl DisjointSet {

	fn new(n: usize) -> Self {
		Self {
			parents: (0 .. n).collect(),
			sizes: vec![1; n]
		}
	}

	fn find(&mut self, mut i: usize) -> usize {
		while self.parents[i] != i {
			self.parents[i] = self.parents[self.parents[i]];
			i = self.parents[i];
		}
		i
	}

	/// returns true if the two sets were separate
	fn union(&mut self, a: usize, b: usize) -> bool {
		let a = self.find(a);
		let b = self.find(b);
		if a == b {
			return false;
		}
		let (big, small) =
			if self.sizes[a] >= self.sizes[b] {
				(a, b)
			} else {
				(b, a)
			};
		self.parents[small] = big;
		self.sizes[big] += self.sizes[small];
		true
	}

	fn labels(mut self) -> Vec<usize> {
		let n = self.parents.len();
		let mut ids = HashMap::<usize,usize>::new();
		let mut labels = Vec::with_capacity(n);
		for i in 0 .. n {
			let root = self.find(i);
			let next = ids.len() + 1;
			labels.push(*ids.entry(root).or_insert(next));
		}
		labels
	}
}


type Cell = (i64, i64, i64);

fn cell_of(p: &Point, size: f64) -> Cell {
	(
		(p.x/size).floor() as i64,
		(p.y/size).floor() as i64,
		(p.z/size).floor() as i64
	)
}


/// Points merge when a chain of pairwise distances `<= threshold` connects them.
pub fn cluster_by_distance(points: &[Point], threshold: f64) -> Vec<usize> {

	let mut sets = DisjointSet::new(points.len());

	// bin the points so we only compare neighbors
	let cell_size =
		if threshold > 0.0 {
			threshold
		} else {
			1.0
		};
	let mut grid = HashMap::<Cell,Vec<usize>>::new();
	for (i, p) in points.iter().enumerate() {
		grid.entry(cell_of(p, cell_size))
			.or_default()
			.push(i);
	}

	for (i, p) in points.iter().enumerate() {
		let (cx, cy, cz) = cell_of(p, cell_size);
		for dz in -1 ..= 1 {
			for dy in -1 ..= 1 {
				for dx in -1 ..= 1 {
					let Some(neighbors) = grid.get(&(cx + dx, cy + dy, cz + dz))
						else { continue; };
					for &j in neighbors {
						if j > i && (points[j] - p).norm() <= threshold {
							sets.union(i, j);
						}
					}
				}
			}
		}
	}

	sets.labels()
}


/// Merges the nearest clusters until at most `max_clusters` remain.
/// This cuts the same single-linkage tree as `cluster_by_distance`, ties going to the lower point index.
/// Labels start at 1, numbered in order of each cluster's first point.
pub fn cluster_by_count(points: &[Point], max_clusters: usize) -> Vec<usize> {

	let n = points.len();
	let max_clusters = max_clusters.max(1);
	let mut sets = DisjointSet::new(n);
	if n <= max_clusters {
		return sets.labels();
	}

	// build the minimum spanning tree (Prim's), its edges are the single-linkage merges
	let mut in_tree = vec![false; n];
	let mut dist = vec![f64::INFINITY; n];
	let mut parent = vec![usize::MAX; n];
	let mut edges = Vec::<(f64, usize, usize)>::with_capacity(n - 1);
	dist[0] = 0.0;
	for _ in 0 .. n {

		let mut next = None::<usize>;
		for i in 0 .. n {
			if in_tree[i] {
				continue;
			}
			match next {
				Some(j) if dist[j] <= dist[i] => (),
				_ => next = Some(i)
			}
		}
		let Some(u) = next
			else { break; };

		in_tree[u] = true;
		if parent[u] != usize::MAX {
			edges.push((dist[u], parent[u].min(u), parent[u].max(u)));
		}

		for v in 0 .. n {
			if in_tree[v] {
				continue;
			}
			let d = (points[v] - points[u]).norm();
			if d < dist[v] {
				dist[v] = d;
				parent[v] = u;
			}
		}
	}

	edges.sort_by(|a, b| {
		a.0.total_cmp(&b.0)
			.then(a.1.cmp(&b.1))
			.then(a.2.cmp(&b.2))
	});

	let mut clusters = n;
	for (_, a, b) in edges {
		if clusters <= max_clusters {
			break;
		}
		if sets.union(a, b) {
			clusters -= 1;
		}
	}

	sets.labels()
}


/// Member indices of each cluster, the cluster with label `l` at position `l - 1`
pub fn groups(labels: &[usize]) -> Vec<Vec<usize>> {
	let num = labels.iter().copied().max().unwrap_or(0);
	let mut groups = vec![Vec::new(); num];
	for (i, &label) in labels.iter().enumerate() {
		groups[label - 1].push(i);
	}
	groups
}


/// The first member of each cluster, in label order (which is also index order)
pub fn representatives(labels: &[usize]) -> Vec<usize> {
	groups(labels).into_iter()
		.filter_map(|members| members.first().copied())
		.collect()
}


pub fn compare_points(a: &Point, b: &Point) -> Ordering {
	a.x.total_cmp(&b.x)
		.then(a.y.total_cmp(&b.y))
		.then(a.z.total_cmp(&b.z))
}
