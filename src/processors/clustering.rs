//! Parallel DBSCAN clustering for LIDAR point clouds.
//!
//! This module implements a parallelized DBSCAN using:
//! - A hashed voxel grid with `eps`-sized cells for neighbor queries
//! - `rayon` for parallel neighbor finding and core point identification
//! - Atomic union-find for lock-free cluster merging
//!
//! The grid has no balancing step, so coincident points, flat ground patches
//! and quantized coordinates cost nothing extra beyond their neighbor lists.
//!
//! Output is deterministic regardless of thread scheduling: cluster ids
//! ascend with the lowest core point index in each cluster, and a border
//! point joins the cluster of its lowest-index core neighbor.
//!
//! # Example
//!
//! ```no_run
//! use fusion_pipeline::processors::clustering::dbscan;
//!
//! let coords = vec![[0.0f32, 0.0, 0.0], [0.1, 0.0, 0.0], [50.0, 50.0, 50.0]];
//! let labels = dbscan(&coords, 0.5, 2).unwrap();
//! assert_eq!(labels, vec![0, 0, -1]);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ClusteringConfig, PreprocessingConfig};
use crate::core::loaders::PointCloud;

/// Label used for points that belong to no cluster.
pub const NOISE: i32 = -1;

/// Errors raised for unusable clustering parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusteringError {
    #[error("eps must be positive and finite, got {0}")]
    InvalidEps(f32),

    #[error("min_points must be at least 1, got {0}")]
    InvalidMinPoints(usize),
}

pub type Result<T> = std::result::Result<T, ClusteringError>;

/// Atomic Union-Find data structure for lock-free parallel cluster merging.
///
/// Uses path compression with atomic compare-and-swap operations to safely
/// merge clusters from multiple threads without locks.
pub struct AtomicUnionFind {
    parent: Vec<AtomicUsize>,
}

impl AtomicUnionFind {
    /// Create a new union-find structure where each element is its own parent.
    #[inline]
    pub fn new(size: usize) -> Self {
        let parent = (0..size).map(AtomicUsize::new).collect();
        Self { parent }
    }

    /// Find the root of the set containing `x` with path compression.
    #[inline]
    pub fn find(&self, mut x: usize) -> usize {
        loop {
            let p = self.parent[x].load(Ordering::Relaxed);
            if p == x {
                return x;
            }
            let gp = self.parent[p].load(Ordering::Relaxed);
            if gp != p {
                // Losing this race is harmless
                let _ = self.parent[x].compare_exchange_weak(
                    p,
                    gp,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            x = p;
        }
    }

    /// Union the sets containing `x` and `y`.
    ///
    /// Returns true if a merge actually occurred, false if they were
    /// already in the same set.
    #[inline]
    pub fn union(&self, x: usize, y: usize) -> bool {
        loop {
            let root_x = self.find(x);
            let root_y = self.find(y);

            if root_x == root_y {
                return false;
            }

            let (small, large) = if root_x < root_y {
                (root_x, root_y)
            } else {
                (root_y, root_x)
            };

            match self.parent[small].compare_exchange_weak(
                small,
                large,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }
}

/// A group of spatially dense points, in sensor coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointCluster {
    pub id: usize,
    /// Member indices into the clustered cloud, ascending
    pub indices: Vec<usize>,
    pub centroid: [f64; 3],
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl PointCluster {
    /// Number of member points.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Clusters plus the points left over as noise.
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    pub clusters: Vec<PointCluster>,
    pub noise: Vec<usize>,
    /// Per-point label, `NOISE` for noise
    pub labels: Vec<i32>,
}

/// Voxel key of a point for cells of edge `1 / inv_cell`.
type CellKey = (i64, i64, i64);

/// Uniform hash grid over point indices.
///
/// With the cell edge equal to `eps`, every point within `eps` of a query
/// lies in the query's own cell or one of its 26 neighbors.
struct VoxelGrid {
    inv_cell: f64,
    cells: HashMap<CellKey, Vec<usize>>,
}

impl VoxelGrid {
    fn new(coords: &[[f32; 3]], cell: f32) -> Self {
        let mut grid = Self {
            inv_cell: 1.0 / cell as f64,
            cells: HashMap::new(),
        };
        for (i, p) in coords.iter().enumerate() {
            let key = grid.key(p);
            grid.cells.entry(key).or_default().push(i);
        }
        grid
    }

    #[inline]
    fn key(&self, p: &[f32; 3]) -> CellKey {
        let cell = |v: f32| (v as f64 * self.inv_cell).floor() as i64;
        (cell(p[0]), cell(p[1]), cell(p[2]))
    }

    /// Indices of all points within `eps_sq` (squared) of `p`, ascending.
    fn within(&self, coords: &[[f32; 3]], p: &[f32; 3], eps_sq: f32) -> Vec<usize> {
        let (cx, cy, cz) = self.key(p);
        let mut found = Vec::new();
        for dx in -1i64..=1 {
            for dy in -1i64..=1 {
                for dz in -1i64..=1 {
                    let key = (
                        cx.saturating_add(dx),
                        cy.saturating_add(dy),
                        cz.saturating_add(dz),
                    );
                    let Some(members) = self.cells.get(&key) else {
                        continue;
                    };
                    found.extend(members.iter().copied().filter(|&j| {
                        let q = &coords[j];
                        let d = [p[0] - q[0], p[1] - q[1], p[2] - q[2]];
                        d[0] * d[0] + d[1] * d[1] + d[2] * d[2] <= eps_sq
                    }));
                }
            }
        }
        found.sort_unstable();
        // Saturated keys at the i64 limits can visit one cell twice
        found.dedup();
        found
    }
}

fn validate_params(eps: f32, min_points: usize) -> Result<()> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(ClusteringError::InvalidEps(eps));
    }
    if min_points < 1 {
        return Err(ClusteringError::InvalidMinPoints(min_points));
    }
    Ok(())
}

/// DBSCAN over 3D Euclidean distance.
///
/// A point is core when at least `min_points` points (itself included) lie
/// within `eps`. Core points within `eps` of each other share a cluster;
/// non-core points within `eps` of a core point are border points.
/// With `min_points == 1` this degenerates to connected components.
///
/// # Algorithm (Parallelized)
///
/// 1. **Build voxel grid**: O(n) hashing into `eps`-sized cells
/// 2. **Parallel neighbor finding**: rayon queries over the 27 surrounding cells
/// 3. **Parallel core point identification**
/// 4. **Lock-free cluster formation**: atomic union-find over core pairs
/// 5. **Label assignment**: sequential scan in index order, so ids are stable
///
/// # Returns
///
/// Vector of cluster labels (`-1` for noise points).
pub fn dbscan(coords: &[[f32; 3]], eps: f32, min_points: usize) -> Result<Vec<i32>> {
    validate_params(eps, min_points)?;

    let n = coords.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let grid = VoxelGrid::new(coords, eps);
    let eps_sq = eps * eps;

    let neighbors: Vec<Vec<usize>> = coords
        .par_iter()
        .map(|coord| grid.within(coords, coord, eps_sq))
        .collect();

    let is_core: Vec<bool> = neighbors
        .par_iter()
        .map(|neigh| neigh.len() >= min_points)
        .collect();

    let uf = AtomicUnionFind::new(n);

    (0..n).into_par_iter().for_each(|i| {
        if is_core[i] {
            for &j in &neighbors[i] {
                if j > i && is_core[j] {
                    uf.union(i, j);
                }
            }
        }
    });

    // Ids are handed out in index order of the first core point seen per root
    let mut root_to_cluster: HashMap<usize, i32> = HashMap::new();
    let mut next_cluster_id: i32 = 0;
    let mut labels = vec![NOISE; n];

    for i in 0..n {
        if is_core[i] {
            let root = uf.find(i);
            let id = *root_to_cluster.entry(root).or_insert_with(|| {
                let id = next_cluster_id;
                next_cluster_id += 1;
                id
            });
            labels[i] = id;
        }
    }

    for i in 0..n {
        if !is_core[i] {
            // Neighbor lists are sorted, so the first core hit has the lowest index
            if let Some(&j) = neighbors[i].iter().find(|&&j| is_core[j]) {
                labels[i] = labels[j];
            }
        }
    }

    Ok(labels)
}

/// Group per-point labels into clusters with centroid and extent.
pub fn collect_clusters(cloud: &PointCloud, labels: &[i32]) -> Clustering {
    let cluster_count = labels.iter().copied().max().map_or(0, |m| (m + 1).max(0)) as usize;
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    let mut noise = Vec::new();

    for (i, &label) in labels.iter().enumerate() {
        if label < 0 {
            noise.push(i);
        } else {
            members[label as usize].push(i);
        }
    }

    let clusters = members
        .into_par_iter()
        .enumerate()
        .filter(|(_, indices)| !indices.is_empty())
        .map(|(id, indices)| {
            let mut sum = [0.0f64; 3];
            let mut min = [f64::INFINITY; 3];
            let mut max = [f64::NEG_INFINITY; 3];
            for &i in &indices {
                let p = [cloud.x[i] as f64, cloud.y[i] as f64, cloud.z[i] as f64];
                for axis in 0..3 {
                    sum[axis] += p[axis];
                    min[axis] = min[axis].min(p[axis]);
                    max[axis] = max[axis].max(p[axis]);
                }
            }
            let count = indices.len() as f64;
            PointCluster {
                id,
                centroid: [sum[0] / count, sum[1] / count, sum[2] / count],
                min,
                max,
                indices,
            }
        })
        .collect();

    Clustering {
        clusters,
        noise,
        labels: labels.to_vec(),
    }
}

/// Cluster a point cloud with the configured DBSCAN parameters.
pub fn cluster_point_cloud(cloud: &PointCloud, config: &ClusteringConfig) -> Result<Clustering> {
    let coords = cloud.to_coords();
    let labels = dbscan(&coords, config.eps, config.min_points)?;
    let clustering = collect_clusters(cloud, &labels);
    log::debug!(
        "DBSCAN eps={} min_points={}: {} clusters, {} noise of {} points",
        config.eps,
        config.min_points,
        clustering.clusters.len(),
        clustering.noise.len(),
        cloud.len()
    );
    Ok(clustering)
}

/// Process a point cloud file: load, preprocess, cluster, and save labels.
///
/// # Returns
///
/// Tuple of (output CSV path, clustering result).
///
/// # Errors
///
/// Returns error if loading, clustering, or file writing fails.
pub fn process_cloud_clustering(
    cloud_path: &Path,
    output_dir: Option<&Path>,
    preprocessing: &PreprocessingConfig,
    config: &ClusteringConfig,
) -> std::result::Result<(PathBuf, Clustering), Box<dyn std::error::Error + Send + Sync>> {
    use crate::core::loaders::load_point_cloud;
    use crate::core::transforms::preprocess;
    use crate::core::writers::write_labels_csv;

    let cloud = load_point_cloud(cloud_path)?;

    let (cloud, stats) = preprocess(&cloud, preprocessing);
    let file_name = cloud_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown");
    log::info!(
        "{}: using {} points ({} out of range, approx stride={})",
        file_name,
        stats.output_points,
        stats.out_of_range,
        stats.subsample_stride
    );

    let clustering = cluster_point_cloud(&cloud, config)?;

    let sizes: Vec<usize> = clustering.clusters.iter().map(PointCluster::len).collect();
    log::info!(
        "{}: cluster sizes {:?}, noise {}",
        file_name,
        sizes,
        clustering.noise.len()
    );

    let out_dir = output_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| cloud_path.parent().unwrap_or(Path::new(".")).to_path_buf());

    let stem = cloud_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let csv_path = out_dir.join(format!("{}_dbscan_labels.csv", stem));

    write_labels_csv(&csv_path, &cloud.to_coords(), &clustering.labels)?;
    log::info!("Labels CSV -> {}", csv_path.display());

    Ok((csv_path, clustering))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn two_blobs() -> Vec<[f32; 3]> {
        vec![
            // Blob around origin
            [0.0, 0.0, 0.0],
            [0.2, 0.0, 0.0],
            [0.0, 0.2, 0.0],
            [0.2, 0.2, 0.0],
            // Blob far away
            [20.0, 20.0, 0.0],
            [20.2, 20.0, 0.0],
            [20.0, 20.2, 0.0],
            [20.2, 20.2, 0.0],
        ]
    }

    #[test]
    fn test_atomic_union_find_basic() {
        let uf = AtomicUnionFind::new(5);

        assert_eq!(uf.find(0), 0);
        assert_eq!(uf.find(4), 4);

        assert!(uf.union(0, 1));
        assert_eq!(uf.find(0), uf.find(1));

        assert!(uf.union(2, 3));
        assert_eq!(uf.find(2), uf.find(3));
        assert_ne!(uf.find(0), uf.find(2));

        assert!(uf.union(1, 2));
        assert_eq!(uf.find(0), uf.find(3));

        assert!(!uf.union(0, 3));
    }

    #[test]
    fn test_dbscan_simple_clusters() {
        let labels = dbscan(&two_blobs(), 0.5, 3).unwrap();
        assert_eq!(labels, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_dbscan_ids_follow_lowest_core_index() {
        // Far blob listed first gets id 0
        let mut coords = two_blobs();
        coords.rotate_left(4);
        let labels = dbscan(&coords, 0.5, 3).unwrap();
        assert_eq!(labels[0], 0);
        assert_eq!(labels[4], 1);
    }

    #[test]
    fn test_dbscan_noise_points() {
        let coords: Vec<[f32; 3]> = vec![
            [0.0, 0.0, 0.0],
            [0.1, 0.0, 0.0],
            [0.0, 0.1, 0.0],
            [100.0, 100.0, 100.0],
        ];
        let labels = dbscan(&coords, 0.5, 3).unwrap();
        assert_eq!(labels, vec![0, 0, 0, NOISE]);
    }

    #[test]
    fn test_dbscan_border_point() {
        // Points 1 and 2 are core; 0 and 3 only reach one core point each
        let coords: Vec<[f32; 3]> = vec![
            [0.0, 0.0, 0.0],
            [0.3, 0.0, 0.0],
            [0.6, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [3.0, 0.0, 0.0],
        ];
        let labels = dbscan(&coords, 0.45, 3).unwrap();
        assert_eq!(labels, vec![0, 0, 0, 0, NOISE]);
    }

    #[test]
    fn test_dbscan_min_points_one_is_connected_components() {
        let coords: Vec<[f32; 3]> = vec![[0.0, 0.0, 0.0], [0.3, 0.0, 0.0], [5.0, 0.0, 0.0]];
        let labels = dbscan(&coords, 0.5, 1).unwrap();
        assert_eq!(labels, vec![0, 0, 1]);
    }

    #[test]
    fn test_dbscan_empty_and_single() {
        assert!(dbscan(&[], 0.5, 3).unwrap().is_empty());
        assert_eq!(dbscan(&[[0.0, 0.0, 0.0]], 0.5, 2).unwrap(), vec![NOISE]);
    }

    #[test]
    fn test_dbscan_coincident_points() {
        let mut coords = vec![[2.0f32, 0.0, 5.0]; 300];
        coords.push([9.0, 0.0, 5.0]);
        let labels = dbscan(&coords, 0.5, 5).unwrap();
        assert!(labels[..300].iter().all(|&l| l == 0));
        assert_eq!(labels[300], NOISE);
    }

    #[test]
    fn test_dbscan_flat_ground_grid() {
        // 40x40 patch at exactly z = 0, spacing 0.3
        let coords: Vec<[f32; 3]> = (0..1600)
            .map(|i| [(i % 40) as f32 * 0.3, (i / 40) as f32 * 0.3, 0.0])
            .collect();
        let labels = dbscan(&coords, 0.5, 5).unwrap();
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_dbscan_points_on_a_line() {
        // Two runs along x with y and z fixed, split by a 2.1 m gap
        let coords: Vec<[f32; 3]> = (0..2000)
            .map(|i| {
                let x = if i < 1000 { i as f32 * 0.1 } else { 2.0 + i as f32 * 0.1 };
                [x, 1.0, 0.0]
            })
            .collect();
        let labels = dbscan(&coords, 0.25, 3).unwrap();
        assert!(labels[..1000].iter().all(|&l| l == 0));
        assert!(labels[1000..].iter().all(|&l| l == 1));
    }

    #[test]
    fn test_dbscan_exact_eps_is_neighbor() {
        // Integer coordinates sitting exactly on cell boundaries
        let coords: Vec<[f32; 3]> = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        let labels = dbscan(&coords, 1.0, 2).unwrap();
        assert_eq!(labels, vec![0, 0, 0]);
    }

    #[test]
    fn test_dbscan_invalid_params() {
        assert_eq!(dbscan(&[], 0.0, 3), Err(ClusteringError::InvalidEps(0.0)));
        assert!(matches!(
            dbscan(&[], f32::NAN, 3),
            Err(ClusteringError::InvalidEps(_))
        ));
        assert_eq!(
            dbscan(&[], 0.5, 0),
            Err(ClusteringError::InvalidMinPoints(0))
        );
    }

    #[test]
    fn test_cluster_point_cloud_extents() {
        let cloud = PointCloud::from_coords(&two_blobs());
        let config = ClusteringConfig {
            eps: 0.5,
            min_points: 3,
        };
        let result = cluster_point_cloud(&cloud, &config).unwrap();

        assert_eq!(result.clusters.len(), 2);
        assert!(result.noise.is_empty());

        let first = &result.clusters[0];
        assert_eq!(first.id, 0);
        assert_eq!(first.indices, vec![0, 1, 2, 3]);
        approx::assert_relative_eq!(first.centroid[0], 0.1, epsilon = 1e-6);
        approx::assert_relative_eq!(first.max[1], 0.2, epsilon = 1e-6);
        assert_eq!(first.min, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_process_cloud_clustering_writes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.csv");
        let mut text = String::from("x,y,z\n");
        for p in two_blobs() {
            text.push_str(&format!("{},{},{}\n", p[0], p[1], p[2]));
        }
        std::fs::write(&input, text).unwrap();

        let (csv_path, clustering) = process_cloud_clustering(
            &input,
            None,
            &PreprocessingConfig::default(),
            &ClusteringConfig {
                eps: 0.5,
                min_points: 3,
            },
        )
        .unwrap();

        assert_eq!(csv_path, dir.path().join("scan_dbscan_labels.csv"));
        assert_eq!(clustering.clusters.len(), 2);
        let written = std::fs::read_to_string(csv_path).unwrap();
        assert_eq!(written.lines().count(), 9);
    }

    proptest! {
        #[test]
        fn prop_clusters_partition_points(
            coords in prop::collection::vec(
                prop::array::uniform3(-5.0f32..5.0), 0..120
            ),
            eps in 0.2f32..2.0,
            min_points in 1usize..6,
        ) {
            let cloud = PointCloud::from_coords(&coords);
            let labels = dbscan(&coords, eps, min_points).unwrap();
            let clustering = collect_clusters(&cloud, &labels);

            let mut seen = vec![0usize; coords.len()];
            for cluster in &clustering.clusters {
                prop_assert!(!cluster.is_empty());
                for &i in &cluster.indices {
                    seen[i] += 1;
                    prop_assert_eq!(labels[i], cluster.id as i32);
                }
            }
            for &i in &clustering.noise {
                seen[i] += 1;
                prop_assert_eq!(labels[i], NOISE);
            }
            prop_assert!(seen.iter().all(|&count| count == 1));
        }
    }
}
