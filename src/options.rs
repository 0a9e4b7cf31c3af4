//! Configuration for the matching drivers.
//!
//! Each driver validates its options with `check()` before any worker
//! starts, so an out-of-range value aborts the run up front.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Options shared by all matching drivers and their workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Number of CPU worker threads; non-positive means all logical cores.
    pub num_threads: i32,

    /// Match on the GPU. Requires a GPU kernel factory on the pool.
    pub use_gpu: bool,

    /// Comma-separated list of GPU device indices. The single value `-1`
    /// expands to one worker per available device.
    pub gpu_index: String,

    /// Lowe ratio threshold between best and second-best match distance.
    pub max_ratio: f64,

    /// Maximum distance between matched descriptors, in normalized space.
    pub max_distance: f64,

    /// Keep only correspondences that are mutual best matches.
    pub cross_check: bool,

    /// Match sets smaller than this are normalized to empty before the
    /// write-back, recording the pair as attempted but below threshold.
    pub min_num_matches: usize,

    /// Upper bound on correspondences per pair. Clamped during pool setup
    /// to the largest descriptor count present in the database.
    pub max_num_matches: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            num_threads: -1,
            use_gpu: false,
            gpu_index: "-1".to_string(),
            max_ratio: 0.8,
            max_distance: 0.7,
            cross_check: true,
            min_num_matches: 15,
            max_num_matches: 32768,
        }
    }
}

impl MatchingConfig {
    pub fn check(&self) -> Result<()> {
        if self.max_ratio <= 0.0 {
            bail!("max_ratio must be positive");
        }
        if self.max_distance <= 0.0 {
            bail!("max_distance must be positive");
        }
        if self.max_num_matches == 0 {
            bail!("max_num_matches must be positive");
        }
        self.gpu_indices()?;
        Ok(())
    }

    /// Parse the comma-separated `gpu_index` list.
    pub fn gpu_indices(&self) -> Result<Vec<i32>> {
        let indices = self
            .gpu_index
            .split(',')
            .map(|token| {
                token
                    .trim()
                    .parse::<i32>()
                    .with_context(|| format!("invalid gpu index {:?}", token))
            })
            .collect::<Result<Vec<i32>>>()?;
        if indices.is_empty() {
            bail!("gpu_index must name at least one device");
        }
        Ok(indices)
    }

    /// Worker count for CPU matching.
    pub fn effective_num_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads as usize
        } else {
            std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(1)
        }
    }
}

/// Options for exhaustive block matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustiveConfig {
    /// Number of images per block; each block's descriptors must fit the
    /// cache together.
    pub block_size: usize,
}

impl Default for ExhaustiveConfig {
    fn default() -> Self {
        Self { block_size: 50 }
    }
}

impl ExhaustiveConfig {
    pub fn check(&self) -> Result<()> {
        if self.block_size <= 1 {
            bail!("block_size must be greater than 1");
        }
        Ok(())
    }
}

/// Options for sequential matching over name-ordered images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialConfig {
    /// Number of consecutive successors each image is paired with.
    pub overlap: usize,

    /// Additionally pair each image with successors at power-of-two
    /// offsets, which helps loop closure on long sequences.
    pub quadratic_overlap: bool,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            overlap: 10,
            quadratic_overlap: true,
        }
    }
}

impl SequentialConfig {
    pub fn check(&self) -> Result<()> {
        if self.overlap == 0 {
            bail!("overlap must be positive");
        }
        Ok(())
    }
}

/// Options for spatial matching over translation priors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// Number of nearest neighbors each location is paired with.
    pub max_num_neighbors: usize,

    /// Neighbors farther than this are not considered, in the unit of the
    /// location coordinates (meters when `is_gps`).
    pub max_distance: f64,

    /// Interpret translation priors as lat/lon/alt and project to
    /// Cartesian before indexing.
    pub is_gps: bool,

    /// Zero the third coordinate before indexing.
    pub ignore_z: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            max_num_neighbors: 50,
            max_distance: 100.0,
            is_gps: true,
            ignore_z: true,
        }
    }
}

impl SpatialConfig {
    pub fn check(&self) -> Result<()> {
        if self.max_num_neighbors == 0 {
            bail!("max_num_neighbors must be positive");
        }
        if self.max_distance <= 0.0 {
            bail!("max_distance must be positive");
        }
        Ok(())
    }
}

/// Options for transitive matching over the existing match graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitiveConfig {
    /// Pairs dispatched per transaction.
    pub batch_size: usize,

    /// Number of closure iterations; each iteration re-reads the graph the
    /// previous one extended.
    pub num_iterations: usize,
}

impl Default for TransitiveConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            num_iterations: 3,
        }
    }
}

impl TransitiveConfig {
    pub fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.num_iterations == 0 {
            bail!("num_iterations must be positive");
        }
        Ok(())
    }
}

/// Options for matching a user-supplied list of image pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePairsConfig {
    /// Pairs dispatched per transaction.
    pub block_size: usize,

    /// Text file with one `name1 name2` pair per line.
    pub match_list_path: PathBuf,
}

impl ImagePairsConfig {
    pub fn new(match_list_path: impl Into<PathBuf>) -> Self {
        Self {
            block_size: 1225,
            match_list_path: match_list_path.into(),
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("block_size must be positive");
        }
        Ok(())
    }
}

/// Options for importing externally computed feature matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturePairsConfig {
    /// Record-oriented text file, see the importer for the format.
    pub match_list_path: PathBuf,
}

impl FeaturePairsConfig {
    pub fn new(match_list_path: impl Into<PathBuf>) -> Self {
        Self {
            match_list_path: match_list_path.into(),
        }
    }

    /// Path validity is the caller's responsibility.
    pub fn check(&self) -> Result<()> {
        Ok(())
    }
}
