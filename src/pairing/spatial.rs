//! Spatial matching over translation priors.

use std::sync::Arc;

use anyhow::{Context, Result};
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::info;

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::gps::GpsTransform;
use crate::matcher::{KernelSet, MatcherPool};
use crate::options::{MatchingConfig, SpatialConfig};
use crate::types::{ImageId, StopToken};

use super::{run_batches, PairGenerator};

/// Matches each image against its spatial nearest neighbors.
///
/// Uses the translation prior of each image as a 3-D location, optionally
/// projecting geographic lat/lon/alt to Cartesian first. Images without a
/// usable prior are not indexed.
pub struct SpatialMatcher {
    options: SpatialConfig,
    match_options: MatchingConfig,
    database: Arc<dyn Database>,
    kernels: KernelSet,
    stop: StopToken,
}

impl SpatialMatcher {
    pub fn new(
        options: SpatialConfig,
        match_options: MatchingConfig,
        database: Arc<dyn Database>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;
        let kernels = KernelSet::cpu_only(&match_options);
        Ok(Self {
            options,
            match_options,
            database,
            kernels,
            stop: StopToken::new(),
        })
    }

    /// Replace the default kernels, e.g. to plug in a GPU backend.
    pub fn with_kernels(mut self, kernels: KernelSet) -> Self {
        self.kernels = kernels;
        self
    }

    /// Token that cancels the run at the next batch boundary.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn run(&self) -> Result<()> {
        info!("Spatial feature matching");

        let mut cache = MatcherCache::new(
            5 * self.options.max_num_neighbors,
            Arc::clone(&self.database),
        );
        cache.setup()?;
        let cache = Arc::new(cache);

        let mut pool = MatcherPool::new(
            self.match_options.clone(),
            Arc::clone(&cache),
            self.kernels.clone(),
        )?;
        pool.setup()?;

        let mut generator = SpatialPairGenerator::new(&self.options, &cache)?;
        run_batches(&mut generator, &pool, self.database.as_ref(), &self.stop)
    }
}

/// Emits one batch per indexed location: its nearest neighbors within the
/// distance threshold, sorted by distance.
pub(crate) struct SpatialPairGenerator {
    image_ids: Vec<ImageId>,
    /// Index into `image_ids` for each indexed location.
    location_idxs: Vec<usize>,
    /// Per location: `(squared distance, location index)` ascending.
    neighbors: Vec<Vec<(f64, usize)>>,
    max_distance_squared: f64,
    current: usize,
}

impl SpatialPairGenerator {
    pub(crate) fn new(options: &SpatialConfig, cache: &MatcherCache) -> Result<Self> {
        let image_ids = cache.image_ids();

        info!("Indexing images...");
        let gps_transform = GpsTransform::new();
        let mut location_idxs = Vec::with_capacity(image_ids.len());
        let mut locations: Vec<[f64; 3]> = Vec::with_capacity(image_ids.len());
        for (idx, &image_id) in image_ids.iter().enumerate() {
            let image = cache
                .image(image_id)
                .with_context(|| format!("unknown image {image_id}"))?;
            if !image.has_location_prior(options.ignore_z) {
                continue;
            }

            let z = if options.ignore_z {
                0.0
            } else {
                image.tvec_prior.z
            };
            let location = if options.is_gps {
                gps_transform.ell_to_xyz(&Vector3::new(
                    image.tvec_prior.x,
                    image.tvec_prior.y,
                    z,
                ))
            } else {
                Vector3::new(image.tvec_prior.x, image.tvec_prior.y, z)
            };

            location_idxs.push(idx);
            locations.push([location.x, location.y, location.z]);
        }

        let num_locations = locations.len();
        if num_locations == 0 {
            info!("No images with location data");
        }

        info!("Building search index...");
        let mut search_index: KdTree<f64, 3> = KdTree::new();
        for (location_idx, location) in locations.iter().enumerate() {
            search_index.add(location, location_idx as u64);
        }

        info!("Searching for nearest neighbors...");
        let knn = options.max_num_neighbors.min(num_locations);
        let neighbors: Vec<Vec<(f64, usize)>> = locations
            .par_iter()
            .map(|location| {
                search_index
                    .nearest_n::<SquaredEuclidean>(location, knn)
                    .into_iter()
                    .map(|neighbor| (neighbor.distance, neighbor.item as usize))
                    .collect()
            })
            .collect();

        Ok(Self {
            image_ids,
            location_idxs,
            neighbors,
            max_distance_squared: options.max_distance * options.max_distance,
            current: 0,
        })
    }
}

impl PairGenerator for SpatialPairGenerator {
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>> {
        let num_locations = self.location_idxs.len();
        if self.current >= num_locations {
            return Ok(None);
        }

        let location_idx = self.current;
        self.current += 1;

        info!("Matching image [{}/{}]", location_idx + 1, num_locations);

        let image_id = self.image_ids[self.location_idxs[location_idx]];
        let mut image_pairs = Vec::new();
        for &(distance_squared, neighbor_idx) in &self.neighbors[location_idx] {
            if neighbor_idx == location_idx {
                continue;
            }
            // Neighbors are sorted by distance, so the first one out of
            // range ends the list.
            if distance_squared > self.max_distance_squared {
                break;
            }
            let neighbor_image_id = self.image_ids[self.location_idxs[neighbor_idx]];
            image_pairs.push((image_id, neighbor_image_id));
        }

        Ok(Some(image_pairs))
    }
}

#[cfg(test)]
mod tests {
    use crate::database::InMemoryDatabase;
    use crate::types::{CameraId, Image};

    use super::*;

    fn database_with_priors(priors: &[(u32, [f64; 3])]) -> Arc<dyn Database> {
        let database = InMemoryDatabase::new();
        for &(id, prior) in priors {
            database.add_image(Image {
                image_id: ImageId::new(id),
                name: format!("{id}.jpg"),
                camera_id: CameraId::new(1),
                tvec_prior: Vector3::new(prior[0], prior[1], prior[2]),
                qvec_prior: None,
            });
        }
        Arc::new(database)
    }

    fn generator_for(
        options: &SpatialConfig,
        priors: &[(u32, [f64; 3])],
    ) -> SpatialPairGenerator {
        let database = database_with_priors(priors);
        let mut cache = MatcherCache::new(8, database);
        cache.setup().unwrap();
        SpatialPairGenerator::new(options, &cache).unwrap()
    }

    fn collect_all(generator: &mut SpatialPairGenerator) -> Vec<Vec<(ImageId, ImageId)>> {
        let mut batches = Vec::new();
        while let Some(batch) = generator.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_distance_threshold_cuts_far_neighbors() {
        let options = SpatialConfig {
            max_num_neighbors: 2,
            max_distance: 2.0,
            is_gps: false,
            ignore_z: false,
        };
        // Three images on a line at x = 1, 2, 11: the third is beyond the
        // threshold from both others.
        let mut generator = generator_for(
            &options,
            &[(1, [1.0, 0.0, 0.0]), (2, [2.0, 0.0, 0.0]), (3, [11.0, 0.0, 0.0])],
        );
        let batches = collect_all(&mut generator);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![(ImageId::new(1), ImageId::new(2))]);
        assert_eq!(batches[1], vec![(ImageId::new(2), ImageId::new(1))]);
        assert!(batches[2].is_empty());
    }

    #[test]
    fn test_no_self_pairs() {
        let options = SpatialConfig {
            max_num_neighbors: 3,
            max_distance: 100.0,
            is_gps: false,
            ignore_z: false,
        };
        let mut generator = generator_for(
            &options,
            &[(1, [1.0, 0.0, 0.0]), (2, [2.0, 0.0, 0.0]), (3, [3.0, 0.0, 0.0])],
        );
        for batch in collect_all(&mut generator) {
            for (a, b) in batch {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_zero_priors_are_skipped() {
        let options = SpatialConfig {
            max_num_neighbors: 2,
            max_distance: 100.0,
            is_gps: false,
            ignore_z: false,
        };
        let mut generator = generator_for(
            &options,
            &[(1, [0.0, 0.0, 0.0]), (2, [1.0, 0.0, 0.0]), (3, [2.0, 0.0, 0.0])],
        );
        let batches = collect_all(&mut generator);

        // Only the two located images are indexed.
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            for &(a, b) in batch {
                assert_ne!(a, ImageId::new(1));
                assert_ne!(b, ImageId::new(1));
            }
        }
    }

    #[test]
    fn test_ignore_z_collapses_altitude() {
        let options = SpatialConfig {
            max_num_neighbors: 2,
            max_distance: 1.0,
            is_gps: false,
            ignore_z: true,
        };
        // Same planar position, wildly different altitude: with ignore_z
        // they are coincident.
        let mut generator = generator_for(
            &options,
            &[(1, [5.0, 5.0, 0.0]), (2, [5.0, 5.0, 1000.0])],
        );
        let batches = collect_all(&mut generator);
        assert_eq!(batches[0], vec![(ImageId::new(1), ImageId::new(2))]);
    }

    #[test]
    fn test_gps_priors_projected_before_indexing() {
        let options = SpatialConfig {
            max_num_neighbors: 2,
            // Roughly 155 m of longitude at this latitude.
            max_distance: 200.0,
            is_gps: true,
            ignore_z: true,
        };
        let mut generator = generator_for(
            &options,
            &[
                (1, [47.0, 8.0, 0.0]),
                (2, [47.0, 8.002, 0.0]),
                (3, [47.0, 9.0, 0.0]),
            ],
        );
        let batches = collect_all(&mut generator);
        // The close pair survives the threshold, the distant image does not.
        assert_eq!(batches[0], vec![(ImageId::new(1), ImageId::new(2))]);
        assert_eq!(batches[1], vec![(ImageId::new(2), ImageId::new(1))]);
        assert!(batches[2].is_empty());
    }

    #[test]
    fn test_no_location_data_produces_no_batches() {
        let options = SpatialConfig {
            max_num_neighbors: 2,
            max_distance: 10.0,
            is_gps: false,
            ignore_z: false,
        };
        let mut generator = generator_for(&options, &[(1, [0.0, 0.0, 0.0])]);
        assert!(generator.next_batch().unwrap().is_none());
    }
}
