//! Sequential matching over name-ordered images.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::matcher::{KernelSet, MatcherPool};
use crate::options::{MatchingConfig, SequentialConfig};
use crate::types::{Image, ImageId, StopToken};

use super::{run_batches, PairGenerator};

/// Matches each image against its successors in name order.
///
/// Intended for ordered captures such as video frames, where temporal
/// neighbors overlap. The optional quadratic offsets reach further ahead
/// to catch loop closures.
pub struct SequentialMatcher {
    options: SequentialConfig,
    match_options: MatchingConfig,
    database: Arc<dyn Database>,
    kernels: KernelSet,
    stop: StopToken,
}

impl SequentialMatcher {
    pub fn new(
        options: SequentialConfig,
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
        info!("Sequential feature matching");

        let mut cache = MatcherCache::new(5 * self.options.overlap, Arc::clone(&self.database));
        cache.setup()?;
        let cache = Arc::new(cache);

        let mut pool = MatcherPool::new(
            self.match_options.clone(),
            Arc::clone(&cache),
            self.kernels.clone(),
        )?;
        pool.setup()?;

        let mut generator =
            SequentialPairGenerator::new(&self.options, ordered_image_ids(&cache));
        run_batches(&mut generator, &pool, self.database.as_ref(), &self.stop)
    }
}

/// Image ids sorted by image name.
fn ordered_image_ids(cache: &MatcherCache) -> Vec<ImageId> {
    let mut images: Vec<&Image> = cache
        .image_ids()
        .into_iter()
        .filter_map(|image_id| cache.image(image_id))
        .collect();
    images.sort_by(|a, b| a.name.cmp(&b.name));
    images.into_iter().map(|image| image.image_id).collect()
}

/// Emits one batch per image: its `overlap` successors, plus successors
/// at power-of-two offsets when quadratic overlap is enabled.
pub(crate) struct SequentialPairGenerator {
    ordered_image_ids: Vec<ImageId>,
    overlap: usize,
    quadratic_overlap: bool,
    image_idx: usize,
}

impl SequentialPairGenerator {
    pub(crate) fn new(options: &SequentialConfig, ordered_image_ids: Vec<ImageId>) -> Self {
        Self {
            ordered_image_ids,
            overlap: options.overlap,
            quadratic_overlap: options.quadratic_overlap,
            image_idx: 0,
        }
    }
}

impl PairGenerator for SequentialPairGenerator {
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>> {
        let num_images = self.ordered_image_ids.len();
        if self.image_idx >= num_images {
            return Ok(None);
        }

        let image_idx1 = self.image_idx;
        self.image_idx += 1;

        info!("Matching image [{}/{}]", image_idx1 + 1, num_images);

        let image_id1 = self.ordered_image_ids[image_idx1];
        let mut image_pairs = Vec::with_capacity(2 * self.overlap);
        for k in 1..=self.overlap {
            let image_idx2 = image_idx1 + k;
            if image_idx2 >= num_images {
                break;
            }
            image_pairs.push((image_id1, self.ordered_image_ids[image_idx2]));

            if self.quadratic_overlap {
                let quadratic_idx2 = 1usize
                    .checked_shl((k - 1) as u32)
                    .and_then(|offset| image_idx1.checked_add(offset));
                if let Some(quadratic_idx2) = quadratic_idx2 {
                    if quadratic_idx2 < num_images {
                        image_pairs.push((image_id1, self.ordered_image_ids[quadratic_idx2]));
                    }
                }
            }
        }

        Ok(Some(image_pairs))
    }
}
