//! Exhaustive matching over all image pairs, in blocks.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::matcher::{KernelSet, MatcherPool};
use crate::options::{ExhaustiveConfig, MatchingConfig};
use crate::types::{ImageId, StopToken};

use super::{run_batches, PairGenerator};

/// Matches every image against every other image.
///
/// Pairs are enumerated in nested blocks of `block_size` images so that
/// one block iteration's descriptors fit the cache together.
pub struct ExhaustiveMatcher {
    options: ExhaustiveConfig,
    match_options: MatchingConfig,
    database: Arc<dyn Database>,
    kernels: KernelSet,
    stop: StopToken,
}

impl ExhaustiveMatcher {
    pub fn new(
        options: ExhaustiveConfig,
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
        info!("Exhaustive feature matching");

        let mut cache = MatcherCache::new(5 * self.options.block_size, Arc::clone(&self.database));
        cache.setup()?;
        let cache = Arc::new(cache);

        let mut pool = MatcherPool::new(
            self.match_options.clone(),
            Arc::clone(&cache),
            self.kernels.clone(),
        )?;
        pool.setup()?;

        let mut generator = ExhaustivePairGenerator::new(&self.options, cache.image_ids());
        run_batches(&mut generator, &pool, self.database.as_ref(), &self.stop)
    }
}

/// Enumerates all unordered pairs block by block.
pub(crate) struct ExhaustivePairGenerator {
    image_ids: Vec<ImageId>,
    block_size: usize,
    num_blocks: usize,
    start_idx1: usize,
    start_idx2: usize,
}

impl ExhaustivePairGenerator {
    pub(crate) fn new(options: &ExhaustiveConfig, image_ids: Vec<ImageId>) -> Self {
        let num_blocks = image_ids.len().div_ceil(options.block_size);
        Self {
            image_ids,
            block_size: options.block_size,
            num_blocks,
            start_idx1: 0,
            start_idx2: 0,
        }
    }
}

impl PairGenerator for ExhaustivePairGenerator {
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>> {
        let num_images = self.image_ids.len();
        if self.start_idx1 >= num_images {
            return Ok(None);
        }

        let block_size = self.block_size;
        let end_idx1 = (self.start_idx1 + block_size).min(num_images);
        let end_idx2 = (self.start_idx2 + block_size).min(num_images);

        info!(
            "Matching block [{}/{}, {}/{}]",
            self.start_idx1 / block_size + 1,
            self.num_blocks,
            self.start_idx2 / block_size + 1,
            self.num_blocks
        );

        let mut image_pairs = Vec::with_capacity(block_size * (block_size - 1) / 2);
        for idx1 in self.start_idx1..end_idx1 {
            for idx2 in self.start_idx2..end_idx2 {
                let block_id1 = idx1 % block_size;
                let block_id2 = idx2 % block_size;
                // Within-block pairs once, cross-block pairs only from the
                // lower-block side. The asymmetric <= vs < on the diagonal
                // keeps descriptor locality per block.
                if (idx1 > idx2 && block_id1 <= block_id2)
                    || (idx1 < idx2 && block_id1 < block_id2)
                {
                    image_pairs.push((self.image_ids[idx1], self.image_ids[idx2]));
                }
            }
        }

        self.start_idx2 += block_size;
        if self.start_idx2 >= num_images {
            self.start_idx2 = 0;
            self.start_idx1 += block_size;
        }

        Ok(Some(image_pairs))
    }
}
