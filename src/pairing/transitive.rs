//! Transitive matching over the existing match graph.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::matcher::{KernelSet, MatcherPool};
use crate::options::{MatchingConfig, TransitiveConfig};
use crate::types::{ImageId, PairId, StopToken};

use super::{run_batches, PairGenerator};

/// Matches pairs reachable by two hops in the current match graph.
///
/// Each iteration re-reads the matched-pair edge list, enumerates length-2
/// walks `a -> b -> c` and dispatches the endpoint pairs `(a, c)` in
/// batches. Pairs matched by one iteration seed further walks in the next.
pub struct TransitiveMatcher {
    options: TransitiveConfig,
    match_options: MatchingConfig,
    database: Arc<dyn Database>,
    kernels: KernelSet,
    stop: StopToken,
}

impl TransitiveMatcher {
    pub fn new(
        options: TransitiveConfig,
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
        info!("Transitive feature matching");

        let mut cache = MatcherCache::new(self.options.batch_size, Arc::clone(&self.database));
        cache.setup()?;
        let cache = Arc::new(cache);

        let mut pool = MatcherPool::new(
            self.match_options.clone(),
            Arc::clone(&cache),
            self.kernels.clone(),
        )?;
        pool.setup()?;

        let mut generator =
            TransitivePairGenerator::new(&self.options, Arc::clone(&self.database));
        run_batches(&mut generator, &pool, self.database.as_ref(), &self.stop)
    }
}

/// Emits two-hop candidate pairs in batches of `batch_size`.
///
/// The graph snapshot for an iteration is taken lazily, when its first
/// batch is requested, so it sees every pair the previous iteration
/// committed.
pub(crate) struct TransitivePairGenerator {
    database: Arc<dyn Database>,
    batch_size: usize,
    num_iterations: usize,
    iteration: usize,
    batch_in_iteration: usize,
    queued: VecDeque<(ImageId, ImageId)>,
}

impl TransitivePairGenerator {
    pub(crate) fn new(options: &TransitiveConfig, database: Arc<dyn Database>) -> Self {
        Self {
            database,
            batch_size: options.batch_size,
            num_iterations: options.num_iterations,
            iteration: 0,
            batch_in_iteration: 0,
            queued: VecDeque::new(),
        }
    }

    /// Enumerate one iteration's candidate pairs from the current graph.
    fn enumerate_iteration(&mut self) -> Result<()> {
        let match_counts = self.database.read_match_counts()?;

        let mut adjacency: BTreeMap<ImageId, Vec<ImageId>> = BTreeMap::new();
        for ((image_id1, image_id2), _num_matches) in match_counts {
            adjacency.entry(image_id1).or_default().push(image_id2);
            adjacency.entry(image_id2).or_default().push(image_id1);
        }

        // One emission per endpoint pair per iteration; self-walks
        // a -> b -> a are enumerated too and dropped at dispatch.
        let mut image_pair_ids: HashSet<PairId> = HashSet::new();
        for (&image_id1, neighbors) in &adjacency {
            for image_id2 in neighbors {
                if let Some(second_hop) = adjacency.get(image_id2) {
                    for &image_id3 in second_hop {
                        let pair_id = PairId::from_image_pair(image_id1, image_id3);
                        if image_pair_ids.insert(pair_id) {
                            self.queued.push_back((image_id1, image_id3));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl PairGenerator for TransitivePairGenerator {
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>> {
        loop {
            if !self.queued.is_empty() {
                self.batch_in_iteration += 1;
                info!("  Batch {}", self.batch_in_iteration);
                let count = self.batch_size.min(self.queued.len());
                return Ok(Some(self.queued.drain(..count).collect()));
            }

            if self.iteration >= self.num_iterations {
                return Ok(None);
            }
            self.iteration += 1;
            self.batch_in_iteration = 0;
            info!("Iteration [{}/{}]", self.iteration, self.num_iterations);
            self.enumerate_iteration()?;
        }
    }
}
