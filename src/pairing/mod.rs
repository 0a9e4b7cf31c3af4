//! Candidate pair enumeration strategies and their drivers.
//!
//! Every strategy enumerates batches of candidate image pairs and feeds
//! them to the matcher pool inside one database transaction per batch, so
//! each completed batch is durable before the next one starts and a
//! mid-run failure leaves a consistent, smaller match set.

mod exhaustive;
mod feature_pairs;
mod image_pairs;
mod sequential;
mod spatial;
mod transitive;

pub use exhaustive::ExhaustiveMatcher;
pub use feature_pairs::FeaturePairsImporter;
pub use image_pairs::ImagePairsMatcher;
pub use sequential::SequentialMatcher;
pub use spatial::SpatialMatcher;
pub use transitive::TransitiveMatcher;

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::database::{Database, DatabaseTransaction};
use crate::matcher::MatcherPool;
use crate::types::{ImageId, StopToken};

/// Source of candidate pair batches for the shared driver loop.
///
/// Batch boundaries are part of each strategy's contract: they set the
/// transaction granularity and the descriptor locality the workers rely
/// on, so generators must not merge or split batches.
pub trait PairGenerator {
    /// The next batch, or `None` once the strategy is exhausted. A batch
    /// may be empty; the driver still runs its transaction.
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>>;
}

/// Drive a generator to completion against the pool.
///
/// The stop token is observed between batches; in-flight work of the
/// current batch always completes and commits.
pub(crate) fn run_batches(
    generator: &mut dyn PairGenerator,
    pool: &MatcherPool,
    database: &dyn Database,
    stop: &StopToken,
) -> Result<()> {
    while let Some(image_pairs) = generator.next_batch()? {
        if stop.is_stopped() {
            info!("matching stopped");
            return Ok(());
        }

        let started = Instant::now();
        let transaction = DatabaseTransaction::begin(database)?;
        pool.match_pairs(&image_pairs)?;
        transaction.commit()?;
        debug!(
            num_pairs = image_pairs.len(),
            "batch finished in {:.3}s",
            started.elapsed().as_secs_f64()
        );
    }
    Ok(())
}
