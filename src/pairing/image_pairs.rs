//! Matching over a user-supplied list of image pairs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::cache::MatcherCache;
use crate::database::Database;
use crate::matcher::{KernelSet, MatcherPool};
use crate::options::{ImagePairsConfig, MatchingConfig};
use crate::types::{ImageId, StopToken};

use super::{run_batches, PairGenerator};

/// Matches exactly the pairs named in a text file.
///
/// One pair per line as `name1 name2`; blank lines and lines starting
/// with `#` are skipped. Lines naming unknown images are reported and
/// skipped.
pub struct ImagePairsMatcher {
    options: ImagePairsConfig,
    match_options: MatchingConfig,
    database: Arc<dyn Database>,
    kernels: KernelSet,
    stop: StopToken,
}

impl ImagePairsMatcher {
    pub fn new(
        options: ImagePairsConfig,
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
        info!("Custom feature matching");

        let mut cache = MatcherCache::new(self.options.block_size, Arc::clone(&self.database));
        cache.setup()?;
        let cache = Arc::new(cache);

        let mut pool = MatcherPool::new(
            self.match_options.clone(),
            Arc::clone(&cache),
            self.kernels.clone(),
        )?;
        pool.setup()?;

        let image_pairs = read_image_pairs_list(&self.options.match_list_path, &cache)?;
        let mut generator = ImagePairsGenerator::new(image_pairs, self.options.block_size);
        run_batches(&mut generator, &pool, self.database.as_ref(), &self.stop)
    }
}

/// Parse the match list, resolving image names to ids.
fn read_image_pairs_list(
    path: &Path,
    cache: &MatcherCache,
) -> Result<Vec<(ImageId, ImageId)>> {
    let mut name_to_id: HashMap<&str, ImageId> = HashMap::with_capacity(cache.num_images());
    for image_id in cache.image_ids() {
        if let Some(image) = cache.image(image_id) {
            name_to_id.insert(image.name.as_str(), image_id);
        }
    }

    let file = File::open(path)
        .with_context(|| format!("opening match list {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut image_pairs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut tokens = line.split_whitespace();
        let (Some(name1), Some(name2)) = (tokens.next(), tokens.next()) else {
            error!("malformed match list line: {line:?}");
            continue;
        };

        let Some(&image_id1) = name_to_id.get(name1) else {
            error!("image {name1} does not exist");
            continue;
        };
        let Some(&image_id2) = name_to_id.get(name2) else {
            error!("image {name2} does not exist");
            continue;
        };

        image_pairs.push((image_id1, image_id2));
    }
    Ok(image_pairs)
}

/// Emits the listed pairs in blocks of `block_size`.
pub(crate) struct ImagePairsGenerator {
    image_pairs: Vec<(ImageId, ImageId)>,
    block_size: usize,
    num_blocks: usize,
    offset: usize,
}

impl ImagePairsGenerator {
    pub(crate) fn new(image_pairs: Vec<(ImageId, ImageId)>, block_size: usize) -> Self {
        let num_blocks = image_pairs.len().div_ceil(block_size);
        Self {
            image_pairs,
            block_size,
            num_blocks,
            offset: 0,
        }
    }
}

impl PairGenerator for ImagePairsGenerator {
    fn next_batch(&mut self) -> Result<Option<Vec<(ImageId, ImageId)>>> {
        if self.offset >= self.image_pairs.len() {
            return Ok(None);
        }

        info!(
            "Matching block [{}/{}]",
            self.offset / self.block_size + 1,
            self.num_blocks
        );

        let block_end = (self.offset + self.block_size).min(self.image_pairs.len());
        let batch = self.image_pairs[self.offset..block_end].to_vec();
        self.offset = block_end;
        Ok(Some(batch))
    }
}
