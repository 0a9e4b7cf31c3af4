//! Storage interface consumed by the matching pipeline.
//!
//! The database is the single source of truth for cameras, images and
//! descriptors, and the write-back sink for matches. Implementations are
//! not assumed reentrant; callers serialize access, as `MatcherCache` does
//! with its database mutex.

pub mod memory;

pub use memory::InMemoryDatabase;

use anyhow::Result;

use crate::types::{Camera, FeatureDescriptors, FeatureMatch, FeatureMatches, Image, ImageId};

/// Persistent store for the matching stage.
///
/// Matches are keyed by the canonical (smaller-id-first) orientation of a
/// pair; `read_matches` and `write_matches` accept either orientation and
/// swap the feature index columns as needed, so callers always observe
/// indices in the orientation they asked for.
pub trait Database: Send + Sync {
    fn read_all_cameras(&self) -> Result<Vec<Camera>>;

    fn read_all_images(&self) -> Result<Vec<Image>>;

    fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors>;

    /// Largest per-image descriptor count, used to clamp `max_num_matches`
    /// during pool setup.
    fn max_num_descriptors(&self) -> Result<usize>;

    fn exists_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<bool>;

    /// Matches oriented as `(image_id1, image_id2)`; empty if the pair has
    /// no record.
    fn read_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<FeatureMatches>;

    fn write_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[FeatureMatch],
    ) -> Result<()>;

    fn delete_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<()>;

    /// Every stored pair together with its match count.
    fn read_match_counts(&self) -> Result<Vec<((ImageId, ImageId), usize)>>;

    fn begin_transaction(&self) -> Result<()>;

    fn commit_transaction(&self) -> Result<()>;

    fn rollback_transaction(&self) -> Result<()>;
}

/// Scoped database transaction.
///
/// Commits only through [`DatabaseTransaction::commit`]; dropping an
/// uncommitted guard rolls back, so every exit path of a batch either
/// commits fully or leaves the database untouched.
pub struct DatabaseTransaction<'a> {
    database: &'a dyn Database,
    committed: bool,
}

impl<'a> DatabaseTransaction<'a> {
    pub fn begin(database: &'a dyn Database) -> Result<Self> {
        database.begin_transaction()?;
        Ok(Self {
            database,
            committed: false,
        })
    }

    pub fn commit(mut self) -> Result<()> {
        self.database.commit_transaction()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for DatabaseTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.database.rollback_transaction() {
                tracing::error!("failed to roll back transaction: {err:#}");
            }
        }
    }
}
