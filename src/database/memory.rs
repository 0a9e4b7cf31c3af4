//! In-memory database, used by tests and small in-process pipelines.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::types::{
    should_swap_image_pair, Camera, CameraId, FeatureDescriptors, FeatureMatch, FeatureMatches,
    Image, ImageId, PairId,
};

use super::Database;

#[derive(Default)]
struct Tables {
    cameras: BTreeMap<CameraId, Camera>,
    images: BTreeMap<ImageId, Image>,
    descriptors: BTreeMap<ImageId, FeatureDescriptors>,
    matches: BTreeMap<PairId, FeatureMatches>,
    /// Snapshot of the match table while a transaction is open. Matches
    /// are the only table the matching stage mutates.
    match_snapshot: Option<BTreeMap<PairId, FeatureMatches>>,
}

/// A [`Database`] kept entirely in memory.
///
/// Transactions snapshot the match table on begin and restore it on
/// rollback.
#[derive(Default)]
pub struct InMemoryDatabase {
    tables: Mutex<Tables>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_camera(&self, camera: Camera) {
        self.tables.lock().cameras.insert(camera.camera_id, camera);
    }

    pub fn add_image(&self, image: Image) {
        self.tables.lock().images.insert(image.image_id, image);
    }

    pub fn add_descriptors(&self, image_id: ImageId, descriptors: FeatureDescriptors) {
        self.tables.lock().descriptors.insert(image_id, descriptors);
    }

    /// Number of stored match records, counting empty ones.
    pub fn num_match_records(&self) -> usize {
        self.tables.lock().matches.len()
    }
}

fn oriented(matches: &[FeatureMatch], swap: bool) -> FeatureMatches {
    if swap {
        matches
            .iter()
            .map(|m| FeatureMatch::new(m.idx2, m.idx1))
            .collect()
    } else {
        matches.to_vec()
    }
}

impl Database for InMemoryDatabase {
    fn read_all_cameras(&self) -> Result<Vec<Camera>> {
        Ok(self.tables.lock().cameras.values().cloned().collect())
    }

    fn read_all_images(&self) -> Result<Vec<Image>> {
        Ok(self.tables.lock().images.values().cloned().collect())
    }

    fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors> {
        match self.tables.lock().descriptors.get(&image_id) {
            Some(descriptors) => Ok(descriptors.clone()),
            None => bail!("no descriptors stored for image {image_id}"),
        }
    }

    fn max_num_descriptors(&self) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .descriptors
            .values()
            .map(|descriptors| descriptors.nrows())
            .max()
            .unwrap_or(0))
    }

    fn exists_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<bool> {
        let pair_id = PairId::from_image_pair(image_id1, image_id2);
        Ok(self.tables.lock().matches.contains_key(&pair_id))
    }

    fn read_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<FeatureMatches> {
        let pair_id = PairId::from_image_pair(image_id1, image_id2);
        let swap = should_swap_image_pair(image_id1, image_id2);
        Ok(self
            .tables
            .lock()
            .matches
            .get(&pair_id)
            .map(|matches| oriented(matches, swap))
            .unwrap_or_default())
    }

    fn write_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[FeatureMatch],
    ) -> Result<()> {
        let pair_id = PairId::from_image_pair(image_id1, image_id2);
        let swap = should_swap_image_pair(image_id1, image_id2);
        let mut tables = self.tables.lock();
        if tables.matches.contains_key(&pair_id) {
            bail!("matches for pair ({image_id1}, {image_id2}) already exist");
        }
        tables.matches.insert(pair_id, oriented(matches, swap));
        Ok(())
    }

    fn delete_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<()> {
        let pair_id = PairId::from_image_pair(image_id1, image_id2);
        self.tables.lock().matches.remove(&pair_id);
        Ok(())
    }

    fn read_match_counts(&self) -> Result<Vec<((ImageId, ImageId), usize)>> {
        Ok(self
            .tables
            .lock()
            .matches
            .iter()
            .map(|(pair_id, matches)| (pair_id.to_image_pair(), matches.len()))
            .collect())
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.match_snapshot.is_some() {
            bail!("a transaction is already open");
        }
        tables.match_snapshot = Some(tables.matches.clone());
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.match_snapshot.take().is_none() {
            bail!("no open transaction to commit");
        }
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        let mut tables = self.tables.lock();
        match tables.match_snapshot.take() {
            Some(snapshot) => {
                tables.matches = snapshot;
                Ok(())
            }
            None => bail!("no open transaction to roll back"),
        }
    }
}
