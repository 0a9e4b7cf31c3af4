//! Caches between the matching workers and the database.
//!
//! Camera and image metadata is loaded eagerly during setup and read
//! without locking afterwards. Descriptor blobs go through a bounded LRU
//! keyed by image id; the LRU and every database access share one mutex
//! because the backing store is not assumed reentrant.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::Mutex;

use crate::database::Database;
use crate::types::{Camera, CameraId, FeatureDescriptors, FeatureMatch, FeatureMatches, Image, ImageId};

/// Metadata and descriptor cache shared by the dispatch loop and workers.
pub struct MatcherCache {
    database: Arc<dyn Database>,
    cameras: HashMap<CameraId, Camera>,
    images: HashMap<ImageId, Image>,
    /// Descriptor LRU and the database critical section.
    descriptors: Mutex<LruCache<ImageId, Arc<FeatureDescriptors>>>,
}

impl MatcherCache {
    /// `cache_size` bounds how many descriptor blobs stay resident. The
    /// driver picks it so one batch's working set fits.
    pub fn new(cache_size: usize, database: Arc<dyn Database>) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            database,
            cameras: HashMap::new(),
            images: HashMap::new(),
            descriptors: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Eagerly load the camera and image tables.
    pub fn setup(&mut self) -> Result<()> {
        let cameras = self.database.read_all_cameras()?;
        self.cameras = cameras
            .into_iter()
            .map(|camera| (camera.camera_id, camera))
            .collect();

        let images = self.database.read_all_images()?;
        self.images = images
            .into_iter()
            .map(|image| (image.image_id, image))
            .collect();

        Ok(())
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&Camera> {
        self.cameras.get(&camera_id)
    }

    pub fn image(&self, image_id: ImageId) -> Option<&Image> {
        self.images.get(&image_id)
    }

    /// All image ids, ascending.
    pub fn image_ids(&self) -> Vec<ImageId> {
        let mut image_ids: Vec<ImageId> = self.images.keys().copied().collect();
        image_ids.sort_unstable();
        image_ids
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// Descriptors for an image, from the cache or the database. The
    /// returned blob stays valid for as long as the caller holds it; a
    /// load failure is fatal for the driver.
    pub fn descriptors(&self, image_id: ImageId) -> Result<Arc<FeatureDescriptors>> {
        let mut descriptors = self.descriptors.lock();
        if let Some(cached) = descriptors.get(&image_id) {
            return Ok(Arc::clone(cached));
        }
        let loaded = Arc::new(
            self.database
                .read_descriptors(image_id)
                .with_context(|| format!("loading descriptors for image {image_id}"))?,
        );
        descriptors.put(image_id, Arc::clone(&loaded));
        Ok(loaded)
    }

    pub fn exists_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<bool> {
        let _database_guard = self.descriptors.lock();
        self.database.exists_matches(image_id1, image_id2)
    }

    pub fn read_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<FeatureMatches> {
        let _database_guard = self.descriptors.lock();
        self.database.read_matches(image_id1, image_id2)
    }

    pub fn write_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[FeatureMatch],
    ) -> Result<()> {
        let _database_guard = self.descriptors.lock();
        self.database.write_matches(image_id1, image_id2, matches)
    }

    pub fn delete_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<()> {
        let _database_guard = self.descriptors.lock();
        self.database.delete_matches(image_id1, image_id2)
    }

    pub fn max_num_descriptors(&self) -> Result<usize> {
        let _database_guard = self.descriptors.lock();
        self.database.max_num_descriptors()
    }

    /// Number of descriptor blobs currently resident.
    pub fn num_cached_descriptors(&self) -> usize {
        self.descriptors.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nalgebra::Vector3;
    use ndarray::Array2;

    use crate::database::InMemoryDatabase;

    use super::*;

    /// Database wrapper counting descriptor reads.
    struct CountingDatabase {
        inner: InMemoryDatabase,
        descriptor_reads: AtomicUsize,
    }

    impl Database for CountingDatabase {
        fn read_all_cameras(&self) -> Result<Vec<Camera>> {
            self.inner.read_all_cameras()
        }
        fn read_all_images(&self) -> Result<Vec<Image>> {
            self.inner.read_all_images()
        }
        fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors> {
            self.descriptor_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_descriptors(image_id)
        }
        fn max_num_descriptors(&self) -> Result<usize> {
            self.inner.max_num_descriptors()
        }
        fn exists_matches(&self, a: ImageId, b: ImageId) -> Result<bool> {
            self.inner.exists_matches(a, b)
        }
        fn read_matches(&self, a: ImageId, b: ImageId) -> Result<FeatureMatches> {
            self.inner.read_matches(a, b)
        }
        fn write_matches(&self, a: ImageId, b: ImageId, matches: &[FeatureMatch]) -> Result<()> {
            self.inner.write_matches(a, b, matches)
        }
        fn delete_matches(&self, a: ImageId, b: ImageId) -> Result<()> {
            self.inner.delete_matches(a, b)
        }
        fn read_match_counts(&self) -> Result<Vec<((ImageId, ImageId), usize)>> {
            self.inner.read_match_counts()
        }
        fn begin_transaction(&self) -> Result<()> {
            self.inner.begin_transaction()
        }
        fn commit_transaction(&self) -> Result<()> {
            self.inner.commit_transaction()
        }
        fn rollback_transaction(&self) -> Result<()> {
            self.inner.rollback_transaction()
        }
    }

    fn seeded_database(num_images: u32) -> CountingDatabase {
        let inner = InMemoryDatabase::new();
        inner.add_camera(Camera {
            camera_id: CameraId::new(1),
            params: vec![500.0],
        });
        for i in 1..=num_images {
            inner.add_image(Image {
                image_id: ImageId::new(i),
                name: format!("image{i:04}.jpg"),
                camera_id: CameraId::new(1),
                tvec_prior: Vector3::zeros(),
                qvec_prior: None,
            });
            inner.add_descriptors(ImageId::new(i), Array2::zeros((4, 128)));
        }
        CountingDatabase {
            inner,
            descriptor_reads: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_setup_loads_metadata() {
        let database = Arc::new(seeded_database(3));
        let mut cache = MatcherCache::new(8, database);
        cache.setup().unwrap();

        assert_eq!(cache.num_images(), 3);
        assert_eq!(
            cache.image_ids(),
            vec![ImageId::new(1), ImageId::new(2), ImageId::new(3)]
        );
        assert!(cache.camera(CameraId::new(1)).is_some());
        assert_eq!(cache.image(ImageId::new(2)).unwrap().name, "image0002.jpg");
    }

    #[test]
    fn test_descriptor_hits_skip_the_database() {
        let database = Arc::new(seeded_database(2));
        let mut cache = MatcherCache::new(8, Arc::clone(&database) as Arc<dyn Database>);
        cache.setup().unwrap();

        cache.descriptors(ImageId::new(1)).unwrap();
        cache.descriptors(ImageId::new(1)).unwrap();
        cache.descriptors(ImageId::new(2)).unwrap();

        assert_eq!(database.descriptor_reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lru_capacity_is_respected() {
        let database = Arc::new(seeded_database(10));
        let mut cache = MatcherCache::new(3, Arc::clone(&database) as Arc<dyn Database>);
        cache.setup().unwrap();

        for i in 1..=10 {
            cache.descriptors(ImageId::new(i)).unwrap();
            assert!(cache.num_cached_descriptors() <= 3);
        }
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let database = Arc::new(seeded_database(3));
        let mut cache = MatcherCache::new(2, Arc::clone(&database) as Arc<dyn Database>);
        cache.setup().unwrap();

        cache.descriptors(ImageId::new(1)).unwrap();
        cache.descriptors(ImageId::new(2)).unwrap();
        // Touch image 1 so image 2 becomes the eviction candidate.
        cache.descriptors(ImageId::new(1)).unwrap();
        cache.descriptors(ImageId::new(3)).unwrap();

        let reads_before = database.descriptor_reads.load(Ordering::SeqCst);
        cache.descriptors(ImageId::new(1)).unwrap();
        assert_eq!(database.descriptor_reads.load(Ordering::SeqCst), reads_before);

        cache.descriptors(ImageId::new(2)).unwrap();
        assert_eq!(
            database.descriptor_reads.load(Ordering::SeqCst),
            reads_before + 1
        );
    }

    #[test]
    fn test_missing_descriptors_propagate() {
        let database = Arc::new(seeded_database(1));
        let mut cache = MatcherCache::new(2, database);
        cache.setup().unwrap();
        assert!(cache.descriptors(ImageId::new(99)).is_err());
    }
}
