//! Core identifier and data types shared across the matching pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{Vector3, Vector4};
use ndarray::Array2;

/// Base of the pair-id encoding; image ids must stay below this value.
pub const MAX_NUM_IMAGES: u64 = 2_147_483_647;

/// Unique identifier for an image in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

impl ImageId {
    /// Create a new ImageId with the given value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a camera in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub u32);

impl CameraId {
    /// Create a new CameraId with the given value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical identifier for an unordered image pair.
///
/// Symmetric in its arguments and injective over unordered pairs, which is
/// what makes it usable as a deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(pub u64);

impl PairId {
    /// Canonical id for the unordered pair `(image_id1, image_id2)`.
    pub fn from_image_pair(image_id1: ImageId, image_id2: ImageId) -> Self {
        let (small, large) = if image_id1.0 <= image_id2.0 {
            (image_id1, image_id2)
        } else {
            (image_id2, image_id1)
        };
        Self(u64::from(small.0) * MAX_NUM_IMAGES + u64::from(large.0))
    }

    /// Recover the image ids, smaller id first.
    pub fn to_image_pair(self) -> (ImageId, ImageId) {
        let image_id1 = (self.0 / MAX_NUM_IMAGES) as u32;
        let image_id2 = (self.0 % MAX_NUM_IMAGES) as u32;
        (ImageId(image_id1), ImageId(image_id2))
    }
}

/// Whether a pair given as `(image_id1, image_id2)` is stored with its ids
/// swapped. Matches are persisted smaller-id-first; callers that pass the
/// opposite orientation get their feature index columns swapped.
pub fn should_swap_image_pair(image_id1: ImageId, image_id2: ImageId) -> bool {
    image_id1.0 > image_id2.0
}

/// A correspondence between one feature in each image of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMatch {
    /// Feature index in the first image.
    pub idx1: u32,
    /// Feature index in the second image.
    pub idx2: u32,
}

impl FeatureMatch {
    pub fn new(idx1: u32, idx2: u32) -> Self {
        Self { idx1, idx2 }
    }
}

/// Ordered correspondences for one directed image pair.
pub type FeatureMatches = Vec<FeatureMatch>;

/// Dense per-image descriptor block, one row per feature.
pub type FeatureDescriptors = Array2<u8>;

/// Camera intrinsics. Read-only for the matching stage.
#[derive(Debug, Clone)]
pub struct Camera {
    pub camera_id: CameraId,
    /// Intrinsic parameters in the producer's calibration convention.
    pub params: Vec<f64>,
}

/// Image metadata. Read-only for the matching stage.
#[derive(Debug, Clone)]
pub struct Image {
    pub image_id: ImageId,
    /// Unique image name, typically the path below the image root.
    pub name: String,
    pub camera_id: CameraId,
    /// Translation prior, Cartesian or geographic lat/lon/alt.
    pub tvec_prior: Vector3<f64>,
    /// Optional rotation prior as a wxyz quaternion.
    pub qvec_prior: Option<Vector4<f64>>,
}

impl Image {
    /// Whether the translation prior carries usable location data. With
    /// `ignore_z` only the first two components are considered.
    pub fn has_location_prior(&self, ignore_z: bool) -> bool {
        if ignore_z {
            self.tvec_prior.x != 0.0 || self.tvec_prior.y != 0.0
        } else {
            self.tvec_prior.x != 0.0 || self.tvec_prior.y != 0.0 || self.tvec_prior.z != 0.0
        }
    }
}

/// Cooperative cancellation flag shared between a driver and its caller.
///
/// Drivers observe the flag between batches and workers between jobs; a
/// matching kernel call in flight is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop at the next batch or job boundary.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_id_symmetric() {
        let a = ImageId::new(3);
        let b = ImageId::new(17);
        assert_eq!(PairId::from_image_pair(a, b), PairId::from_image_pair(b, a));
    }

    #[test]
    fn test_pair_id_roundtrip() {
        let a = ImageId::new(42);
        let b = ImageId::new(7);
        let pair_id = PairId::from_image_pair(a, b);
        assert_eq!(pair_id.to_image_pair(), (b, a));
    }

    #[test]
    fn test_pair_id_injective() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for i in 0..20u32 {
            for j in (i + 1)..20u32 {
                assert!(seen.insert(PairId::from_image_pair(ImageId(i), ImageId(j))));
            }
        }
    }

    #[test]
    fn test_should_swap_image_pair() {
        assert!(should_swap_image_pair(ImageId(5), ImageId(2)));
        assert!(!should_swap_image_pair(ImageId(2), ImageId(5)));
        assert!(!should_swap_image_pair(ImageId(2), ImageId(2)));
    }

    #[test]
    fn test_location_prior() {
        let mut image = Image {
            image_id: ImageId::new(1),
            name: "a.jpg".to_string(),
            camera_id: CameraId::new(1),
            tvec_prior: Vector3::new(0.0, 0.0, 5.0),
            qvec_prior: None,
        };
        assert!(image.has_location_prior(false));
        assert!(!image.has_location_prior(true));

        image.tvec_prior = Vector3::zeros();
        assert!(!image.has_location_prior(false));
    }

    #[test]
    fn test_stop_token() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        assert!(clone.is_stopped());
    }
}
