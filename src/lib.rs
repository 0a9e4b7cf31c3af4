//! Feature-matching orchestration for structure-from-motion pipelines.
//!
//! Given a database of images, cameras and per-image feature descriptors,
//! this crate enumerates candidate image pairs under several strategies
//! (exhaustive, sequential, spatial, transitive, user-supplied list),
//! matches their descriptors on a pool of CPU or GPU workers, and writes
//! the resulting correspondences back to the database in transactional
//! batches. A bounded LRU cache keeps each batch's descriptors resident
//! between jobs.

pub mod cache;
pub mod database;
pub mod gps;
pub mod matcher;
pub mod options;
pub mod pairing;
pub mod queue;
pub mod types;
