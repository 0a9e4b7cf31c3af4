//! Descriptor matching kernels.
//!
//! The workers are kernel-agnostic: CPU workers call a shared
//! [`CpuMatchKernel`], GPU workers own a [`GpuMatchKernel`] created on
//! their thread by a [`GpuMatchKernelFactory`]. The built-in
//! [`BruteForceCpuMatcher`] covers the CPU side; GPU backends are supplied
//! by the caller.

use anyhow::{bail, Result};

use crate::options::MatchingConfig;
use crate::types::{FeatureDescriptors, FeatureMatch, FeatureMatches};

/// CPU descriptor matcher, shared by all CPU workers.
pub trait CpuMatchKernel: Send + Sync {
    fn match_descriptors(
        &self,
        descriptors1: &FeatureDescriptors,
        descriptors2: &FeatureDescriptors,
    ) -> Result<FeatureMatches>;
}

/// GPU descriptor matcher, owned by exactly one worker thread.
///
/// A `None` operand tells the kernel to reuse the descriptors still
/// resident on the device in that slot from the previous call. Upload
/// dominates kernel time for typical feature counts, so the elision is
/// what makes locality-preserving pair orders pay off.
pub trait GpuMatchKernel: Send {
    fn match_descriptors(
        &mut self,
        descriptors1: Option<&FeatureDescriptors>,
        descriptors2: Option<&FeatureDescriptors>,
    ) -> Result<FeatureMatches>;
}

/// Creates GPU kernels on their worker threads so a device context is
/// never shared between threads.
pub trait GpuMatchKernelFactory: Send + Sync {
    /// Number of usable devices, for `gpu_index = -1` expansion.
    fn num_devices(&self) -> usize;

    /// Build a kernel bound to the given device. Called on the worker
    /// thread; a failure aborts driver setup.
    fn create_kernel(&self, gpu_index: i32, config: &MatchingConfig)
        -> Result<Box<dyn GpuMatchKernel>>;
}

/// Brute-force matcher over L2-normalized descriptors with Lowe ratio
/// test, absolute distance threshold and optional cross check.
#[derive(Debug, Clone)]
pub struct BruteForceCpuMatcher {
    max_ratio: f32,
    max_distance: f32,
    cross_check: bool,
}

impl BruteForceCpuMatcher {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            max_ratio: config.max_ratio as f32,
            max_distance: config.max_distance as f32,
            cross_check: config.cross_check,
        }
    }
}

/// L2-normalize each descriptor row into float space.
fn normalize_rows(descriptors: &FeatureDescriptors) -> Vec<Vec<f32>> {
    descriptors
        .rows()
        .into_iter()
        .map(|row| {
            let mut values: Vec<f32> = row.iter().map(|&v| f32::from(v)).collect();
            let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for value in &mut values {
                    *value /= norm;
                }
            }
            values
        })
        .collect()
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Best and second-best neighbor of `query` among `rows`.
fn nearest_two(query: &[f32], rows: &[Vec<f32>]) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32)> = None;
    let mut second_best = f32::INFINITY;
    for (idx, row) in rows.iter().enumerate() {
        let dist = distance(query, row);
        match best {
            Some((_, best_dist)) if dist >= best_dist => {
                if dist < second_best {
                    second_best = dist;
                }
            }
            _ => {
                if let Some((_, best_dist)) = best {
                    second_best = best_dist;
                }
                best = Some((idx, dist));
            }
        }
    }
    best.map(|(idx, dist)| (idx, dist, second_best))
}

impl CpuMatchKernel for BruteForceCpuMatcher {
    fn match_descriptors(
        &self,
        descriptors1: &FeatureDescriptors,
        descriptors2: &FeatureDescriptors,
    ) -> Result<FeatureMatches> {
        if descriptors1.nrows() == 0 || descriptors2.nrows() == 0 {
            return Ok(Vec::new());
        }
        if descriptors1.ncols() != descriptors2.ncols() {
            bail!(
                "descriptor dimensions differ: {} vs {}",
                descriptors1.ncols(),
                descriptors2.ncols()
            );
        }

        let rows1 = normalize_rows(descriptors1);
        let rows2 = normalize_rows(descriptors2);

        let mut matches = Vec::new();
        for (idx1, query) in rows1.iter().enumerate() {
            let Some((idx2, best, second_best)) = nearest_two(query, &rows2) else {
                continue;
            };
            if best > self.max_distance {
                continue;
            }
            if second_best.is_finite() && best >= self.max_ratio * second_best {
                continue;
            }
            if self.cross_check {
                let Some((reverse_idx, _, _)) = nearest_two(&rows2[idx2], &rows1) else {
                    continue;
                };
                if reverse_idx != idx1 {
                    continue;
                }
            }
            matches.push(FeatureMatch::new(idx1 as u32, idx2 as u32));
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    /// Descriptors with one strong component per row, offset by `shift`.
    fn one_hot_descriptors(num: usize, shift: usize) -> FeatureDescriptors {
        let mut descriptors = Array2::zeros((num, 128));
        for i in 0..num {
            descriptors[[i, (i + shift) % 128]] = 255u8;
        }
        descriptors
    }

    fn test_config() -> MatchingConfig {
        MatchingConfig {
            min_num_matches: 1,
            ..MatchingConfig::default()
        }
    }

    #[test]
    fn test_identical_descriptors_match_one_to_one() {
        let matcher = BruteForceCpuMatcher::new(&test_config());
        let descriptors = one_hot_descriptors(6, 0);
        let matches = matcher.match_descriptors(&descriptors, &descriptors).unwrap();
        assert_eq!(matches.len(), 6);
        for m in &matches {
            assert_eq!(m.idx1, m.idx2);
        }
    }

    #[test]
    fn test_shifted_descriptors_match_shifted_indices() {
        let matcher = BruteForceCpuMatcher::new(&test_config());
        let descriptors1 = one_hot_descriptors(4, 0);
        let descriptors2 = one_hot_descriptors(4, 1);
        let matches = matcher
            .match_descriptors(&descriptors1, &descriptors2)
            .unwrap();
        // Row i of image 1 peaks at component i, which row i-1 of image 2
        // reproduces exactly.
        assert_eq!(matches.len(), 3);
        for m in &matches {
            assert_eq!(m.idx1, m.idx2 + 1);
        }
    }

    #[test]
    fn test_empty_inputs_yield_no_matches() {
        let matcher = BruteForceCpuMatcher::new(&test_config());
        let empty: FeatureDescriptors = Array2::zeros((0, 128));
        let descriptors = one_hot_descriptors(3, 0);
        assert!(matcher.match_descriptors(&empty, &descriptors).unwrap().is_empty());
        assert!(matcher.match_descriptors(&descriptors, &empty).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let matcher = BruteForceCpuMatcher::new(&test_config());
        let descriptors1: FeatureDescriptors = Array2::zeros((2, 128));
        let descriptors2: FeatureDescriptors = Array2::zeros((2, 64));
        assert!(matcher
            .match_descriptors(&descriptors1, &descriptors2)
            .is_err());
    }

    #[test]
    fn test_ambiguous_match_fails_ratio_test() {
        let matcher = BruteForceCpuMatcher::new(&test_config());
        let descriptors1 = one_hot_descriptors(1, 0);
        // Two identical candidates: best and second-best distances tie, so
        // the ratio test rejects the correspondence.
        let mut descriptors2 = Array2::zeros((2, 128));
        descriptors2[[0, 0]] = 255u8;
        descriptors2[[1, 0]] = 255u8;
        let matches = matcher
            .match_descriptors(&descriptors1, &descriptors2)
            .unwrap();
        assert!(matches.is_empty());
    }
}
