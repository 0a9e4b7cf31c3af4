//! Descriptor matching kernels, workers and the worker pool.

pub mod kernel;
mod pool;
mod worker;

pub use kernel::{BruteForceCpuMatcher, CpuMatchKernel, GpuMatchKernel, GpuMatchKernelFactory};
pub use pool::{KernelSet, MatcherPool, PairJob};
