//! Worker pool and the per-batch dispatch primitive.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use tracing::debug;

use crate::cache::MatcherCache;
use crate::matcher::kernel::{BruteForceCpuMatcher, CpuMatchKernel, GpuMatchKernelFactory};
use crate::options::MatchingConfig;
use crate::queue::JobQueue;
use crate::types::{FeatureMatches, ImageId, PairId};

use super::worker::{run_cpu_worker, run_gpu_worker, WorkerContext};

/// Capacity of the input queue; pushes beyond it block the dispatcher
/// until the workers catch up.
const INPUT_QUEUE_CAPACITY: usize = 128;

/// Unit of work dispatched to the workers.
#[derive(Debug, Clone, Copy)]
pub struct PairJob {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
}

/// One result per dispatched job. A failed job carries the error so the
/// dispatcher can keep its result accounting intact before propagating.
pub(crate) struct MatchOutput {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub matches: Result<FeatureMatches>,
}

/// Matching kernels available to a pool.
#[derive(Clone)]
pub struct KernelSet {
    pub cpu: Arc<dyn CpuMatchKernel>,
    pub gpu: Option<Arc<dyn GpuMatchKernelFactory>>,
}

impl KernelSet {
    /// The built-in brute-force CPU kernel and no GPU backend.
    pub fn cpu_only(config: &MatchingConfig) -> Self {
        Self {
            cpu: Arc::new(BruteForceCpuMatcher::new(config)),
            gpu: None,
        }
    }
}

enum WorkerPlan {
    Cpu,
    Gpu { gpu_index: i32 },
}

/// Owns the matcher workers and both job queues.
///
/// Lifecycle: construct, `setup()` (starts the workers), any number of
/// `match_pairs()` calls, then drop. Dropping drains the queues, stops
/// them and joins every worker.
pub struct MatcherPool {
    config: MatchingConfig,
    cache: Arc<MatcherCache>,
    kernels: KernelSet,
    plans: Vec<WorkerPlan>,
    input: Arc<JobQueue<PairJob>>,
    output: Arc<JobQueue<MatchOutput>>,
    workers: Vec<JoinHandle<()>>,
    is_setup: bool,
}

impl MatcherPool {
    pub fn new(config: MatchingConfig, cache: Arc<MatcherCache>, kernels: KernelSet) -> Result<Self> {
        config.check()?;

        let plans = if config.use_gpu {
            let factory = kernels
                .gpu
                .as_ref()
                .context("GPU matching requested but no GPU kernel factory was provided")?;
            let mut gpu_indices = config.gpu_indices()?;
            if gpu_indices.len() == 1 && gpu_indices[0] == -1 {
                let num_devices = factory.num_devices();
                if num_devices == 0 {
                    bail!("no GPU devices available");
                }
                gpu_indices = (0..num_devices as i32).collect();
            }
            gpu_indices
                .into_iter()
                .map(|gpu_index| WorkerPlan::Gpu { gpu_index })
                .collect()
        } else {
            (0..config.effective_num_threads())
                .map(|_| WorkerPlan::Cpu)
                .collect()
        };

        Ok(Self {
            config,
            cache,
            kernels,
            plans,
            input: Arc::new(JobQueue::with_capacity(INPUT_QUEUE_CAPACITY)),
            output: Arc::new(JobQueue::new()),
            workers: Vec::new(),
            is_setup: false,
        })
    }

    /// Number of workers this pool runs.
    pub fn num_workers(&self) -> usize {
        self.plans.len()
    }

    /// Clamp the options against the database and start the workers.
    ///
    /// Fails if any worker reports an invalid setup; already-started
    /// workers are stopped and joined before returning.
    pub fn setup(&mut self) -> Result<()> {
        if self.is_setup {
            return Ok(());
        }

        // No pair can have more matches than the largest descriptor count.
        let max_num_features = self.cache.max_num_descriptors()?;
        if max_num_features > 0 {
            self.config.max_num_matches = self.config.max_num_matches.min(max_num_features);
        }

        let (setup_tx, setup_rx) = bounded::<Result<()>>(self.plans.len());
        for plan in &self.plans {
            let context = WorkerContext {
                min_num_matches: self.config.min_num_matches,
                max_num_matches: self.config.max_num_matches,
                cache: Arc::clone(&self.cache),
                input: Arc::clone(&self.input),
                output: Arc::clone(&self.output),
            };
            let setup_tx = setup_tx.clone();
            match plan {
                WorkerPlan::Cpu => {
                    let kernel = Arc::clone(&self.kernels.cpu);
                    self.workers
                        .push(thread::spawn(move || run_cpu_worker(context, kernel, setup_tx)));
                }
                WorkerPlan::Gpu { gpu_index } => {
                    let factory = Arc::clone(
                        self.kernels
                            .gpu
                            .as_ref()
                            .context("GPU worker planned without a kernel factory")?,
                    );
                    let gpu_index = *gpu_index;
                    let config = self.config.clone();
                    self.workers.push(thread::spawn(move || {
                        run_gpu_worker(context, factory, gpu_index, config, setup_tx)
                    }));
                }
            }
        }
        drop(setup_tx);

        for _ in 0..self.plans.len() {
            match setup_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.shutdown();
                    return Err(err.context("matcher worker setup failed"));
                }
                Err(_) => {
                    self.shutdown();
                    bail!("matcher worker exited before signaling setup");
                }
            }
        }

        debug!(num_workers = self.workers.len(), "matcher pool ready");
        self.is_setup = true;
        Ok(())
    }

    /// Match a batch of image pairs and write the results through the
    /// cache. The caller holds the enclosing database transaction.
    ///
    /// Self-pairs, duplicates (by canonical pair id) and pairs already in
    /// the database are skipped; exactly one result per surviving pair is
    /// awaited, so worker completion order does not matter.
    pub fn match_pairs(&self, image_pairs: &[(ImageId, ImageId)]) -> Result<()> {
        if !self.is_setup {
            bail!("matcher pool used before setup");
        }
        if image_pairs.is_empty() {
            return Ok(());
        }

        let mut pair_ids = HashSet::with_capacity(image_pairs.len());
        let mut num_outputs = 0usize;
        for &(image_id1, image_id2) in image_pairs {
            if image_id1 == image_id2 {
                continue;
            }
            let pair_id = PairId::from_image_pair(image_id1, image_id2);
            if !pair_ids.insert(pair_id) {
                continue;
            }
            if self.cache.exists_matches(image_id1, image_id2)? {
                continue;
            }
            num_outputs += 1;
            if !self.input.push(PairJob {
                image_id1,
                image_id2,
            }) {
                bail!("input queue stopped during dispatch");
            }
        }

        // Pop exactly as many results as were enqueued, even past a
        // failure, so the queues are empty when we return and the
        // enclosing transaction can roll back cleanly.
        let mut first_error = None;
        for _ in 0..num_outputs {
            let Some(output) = self.output.pop() else {
                bail!("output queue stopped while awaiting results");
            };
            match output.matches {
                Ok(mut matches) => {
                    if matches.len() < self.config.min_num_matches {
                        matches.clear();
                    }
                    if first_error.is_none() {
                        if let Err(err) =
                            self.cache
                                .write_matches(output.image_id1, output.image_id2, &matches)
                        {
                            first_error = Some(err);
                        }
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        if !self.output.is_empty() {
            bail!("output queue not empty after dispatch");
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.input.wait();
        self.output.wait();
        self.input.stop();
        self.output.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("matcher worker panicked");
            }
        }
    }
}

impl Drop for MatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
