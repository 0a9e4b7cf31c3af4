//! Long-lived matcher workers.
//!
//! Each worker pops pair jobs from the shared input queue, fetches
//! descriptors through the cache, invokes its kernel and pushes exactly
//! one output per job. Workers exit when the input queue is stopped and
//! drained.

use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::Sender;
use tracing::debug;

use crate::cache::MatcherCache;
use crate::matcher::kernel::{CpuMatchKernel, GpuMatchKernel, GpuMatchKernelFactory};
use crate::options::MatchingConfig;
use crate::queue::JobQueue;
use crate::types::{FeatureDescriptors, FeatureMatches, ImageId};

use super::pool::{MatchOutput, PairJob};

/// Everything a worker needs besides its kernel.
pub(crate) struct WorkerContext {
    pub min_num_matches: usize,
    pub max_num_matches: usize,
    pub cache: Arc<MatcherCache>,
    pub input: Arc<JobQueue<PairJob>>,
    pub output: Arc<JobQueue<MatchOutput>>,
}

impl WorkerContext {
    /// Apply the per-pair limits and push the result. Returns `false`
    /// when the output queue has been stopped.
    fn push_output(&self, job: &PairJob, matches: Result<FeatureMatches>) -> bool {
        let matches = matches.map(|mut matches| {
            matches.truncate(self.max_num_matches);
            if matches.len() < self.min_num_matches {
                matches.clear();
            }
            matches
        });
        self.output.push(MatchOutput {
            image_id1: job.image_id1,
            image_id2: job.image_id2,
            matches,
        })
    }
}

pub(crate) fn run_cpu_worker(
    context: WorkerContext,
    kernel: Arc<dyn CpuMatchKernel>,
    setup_tx: Sender<Result<()>>,
) {
    // CPU workers have no device state to initialize.
    let _ = setup_tx.send(Ok(()));

    while let Some(job) = context.input.pop() {
        let matches = match_on_cpu(&context, kernel.as_ref(), &job);
        if !context.push_output(&job, matches) {
            break;
        }
    }
    debug!("cpu matcher worker exiting");
}

fn match_on_cpu(
    context: &WorkerContext,
    kernel: &dyn CpuMatchKernel,
    job: &PairJob,
) -> Result<FeatureMatches> {
    let descriptors1 = context.cache.descriptors(job.image_id1)?;
    let descriptors2 = context.cache.descriptors(job.image_id2)?;
    kernel.match_descriptors(&descriptors1, &descriptors2)
}

pub(crate) fn run_gpu_worker(
    context: WorkerContext,
    factory: Arc<dyn GpuMatchKernelFactory>,
    gpu_index: i32,
    config: MatchingConfig,
    setup_tx: Sender<Result<()>>,
) {
    // The kernel is created on this thread so the device context is never
    // shared; a failure here is the setup-invalid signal.
    let mut kernel = match factory.create_kernel(gpu_index, &config) {
        Ok(kernel) => {
            let _ = setup_tx.send(Ok(()));
            kernel
        }
        Err(err) => {
            let _ = setup_tx.send(Err(err));
            return;
        }
    };

    let mut slots = DeviceSlots::default();
    while let Some(job) = context.input.pop() {
        let matches = match_on_gpu(&context, kernel.as_mut(), &mut slots, &job);
        if !context.push_output(&job, matches) {
            break;
        }
    }
    debug!(gpu_index, "gpu matcher worker exiting");
}

/// Which image's descriptors are resident on the device per operand slot.
#[derive(Default)]
struct DeviceSlots {
    resident: [Option<ImageId>; 2],
}

impl DeviceSlots {
    /// Descriptors to upload for a slot, or `None` when the slot already
    /// holds this image's descriptors and the kernel can reuse them.
    fn fetch(
        &mut self,
        slot: usize,
        image_id: ImageId,
        cache: &MatcherCache,
    ) -> Result<Option<Arc<FeatureDescriptors>>> {
        if self.resident[slot] == Some(image_id) {
            return Ok(None);
        }
        let descriptors = cache.descriptors(image_id)?;
        self.resident[slot] = Some(image_id);
        Ok(Some(descriptors))
    }
}

fn match_on_gpu(
    context: &WorkerContext,
    kernel: &mut dyn GpuMatchKernel,
    slots: &mut DeviceSlots,
    job: &PairJob,
) -> Result<FeatureMatches> {
    let descriptors1 = slots.fetch(0, job.image_id1, &context.cache)?;
    let descriptors2 = slots.fetch(1, job.image_id2, &context.cache)?;
    kernel.match_descriptors(descriptors1.as_deref(), descriptors2.as_deref())
}
