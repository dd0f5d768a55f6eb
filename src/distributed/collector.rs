//! Global collectors: how a worker sees the rest of the global batch

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use super::communication::ExchangeHub;
use crate::{
    contrastive::PairIndex,
    error::{ContrastError, ContrastResult},
    tensor::Tensor,
};

/// Collective operations a training step needs from its replica group.
///
/// Every method is a barrier: all ranks must call it the same number of
/// times in the same order, and all ranks observe identical results.
pub trait GlobalCollector: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Concatenate every rank's rows in rank order. The result is detached.
    fn all_gather(&self, local: &Tensor<2>) -> ContrastResult<Tensor<2>>;

    /// Concatenate every rank's labels in rank order
    fn all_gather_labels(&self, labels: &[i64]) -> ContrastResult<Vec<i64>>;

    /// Element-wise sum over ranks
    fn all_reduce_sum(&self, values: &[f32]) -> ContrastResult<Vec<f32>>;

    /// Global positions of this rank's own rows after [`all_gather`](Self::all_gather)
    fn pair_indices(&self, local_batch: usize) -> PairIndex {
        PairIndex::rank_major(self.rank(), local_batch)
    }
}

/// Single-process collector: every collective is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCollector;

impl GlobalCollector for IdentityCollector {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, local: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        Ok(local.detach())
    }

    fn all_gather_labels(&self, labels: &[i64]) -> ContrastResult<Vec<i64>> {
        Ok(labels.to_vec())
    }

    fn all_reduce_sum(&self, values: &[f32]) -> ContrastResult<Vec<f32>> {
        Ok(values.to_vec())
    }
}

/// Which collector a run uses, resolved once from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum CollectorKind {
    Identity,
    Replicated { world_size: usize },
}

impl CollectorKind {
    pub fn for_workers(num_workers: usize) -> Self {
        if num_workers <= 1 {
            CollectorKind::Identity
        } else {
            CollectorKind::Replicated { world_size: num_workers }
        }
    }

    pub fn world_size(&self) -> usize {
        match self {
            CollectorKind::Identity => 1,
            CollectorKind::Replicated { world_size } => *world_size,
        }
    }
}

struct ReplicaShared {
    features: ExchangeHub<Tensor<2>>,
    labels: ExchangeHub<Vec<i64>>,
    sums: ExchangeHub<Vec<f32>>,
}

/// A fixed set of data-parallel replicas sharing exchange hubs
pub struct ReplicaGroup {
    shared: Arc<ReplicaShared>,
    world_size: usize,
}

impl ReplicaGroup {
    pub fn new(world_size: usize, timeout: Duration) -> ContrastResult<Self> {
        if world_size == 0 {
            return Err(ContrastError::ConfigurationError(
                "replica group needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(ReplicaShared {
                features: ExchangeHub::new(world_size, timeout),
                labels: ExchangeHub::new(world_size, timeout),
                sums: ExchangeHub::new(world_size, timeout),
            }),
            world_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Handle for one rank. Each rank must be driven by its own thread.
    pub fn collector(&self, rank: usize) -> ContrastResult<BarrierCollector> {
        if rank >= self.world_size {
            return Err(ContrastError::DistributedError(format!(
                "rank {} outside world of {}",
                rank, self.world_size
            )));
        }
        Ok(BarrierCollector {
            shared: Arc::clone(&self.shared),
            rank,
            world_size: self.world_size,
        })
    }

    /// Run `worker` once per rank on scoped threads and collect the results in rank order
    pub fn run<R, F>(&self, worker: F) -> Vec<ContrastResult<R>>
    where
        R: Send,
        F: Fn(BarrierCollector) -> ContrastResult<R> + Sync,
    {
        let worker = &worker;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.world_size)
                .map(|rank| {
                    let collector = self.collector(rank);
                    scope.spawn(move || collector.and_then(worker))
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(ContrastError::DistributedError(format!("worker {} panicked", rank)))
                    })
                })
                .collect()
        })
    }
}

/// Run `worker` once per rank of `kind` and return the results in rank order.
///
/// A single worker runs inline on the calling thread. When any rank fails,
/// the first failure that is not a collective timeout is reported, since the
/// other ranks' timeouts are usually a consequence of it.
pub fn run_replicas<R, F>(kind: CollectorKind, timeout: Duration, worker: F) -> ContrastResult<Vec<R>>
where
    R: Send,
    F: Fn(&dyn GlobalCollector) -> ContrastResult<R> + Sync,
{
    let results = match kind {
        CollectorKind::Identity => vec![worker(&IdentityCollector)],
        CollectorKind::Replicated { world_size } => {
            ReplicaGroup::new(world_size, timeout)?.run(|collector| worker(&collector))
        }
    };

    let mut outputs = Vec::with_capacity(results.len());
    let mut first_error: Option<ContrastError> = None;
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => {
                let replace = match &first_error {
                    None => true,
                    Some(ContrastError::DistributedError(_)) => {
                        !matches!(e, ContrastError::DistributedError(_))
                    }
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(outputs),
    }
}

/// Collector handle for one rank of a [`ReplicaGroup`]
pub struct BarrierCollector {
    shared: Arc<ReplicaShared>,
    rank: usize,
    world_size: usize,
}

impl GlobalCollector for BarrierCollector {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, local: &Tensor<2>) -> ContrastResult<Tensor<2>> {
        let parts = self.shared.features.exchange(self.rank, local.detach())?;

        let sizes: Vec<usize> = parts.iter().map(|p| p.rows()).collect();
        if sizes.iter().any(|&s| s != sizes[0]) {
            return Err(ContrastError::batch_size_mismatch(&sizes));
        }
        if let Some(odd) = parts.iter().find(|p| p.cols() != parts[0].cols()) {
            return Err(ContrastError::shape_mismatch(
                "gathered features",
                &format!("[_, {}] on every rank", parts[0].cols()),
                &odd.shape().to_string(),
            ));
        }

        Ok(Tensor::concat_rows(&parts)?.detach())
    }

    fn all_gather_labels(&self, labels: &[i64]) -> ContrastResult<Vec<i64>> {
        let parts = self.shared.labels.exchange(self.rank, labels.to_vec())?;

        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
        if sizes.iter().any(|&s| s != sizes[0]) {
            return Err(ContrastError::batch_size_mismatch(&sizes));
        }

        Ok(parts.iter().flatten().copied().collect())
    }

    fn all_reduce_sum(&self, values: &[f32]) -> ContrastResult<Vec<f32>> {
        let parts = self.shared.sums.exchange(self.rank, values.to_vec())?;

        if let Some(odd) = parts.iter().find(|p| p.len() != values.len()) {
            return Err(ContrastError::shape_mismatch(
                "all_reduce_sum",
                &format!("{} values on every rank", values.len()),
                &odd.len().to_string(),
            ));
        }

        // rank order keeps the float summation identical on every worker
        let mut total = vec![0.0f32; values.len()];
        for part in parts.iter() {
            for (t, v) in total.iter_mut().zip(part) {
                *t += v;
            }
        }
        Ok(total)
    }
}
