//! Blocking all-workers exchange used by the replica collectors

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{ContrastError, ContrastResult};

/// Rendezvous point where every rank deposits one item per round and all
/// ranks receive the full rank-ordered list once the last one arrives.
pub struct ExchangeHub<T> {
    world_size: usize,
    timeout: Duration,
    state: Mutex<HubState<T>>,
    round_complete: Condvar,
}

struct HubState<T> {
    generation: u64,
    pending: usize,
    slots: Vec<Option<T>>,
    published: Arc<Vec<T>>,
}

impl<T: Send> ExchangeHub<T> {
    pub fn new(world_size: usize, timeout: Duration) -> Self {
        Self {
            world_size,
            timeout,
            state: Mutex::new(HubState {
                generation: 0,
                pending: 0,
                slots: (0..world_size).map(|_| None).collect(),
                published: Arc::new(Vec::new()),
            }),
            round_complete: Condvar::new(),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Deposit `item` for `rank` and block until every rank has deposited.
    ///
    /// A round only completes once all ranks arrive, so the published list
    /// cannot be replaced before every waiter of that round has read it.
    pub fn exchange(&self, rank: usize, item: T) -> ContrastResult<Arc<Vec<T>>> {
        if rank >= self.world_size {
            return Err(ContrastError::DistributedError(format!(
                "rank {} outside world of {}",
                rank, self.world_size
            )));
        }

        let mut state = self.state.lock();
        if state.slots[rank].is_some() {
            return Err(ContrastError::DistributedError(format!(
                "rank {} entered the same exchange round twice",
                rank
            )));
        }
        state.slots[rank] = Some(item);
        state.pending += 1;
        let generation = state.generation;

        if state.pending == self.world_size {
            let items = state
                .slots
                .iter_mut()
                .map(Option::take)
                .collect::<Option<Vec<T>>>()
                .ok_or_else(|| {
                    ContrastError::DistributedError("exchange completed with an empty slot".to_string())
                })?;
            state.published = Arc::new(items);
            state.pending = 0;
            state.generation += 1;
            self.round_complete.notify_all();
            return Ok(Arc::clone(&state.published));
        }

        let deadline = Instant::now() + self.timeout;
        while state.generation == generation {
            if self.round_complete.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                state.slots[rank] = None;
                state.pending -= 1;
                tracing::warn!(
                    rank,
                    arrived = state.pending,
                    world_size = self.world_size,
                    "exchange timed out waiting for peers"
                );
                return Err(ContrastError::DistributedError(format!(
                    "rank {} timed out after {:?} waiting for {} peers",
                    rank,
                    self.timeout,
                    self.world_size - state.pending - 1
                )));
            }
        }

        Ok(Arc::clone(&state.published))
    }
}
