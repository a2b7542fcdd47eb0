//! Block-wide barrier.
//!
//! Inside a cluster, threads park on a wait/wake barrier. The cluster leader (lane 0) waits
//! until every participating thread of its cluster has arrived, then, if the block spans
//! several clusters, joins the other leaders on the block's `WaitGroup` before waking its
//! cluster. The `WaitGroup` alternates between two counters so a fast leader entering the
//! next barrier never disturbs the counter the slow ones are still spinning on.

use crate::{Fault, Result};
use crossbeam::utils::Backoff;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Condvar, Mutex,
};

/// Wait/wake barrier shared by the threads of one cluster.
#[derive(Debug, Default)]
pub struct LocalBarrier {
    state: Mutex<LocalState>,
    wake: Condvar,
}

#[derive(Debug, Default)]
struct LocalState {
    arrived: u32,
    generation: u64,
}

impl LocalBarrier {
    /// Create a LocalBarrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrive and wait for `participants` threads of the cluster.
    ///
    /// The leader runs `across` once everyone has arrived and before anyone is released;
    /// its result is returned to the leader only. Waits end early with `Fault::Aborted`
    /// once `abort` is raised.
    pub fn arrive<F>(&self, participants: u32, leader: bool, abort: &AtomicBool, across: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.arrived += 1;
        if leader {
            while state.arrived < participants {
                if abort.load(Ordering::SeqCst) {
                    return Err(Fault::Aborted);
                }
                state = self.wake.wait(state).unwrap();
            }
            drop(state);
            let crossed = across();
            let mut state = self.state.lock().unwrap();
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            drop(state);
            self.wake.notify_all();
            crossed
        } else {
            if state.arrived == participants {
                self.wake.notify_all();
            }
            while state.generation == generation {
                if abort.load(Ordering::SeqCst) {
                    return Err(Fault::Aborted);
                }
                state = self.wake.wait(state).unwrap();
            }
            Ok(())
        }
    }

    /// Wake every waiter so it can observe an abort.
    pub fn interrupt(&self) {
        let _state = self.state.lock().unwrap();
        self.wake.notify_all();
    }
}

/// Two-slot counter joining the cluster leaders of a multi-cluster block.
#[derive(Debug, Default)]
pub struct WaitGroup {
    slots: [AtomicU64; 2],
    generation: AtomicU64,
}

impl WaitGroup {
    /// Create a WaitGroup
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed rounds.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Arrive and spin until `parties` leaders have arrived in the current round.
    /// Returns the round that completed.
    pub fn arrive_and_wait(&self, parties: u64, abort: &AtomicBool) -> Result<u64> {
        let generation = self.generation.load(Ordering::SeqCst);
        let slot = &self.slots[(generation & 1) as usize];
        if slot.fetch_add(1, Ordering::SeqCst) + 1 == parties {
            self.slots[((generation + 1) & 1) as usize].store(0, Ordering::SeqCst);
            self.generation.store(generation + 1, Ordering::SeqCst);
            slot.store(0, Ordering::SeqCst);
        } else {
            let backoff = Backoff::new();
            while slot.load(Ordering::SeqCst) != 0 {
                if abort.load(Ordering::SeqCst) {
                    return Err(Fault::Aborted);
                }
                backoff.snooze();
            }
        }
        Ok(generation)
    }
}
