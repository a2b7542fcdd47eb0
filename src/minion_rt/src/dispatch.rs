//! Dispatcher run by every hardware thread for a launch.

use crate::{
    barrier::{LocalBarrier, WaitGroup},
    kernel::{GlobalMemory, KernelFn},
    partition::{Assignment, Partition, Role},
    record::LaunchRecord,
    topology::Topology,
    Dim3, Fault, Result,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

/// Synchronization and scratch state of one block slot.
struct BlockShared {
    wait_group: WaitGroup,
    scratch: Box<[AtomicU64]>,
}

/// State shared by all hardware threads of one launch.
pub struct LaunchState<'a> {
    record: &'a LaunchRecord,
    partition: Partition,
    memory: &'a dyn GlobalMemory,
    clusters: Vec<LocalBarrier>,
    blocks: Vec<BlockShared>,
    aborted: AtomicBool,
}

impl<'a> LaunchState<'a> {
    /// Resolve `record` against `topology`.
    pub fn new(record: &'a LaunchRecord, topology: &Topology, memory: &'a dyn GlobalMemory) -> Result<Self> {
        let partition = Partition::new(record.grid, record.block, topology)?;
        let words = (record.shared_mem as usize + 7) / 8;
        let blocks = (0..partition.blocks_in_flight())
            .map(|_| BlockShared {
                wait_group: WaitGroup::new(),
                scratch: (0..words).map(|_| AtomicU64::new(0)).collect(),
            })
            .collect();
        Ok(LaunchState {
            record,
            clusters: (0..partition.active_clusters()).map(|_| LocalBarrier::new()).collect(),
            partition,
            memory,
            blocks,
            aborted: AtomicBool::new(false),
        })
    }

    /// Resolved geometry.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Stop the launch: every waiter returns `Fault::Aborted`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for cluster in &self.clusters {
            cluster.interrupt();
        }
    }

    /// Whether a thread of this launch has faulted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn sync_block(&self, a: &Assignment) -> Result<()> {
        let spread = self.partition.clusters_per_block();
        let block = &self.blocks[a.slot as usize];
        self.clusters[a.cluster as usize].arrive(a.cluster_threads, a.is_cluster_leader(), &self.aborted, || {
            if spread > 1 {
                block.wait_group.arrive_and_wait(spread as u64, &self.aborted).map(|_| ())
            } else {
                Ok(())
            }
        })
    }
}

/// One thread's view of one block.
pub struct WorkItem<'a> {
    state: &'a LaunchState<'a>,
    assignment: &'a Assignment,
    block_id: u32,
    thread_idx: Dim3,
    block_idx: Dim3,
}

impl<'a> WorkItem<'a> {
    /// Thread coordinates inside the block.
    pub fn thread_idx(&self) -> Dim3 {
        self.thread_idx
    }

    /// Block coordinates inside the grid.
    pub fn block_idx(&self) -> Dim3 {
        self.block_idx
    }

    /// Block extent.
    pub fn block_dim(&self) -> Dim3 {
        self.state.record.block
    }

    /// Grid extent.
    pub fn grid_dim(&self) -> Dim3 {
        self.state.record.grid
    }

    /// Linear thread id inside the block.
    pub fn local_id(&self) -> u32 {
        self.assignment.local_id
    }

    /// Linear block id inside the grid.
    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    /// Linear id across the whole grid.
    pub fn global_id(&self) -> u64 {
        self.block_id as u64 * self.state.partition.block_size() as u64 + self.assignment.local_id as u64
    }

    /// Number of work items in the grid.
    pub fn global_size(&self) -> u64 {
        self.state.partition.grid_size() as u64 * self.state.partition.block_size() as u64
    }

    /// Hardware thread running this work item.
    pub fn hart(&self) -> u32 {
        self.assignment.hart
    }

    /// Packed kernel arguments.
    pub fn args(&self) -> &[u8] {
        &self.state.record.args
    }

    /// `u32` argument at byte `offset`.
    pub fn arg_u32(&self, offset: usize) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.arg_bytes(offset, 4)?);
        Ok(u32::from_le_bytes(raw))
    }

    /// `u64` argument at byte `offset`.
    pub fn arg_u64(&self, offset: usize) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.arg_bytes(offset, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn arg_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.args().get(offset..offset + len).ok_or_else(|| {
            Fault::Kernel(format!(
                "argument at offset {} overruns the {} argument bytes",
                offset,
                self.args().len()
            ))
        })
    }

    /// Global device memory.
    pub fn memory(&self) -> &dyn GlobalMemory {
        self.state.memory
    }

    /// Block shared memory, `ceil(shared_mem / 8)` words.
    pub fn shared(&self) -> &[AtomicU64] {
        &self.state.blocks[self.assignment.slot as usize].scratch
    }

    /// Wait for every thread of the block.
    pub fn barrier(&self) -> Result<()> {
        self.state.sync_block(self.assignment)
    }
}

/// Body of the dispatcher for hardware thread `hart`.
pub fn dispatch(hart: u32, state: &LaunchState<'_>, kernel: &KernelFn) -> Result<()> {
    let assignment = match state.partition.role(hart) {
        Role::Idle => return Ok(()),
        Role::Active(a) => a,
    };
    let record = state.record;
    for block_id in state.partition.blocks(assignment.slot) {
        if state.is_aborted() {
            return Err(Fault::Aborted);
        }
        // consecutive blocks of a slot reuse the same shared memory
        if record.shared_mem > 0 {
            state.sync_block(&assignment)?;
        }
        let item = WorkItem {
            state,
            assignment: &assignment,
            block_id,
            thread_idx: record.block.unflatten(assignment.local_id),
            block_idx: record.grid.unflatten(block_id),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| kernel(&item)))
            .unwrap_or_else(|_| Err(Fault::Kernel(format!("hart {} panicked", hart))));
        if let Err(fault) = outcome {
            if fault != Fault::Aborted {
                log::warn!("hart {} faulted in block {}: {}", hart, block_id, fault);
            }
            state.abort();
            return Err(fault);
        }
    }
    Ok(())
}

/// Run `kernel` for `record` on every hardware thread of `topology` and wait for all of them.
pub fn run_launch(topology: &Topology, record: &LaunchRecord, kernel: &KernelFn, memory: &dyn GlobalMemory) -> Result<()> {
    let state = LaunchState::new(record, topology, memory)?;
    log::debug!(
        "launch grid {} block {}: {} clusters per block, {} blocks in flight",
        record.grid,
        record.block,
        state.partition.clusters_per_block(),
        state.partition.blocks_in_flight()
    );
    let outcomes = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..topology.hardware_threads())
            .map(|hart| {
                let state = &state;
                s.spawn(move |_| dispatch(hart, state, kernel))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(Fault::Kernel("hardware thread panicked".to_string()))))
            .collect::<Vec<_>>()
    })
    .map_err(|_| Fault::Kernel("hardware thread panicked".to_string()))?;

    let mut aborted = None;
    for outcome in outcomes {
        match outcome {
            Err(Fault::Aborted) => aborted = Some(Fault::Aborted),
            Err(fault) => return Err(fault),
            Ok(()) => {}
        }
    }
    aborted.map_or(Ok(()), Err)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::FlatMemory;
    use std::{thread, time::Duration};

    fn record(grid: Dim3, block: Dim3, shared_mem: u32, args: Vec<u8>) -> LaunchRecord {
        LaunchRecord {
            grid,
            block,
            shared_mem,
            kernel_entry: 0,
            args,
        }
    }

    #[test]
    fn each_work_item_runs_once() {
        let topology = Topology::new(3, 4);
        let memory = FlatMemory::new(0, 0);
        let grid = Dim3::new(3, 2, 1);
        let block = Dim3::new(3, 2, 1);
        let hits: &'static [AtomicU64] = Box::leak((0..36).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice());
        let kernel = move |item: &WorkItem<'_>| -> Result<()> {
            let t = item.thread_idx();
            let b = item.block_idx();
            assert_eq!(item.local_id(), t.x + 3 * t.y);
            assert_eq!(item.block_id(), b.x + 3 * b.y);
            hits[item.global_id() as usize].fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        run_launch(&topology, &record(grid, block, 0, vec![]), &kernel, &memory).unwrap();
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn barrier_publishes_shared_writes_across_clusters() {
        const ITERATIONS: u64 = 1000;
        // 3 clusters of 4 threads, one block of 10 threads spanning all of them
        let topology = Topology::new(3, 4);
        let memory = FlatMemory::new(0, 0);
        let block = Dim3::new(10, 1, 1);
        let kernel = |item: &WorkItem<'_>| -> Result<()> {
            let shared = item.shared();
            let me = item.local_id() as usize;
            for it in 1..=ITERATIONS {
                if (it + me as u64) % 101 == 0 {
                    thread::sleep(Duration::from_micros(100));
                } else if item.hart() % 4 == 1 {
                    thread::yield_now();
                }
                shared[me].store(it, Ordering::SeqCst);
                item.barrier()?;
                for (other, word) in shared.iter().enumerate().take(10) {
                    let seen = word.load(Ordering::SeqCst);
                    if seen != it {
                        return Err(Fault::Kernel(format!(
                            "iteration {}: thread {} saw {} from thread {}",
                            it, me, seen, other
                        )));
                    }
                }
                item.barrier()?;
            }
            Ok(())
        };
        let rec = record(Dim3::new(1, 1, 1), block, 80, vec![]);
        run_launch(&topology, &rec, &kernel, &memory).unwrap();
    }

    #[test]
    fn fault_aborts_waiting_threads() {
        let topology = Topology::new(2, 4);
        let memory = FlatMemory::new(0, 0);
        let kernel = |item: &WorkItem<'_>| -> Result<()> {
            if item.local_id() == 5 {
                return Err(Fault::Kernel("boom".to_string()));
            }
            item.barrier()
        };
        let rec = record(Dim3::new(4, 1, 1), Dim3::new(8, 1, 1), 0, vec![]);
        assert_eq!(
            run_launch(&topology, &rec, &kernel, &memory),
            Err(Fault::Kernel("boom".to_string()))
        );
    }

    #[test]
    fn short_argument_buffer_faults() {
        let topology = Topology::new(1, 2);
        let memory = FlatMemory::new(0, 0);
        let kernel = |item: &WorkItem<'_>| -> Result<()> { item.arg_u64(0).map(|_| ()) };
        let rec = record(Dim3::new(1, 1, 1), Dim3::new(2, 1, 1), 0, vec![0; 4]);
        assert!(matches!(
            run_launch(&topology, &rec, &kernel, &memory),
            Err(Fault::Kernel(_))
        ));
    }
}
