//! Static mapping of a grid of blocks onto clusters of hardware threads.
//!
//! A block occupies `ceil(block_size / C)` consecutive clusters. As many blocks as fit run
//! side by side ("slots"); slot `s` then walks the grid with stride `blocks_in_flight`.
//! Threads of the last cluster of a block beyond `block_size` stay idle, as do clusters
//! past the last full slot.

use crate::{topology::Topology, Dim3, Fault, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Launch geometry resolved against the active topology.
pub struct Partition {
    grid_size: u32,
    block_size: u32,
    threads_per_cluster: u32,
    clusters_per_block: u32,
    blocks_in_flight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What a single hardware thread does for the launch.
pub enum Role {
    /// The thread has no work item in any block.
    Idle,
    /// The thread runs one work item in every block of its slot.
    Active(Assignment),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Placement of an active hardware thread.
pub struct Assignment {
    /// Hardware thread index.
    pub hart: u32,
    /// Physical cluster.
    pub cluster: u32,
    /// Block slot this cluster belongs to.
    pub slot: u32,
    /// Linear thread id inside the block.
    pub local_id: u32,
    /// Index of the cluster inside the block.
    pub local_cluster: u32,
    /// Threads of this cluster that take part in the block.
    pub cluster_threads: u32,
    /// Position inside the cluster.
    pub lane: u32,
}

impl Assignment {
    /// The first thread of each cluster runs the cross-cluster step of the barrier.
    pub fn is_cluster_leader(&self) -> bool {
        self.lane == 0
    }
}

impl Partition {
    /// Resolve `grid` and `block` against `topology`.
    pub fn new(grid: Dim3, block: Dim3, topology: &Topology) -> Result<Self> {
        let grid_size = grid
            .volume()
            .ok_or_else(|| Fault::InvalidLaunch(format!("grid {} is empty or too large", grid)))?;
        let block_size = block
            .volume()
            .ok_or_else(|| Fault::InvalidLaunch(format!("block {} is empty or too large", block)))?;
        let c = topology.threads_per_cluster;
        if c == 0 || topology.clusters == 0 {
            return Err(Fault::InvalidLaunch("no active clusters".to_string()));
        }
        let clusters_per_block = ((block_size as u64 + c as u64 - 1) / c as u64) as u32;
        let blocks_in_flight = topology.clusters / clusters_per_block;
        if blocks_in_flight == 0 {
            return Err(Fault::InvalidLaunch(format!(
                "block of {} threads needs {} clusters, {} are active",
                block_size, clusters_per_block, topology.clusters
            )));
        }
        Ok(Partition {
            grid_size,
            block_size,
            threads_per_cluster: c,
            clusters_per_block,
            blocks_in_flight,
        })
    }

    /// Number of blocks in the grid.
    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Number of threads in a block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Clusters spanned by one block.
    pub fn clusters_per_block(&self) -> u32 {
        self.clusters_per_block
    }

    /// Blocks running concurrently.
    pub fn blocks_in_flight(&self) -> u32 {
        self.blocks_in_flight
    }

    /// Clusters holding at least one active thread.
    pub fn active_clusters(&self) -> u32 {
        self.clusters_per_block * self.blocks_in_flight
    }

    /// Role of hardware thread `hart`.
    pub fn role(&self, hart: u32) -> Role {
        let c = self.threads_per_cluster;
        let cluster = hart / c;
        if cluster >= self.active_clusters() {
            return Role::Idle;
        }
        let block_threads = self.clusters_per_block * c;
        let local_id = hart % block_threads;
        if local_id >= self.block_size {
            return Role::Idle;
        }
        let local_cluster = local_id / c;
        let cluster_threads = if local_cluster == self.clusters_per_block - 1 {
            c - (block_threads - self.block_size)
        } else {
            c
        };
        Role::Active(Assignment {
            hart,
            cluster,
            slot: cluster / self.clusters_per_block,
            local_id,
            local_cluster,
            cluster_threads,
            lane: hart % c,
        })
    }

    /// Blocks executed by `slot`, in order.
    pub fn blocks(&self, slot: u32) -> impl Iterator<Item = u32> {
        (slot..self.grid_size).step_by(self.blocks_in_flight as usize)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn active(p: &Partition, hart: u32) -> Assignment {
        match p.role(hart) {
            Role::Active(a) => a,
            Role::Idle => panic!("hart {} unexpectedly idle", hart),
        }
    }

    #[test]
    fn block_spanning_two_clusters() {
        let p = Partition::new(Dim3::new(10, 1, 1), Dim3::new(65, 1, 1), &Topology::new(4, 64)).unwrap();
        assert_eq!(p.clusters_per_block(), 2);
        assert_eq!(p.blocks_in_flight(), 2);
        assert_eq!(p.active_clusters(), 4);

        let a = active(&p, 64);
        assert_eq!(a.local_id, 64);
        assert_eq!(a.local_cluster, 1);
        assert_eq!(a.cluster_threads, 1);
        assert!(a.is_cluster_leader());
        assert_eq!(p.role(65), Role::Idle);
        assert_eq!(p.role(127), Role::Idle);

        let b = active(&p, 130);
        assert_eq!(b.slot, 1);
        assert_eq!(b.local_id, 2);
        assert_eq!(b.cluster_threads, 64);
        assert_eq!(p.blocks(1).collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn leftover_clusters_are_idle() {
        let p = Partition::new(Dim3::new(3, 1, 1), Dim3::new(100, 1, 1), &Topology::new(5, 64)).unwrap();
        assert_eq!(p.blocks_in_flight(), 2);
        assert_eq!(p.active_clusters(), 4);
        assert_eq!(p.role(4 * 64), Role::Idle);
        assert_eq!(p.blocks(0).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn every_work_item_assigned_once() {
        let topology = Topology::new(6, 8);
        let p = Partition::new(Dim3::new(5, 2, 1), Dim3::new(3, 2, 2), &topology).unwrap();
        let mut seen = vec![0u32; (p.grid_size() * p.block_size()) as usize];
        for hart in 0..topology.hardware_threads() {
            if let Role::Active(a) = p.role(hart) {
                for block in p.blocks(a.slot) {
                    seen[(block * p.block_size() + a.local_id) as usize] += 1;
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn block_larger_than_device() {
        let err = Partition::new(Dim3::new(1, 1, 1), Dim3::new(129, 1, 1), &Topology::new(2, 64));
        assert!(matches!(err, Err(Fault::InvalidLaunch(_))));
        let err = Partition::new(Dim3::new(0, 1, 1), Dim3::new(1, 1, 1), &Topology::new(2, 64));
        assert!(matches!(err, Err(Fault::InvalidLaunch(_))));
    }
}
