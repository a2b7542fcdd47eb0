//! Physical layout of the device: clusters of hardware threads sharing a local region.

/// Number of clusters on a full device.
pub const CLUSTERS: u32 = 32;
/// Hardware threads per cluster (32 cores with two harts each).
pub const THREADS_PER_CLUSTER: u32 = 64;
/// Size of the shared region owned by each cluster.
pub const SHARED_REGION_SIZE_PER_CLUSTER: usize = 256 * 1024;
/// The first cache line of the shared region is reserved for barrier state.
pub const SYNC_LINE_SIZE: usize = 64;
/// Largest `shared_mem` a launch may request.
pub const MAX_SHARED_MEM_PER_BLOCK: usize = SHARED_REGION_SIZE_PER_CLUSTER - SYNC_LINE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Clusters taking part in a launch and the number of hardware threads in each.
pub struct Topology {
    /// Active clusters.
    pub clusters: u32,
    /// Hardware threads per cluster.
    pub threads_per_cluster: u32,
}

impl Topology {
    /// Create a Topology
    pub fn new(clusters: u32, threads_per_cluster: u32) -> Self {
        Topology {
            clusters,
            threads_per_cluster,
        }
    }

    /// Total number of hardware threads.
    pub fn hardware_threads(&self) -> u32 {
        self.clusters * self.threads_per_cluster
    }

    /// Cluster a hardware thread belongs to.
    pub fn cluster_of(&self, hart: u32) -> u32 {
        hart / self.threads_per_cluster
    }

    /// Position of a hardware thread inside its cluster.
    pub fn lane_of(&self, hart: u32) -> u32 {
        hart % self.threads_per_cluster
    }
}

impl Default for Topology {
    fn default() -> Self {
        Topology::new(CLUSTERS, THREADS_PER_CLUSTER)
    }
}
