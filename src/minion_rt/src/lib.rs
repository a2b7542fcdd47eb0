#![deny(warnings)]
#![deny(missing_docs)]
#![warn(clippy::all)]

//! MinionRt is the device-resident half of the execution runtime.
//! Every hardware thread runs the same dispatcher: it works out its own role from the launch
//! geometry, iterates over the blocks assigned to its slot and synchronizes with the rest of
//! its block through a per-cluster barrier joined across clusters by a `WaitGroup`.

pub mod barrier;
pub mod builtins;
pub mod dispatch;
pub mod kernel;
pub mod memory;
pub mod partition;
pub mod record;
pub mod topology;

pub use crate::dispatch::{run_launch, WorkItem};
pub use crate::kernel::{GlobalMemory, KernelFn, KernelId, KernelRegistry};
pub use crate::memory::FlatMemory;
pub use crate::partition::{Assignment, Partition, Role};
pub use crate::record::{Command, Completion, LaunchRecord};
pub use crate::topology::Topology;

use std::fmt;

/// Result of device-side operations.
pub type Result<T> = std::result::Result<T, Fault>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Faults raised on the device while decoding or running a command.
pub enum Fault {
    /// The kernel entry address does not hold a known kernel.
    #[error("illegal instruction at kernel entry {entry:#x}")]
    IllegalInstruction {
        /// Entry address taken from the launch record.
        entry: u64,
    },
    /// A load or store fell outside every mapped memory window.
    #[error("memory access fault at {addr:#x} ({len} bytes)")]
    MemoryAccess {
        /// First faulting address.
        addr: u64,
        /// Access width in bytes.
        len: usize,
    },
    /// The launch geometry cannot be mapped onto the active clusters.
    #[error("invalid launch: {0}")]
    InvalidLaunch(String),
    /// A command or record could not be decoded.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    /// The kernel body reported a failure.
    #[error("kernel failure: {0}")]
    Kernel(String),
    /// Another hardware thread of the same launch faulted first.
    #[error("launch aborted")]
    Aborted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
/// Three dimensional extent of a grid or a block, x varying fastest.
pub struct Dim3 {
    /// Extent along x.
    pub x: u32,
    /// Extent along y.
    pub y: u32,
    /// Extent along z.
    pub z: u32,
}

impl Dim3 {
    /// Create a Dim3
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Number of elements covered, `None` when empty or when the product overflows.
    pub fn volume(&self) -> Option<u32> {
        let v = self.x.checked_mul(self.y)?.checked_mul(self.z)?;
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }

    /// Decompose a flat index into coordinates of this extent.
    pub fn unflatten(&self, index: u32) -> Dim3 {
        Dim3 {
            x: index % self.x,
            y: (index / self.x) % self.y,
            z: (index / self.x) / self.y,
        }
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Dim3::new(x, 1, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Dim3::new(x, y, z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unflatten_x_fastest() {
        let block = Dim3::new(4, 3, 2);
        assert_eq!(block.unflatten(0), Dim3::new(0, 0, 0));
        assert_eq!(block.unflatten(5), Dim3::new(1, 1, 0));
        assert_eq!(block.unflatten(13), Dim3::new(1, 0, 1));
        assert_eq!(block.unflatten(23), Dim3::new(3, 2, 1));
    }

    #[test]
    fn volume_rejects_empty_and_overflow() {
        assert_eq!(Dim3::new(4, 3, 2).volume(), Some(24));
        assert_eq!(Dim3::new(4, 0, 2).volume(), None);
        assert_eq!(Dim3::new(u32::MAX, 2, 1).volume(), None);
        assert_eq!(Dim3::from(7), Dim3::new(7, 1, 1));
    }
}
