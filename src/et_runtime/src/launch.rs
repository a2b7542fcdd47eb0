//! Per-thread state of the configure / stage argument / launch sequence.

use crate::error::{Error, Result};
use crate::stream::StreamId;
use crate::target::DeviceProperties;
use crate::utils::align_up;
use minion_rt::Dim3;

/// Argument bytes packed at caller-chosen offsets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ArgBuffer {
    bytes: Vec<u8>,
}

impl ArgBuffer {
    /// Copy `arg` to `offset`. A non-zero offset must equal the current length rounded up
    /// to `arg.len()`, so each argument sits at its natural alignment right after the
    /// previous one.
    pub fn stage(&mut self, arg: &[u8], offset: usize) -> Result<()> {
        let expected = align_up(self.bytes.len() as u64, arg.len() as u64) as usize;
        if offset != 0 && offset != expected {
            return Err(Error::ConfigurationError(format!(
                "argument of {} bytes at offset {}, expected {}",
                arg.len(),
                offset,
                expected
            )));
        }
        let end = offset + arg.len();
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[offset..end].copy_from_slice(arg);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A configured launch waiting for its arguments.
#[derive(Debug)]
pub(crate) struct PendingLaunch {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem: u32,
    pub stream: StreamId,
    pub args: ArgBuffer,
}

/// Reject geometry the device cannot run.
pub(crate) fn check_geometry(grid: Dim3, block: Dim3, shared_mem: u32, props: &DeviceProperties) -> Result<()> {
    if grid.volume().is_none() {
        return Err(Error::InvalidValue(format!("grid {} is empty or too large", grid)));
    }
    let threads = block
        .volume()
        .ok_or_else(|| Error::InvalidValue(format!("block {} is empty or too large", block)))?;
    if threads > props.max_threads_per_block {
        return Err(Error::InvalidValue(format!(
            "block of {} threads exceeds {} threads of the active clusters",
            threads, props.max_threads_per_block
        )));
    }
    if shared_mem as usize > props.shared_mem_per_block {
        return Err(Error::InvalidValue(format!(
            "{} bytes of shared memory exceed the {} available per block",
            shared_mem, props.shared_mem_per_block
        )));
    }
    Ok(())
}

/// One cluster-sized block per `threads_per_cluster` elements, for the builtin kernels.
pub(crate) fn linear_dims(elements: u64, threads_per_cluster: u32) -> (Dim3, Dim3) {
    const MAX_BLOCKS: u64 = 1024;
    let per_block = threads_per_cluster.max(1) as u64;
    let blocks = ((elements + per_block - 1) / per_block).clamp(1, MAX_BLOCKS);
    (Dim3::new(blocks as u32, 1, 1), Dim3::new(per_block as u32, 1, 1))
}
