//! Kernels backing device-side memcpy and memset.
//!
//! Copy arguments: `count: u32` at 0, `src: u64` at 8, `dst: u64` at 16.
//! Set arguments: `count: u32` at 0, `value: u32` at 4, `dst: u64` at 8.
//! `count` is in elements; work items stride over them by the grid size.

use crate::{dispatch::WorkItem, kernel::KernelRegistry, Result};

/// Byte-wise copy.
pub const COPY_INT8: &str = "CopyKernel_Int8";
/// Word-wise copy.
pub const COPY_INT32: &str = "CopyKernel_Int32";
/// Byte-wise fill.
pub const SET_INT8: &str = "SetKernel_Int8";
/// Word-wise fill, `value` holds the byte replicated four times.
pub const SET_INT32: &str = "SetKernel_Int32";
/// All builtin kernel names.
pub const NAMES: [&str; 4] = [COPY_INT8, COPY_INT32, SET_INT8, SET_INT32];

pub(crate) fn register_all(registry: &mut KernelRegistry) {
    registry.register(COPY_INT8, |item| copy(item, 1));
    registry.register(COPY_INT32, |item| copy(item, 4));
    registry.register(SET_INT8, |item| set(item, 1));
    registry.register(SET_INT32, |item| set(item, 4));
}

fn copy(item: &WorkItem<'_>, width: u64) -> Result<()> {
    let count = item.arg_u32(0)? as u64;
    let src = item.arg_u64(8)?;
    let dst = item.arg_u64(16)?;
    let mut buf = [0u8; 4];
    let word = &mut buf[..width as usize];
    let mut i = item.global_id();
    while i < count {
        item.memory().load(src + i * width, word)?;
        item.memory().store(dst + i * width, word)?;
        i += item.global_size();
    }
    Ok(())
}

fn set(item: &WorkItem<'_>, width: u64) -> Result<()> {
    let count = item.arg_u32(0)? as u64;
    let value = item.arg_u32(4)?.to_le_bytes();
    let dst = item.arg_u64(8)?;
    let mut i = item.global_id();
    while i < count {
        item.memory().store(dst + i * width, &value[..width as usize])?;
        i += item.global_size();
    }
    Ok(())
}
