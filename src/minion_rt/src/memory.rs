//! A flat, byte-addressed memory window.

use crate::{kernel::GlobalMemory, Fault, Result};
use std::{ops::Range, sync::RwLock};

/// Contiguous memory starting at a fixed device address.
#[derive(Debug)]
pub struct FlatMemory {
    base: u64,
    bytes: RwLock<Vec<u8>>,
}

impl FlatMemory {
    /// Create a zero-filled window of `size` bytes mapped at `base`.
    pub fn new(base: u64, size: usize) -> Self {
        FlatMemory {
            base,
            bytes: RwLock::new(vec![0; size]),
        }
    }

    /// First mapped address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Window size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.read().unwrap().len()
    }

    /// Whether the window has no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `[addr, addr + len)` lies entirely inside the window.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.range(addr, len).is_some()
    }

    fn range(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        let start = addr.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        if end <= self.len() {
            Some(start..end)
        } else {
            None
        }
    }
}

impl GlobalMemory for FlatMemory {
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let range = self.range(addr, out.len()).ok_or(Fault::MemoryAccess {
            addr,
            len: out.len(),
        })?;
        out.copy_from_slice(&self.bytes.read().unwrap()[range]);
        Ok(())
    }

    fn store(&self, addr: u64, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len()).ok_or(Fault::MemoryAccess {
            addr,
            len: data.len(),
        })?;
        self.bytes.write().unwrap()[range].copy_from_slice(data);
        Ok(())
    }
}
