//! Address-range allocators for the host and device memory regions.
//!
//! A region keeps its allocated spans ordered by address; the free gaps are whatever lies
//! between them, so a freed span merges with its free neighbours on its own.

use crate::error::{Error, Result};
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Base of the pinned host region.
pub const HOST_REGION_BASE: u64 = 0x0000_7e00_0000_0000;
/// Base of the device data region.
pub const DEVICE_REGION_BASE: u64 = 0x0080_8000_0000;

#[derive(Clone, Debug, PartialEq, Eq)]
/// First-fit allocator over `[base, base + size)`.
pub struct MemoryRegion {
    name: &'static str,
    base: u64,
    size: u64,
    alignment: u64,
    spans: BTreeMap<u64, u64>,
}

impl MemoryRegion {
    /// Create an empty region.
    pub fn new(name: &'static str, base: u64, size: u64, alignment: u64) -> Self {
        MemoryRegion {
            name,
            base,
            size,
            alignment: alignment.max(1),
            spans: BTreeMap::new(),
        }
    }

    /// Region name used in errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First address of the region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reserve `len` bytes at the lowest fitting address.
    pub fn alloc(&mut self, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidValue(format!("zero-sized allocation in the {} region", self.name)));
        }
        let need = align_up(len, self.alignment);
        let end = self.base + self.size;
        let mut cursor = self.base;
        for (&start, &span) in &self.spans {
            if start - cursor >= need {
                break;
            }
            cursor = start + span;
        }
        if end - cursor < need {
            return Err(Error::OutOfMemory {
                region: self.name,
                requested: len,
            });
        }
        self.spans.insert(cursor, need);
        Ok(cursor)
    }

    /// Release the allocation starting at `ptr`.
    pub fn free(&mut self, ptr: u64) -> Result<()> {
        self.spans.remove(&ptr).map(|_| ()).ok_or_else(|| {
            Error::InvalidValue(format!("{:#x} is not an allocation of the {} region", ptr, self.name))
        })
    }

    /// Whether `addr` lies inside the region, allocated or not.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// `(start, len)` of the allocation containing `addr`.
    pub fn allocation_containing(&self, addr: u64) -> Option<(u64, u64)> {
        let (&start, &len) = self.spans.range(..=addr).next_back()?;
        if addr < start + len {
            Some((start, len))
        } else {
            None
        }
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        self.spans.len()
    }

    /// Bytes reserved by live allocations, alignment padding included.
    pub fn allocated_bytes(&self) -> u64 {
        self.spans.values().sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Where a pointer lives.
pub enum MemoryType {
    /// Pinned host memory.
    Host,
    /// Device memory.
    Device,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Answer of `Device::pointer_attributes`.
pub struct PointerAttributes {
    /// Host or device memory.
    pub memory_type: MemoryType,
    /// Owning device.
    pub device: i32,
    /// Start of the containing allocation.
    pub allocation: u64,
    /// Size of the containing allocation.
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Live allocations and bytes of one region.
pub struct RegionUsage {
    /// Live allocations.
    pub allocations: usize,
    /// Reserved bytes.
    pub bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Usage of all regions of a device.
pub struct MemoryUsage {
    /// Pinned host region.
    pub host: RegionUsage,
    /// Device data region.
    pub device: RegionUsage,
    /// Device code region.
    pub code: RegionUsage,
}

impl From<&MemoryRegion> for RegionUsage {
    fn from(region: &MemoryRegion) -> Self {
        RegionUsage {
            allocations: region.allocations(),
            bytes: region.allocated_bytes(),
        }
    }
}
