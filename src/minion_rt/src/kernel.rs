//! Kernel bodies and the memory they run against.
//!
//! A code image holds, at each kernel symbol, an 8-byte little-endian `KernelId`. The
//! dispatcher reads the word at the launch entry address and looks the body up in the
//! `KernelRegistry`; anything else at that address is an illegal instruction.

use crate::{builtins, dispatch::WorkItem, Fault, Result};
use std::{collections::HashMap, fmt, sync::Arc};

/// Size of the kernel stub written at each symbol.
pub const KERNEL_STUB_SIZE: usize = 8;
/// Distance between consecutive kernel symbols in a code image.
pub const KERNEL_STUB_ALIGN: u64 = 64;

/// Signature of a kernel body, called once per work item.
pub type KernelFn = dyn Fn(&WorkItem<'_>) -> Result<()> + Send + Sync;

/// Device memory as seen by kernels.
pub trait GlobalMemory: Send + Sync {
    /// Copy `out.len()` bytes starting at `addr`.
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<()>;
    /// Copy `data` to `addr`.
    fn store(&self, addr: u64, data: &[u8]) -> Result<()>;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Identifier stored in a kernel stub, derived from the kernel name.
pub struct KernelId(pub u64);

impl KernelId {
    /// 64-bit FNV-1a of the kernel name.
    pub fn from_name(name: &str) -> Self {
        let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
        });
        KernelId(hash)
    }

    /// Stub bytes for this id.
    pub fn to_stub(self) -> [u8; KERNEL_STUB_SIZE] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelId({:#018x})", self.0)
    }
}

#[derive(Clone)]
struct Entry {
    name: String,
    body: Arc<KernelFn>,
}

/// Kernel bodies known to the device.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<KernelId, Entry>,
}

impl KernelRegistry {
    /// Create an empty KernelRegistry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the copy and set kernels used for device-side memcpy and memset.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtins::register_all(&mut registry);
        registry
    }

    /// Register `body` under `name`, replacing any previous body with the same name.
    pub fn register<F>(&mut self, name: &str, body: F) -> KernelId
    where
        F: Fn(&WorkItem<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(body))
    }

    /// Register an already shared body under `name`.
    pub fn insert(&mut self, name: &str, body: Arc<KernelFn>) -> KernelId {
        let id = KernelId::from_name(name);
        log::debug!("register kernel {} as {:?}", name, id);
        self.kernels.insert(
            id,
            Entry {
                name: name.to_string(),
                body,
            },
        );
        id
    }

    /// Move every kernel of `other` into this registry.
    pub fn merge(&mut self, other: KernelRegistry) {
        self.kernels.extend(other.kernels);
    }

    /// Body registered for `id`.
    pub fn lookup(&self, id: KernelId) -> Option<Arc<KernelFn>> {
        self.kernels.get(&id).map(|e| e.body.clone())
    }

    /// Name registered for `id`.
    pub fn name_of(&self, id: KernelId) -> Option<&str> {
        self.kernels.get(&id).map(|e| e.name.as_str())
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether no kernel is registered.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Read the stub at `entry` and return the matching body.
    pub fn resolve_entry(&self, memory: &dyn GlobalMemory, entry: u64) -> Result<Arc<KernelFn>> {
        let mut stub = [0u8; KERNEL_STUB_SIZE];
        memory
            .load(entry, &mut stub)
            .map_err(|_| Fault::IllegalInstruction { entry })?;
        self.lookup(KernelId(u64::from_le_bytes(stub)))
            .ok_or(Fault::IllegalInstruction { entry })
    }
}
