//! Kernel code images and symbol resolution.

use crate::action::Marker;
use minion_rt::{
    builtins,
    kernel::{KernelId, KERNEL_STUB_ALIGN, KERNEL_STUB_SIZE},
};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Handle of a registered image.
pub struct ImageId(usize);

impl From<usize> for ImageId {
    fn from(id: usize) -> Self {
        ImageId(id)
    }
}

/// Resolves kernel names to offsets inside an uploadable code image.
pub trait KernelResolver: Send + Sync {
    /// Offset of `name` from the start of the image.
    fn resolve(&self, name: &str) -> Option<u64>;
    /// Bytes to upload into the code region.
    fn image_bytes(&self) -> Arc<[u8]>;
}

#[derive(Clone, Debug)]
/// A code image with its symbol table.
pub struct KernelImage {
    name: String,
    bytes: Arc<[u8]>,
    symbols: BTreeMap<String, u64>,
}

impl KernelImage {
    /// Start an image whose kernels are laid out one stub per 64 bytes.
    pub fn builder(name: &str) -> KernelImageBuilder {
        KernelImageBuilder {
            name: name.to_string(),
            kernels: Vec::new(),
        }
    }

    /// Image from externally produced bytes and symbols.
    pub fn from_parts(name: &str, bytes: Vec<u8>, symbols: BTreeMap<String, u64>) -> Self {
        KernelImage {
            name: name.to_string(),
            bytes: bytes.into(),
            symbols,
        }
    }

    /// Image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Kernel names in the image.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }
}

impl KernelResolver for KernelImage {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    fn image_bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }
}

/// Builder of `KernelImage`.
pub struct KernelImageBuilder {
    name: String,
    kernels: Vec<String>,
}

impl KernelImageBuilder {
    /// Add a kernel symbol.
    pub fn kernel(mut self, name: &str) -> Self {
        self.kernels.push(name.to_string());
        self
    }

    /// Lay out the stubs.
    pub fn build(self) -> KernelImage {
        let mut bytes = vec![0u8; self.kernels.len() * KERNEL_STUB_ALIGN as usize];
        let mut symbols = BTreeMap::new();
        for (i, kernel) in self.kernels.into_iter().enumerate() {
            let offset = i as u64 * KERNEL_STUB_ALIGN;
            let at = offset as usize;
            bytes[at..at + KERNEL_STUB_SIZE].copy_from_slice(&KernelId::from_name(&kernel).to_stub());
            symbols.insert(kernel, offset);
        }
        KernelImage {
            name: self.name,
            bytes: bytes.into(),
            symbols,
        }
    }
}

/// Image holding the copy and set kernels.
pub fn builtin_image() -> KernelImage {
    builtins::NAMES
        .iter()
        .fold(KernelImage::builder("libdevice"), |b, name| b.kernel(name))
        .build()
}

/// An image resident in the code region.
pub(crate) struct LoadedImage {
    pub device_ptr: u64,
    /// Marker of the upload; dropped once observed executed.
    pub upload: Option<Arc<Marker>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_lays_out_stubs() {
        let image = KernelImage::builder("test").kernel("noop").kernel("saxpy").build();
        assert_eq!(image.len(), 128);
        assert_eq!(image.resolve("noop"), Some(0));
        assert_eq!(image.resolve("saxpy"), Some(64));
        assert_eq!(image.resolve("missing"), None);
        let bytes = image.image_bytes();
        assert_eq!(&bytes[64..72], &KernelId::from_name("saxpy").to_stub());
        assert_eq!(image.symbols().collect::<Vec<_>>(), vec!["noop", "saxpy"]);
    }

    #[test]
    fn builtin_image_resolves_builtins() {
        let image = builtin_image();
        for name in builtins::NAMES.iter() {
            assert!(image.resolve(name).is_some());
        }
    }
}
