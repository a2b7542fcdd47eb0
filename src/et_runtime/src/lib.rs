#![deny(warnings)]
#![deny(missing_docs)]
#![warn(clippy::all)]

//! EtRuntime is the host side of the execution runtime for the many-core RISC-V accelerator.
//! Work is queued on streams as actions; one executor thread per device drains the streams
//! in order, launching kernels through the virtual queues to the device dispatcher.

mod action;
pub mod config;
mod device;
pub mod error;
mod event;
mod executor;
pub mod handle;
mod idmap;
pub mod image;
mod launch;
pub mod memory;
mod platform;
mod stream;
pub mod target;
pub mod transport;
pub mod utils;

pub use crate::config::{ConfigError, RuntimeConfig};
pub use crate::device::{Device, MemcpyKind};
pub use crate::error::{Error, Result};
pub use crate::event::{EventFlags, EventId};
pub use crate::handle::Handle;
pub use crate::image::{ImageId, KernelImage, KernelResolver};
pub use crate::memory::{MemoryType, MemoryUsage, PointerAttributes, RegionUsage};
pub use crate::platform::Platform;
pub use crate::stream::{StreamFlags, StreamId};
pub use crate::target::{DeviceProperties, DeviceTarget, SimDevice};
pub use minion_rt::Dim3;
