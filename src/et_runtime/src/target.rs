//! Device targets: what the executor drives.
//!
//! `SimDevice` runs the device side in-process. Memory transfers go straight to the device
//! memory windows (the DMA path); configure and launch commands travel over a submission
//! queue to a master thread, which answers on a completion queue.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::memory::DEVICE_REGION_BASE;
use crate::transport::{Transport, VirtQueue};
use crate::utils::ToResult;
use minion_rt::{
    dispatch, topology::MAX_SHARED_MEM_PER_BLOCK, Command, Completion, Fault, FlatMemory, GlobalMemory,
    KernelFn, KernelRegistry, LaunchRecord, Topology,
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
};

#[derive(Clone, Debug, PartialEq, Eq)]
/// Static description of a device.
pub struct DeviceProperties {
    /// Marketing name.
    pub name: String,
    /// Size of the device data region.
    pub total_global_mem: u64,
    /// Size of the device code region.
    pub code_mem: u64,
    /// Clusters on the device.
    pub clusters: u32,
    /// Hardware threads per cluster.
    pub threads_per_cluster: u32,
    /// Clusters programmed active at bring-up.
    pub active_clusters: u32,
    /// Largest block the active clusters can hold.
    pub max_threads_per_block: u32,
    /// Largest `shared_mem` per block.
    pub shared_mem_per_block: usize,
}

impl DeviceProperties {
    /// Properties of device `index` described by `config`.
    pub fn from_config(index: i32, config: &RuntimeConfig) -> Self {
        DeviceProperties {
            name: format!("ET-SoC simulated device {}", index),
            total_global_mem: config.device_region_size,
            code_mem: config.code_region_size,
            clusters: config.clusters,
            threads_per_cluster: config.threads_per_cluster,
            active_clusters: config.active_clusters,
            max_threads_per_block: config.active_clusters * config.threads_per_cluster,
            shared_mem_per_block: MAX_SHARED_MEM_PER_BLOCK,
        }
    }

    /// Base of the code region, directly after the data region.
    pub fn code_region_base(&self) -> u64 {
        DEVICE_REGION_BASE + self.total_global_mem
    }
}

/// A device as seen by the executor.
pub trait DeviceTarget: Send + Sync {
    /// Static properties.
    fn properties(&self) -> &DeviceProperties;
    /// Program the number of active clusters.
    fn configure(&self, active_clusters: u32) -> Result<()>;
    /// Copy `data` into device memory at `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;
    /// Copy device memory at `addr` into `out`.
    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()>;
    /// Run a kernel to completion.
    fn launch(&self, record: &LaunchRecord) -> Result<()>;
    /// Make `body` available to launches of `name`.
    fn register_kernel(&self, name: &str, _body: Arc<KernelFn>) -> Result<()> {
        Err(Error::InvalidValue(format!(
            "{} does not take host kernels ({})",
            self.properties().name,
            name
        )))
    }
}

/// Data and code windows of a simulated device.
pub struct DeviceMemory {
    windows: Vec<FlatMemory>,
}

impl DeviceMemory {
    fn window(&self, addr: u64, len: usize) -> Option<&FlatMemory> {
        self.windows.iter().find(|w| w.contains(addr, len))
    }
}

impl GlobalMemory for DeviceMemory {
    fn load(&self, addr: u64, out: &mut [u8]) -> minion_rt::Result<()> {
        self.window(addr, out.len())
            .ok_or(Fault::MemoryAccess { addr, len: out.len() })?
            .load(addr, out)
    }

    fn store(&self, addr: u64, data: &[u8]) -> minion_rt::Result<()> {
        self.window(addr, data.len())
            .ok_or(Fault::MemoryAccess { addr, len: data.len() })?
            .store(addr, data)
    }
}

/// In-process device.
pub struct SimDevice {
    properties: DeviceProperties,
    memory: Arc<DeviceMemory>,
    registry: Arc<RwLock<KernelRegistry>>,
    submission: Arc<VirtQueue>,
    completion: Arc<VirtQueue>,
    doorbell: Mutex<()>,
    master: Option<JoinHandle<()>>,
}

impl SimDevice {
    /// Bring up device `index` with the builtin kernels and those in `registry`.
    pub fn new(index: i32, config: &RuntimeConfig, registry: KernelRegistry) -> Self {
        let properties = DeviceProperties::from_config(index, config);
        let memory = Arc::new(DeviceMemory {
            windows: vec![
                FlatMemory::new(DEVICE_REGION_BASE, config.device_region_size as usize),
                FlatMemory::new(properties.code_region_base(), config.code_region_size as usize),
            ],
        });
        let mut builtins = KernelRegistry::with_builtins();
        builtins.merge(registry);
        let registry = Arc::new(RwLock::new(builtins));
        let submission = Arc::new(VirtQueue::new(config.queue_depth, config.queue_slot_size));
        let completion = Arc::new(VirtQueue::new(config.queue_depth, config.queue_slot_size));
        let master = {
            let memory = Arc::clone(&memory);
            let registry = Arc::clone(&registry);
            let submission = Arc::clone(&submission);
            let completion = Arc::clone(&completion);
            let topology = Topology::new(config.active_clusters, config.threads_per_cluster);
            let clusters = config.clusters;
            thread::Builder::new()
                .name(format!("etsoc-master-{}", index))
                .spawn(move || {
                    device_master(topology, clusters, memory, registry, submission, completion)
                })
                .ok()
        };
        SimDevice {
            properties,
            memory,
            registry,
            submission,
            completion,
            doorbell: Mutex::new(()),
            master,
        }
    }

    /// Make `body` available to launches of `name`.
    pub fn register_kernel<F>(&self, name: &str, body: F)
    where
        F: Fn(&minion_rt::WorkItem<'_>) -> minion_rt::Result<()> + Send + Sync + 'static,
    {
        self.registry.write().unwrap().register(name, body);
    }

    fn submit(&self, command: &Command) -> Result<()> {
        if self.master.is_none() {
            return Err(Error::TransportFailure("device master thread is not running".to_string()));
        }
        let _doorbell = self.doorbell.lock().unwrap();
        self.submission.push_command(&command.encode()).to_result()?;
        let mut buf = vec![0u8; self.completion.max_element_size()];
        let len = self.completion.wait_command(&mut buf).to_result()?;
        let done = Completion::decode(&buf[..len])
            .map_err(|fault| Error::TransportFailure(fault.to_string()))?;
        done.into_result().map_err(Error::DeviceFault)
    }

    fn dma_error(addr: u64, len: usize) -> Error {
        Error::InvalidValue(format!("{:#x} (+{}) is not device memory", addr, len))
    }
}

impl DeviceTarget for SimDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn configure(&self, active_clusters: u32) -> Result<()> {
        self.submit(&Command::Configure { active_clusters })
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory
            .store(addr, data)
            .map_err(|_| Self::dma_error(addr, data.len()))
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        self.memory.load(addr, out).map_err(|_| Self::dma_error(addr, len))
    }

    fn launch(&self, record: &LaunchRecord) -> Result<()> {
        self.submit(&Command::Launch(record.clone()))
    }

    fn register_kernel(&self, name: &str, body: Arc<KernelFn>) -> Result<()> {
        self.registry.write().unwrap().insert(name, body);
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        if let Some(master) = self.master.take() {
            if self.submission.push_command(&Command::Shutdown.encode()).to_result().is_ok() {
                let _ = master.join();
            }
        }
    }
}

fn device_master(
    topology: Topology,
    clusters: u32,
    memory: Arc<DeviceMemory>,
    registry: Arc<RwLock<KernelRegistry>>,
    submission: Arc<VirtQueue>,
    completion: Arc<VirtQueue>,
) {
    let active = AtomicU32::new(topology.clusters);
    let mut buf = vec![0u8; submission.max_element_size()];
    loop {
        let len = match submission.wait_command(&mut buf).to_result() {
            Ok(len) => len,
            Err(e) => {
                log::warn!("Error in device master {:?}", e);
                return;
            }
        };
        let outcome = match Command::decode(&buf[..len]) {
            Ok(Command::Shutdown) => return,
            Ok(Command::Configure { active_clusters }) => {
                if active_clusters == 0 || active_clusters > clusters {
                    Err(Fault::InvalidLaunch(format!(
                        "cannot activate {} of {} clusters",
                        active_clusters, clusters
                    )))
                } else {
                    log::debug!("device master: {} active clusters", active_clusters);
                    active.store(active_clusters, Ordering::SeqCst);
                    Ok(())
                }
            }
            Ok(Command::Launch(record)) => {
                let topology = Topology::new(active.load(Ordering::SeqCst), topology.threads_per_cluster);
                let kernel = registry.read().unwrap().resolve_entry(memory.as_ref(), record.kernel_entry);
                kernel.and_then(|kernel| dispatch::run_launch(&topology, &record, kernel.as_ref(), memory.as_ref()))
            }
            Err(fault) => Err(fault),
        };
        if let Err(e) = completion.push_command(&Completion::from_result(outcome).encode()).to_result() {
            log::warn!("Error in device master {:?}", e);
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use minion_rt::Dim3;

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            clusters: 4,
            threads_per_cluster: 4,
            active_clusters: 2,
            device_region_size: 1 << 16,
            code_region_size: 1 << 12,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn dma_is_bounds_checked() {
        let sim = SimDevice::new(0, &small_config(), KernelRegistry::new());
        sim.write(DEVICE_REGION_BASE + 8, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        sim.read(DEVICE_REGION_BASE + 8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(matches!(sim.write(0x10, &[0]), Err(Error::InvalidValue(_))));
        let code = sim.properties().code_region_base();
        sim.write(code, &[9; 16]).unwrap();
        assert!(sim.read(code + (1 << 12) - 8, &mut [0u8; 16]).is_err());
    }

    #[test]
    fn configure_and_launch_through_queues() {
        let sim = SimDevice::new(0, &small_config(), KernelRegistry::new());
        sim.register_kernel("fill", |item| {
            let dst = item.arg_u64(0)?;
            item.memory().store(dst + item.global_id(), &[item.block_id() as u8 + 1])
        });
        sim.configure(4).unwrap();
        assert!(matches!(sim.configure(5), Err(Error::DeviceFault(_))));

        let code = sim.properties().code_region_base();
        sim.write(code, &minion_rt::KernelId::from_name("fill").to_stub()).unwrap();
        let record = LaunchRecord {
            grid: Dim3::new(3, 1, 1),
            block: Dim3::new(8, 1, 1),
            shared_mem: 0,
            kernel_entry: code,
            args: DEVICE_REGION_BASE.to_le_bytes().to_vec(),
        };
        sim.launch(&record).unwrap();
        let mut out = [0u8; 24];
        sim.read(DEVICE_REGION_BASE, &mut out).unwrap();
        assert_eq!(&out[..8], &[1; 8]);
        assert_eq!(&out[16..], &[3; 8]);

        let bad = LaunchRecord {
            kernel_entry: code + 64,
            ..record
        };
        assert!(matches!(sim.launch(&bad), Err(Error::DeviceFault(_))));
    }
}
