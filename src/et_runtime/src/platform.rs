use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::target::DeviceProperties;
use minion_rt::{KernelFn, KernelRegistry, WorkItem};
use std::{collections::HashMap, sync::Arc};

/// Platform enumerates the devices described by a configuration and attaches them on demand.
pub struct Platform {
    config: RuntimeConfig,
    kernels: KernelRegistry,
    devices: HashMap<i32, Handle>,
}

impl Platform {
    /// Create a Platform for every device in `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_kernels(config, KernelRegistry::new())
    }

    /// Create a Platform whose devices come up with `kernels` next to the builtins.
    pub fn with_kernels(config: RuntimeConfig, kernels: KernelRegistry) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidValue(e.to_string()))?;
        Ok(Platform {
            config,
            kernels,
            devices: HashMap::new(),
        })
    }

    /// Make `body` available under `name` on attached devices and on those attached later.
    pub fn register_kernel<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: Fn(&WorkItem<'_>) -> minion_rt::Result<()> + Send + Sync + 'static,
    {
        let body: Arc<KernelFn> = Arc::new(body);
        self.kernels.insert(name, Arc::clone(&body));
        for handle in self.devices.values() {
            handle.install_kernel(name, Arc::clone(&body))?;
        }
        Ok(())
    }

    /// Configuration in use.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of devices.
    pub fn device_count(&self) -> i32 {
        self.config.device_count
    }

    fn check_index(&self, index: i32) -> Result<()> {
        if index < 0 || index >= self.config.device_count {
            Err(Error::InvalidValue(format!(
                "device {} out of range 0..{}",
                index, self.config.device_count
            )))
        } else {
            Ok(())
        }
    }

    /// Properties of device `index`, without attaching it.
    pub fn properties(&self, index: i32) -> Result<DeviceProperties> {
        self.check_index(index)?;
        Ok(DeviceProperties::from_config(index, &self.config))
    }

    /// Handle to device `index`, bringing it up on first use.
    pub fn attach(&mut self, index: i32) -> Result<Handle> {
        self.check_index(index)?;
        if let Some(handle) = self.devices.get(&index) {
            return Ok(handle.clone());
        }
        let handle = Handle::new(Device::with_kernels(index, &self.config, self.kernels.clone())?);
        self.devices.insert(index, handle.clone());
        Ok(handle)
    }

    /// Drop the platform's handle to device `index`. The device is torn down once the
    /// last outstanding handle is gone.
    pub fn detach(&mut self, index: i32) -> Result<()> {
        self.devices
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidValue(format!("device {} is not attached", index)))
    }

    /// Attached device indices.
    pub fn attached(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
