//! Shared handle to a device, and the process-wide platform behind the free functions
//! (`init`, `set_device`, `current`, ...) for callers that do not hold a `Platform` themselves.

use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::target::DeviceProperties;
use minion_rt::WorkItem;
use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};

/// Handle for Device
#[derive(Clone)]
pub struct Handle {
    backend: Arc<Device>,
}

impl Handle {
    pub(crate) fn new(backend: Device) -> Self {
        Handle {
            backend: Arc::new(backend),
        }
    }
}

impl Deref for Handle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.backend
    }
}

struct Runtime {
    platform: Platform,
    current: i32,
}

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

fn with_runtime<T>(f: impl FnOnce(&mut Runtime) -> Result<T>) -> Result<T> {
    let mut runtime = RUNTIME.lock().unwrap();
    match runtime.as_mut() {
        Some(runtime) => f(runtime),
        None => Err(Error::InvalidValue("runtime is not initialized".to_string())),
    }
}

/// Initialize the process-wide platform; device 0 becomes current.
pub fn init(config: RuntimeConfig) -> Result<()> {
    let mut runtime = RUNTIME.lock().unwrap();
    if runtime.is_some() {
        return Err(Error::InvalidValue("runtime is already initialized".to_string()));
    }
    *runtime = Some(Runtime {
        platform: Platform::new(config)?,
        current: 0,
    });
    Ok(())
}

/// Drop the process-wide platform. Devices go away once outstanding handles are dropped.
pub fn shutdown() -> Result<()> {
    RUNTIME
        .lock()
        .unwrap()
        .take()
        .map(|_| ())
        .ok_or_else(|| Error::InvalidValue("runtime is not initialized".to_string()))
}

/// Number of devices.
pub fn device_count() -> Result<i32> {
    with_runtime(|rt| Ok(rt.platform.device_count()))
}

/// Properties of device `index`.
pub fn device_properties(index: i32) -> Result<DeviceProperties> {
    with_runtime(|rt| rt.platform.properties(index))
}

/// Select the device `current` returns.
pub fn set_device(index: i32) -> Result<()> {
    with_runtime(|rt| {
        rt.platform.properties(index)?;
        rt.current = index;
        Ok(())
    })
}

/// Make `body` available under `name` on every device of the platform.
pub fn register_kernel<F>(name: &str, body: F) -> Result<()>
where
    F: Fn(&WorkItem<'_>) -> minion_rt::Result<()> + Send + Sync + 'static,
{
    with_runtime(|rt| rt.platform.register_kernel(name, body))
}

/// Handle to the current device, attaching it on first use.
pub fn current() -> Result<Handle> {
    with_runtime(|rt| {
        let index = rt.current;
        rt.platform.attach(index)
    })
}
