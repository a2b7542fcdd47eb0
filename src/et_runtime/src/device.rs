//! Device manages one accelerator: its memory regions, streams, events, resident code
//! images and the executor thread draining the streams.
//!
//! Every call takes the device lock briefly and never blocks while holding it; waiting
//! happens on markers after the lock is released.

use crate::action::{Action, ActionKind, ExecContext, Marker, ReadTarget, WriteSource};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, EventId};
use crate::executor::Executor;
use crate::idmap::IdMap;
use crate::image::{builtin_image, ImageId, KernelResolver, LoadedImage};
use crate::launch::{check_geometry, linear_dims, ArgBuffer, PendingLaunch};
use crate::memory::{
    MemoryRegion, MemoryType, MemoryUsage, PointerAttributes, DEVICE_REGION_BASE, HOST_REGION_BASE,
};
use crate::stream::{Stream, StreamFlags, StreamId};
use crate::target::{DeviceProperties, DeviceTarget, SimDevice};
use minion_rt::{builtins, Dim3, FlatMemory, GlobalMemory, KernelFn, KernelRegistry, LaunchRecord, WorkItem};
use std::{
    collections::HashMap,
    convert::TryFrom,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, ThreadId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Direction of a memcpy.
pub enum MemcpyKind {
    /// Pinned host to pinned host.
    HostToHost,
    /// Pinned host to device.
    HostToDevice,
    /// Device to pinned host.
    DeviceToHost,
    /// Device to device, run as a copy kernel.
    DeviceToDevice,
    /// Inferred from the addresses: anything outside the device regions is host memory.
    Default,
}

pub(crate) struct Shared {
    pub state: Mutex<State>,
    pub work: Condvar,
}

pub(crate) struct State {
    pub streams: IdMap<StreamId, Stream>,
    default_stream: StreamId,
    events: IdMap<EventId, Event>,
    images: IdMap<ImageId, Arc<dyn KernelResolver>>,
    loaded: HashMap<ImageId, LoadedImage>,
    pending: HashMap<ThreadId, PendingLaunch>,
    host_region: MemoryRegion,
    data_region: MemoryRegion,
    code_region: MemoryRegion,
    next_action: u64,
    pub exit_requested: bool,
    pub fault: Option<String>,
}

impl State {
    /// Blocking streams run their work on the default stream.
    fn route(&self, stream: StreamId) -> Result<StreamId> {
        match self.streams.get(stream) {
            Some(s) if s.is_blocking() => Ok(self.default_stream),
            Some(_) => Ok(stream),
            None => Err(Error::InvalidValue(format!("unknown stream {:?}", stream))),
        }
    }

    fn push(&mut self, stream: StreamId, kind: ActionKind) -> Result<()> {
        let target = self.route(stream)?;
        let id = self.next_action;
        self.next_action += 1;
        if let Some(s) = self.streams.get_mut(target) {
            s.push(Action { id, kind });
        }
        Ok(())
    }

    /// Front action of the first stream, in creation order, whose front is ready.
    pub(crate) fn pop_ready(&mut self) -> Option<(StreamId, Action)> {
        self.streams
            .iter_mut()
            .find_map(|(&id, stream)| stream.pop_ready().map(|action| (id, action)))
    }

    fn event(&self, id: EventId) -> Result<&Event> {
        self.events
            .get(id)
            .ok_or_else(|| Error::InvalidValue(format!("unknown event {:?}", id)))
    }

    fn is_device_ptr(&self, ptr: u64) -> bool {
        self.data_region.contains(ptr) || self.code_region.contains(ptr)
    }

    /// Drop uploads that failed so the next launch from the image uploads it again.
    fn forget_failed_uploads(&mut self) {
        let failed: Vec<ImageId> = self
            .loaded
            .iter()
            .filter(|(_, loaded)| matches!(loaded.upload.as_ref().and_then(|m| m.outcome()), Some(Err(_))))
            .map(|(&id, _)| id)
            .collect();
        for id in failed {
            if let Some(loaded) = self.loaded.remove(&id) {
                log::warn!("upload of {:?} failed, releasing {:#x}", id, loaded.device_ptr);
                if let Err(e) = self.code_region.free(loaded.device_ptr) {
                    log::warn!("Error in releasing code of {:?}: {}", id, e);
                }
            }
        }
    }

    fn abandon_all(&mut self) -> usize {
        self.pending.clear();
        self.streams.iter_mut().map(|(_, s)| s.abandon_all()).sum()
    }
}

/// One attached accelerator.
pub struct Device {
    index: i32,
    properties: DeviceProperties,
    shared: Arc<Shared>,
    host: Arc<FlatMemory>,
    target: Arc<dyn DeviceTarget>,
    executor: Executor,
}

impl Device {
    /// Attach simulated device `index` with only the builtin kernels.
    pub fn new(index: i32, config: &RuntimeConfig) -> Result<Self> {
        Self::with_kernels(index, config, KernelRegistry::new())
    }

    /// Attach simulated device `index` running the builtin kernels and those in `kernels`.
    pub fn with_kernels(index: i32, config: &RuntimeConfig, kernels: KernelRegistry) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidValue(e.to_string()))?;
        Self::with_target(index, config, Arc::new(SimDevice::new(index, config, kernels)))
    }

    /// Attach `target` as device `index`. The host region comes from `config`, the
    /// device regions from the target's properties.
    pub fn with_target(index: i32, config: &RuntimeConfig, target: Arc<dyn DeviceTarget>) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidValue(e.to_string()))?;
        let properties = target.properties().clone();
        let align = config.region_alignment;
        let host = Arc::new(FlatMemory::new(HOST_REGION_BASE, config.host_region_size as usize));

        let mut streams = IdMap::new();
        let default_stream = streams.insert(Stream::new(StreamFlags::Blocking));
        let mut images: IdMap<ImageId, Arc<dyn KernelResolver>> = IdMap::new();
        images.insert(Arc::new(builtin_image()));
        let mut state = State {
            streams,
            default_stream,
            events: IdMap::new(),
            images,
            loaded: HashMap::new(),
            pending: HashMap::new(),
            host_region: MemoryRegion::new("host", HOST_REGION_BASE, config.host_region_size, align),
            data_region: MemoryRegion::new("device", DEVICE_REGION_BASE, properties.total_global_mem, align),
            code_region: MemoryRegion::new("code", properties.code_region_base(), properties.code_mem, align),
            next_action: 0,
            exit_requested: false,
            fault: None,
        };
        state.push(
            default_stream,
            ActionKind::Configure {
                active_clusters: properties.active_clusters,
            },
        )?;

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            work: Condvar::new(),
        });
        let ctx = ExecContext {
            target: Arc::clone(&target),
            host: Arc::clone(&host),
        };
        let executor = Executor::spawn(index, Arc::clone(&shared), ctx)?;
        log::info!(
            "device {} up: {}, {} of {} clusters active",
            index,
            properties.name,
            properties.active_clusters,
            properties.clusters
        );
        Ok(Device {
            index,
            properties,
            shared,
            host,
            target,
            executor,
        })
    }

    /// Device index.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Static properties.
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.shared.state.lock().unwrap();
        if let Some(msg) = &state.fault {
            return Err(Error::DeviceFault(msg.clone()));
        }
        Ok(state)
    }

    fn enqueue(&self, state: &mut State, stream: StreamId, kind: ActionKind) -> Result<()> {
        state.push(stream, kind)?;
        self.shared.work.notify_one();
        Ok(())
    }

    // ---- memory ----

    /// Allocate pinned host memory. The returned address is only accessible through
    /// `write_host`, `read_host` and memcpy.
    pub fn malloc_host(&self, size: usize) -> Result<u64> {
        self.lock()?.host_region.alloc(size as u64)
    }

    /// Release pinned host memory.
    pub fn free_host(&self, ptr: u64) -> Result<()> {
        self.lock()?.host_region.free(ptr)
    }

    /// Allocate device memory.
    pub fn malloc(&self, size: usize) -> Result<u64> {
        self.lock()?.data_region.alloc(size as u64)
    }

    /// Release device memory.
    pub fn free(&self, ptr: u64) -> Result<()> {
        self.lock()?.data_region.free(ptr)
    }

    /// Which allocation `ptr` points into.
    pub fn pointer_attributes(&self, ptr: u64) -> Result<PointerAttributes> {
        let state = self.lock()?;
        let found = if let Some(span) = state.host_region.allocation_containing(ptr) {
            Some((MemoryType::Host, span))
        } else {
            state
                .data_region
                .allocation_containing(ptr)
                .map(|span| (MemoryType::Device, span))
        };
        let (memory_type, (allocation, size)) =
            found.ok_or_else(|| Error::InvalidValue(format!("{:#x} is not an allocation", ptr)))?;
        Ok(PointerAttributes {
            memory_type,
            device: self.index,
            allocation,
            size,
        })
    }

    /// Live allocations per region.
    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        let state = self.lock()?;
        Ok(MemoryUsage {
            host: (&state.host_region).into(),
            device: (&state.data_region).into(),
            code: (&state.code_region).into(),
        })
    }

    /// Copy `data` into pinned host memory.
    pub fn write_host(&self, ptr: u64, data: &[u8]) -> Result<()> {
        self.host
            .store(ptr, data)
            .map_err(|_| Error::InvalidValue(format!("{:#x} (+{}) is not pinned host memory", ptr, data.len())))
    }

    /// Copy pinned host memory into `out`.
    pub fn read_host(&self, ptr: u64, out: &mut [u8]) -> Result<()> {
        let len = out.len();
        self.host
            .load(ptr, out)
            .map_err(|_| Error::InvalidValue(format!("{:#x} (+{}) is not pinned host memory", ptr, len)))
    }

    fn check_range(&self, state: &State, ptr: u64, count: usize, host: bool) -> Result<()> {
        let end = ptr.checked_add(count as u64);
        let valid = if host {
            self.host.contains(ptr, count)
        } else {
            end.map_or(false, |end| state.is_device_ptr(ptr) && state.is_device_ptr(end - 1))
        };
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidValue(format!(
                "{:#x} (+{}) is not {} memory",
                ptr,
                count,
                if host { "pinned host" } else { "device" }
            )))
        }
    }

    /// Queue a copy of `count` bytes on `stream`.
    pub fn memcpy_async(&self, dst: u64, src: u64, count: usize, kind: MemcpyKind, stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        state.route(stream)?;
        if count == 0 {
            return Ok(());
        }
        let kind = match kind {
            MemcpyKind::Default => match (state.is_device_ptr(src), state.is_device_ptr(dst)) {
                (false, false) => MemcpyKind::HostToHost,
                (false, true) => MemcpyKind::HostToDevice,
                (true, false) => MemcpyKind::DeviceToHost,
                (true, true) => MemcpyKind::DeviceToDevice,
            },
            kind => kind,
        };
        let (src_host, dst_host) = match kind {
            MemcpyKind::HostToHost => (true, true),
            MemcpyKind::HostToDevice => (true, false),
            MemcpyKind::DeviceToHost => (false, true),
            _ => (false, false),
        };
        self.check_range(&state, src, count, src_host)?;
        self.check_range(&state, dst, count, dst_host)?;
        match kind {
            MemcpyKind::DeviceToHost => self.enqueue(
                &mut state,
                stream,
                ActionKind::Read {
                    src,
                    dst: ReadTarget::Host(dst),
                    len: count,
                },
            ),
            MemcpyKind::DeviceToDevice => {
                let (name, elements) = if count % 4 == 0 {
                    (builtins::COPY_INT32, count / 4)
                } else {
                    (builtins::COPY_INT8, count)
                };
                let elements = element_count(elements)?;
                let mut args = ArgBuffer::default();
                args.stage(&elements.to_le_bytes(), 0)?;
                args.stage(&src.to_le_bytes(), 8)?;
                args.stage(&dst.to_le_bytes(), 16)?;
                self.enqueue_builtin(&mut state, stream, name, elements, args)
            }
            _ => self.enqueue(
                &mut state,
                stream,
                ActionKind::Write {
                    dst,
                    src: WriteSource::Host { ptr: src, len: count },
                    done: None,
                },
            ),
        }
    }

    /// Copy on the default stream and wait for it.
    pub fn memcpy(&self, dst: u64, src: u64, count: usize, kind: MemcpyKind) -> Result<()> {
        let stream = self.default_stream();
        self.memcpy_async(dst, src, count, kind, stream)?;
        self.stream_synchronize(stream)
    }

    /// Queue a copy of `data`, captured now, to device address `dst`.
    pub fn upload_async(&self, dst: u64, data: &[u8], stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        state.route(stream)?;
        self.check_range(&state, dst, data.len(), false)?;
        self.enqueue(
            &mut state,
            stream,
            ActionKind::Write {
                dst,
                src: WriteSource::Bytes(data.into()),
                done: None,
            },
        )
    }

    /// Read `out.len()` bytes of device memory through the default stream.
    pub fn download(&self, src: u64, out: &mut [u8]) -> Result<()> {
        let stage = Arc::new(Mutex::new(Vec::new()));
        let stream = {
            let mut state = self.lock()?;
            self.check_range(&state, src, out.len(), false)?;
            let stream = state.default_stream;
            self.enqueue(
                &mut state,
                stream,
                ActionKind::Read {
                    src,
                    dst: ReadTarget::Staging(Arc::clone(&stage)),
                    len: out.len(),
                },
            )?;
            stream
        };
        self.stream_synchronize(stream)?;
        let staged = stage.lock().unwrap();
        if staged.len() != out.len() {
            return Err(Error::InvalidValue(format!("download of {:#x} did not complete", src)));
        }
        out.copy_from_slice(&staged);
        Ok(())
    }

    /// Queue a fill of `count` bytes at device address `ptr`.
    pub fn memset_async(&self, ptr: u64, value: u8, count: usize, stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        state.route(stream)?;
        if count == 0 {
            return Ok(());
        }
        self.check_range(&state, ptr, count, false)?;
        let (name, elements, word) = if count % 4 == 0 {
            (builtins::SET_INT32, count / 4, u32::from_le_bytes([value; 4]))
        } else {
            (builtins::SET_INT8, count, value as u32)
        };
        let elements = element_count(elements)?;
        let mut args = ArgBuffer::default();
        args.stage(&elements.to_le_bytes(), 0)?;
        args.stage(&word.to_le_bytes(), 4)?;
        args.stage(&ptr.to_le_bytes(), 8)?;
        self.enqueue_builtin(&mut state, stream, name, elements, args)
    }

    /// Fill on the default stream and wait for it.
    pub fn memset(&self, ptr: u64, value: u8, count: usize) -> Result<()> {
        let stream = self.default_stream();
        self.memset_async(ptr, value, count, stream)?;
        self.stream_synchronize(stream)
    }

    fn enqueue_builtin(&self, state: &mut State, stream: StreamId, name: &str, elements: u32, args: ArgBuffer) -> Result<()> {
        let (grid, block) = linear_dims(elements as u64, self.properties.threads_per_cluster);
        self.enqueue_launch(state, stream, grid, block, 0, args.into_bytes(), name)
    }

    // ---- streams ----

    /// The stream every blocking stream funnels into.
    pub fn default_stream(&self) -> StreamId {
        self.shared.state.lock().unwrap().default_stream
    }

    /// Create a stream.
    pub fn create_stream(&self, flags: StreamFlags) -> Result<StreamId> {
        Ok(self.lock()?.streams.insert(Stream::new(flags)))
    }

    /// Destroy a stream. Its queued actions are dropped and their markers fire as abandoned.
    pub fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        if stream == state.default_stream {
            return Err(Error::InvalidValue("the default stream cannot be destroyed".to_string()));
        }
        let mut removed = state
            .streams
            .remove(stream)
            .ok_or_else(|| Error::InvalidValue(format!("unknown stream {:?}", stream)))?;
        let abandoned = removed.abandon_all();
        if abandoned > 0 {
            log::warn!("{} actions abandoned with {:?}", abandoned, stream);
        }
        self.shared.work.notify_one();
        Ok(())
    }

    /// Wait for everything queued on `stream` so far; returns and clears its deferred error.
    pub fn stream_synchronize(&self, stream: StreamId) -> Result<()> {
        let marker = Marker::new();
        {
            let mut state = self.lock()?;
            self.enqueue(
                &mut state,
                stream,
                ActionKind::EventMark {
                    marker: Arc::clone(&marker),
                    consume: true,
                    carried: None,
                },
            )?;
        }
        marker.wait()
    }

    /// Wait for every stream; returns the first deferred error.
    pub fn synchronize(&self) -> Result<()> {
        let markers = {
            let mut state = self.lock()?;
            self.mark_every_queue(&mut state, true)?
        };
        markers
            .iter()
            .map(|marker| marker.wait())
            .fold(Ok(()), |first, outcome| first.and(outcome))
    }

    /// Queue a mark at the end of the default stream and of every non-blocking stream.
    fn mark_every_queue(&self, state: &mut State, consume: bool) -> Result<Vec<Arc<Marker>>> {
        let default = state.default_stream;
        let streams: Vec<StreamId> = state
            .streams
            .iter()
            .filter(|&(&id, stream)| id == default || !stream.is_blocking())
            .map(|(&id, _)| id)
            .collect();
        let mut markers = Vec::with_capacity(streams.len());
        for stream in streams {
            let marker = Marker::new();
            self.enqueue(
                state,
                stream,
                ActionKind::EventMark {
                    marker: Arc::clone(&marker),
                    consume,
                    carried: None,
                },
            )?;
            markers.push(marker);
        }
        Ok(markers)
    }

    /// Make later work on `stream` wait for the latest record of `event`.
    pub fn stream_wait_event(&self, stream: StreamId, event: EventId) -> Result<()> {
        let mut state = self.lock()?;
        state.route(stream)?;
        if let Some(marker) = state.event(event)?.marker.clone() {
            self.enqueue(&mut state, stream, ActionKind::EventWait(marker))?;
        }
        Ok(())
    }

    // ---- events ----

    /// Create an event.
    pub fn create_event(&self, flags: EventFlags) -> Result<EventId> {
        Ok(self.lock()?.events.insert(Event::new(flags)))
    }

    /// Destroy an event; waiters already queued keep their marker.
    pub fn destroy_event(&self, event: EventId) -> Result<()> {
        self.lock()?
            .events
            .remove(event)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidValue(format!("unknown event {:?}", event)))
    }

    /// Record `event` at the current end of `stream`.
    pub fn record_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        state.event(event)?;
        let marker = Marker::new();
        self.enqueue(
            &mut state,
            stream,
            ActionKind::EventMark {
                marker: Arc::clone(&marker),
                consume: false,
                carried: None,
            },
        )?;
        if let Some(e) = state.events.get_mut(event) {
            e.marker = Some(marker);
        }
        Ok(())
    }

    /// `Ok` once the latest record executed (or if never recorded), `NotReady` before.
    pub fn query_event(&self, event: EventId) -> Result<()> {
        let state = self.lock()?;
        match &state.event(event)?.marker {
            None => Ok(()),
            Some(marker) => marker.outcome().unwrap_or(Err(Error::NotReady)),
        }
    }

    /// Block until the latest record executed.
    pub fn synchronize_event(&self, event: EventId) -> Result<()> {
        let marker = self.lock()?.event(event)?.marker.clone();
        match marker {
            Some(marker) => marker.wait(),
            None => Ok(()),
        }
    }

    /// Milliseconds between the executions of two recorded events.
    pub fn elapsed_time(&self, start: EventId, end: EventId) -> Result<f32> {
        let state = self.lock()?;
        let instant = |id: EventId| -> Result<std::time::Instant> {
            let event = state.event(id)?;
            if event.flags.disable_timing {
                return Err(Error::InvalidValue(format!("{:?} was created with timing disabled", id)));
            }
            let marker = event
                .marker
                .as_ref()
                .ok_or_else(|| Error::InvalidValue(format!("{:?} was never recorded", id)))?;
            marker.executed_at().ok_or(Error::NotReady)
        };
        let (t0, t1) = (instant(start)?, instant(end)?);
        let ms = if t1 >= t0 {
            (t1 - t0).as_secs_f64() * 1e3
        } else {
            -((t0 - t1).as_secs_f64() * 1e3)
        };
        Ok(ms as f32)
    }

    // ---- kernels ----

    /// Make `body` runnable on the device under `name`. Launching it still needs an
    /// image that places `name` (see `register_image`).
    pub fn register_kernel<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: Fn(&WorkItem<'_>) -> minion_rt::Result<()> + Send + Sync + 'static,
    {
        self.install_kernel(name, Arc::new(body))
    }

    pub(crate) fn install_kernel(&self, name: &str, body: Arc<KernelFn>) -> Result<()> {
        self.target.register_kernel(name, body)
    }

    /// Make the kernels of `image` launchable by name. Images are searched in
    /// registration order.
    pub fn register_image<R: KernelResolver + 'static>(&self, image: R) -> Result<ImageId> {
        Ok(self.lock()?.images.insert(Arc::new(image)))
    }

    /// Register `image` and upload it now. An image whose upload fails is not registered.
    pub fn load_module<R: KernelResolver + 'static>(&self, image: R) -> Result<ImageId> {
        let (id, stream, upload) = {
            let mut state = self.lock()?;
            let id = state.images.insert(Arc::new(image));
            let stream = state.default_stream;
            let (_, upload) = self.make_resident(&mut state, id)?;
            (id, stream, upload)
        };
        if let Err(e) = self.stream_synchronize(stream) {
            if matches!(upload.and_then(|m| m.outcome()), Some(Err(_))) {
                let mut state = self.shared.state.lock().unwrap();
                state.images.remove(id);
                state.forget_failed_uploads();
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Forget `image` and release its code memory once the work queued so far, which may
    /// still write or run that code, has drained.
    pub fn unload_module(&self, image: ImageId) -> Result<()> {
        let (loaded, markers) = {
            let mut state = self.lock()?;
            state
                .images
                .remove(image)
                .ok_or_else(|| Error::InvalidValue(format!("unknown image {:?}", image)))?;
            match state.loaded.remove(&image) {
                Some(loaded) => (loaded, self.mark_every_queue(&mut state, false)?),
                None => return Ok(()),
            }
        };
        for marker in markers {
            // stream errors stay deferred for their own synchronize
            let _ = marker.wait();
        }
        self.lock()?.code_region.free(loaded.device_ptr)
    }

    /// Images uploaded to the code region.
    pub fn resident_images(&self) -> Result<usize> {
        let mut state = self.lock()?;
        state.forget_failed_uploads();
        Ok(state.loaded.len())
    }

    /// First step of a launch on the calling thread.
    pub fn configure(&self, grid: Dim3, block: Dim3, shared_mem: u32, stream: StreamId) -> Result<()> {
        let mut state = self.lock()?;
        let me = thread::current().id();
        if state.pending.contains_key(&me) {
            return Err(Error::ConfigurationError(
                "configure called twice without a launch".to_string(),
            ));
        }
        state.route(stream)?;
        check_geometry(grid, block, shared_mem, &self.properties)?;
        state.pending.insert(
            me,
            PendingLaunch {
                grid,
                block,
                shared_mem,
                stream,
                args: ArgBuffer::default(),
            },
        );
        Ok(())
    }

    /// Copy one argument into the calling thread's pending launch.
    pub fn stage_argument(&self, arg: &[u8], offset: usize) -> Result<()> {
        let mut state = self.lock()?;
        let pending = state
            .pending
            .get_mut(&thread::current().id())
            .ok_or_else(|| Error::ConfigurationError("stage_argument without configure".to_string()))?;
        pending.args.stage(arg, offset)
    }

    /// Queue the calling thread's pending launch of `kernel`.
    pub fn launch(&self, kernel: &str) -> Result<()> {
        let mut state = self.lock()?;
        let pending = state
            .pending
            .remove(&thread::current().id())
            .ok_or_else(|| Error::ConfigurationError("launch without configure".to_string()))?;
        self.enqueue_launch(
            &mut state,
            pending.stream,
            pending.grid,
            pending.block,
            pending.shared_mem,
            pending.args.into_bytes(),
            kernel,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_launch(
        &self,
        state: &mut State,
        stream: StreamId,
        grid: Dim3,
        block: Dim3,
        shared_mem: u32,
        args: Vec<u8>,
        kernel: &str,
    ) -> Result<()> {
        let (image, offset) = state
            .images
            .iter()
            .find_map(|(&id, image)| image.resolve(kernel).map(|offset| (id, offset)))
            .ok_or_else(|| Error::UnresolvedKernel(kernel.to_string()))?;
        let (base, code) = self.make_resident(state, image)?;
        log::debug!("launch {} at {:#x}, grid {} block {}", kernel, base + offset, grid, block);
        self.enqueue(
            state,
            stream,
            ActionKind::Launch {
                record: LaunchRecord {
                    grid,
                    block,
                    shared_mem,
                    kernel_entry: base + offset,
                    args,
                },
                code,
            },
        )
    }

    /// Upload `image` on first use. Returns its code address and, while the upload is
    /// still queued, the marker launches from it must wait for.
    fn make_resident(&self, state: &mut State, image: ImageId) -> Result<(u64, Option<Arc<Marker>>)> {
        state.forget_failed_uploads();
        if let Some(loaded) = state.loaded.get_mut(&image) {
            if loaded.upload.as_ref().map_or(false, |m| m.is_executed()) {
                loaded.upload = None;
            }
            return Ok((loaded.device_ptr, loaded.upload.clone()));
        }
        let bytes = state
            .images
            .get(image)
            .ok_or_else(|| Error::InvalidValue(format!("unknown image {:?}", image)))?
            .image_bytes();
        let device_ptr = state.code_region.alloc(bytes.len() as u64)?;
        let upload = Marker::new();
        let default = state.default_stream;
        self.enqueue(
            state,
            default,
            ActionKind::Write {
                dst: device_ptr,
                src: WriteSource::Bytes(bytes),
                done: Some(Arc::clone(&upload)),
            },
        )?;
        state.loaded.insert(
            image,
            LoadedImage {
                device_ptr,
                upload: Some(Arc::clone(&upload)),
            },
        );
        Ok((device_ptr, Some(upload)))
    }
}

fn element_count(elements: usize) -> Result<u32> {
    u32::try_from(elements).map_err(|_| Error::InvalidValue(format!("{} elements exceed one transfer", elements)))
}

impl Drop for Device {
    fn drop(&mut self) {
        self.executor.stop(&self.shared);
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let abandoned = state.abandon_all();
        log::info!("device {} released, {} queued actions abandoned", self.index, abandoned);
    }
}
