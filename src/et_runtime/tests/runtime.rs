use et_runtime::{
    Device, Dim3, Error, KernelImage, MemcpyKind, MemoryType, Platform, RuntimeConfig, SimDevice, StreamFlags,
};
use minion_rt::{Fault, KernelRegistry, WorkItem};
use std::sync::{atomic::Ordering, Arc};

fn config() -> RuntimeConfig {
    RuntimeConfig {
        clusters: 4,
        threads_per_cluster: 8,
        active_clusters: 4,
        host_region_size: 1 << 16,
        device_region_size: 1 << 20,
        code_region_size: 1 << 14,
        ..RuntimeConfig::default()
    }
}

fn load_u32(item: &WorkItem<'_>, addr: u64) -> minion_rt::Result<u32> {
    let mut raw = [0u8; 4];
    item.memory().load(addr, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn store_u32(item: &WorkItem<'_>, addr: u64, value: u32) -> minion_rt::Result<()> {
    item.memory().store(addr, &value.to_le_bytes())
}

/// `scale(n, factor, ptr)`: `ptr[i] *= factor` for `i < n`.
fn scale(item: &WorkItem<'_>) -> minion_rt::Result<()> {
    let n = item.arg_u32(0)? as u64;
    let factor = item.arg_u32(4)?;
    let ptr = item.arg_u64(8)?;
    let i = item.global_id();
    if i < n {
        let addr = ptr + 4 * i;
        let value = load_u32(item, addr)?;
        store_u32(item, addr, value * factor)?;
    }
    Ok(())
}

/// `block_sum(out)`: `out[block] = sum(global_id + 1)` over the block.
fn block_sum(item: &WorkItem<'_>) -> minion_rt::Result<()> {
    let out = item.arg_u64(0)?;
    item.shared()[0].fetch_add(item.global_id() + 1, Ordering::SeqCst);
    item.barrier()?;
    if item.local_id() == 0 {
        let sum = item.shared()[0].swap(0, Ordering::SeqCst);
        item.memory().store(out + 8 * item.block_id() as u64, &sum.to_le_bytes())?;
    }
    Ok(())
}

fn simulated(config: &RuntimeConfig) -> (Arc<SimDevice>, Device) {
    let sim = Arc::new(SimDevice::new(0, config, KernelRegistry::new()));
    sim.register_kernel("noop", |_: &WorkItem<'_>| -> minion_rt::Result<()> { Ok(()) });
    sim.register_kernel("scale", scale);
    sim.register_kernel("block_sum", block_sum);
    sim.register_kernel("fault", |item: &WorkItem<'_>| -> minion_rt::Result<()> {
        if item.global_id() == 3 {
            return Err(Fault::Kernel("thread 3 gave up".to_string()));
        }
        Ok(())
    });
    sim.register_kernel("wild_store", |item: &WorkItem<'_>| -> minion_rt::Result<()> {
        item.memory().store(0x10, &[1])
    });
    let device = Device::with_target(0, config, sim.clone()).unwrap();
    device
        .register_image(
            KernelImage::builder("tests")
                .kernel("noop")
                .kernel("scale")
                .kernel("block_sum")
                .kernel("fault")
                .kernel("wild_store")
                .build(),
        )
        .unwrap();
    (sim, device)
}

#[test]
fn noop_launch_uploads_one_image() {
    let (_sim, device) = simulated(&config());
    let stream = device.default_stream();
    device.configure(Dim3::new(2, 1, 1), Dim3::new(4, 1, 1), 0, stream).unwrap();
    for offset in &[0, 4, 8] {
        device.stage_argument(&(*offset as u32).to_le_bytes(), *offset).unwrap();
    }
    device.launch("noop").unwrap();
    device.stream_synchronize(stream).unwrap();
    assert_eq!(device.resident_images().unwrap(), 1);
    assert_eq!(device.memory_usage().unwrap().code.allocations, 1);
}

#[test]
fn launch_end_to_end() {
    let (_sim, device) = simulated(&config());
    let stream = device.create_stream(StreamFlags::NonBlocking).unwrap();
    let n = 100u32;
    let input: Vec<u8> = (0..n).flat_map(|i| i.to_le_bytes().to_vec()).collect();
    let host = device.malloc_host(input.len()).unwrap();
    let buf = device.malloc(input.len()).unwrap();
    device.write_host(host, &input).unwrap();
    device
        .memcpy_async(buf, host, input.len(), MemcpyKind::HostToDevice, stream)
        .unwrap();

    device.configure(Dim3::new(7, 1, 1), Dim3::new(16, 1, 1), 0, stream).unwrap();
    device.stage_argument(&n.to_le_bytes(), 0).unwrap();
    device.stage_argument(&3u32.to_le_bytes(), 4).unwrap();
    device.stage_argument(&buf.to_le_bytes(), 8).unwrap();
    device.launch("scale").unwrap();
    device
        .memcpy_async(host, buf, input.len(), MemcpyKind::Default, stream)
        .unwrap();
    device.stream_synchronize(stream).unwrap();

    let mut output = vec![0u8; input.len()];
    device.read_host(host, &mut output).unwrap();
    for (i, word) in output.chunks(4).enumerate() {
        assert_eq!(u32::from_le_bytes([word[0], word[1], word[2], word[3]]), 3 * i as u32);
    }
    assert_eq!(device.resident_images().unwrap(), 1);
    assert_eq!(device.memory_usage().unwrap().code.allocations, 1);
}

#[test]
fn blocks_spanning_clusters_share_memory() {
    let (_sim, device) = simulated(&config());
    let blocks = 5u32;
    let out = device.malloc(8 * blocks as usize).unwrap();
    let stream = device.default_stream();
    device.configure(Dim3::new(blocks, 1, 1), Dim3::new(4, 4, 1), 8, stream).unwrap();
    device.stage_argument(&out.to_le_bytes(), 0).unwrap();
    device.launch("block_sum").unwrap();

    let mut raw = vec![0u8; 8 * blocks as usize];
    device.download(out, &mut raw).unwrap();
    for (b, word) in raw.chunks(8).enumerate() {
        let mut sum = [0u8; 8];
        sum.copy_from_slice(word);
        assert_eq!(u64::from_le_bytes(sum), 256 * b as u64 + 136, "block {}", b);
    }
}

#[test]
fn memset_and_device_copies() {
    let (_sim, device) = simulated(&config());
    let a = device.malloc(64).unwrap();
    let b = device.malloc(64).unwrap();
    device.memset(a, 0x11, 64).unwrap();
    device.memset(a + 3, 0x22, 10).unwrap();
    device.memcpy(b, a, 64, MemcpyKind::DeviceToDevice).unwrap();
    device.memcpy(b + 61, a, 3, MemcpyKind::Default).unwrap();

    let mut out = [0u8; 64];
    device.download(b, &mut out).unwrap();
    let mut expected = [0x11u8; 64];
    expected[3..13].iter_mut().for_each(|x| *x = 0x22);
    expected[61..].copy_from_slice(&[0x11; 3]);
    assert_eq!(&out[..], &expected[..]);
    // the builtin image went resident for the fills and copies
    assert_eq!(device.resident_images().unwrap(), 1);
    assert_eq!(device.pointer_attributes(b + 8).unwrap().memory_type, MemoryType::Device);
}

#[test]
fn kernel_fault_poisons_the_device() {
    let (_sim, device) = simulated(&config());
    let stream = device.default_stream();
    device.configure(Dim3::new(2, 1, 1), Dim3::new(8, 1, 1), 0, stream).unwrap();
    device.launch("fault").unwrap();
    assert!(matches!(device.synchronize(), Err(Error::DeviceFault(_))));
    assert!(matches!(device.malloc(16), Err(Error::DeviceFault(_))));
    assert!(matches!(
        device.create_stream(StreamFlags::NonBlocking),
        Err(Error::DeviceFault(_))
    ));
}

#[test]
fn stray_store_is_a_device_fault() {
    let (_sim, device) = simulated(&config());
    let stream = device.default_stream();
    device.configure(Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 0, stream).unwrap();
    device.launch("wild_store").unwrap();
    match device.stream_synchronize(stream) {
        Err(Error::DeviceFault(msg)) => assert!(msg.contains("0x10"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn modules_load_and_unload() {
    let (sim, device) = simulated(&config());
    sim.register_kernel("late", |_: &WorkItem<'_>| -> minion_rt::Result<()> { Ok(()) });
    let image = device
        .load_module(KernelImage::builder("late").kernel("late").build())
        .unwrap();
    assert_eq!(device.memory_usage().unwrap().code.allocations, 1);

    let stream = device.default_stream();
    device.configure(Dim3::new(1, 1, 1), Dim3::new(8, 1, 1), 0, stream).unwrap();
    device.launch("late").unwrap();
    device.synchronize().unwrap();

    device.unload_module(image).unwrap();
    assert_eq!(device.memory_usage().unwrap().code.allocations, 0);
    assert!(matches!(device.unload_module(image), Err(Error::InvalidValue(_))));
    device.configure(Dim3::new(1, 1, 1), Dim3::new(8, 1, 1), 0, stream).unwrap();
    assert_eq!(device.launch("late"), Err(Error::UnresolvedKernel("late".to_string())));
}

#[test]
fn code_region_exhaustion() {
    let config = RuntimeConfig {
        code_region_size: 128,
        ..config()
    };
    let (_sim, device) = simulated(&config);
    let big = (0..4).fold(KernelImage::builder("big"), |b, i| b.kernel(&format!("k{}", i)));
    assert!(matches!(
        device.load_module(big.build()),
        Err(Error::OutOfMemory { region: "code", .. })
    ));
}

#[test]
fn platform_attaches_on_demand() {
    let mut platform = Platform::new(RuntimeConfig {
        device_count: 2,
        ..config()
    })
    .unwrap();
    assert_eq!(platform.device_count(), 2);
    assert!(platform.attached().is_empty());
    let first = platform.attach(1).unwrap();
    let again = platform.attach(1).unwrap();
    assert_eq!((first.index(), again.index()), (1, 1));
    assert_eq!(platform.attached(), vec![1]);
    assert!(platform.attach(2).is_err());
    assert_eq!(platform.properties(0).unwrap().clusters, 4);

    let ptr = first.malloc(32).unwrap();
    assert_eq!(again.pointer_attributes(ptr).unwrap().allocation, ptr);
    platform.detach(1).unwrap();
    assert!(platform.detach(1).is_err());
    first.memset(ptr, 7, 32).unwrap();
}

#[test]
fn platform_devices_run_user_kernels() {
    let mut kernels = KernelRegistry::new();
    kernels.register("scale", scale);
    let mut platform = Platform::with_kernels(config(), kernels).unwrap();
    let device = platform.attach(0).unwrap();
    device
        .register_image(KernelImage::builder("user").kernel("scale").kernel("fill").build())
        .unwrap();

    let n = 16u32;
    let buf = device.malloc(4 * n as usize).unwrap();
    device.memset(buf, 0, 4 * n as usize).unwrap();
    device.memset(buf, 1, 1).unwrap();
    let stream = device.default_stream();
    device.configure(Dim3::new(1, 1, 1), Dim3::new(n, 1, 1), 0, stream).unwrap();
    device.stage_argument(&n.to_le_bytes(), 0).unwrap();
    device.stage_argument(&5u32.to_le_bytes(), 4).unwrap();
    device.stage_argument(&buf.to_le_bytes(), 8).unwrap();
    device.launch("scale").unwrap();
    device.stream_synchronize(stream).unwrap();
    let mut word = [0u8; 4];
    device.download(buf, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 5);

    // registered after the device came up; reaches it and the devices attached later
    platform
        .register_kernel("fill", |item: &WorkItem<'_>| -> minion_rt::Result<()> {
            let ptr = item.arg_u64(0)?;
            store_u32(item, ptr + 4 * item.global_id(), 0x600d)
        })
        .unwrap();
    device.configure(Dim3::new(1, 1, 1), Dim3::new(n, 1, 1), 0, stream).unwrap();
    device.stage_argument(&buf.to_le_bytes(), 0).unwrap();
    device.launch("fill").unwrap();
    device.stream_synchronize(stream).unwrap();
    let mut out = vec![0u8; 4 * n as usize];
    device.download(buf, &mut out).unwrap();
    assert!(out.chunks(4).all(|w| w == &0x600du32.to_le_bytes()[..]));
    assert_eq!(device.resident_images().unwrap(), 2);
}

