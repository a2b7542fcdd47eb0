#![deny(warnings)]
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use et_runtime::{
    Device, Dim3, EventFlags, KernelImage, MemcpyKind, Platform, RuntimeConfig, StreamFlags,
};
use minion_rt::{Fault, KernelRegistry, WorkItem};
use std::{
    error::Error,
    process,
    sync::atomic::Ordering,
    time::Instant,
};

type BoxResult<T> = Result<T, Box<dyn Error>>;

fn load_config(matches: &ArgMatches<'_>) -> BoxResult<RuntimeConfig> {
    let mut config = match matches.value_of("config") {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(clusters) = matches.value_of("clusters") {
        config.clusters = clusters.parse()?;
        config.active_clusters = config.active_clusters.min(config.clusters);
    }
    config.validate()?;
    Ok(config)
}

fn info(config: RuntimeConfig) -> BoxResult<()> {
    let platform = Platform::new(config)?;
    for index in 0..platform.device_count() {
        let props = platform.properties(index)?;
        println!("device {}: {}", index, props.name);
        println!("  clusters            {} x {} threads", props.clusters, props.threads_per_cluster);
        println!("  active clusters     {}", props.active_clusters);
        println!("  global memory       {} MiB", props.total_global_mem >> 20);
        println!("  code memory         {} MiB", props.code_mem >> 20);
        println!("  threads per block   {}", props.max_threads_per_block);
        println!("  shared mem / block  {} bytes", props.shared_mem_per_block);
    }
    Ok(())
}

/// Every thread of a block bumps the shared counter once per round; between the
/// two barriers all of them must observe the full count.
fn barrier_rounds(item: &WorkItem<'_>) -> minion_rt::Result<()> {
    let rounds = item.arg_u32(0)? as u64;
    let out = item.arg_u64(8)?;
    let threads = item.block_dim().volume().unwrap_or(0) as u64;
    let counter = &item.shared()[0];
    if item.local_id() == 0 {
        counter.store(0, Ordering::SeqCst);
    }
    item.barrier()?;
    for round in 1..=rounds {
        counter.fetch_add(1, Ordering::SeqCst);
        item.barrier()?;
        let seen = counter.load(Ordering::SeqCst);
        if seen != round * threads {
            return Err(Fault::Kernel(format!(
                "block {} round {}: saw {} of {} arrivals",
                item.block_id(),
                round,
                seen,
                round * threads
            )));
        }
        item.barrier()?;
    }
    if item.local_id() == 0 {
        item.memory()
            .store(out + 8 * item.block_id() as u64, &rounds.to_le_bytes())?;
    }
    Ok(())
}

fn attach(config: &RuntimeConfig) -> BoxResult<Device> {
    let mut kernels = KernelRegistry::new();
    kernels.register("noop", |_: &WorkItem<'_>| -> minion_rt::Result<()> { Ok(()) });
    kernels.register("barrier_rounds", barrier_rounds);
    let device = Device::with_kernels(0, config, kernels)?;
    device.register_image(
        KernelImage::builder("etrt_tool")
            .kernel("noop")
            .kernel("barrier_rounds")
            .build(),
    )?;
    Ok(device)
}

fn smoke(config: RuntimeConfig, iterations: u32) -> BoxResult<()> {
    let device = attach(&config)?;
    let stream = device.create_stream(StreamFlags::NonBlocking)?;
    let (start, end) = (
        device.create_event(EventFlags::default())?,
        device.create_event(EventFlags::default())?,
    );
    let size = 4096;
    let host = device.malloc_host(size)?;
    let a = device.malloc(size)?;
    let b = device.malloc(size)?;

    for i in 0..iterations {
        let value = (i % 251) as u8;
        device.record_event(start, stream)?;
        device.memset_async(a, value, size, stream)?;
        device.memcpy_async(b, a, size - 1, MemcpyKind::DeviceToDevice, stream)?;
        device.memcpy_async(host, b, size, MemcpyKind::Default, stream)?;
        device.configure(Dim3::new(4, 1, 1), Dim3::new(config.threads_per_cluster, 1, 1), 0, stream)?;
        device.stage_argument(&i.to_le_bytes(), 0)?;
        device.launch("noop")?;
        device.record_event(end, stream)?;
        device.stream_synchronize(stream)?;

        let mut out = vec![0u8; size];
        device.read_host(host, &mut out)?;
        if out[..size - 1].iter().any(|&x| x != value) {
            return Err(format!("iteration {}: copy mismatch", i).into());
        }
        log::info!("iteration {}: {:.3} ms", i, device.elapsed_time(start, end)?);
    }
    let usage = device.memory_usage()?;
    println!(
        "smoke passed: {} iterations, {} images resident, {} device allocations",
        iterations,
        device.resident_images()?,
        usage.device.allocations
    );
    Ok(())
}

fn barrier(config: RuntimeConfig, iterations: u32) -> BoxResult<()> {
    let device = attach(&config)?;
    let threads = config.threads_per_cluster * config.active_clusters;
    let blocks = config.active_clusters * 2;
    let out = device.malloc(8 * blocks as usize)?;
    let began = Instant::now();
    device.configure(Dim3::new(blocks, 1, 1), Dim3::new(threads, 1, 1), 8, device.default_stream())?;
    device.stage_argument(&iterations.to_le_bytes(), 0)?;
    device.stage_argument(&out.to_le_bytes(), 8)?;
    device.launch("barrier_rounds")?;
    device.synchronize()?;

    let mut raw = vec![0u8; 8 * blocks as usize];
    device.download(out, &mut raw)?;
    for (block, word) in raw.chunks(8).enumerate() {
        let mut done = [0u8; 8];
        done.copy_from_slice(word);
        if u64::from_le_bytes(done) != iterations as u64 {
            return Err(format!("block {} did not finish its rounds", block).into());
        }
    }
    println!(
        "barrier passed: {} blocks of {} threads, {} rounds in {:?}",
        blocks,
        threads,
        iterations,
        began.elapsed()
    );
    Ok(())
}

fn main() {
    let matches = App::new("ET runtime tool")
        .about("Inspect and exercise the simulated accelerator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .long("config")
                .help("Runtime configuration in TOML")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("clusters")
                .long("clusters")
                .help("Override the number of clusters")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("iterations")
                .long("iterations")
                .help("Rounds for smoke and barrier")
                .default_value("16")
                .takes_value(true),
        )
        .subcommand(SubCommand::with_name("info").about("Print device properties"))
        .subcommand(SubCommand::with_name("smoke").about("memset, copies and an empty launch, end to end"))
        .subcommand(SubCommand::with_name("barrier").about("Stress the multi-cluster block barrier"))
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();

    let outcome = load_config(&matches).and_then(|config| {
        let iterations: u32 = matches.value_of("iterations").unwrap_or("16").parse()?;
        match matches.subcommand_name() {
            Some("smoke") => smoke(config, iterations),
            Some("barrier") => barrier(config, iterations),
            _ => info(config),
        }
    });
    if let Err(e) = outcome {
        log::error!("{}", e);
        eprintln!("etrt_tool: {}", e);
        process::exit(1);
    }
}
