use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, eyre, Context, Result};
use shmpool::ShmPool;
use shmring::{create_ring_buffer, delete_ring_buffer, get_ring_buffer, RingBufferAttribute, RingError};

/// Which subsystem a command addresses. Resolved from `--ipc` or from the
/// name the binary was invoked under (`rb_cli`, `shmp_cli`).
#[derive(Clone, Copy, PartialEq, Eq)]
enum IpcKind {
    RingBuffer,
    ShmPool,
}

impl IpcKind {
    fn from_name(name: &str) -> Option<IpcKind> {
        match name {
            "ringbuffer" | "rb_cli" => Some(IpcKind::RingBuffer),
            "shmpool" | "shmp_cli" => Some(IpcKind::ShmPool),
            _ => None,
        }
    }
}

#[derive(Parser)]
#[command(name = "ipc_cli")]
#[command(about = "control tool for shared-memory rings and pools")]
struct Args {
    #[arg(short, long, help = "ipc kind to control (ringbuffer|shmpool)")]
    ipc: Option<String>,

    #[arg(short, long, help = "command to execute (use `more` to list commands)")]
    cmd: Option<String>,

    #[arg(
        short,
        long = "property",
        value_name = "K=V",
        help = "command property; may be repeated"
    )]
    property: Vec<String>,
}

type Properties = HashMap<String, String>;

fn parse_properties(raw: &[String]) -> Result<Properties> {
    let mut props = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| eyre!("invalid property {entry:?}, expected k=v"))?;
        props.insert(key.to_owned(), value.to_owned());
    }
    Ok(props)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let props = parse_properties(&args.property)?;

    let alias = std::env::args()
        .next()
        .map(|argv0| {
            argv0
                .rsplit('/')
                .next()
                .unwrap_or(argv0.as_str())
                .to_owned()
        })
        .unwrap_or_default();

    let kind = IpcKind::from_name(&alias)
        .or_else(|| args.ipc.as_deref().and_then(IpcKind::from_name))
        .ok_or_else(|| eyre!("specify the ipc kind with --ipc ringbuffer|shmpool"))?;

    let cmd = args
        .cmd
        .as_deref()
        .ok_or_else(|| eyre!("specify a command with --cmd (try --cmd more)"))?;

    match kind {
        IpcKind::RingBuffer => ring_command(cmd, &props),
        IpcKind::ShmPool => pool_command(cmd, &props),
    }
}

fn prop_parse<T: std::str::FromStr>(props: &Properties, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    props
        .get(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid {key} property {raw:?}"))
        })
        .transpose()
}

fn ring_command(cmd: &str, props: &Properties) -> Result<()> {
    match cmd {
        "more" => {
            println!(
                "ring buffer commands\n\
                 --cmd more    this text\n\
                 --cmd create  -p key=<key> page_size=4K|2M|1G capacity=<pow2> entry_size=<pow2>\n\
                 \u{20}             -p multiple_producers=0|1 multiple_consumers=0|1 description=<text>\n\
                 --cmd show    -p key=<key>\n\
                 --cmd delete  -p key=<key>\n\
                 --cmd perf    -p key=<key> role=producer|consumer [size=<bytes>] [wcount=<n>] [rcount=<n>]"
            );
            Ok(())
        }
        "create" => ring_create(props),
        "show" => ring_show(props),
        "delete" => {
            let key = required_key(props)?;
            delete_ring_buffer(key)?;
            println!("ring buffer {key:#x} deleted");
            Ok(())
        }
        "perf" => ring_perf(props),
        other => bail!("unknown ring buffer command {other:?}, try --cmd more"),
    }
}

fn parse_key(raw: &str) -> Result<libc::key_t> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.with_context(|| format!("invalid key property {raw:?}"))
}

fn required_key(props: &Properties) -> Result<libc::key_t> {
    props
        .get("key")
        .map(|raw| parse_key(raw))
        .transpose()?
        .ok_or_else(|| eyre!("mandatory key property missing, pass -p key=<key>"))
}

/// Shared-host monotonic clock, comparable across the producer and consumer
/// processes of one perf run.
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn ring_create(props: &Properties) -> Result<()> {
    let page_size = match props.get("page_size").map(String::as_str) {
        None | Some("4K") => 0x1000,
        Some("2M") => 0x20_0000,
        Some("1G") => 0x4000_0000,
        Some(other) => bail!("unknown page_size {other:?}, expected 4K, 2M or 1G"),
    };
    let attr = RingBufferAttribute::new(
        props.get("key").map(|raw| parse_key(raw)).transpose()?.unwrap_or(0),
        page_size,
        prop_parse(props, "capacity")?.unwrap_or(4096),
        prop_parse(props, "entry_size")?.unwrap_or(64),
        prop_parse::<u8>(props, "multiple_producers")?.unwrap_or(0) != 0,
        prop_parse::<u8>(props, "multiple_consumers")?.unwrap_or(0) != 0,
        props.get("description").map(String::as_str).unwrap_or(""),
    )?;

    let key = create_ring_buffer(&attr)?;
    println!("ring buffer created with key = {key:#x}");
    Ok(())
}

fn ring_show(props: &Properties) -> Result<()> {
    let ring = get_ring_buffer(required_key(props)?)?;
    let attr = ring.attribute();
    println!("key:               {:#x}", attr.key);
    println!("id:                {}", attr.id);
    println!("page_size:         {} KiB", attr.page_size / 1024);
    println!("capacity:          {}", attr.capacity);
    println!("entry_size:        {} bytes", attr.entry_size);
    println!("multiple_producer: {}", attr.multiple_producer);
    println!("multiple_consumer: {}", attr.multiple_consumer);
    println!("cacheline_size:    {}", attr.cacheline_size);
    println!("description:       {}", attr.description());
    println!("current size:      {}", ring.size());
    Ok(())
}

fn ring_perf(props: &Properties) -> Result<()> {
    let ring = get_ring_buffer(required_key(props)?)?;
    let attr = ring.attribute();

    let role = props
        .get("role")
        .ok_or_else(|| eyre!("mandatory role property missing, pass -p role=producer|consumer"))?;
    let size = prop_parse::<usize>(props, "size")?.unwrap_or(attr.entry_size as usize);
    if size < 8 || size > attr.entry_size as usize {
        bail!("message size {size} must be in [8, {}]", attr.entry_size);
    }
    let wcount = prop_parse::<usize>(props, "wcount")?.unwrap_or(1000);
    let rcount = prop_parse::<usize>(props, "rcount")?.unwrap_or(10_000);

    match role.as_str() {
        "producer" => {
            let mut message = vec![0u8; size];
            for _ in 0..wcount {
                // zeroed send timestamp disables measurement on the consumer
                ring.produce(&message, Duration::from_secs(60))?;
            }
            for _ in 0..rcount {
                message[..8].copy_from_slice(&monotonic_ns().to_le_bytes());
                ring.produce(&message, Duration::from_secs(60))?;
            }
            println!("sent {} warmup and {} timed messages", wcount, rcount);
            Ok(())
        }
        "consumer" => {
            let stop = Arc::new(AtomicBool::new(false));
            let ring = Arc::new(ring);
            let worker = {
                let stop = stop.clone();
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut buf = vec![0u8; size];
                    let mut latencies_ns = Vec::with_capacity(rcount);
                    while !stop.load(Ordering::Relaxed) {
                        match ring.consume(&mut buf, Duration::from_secs(1)) {
                            Ok(()) => {
                                let sent_ns =
                                    u64::from_le_bytes(buf[..8].try_into().expect("8-byte stamp"));
                                if sent_ns != 0 {
                                    latencies_ns.push(monotonic_ns().saturating_sub(sent_ns));
                                }
                            }
                            Err(RingError::Timeout) => continue,
                            Err(e) => {
                                tracing::error!(error = %e, "consume failed");
                                break;
                            }
                        }
                    }
                    latencies_ns
                })
            };

            eprintln!("press ENTER to finish");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            stop.store(true, Ordering::Relaxed);

            let latencies_ns = worker.join().expect("consumer thread");
            for latency in &latencies_ns {
                println!("{latency}");
            }
            eprintln!("{} timed messages received", latencies_ns.len());
            Ok(())
        }
        other => bail!("unknown role {other:?}, expected producer or consumer"),
    }
}

fn pool_command(cmd: &str, props: &Properties) -> Result<()> {
    match cmd {
        "more" => {
            println!(
                "shared memory pool commands\n\
                 --cmd more          this text\n\
                 --cmd create_group  -p group=<name>\n\
                 --cmd remove_group  -p group=<name>\n\
                 --cmd activate      -p group=<name> [psize=<bytes>] [dsize=<bytes>]"
            );
            Ok(())
        }
        "create_group" => {
            let name = required_group(props)?;
            ShmPool::create_group(name)?;
            println!("shared memory pool group {name:?} created");
            Ok(())
        }
        "remove_group" => {
            let name = required_group(props)?;
            ShmPool::remove_group(name)?;
            println!("shared memory pool group {name:?} removed");
            Ok(())
        }
        "activate" => pool_activate(props),
        other => bail!("unknown pool command {other:?}, try --cmd more"),
    }
}

fn required_group(props: &Properties) -> Result<&str> {
    props
        .get("group")
        .map(String::as_str)
        .ok_or_else(|| eyre!("mandatory group property missing, pass -p group=<name>"))
}

/// Bring a pool up, exercise an allocation, and hold everything mapped until
/// the operator hits ENTER so other processes can attach and poke at it.
fn pool_activate(props: &Properties) -> Result<()> {
    let name = required_group(props)?;
    let pool_size = prop_parse::<u64>(props, "psize")?.unwrap_or(shmpool::MIN_POOL_SIZE);
    let data_size = prop_parse::<usize>(props, "dsize")?.unwrap_or(0x10_0000);

    ShmPool::initialize(name)?;
    let pool = ShmPool::create(pool_size)?;
    println!("pool allocated:");
    println!("capacity: {:#x}", pool.get_capacity());
    println!("offset:   {:#x}", pool.get_offset());
    println!("vaddr:    {:#x}", pool.get_vaddr());

    let ptr = pool.malloc(data_size);
    if ptr.is_null() {
        bail!("pool malloc of {data_size} bytes failed");
    }
    unsafe {
        std::ptr::write_bytes(ptr, 0xA5, data_size);
        assert_eq!(ptr.read(), 0xA5);
        assert_eq!(ptr.add(data_size - 1).read(), 0xA5);
    }
    println!("data:     {:#x} ({data_size} bytes, pattern 0xA5)", ptr as u64);

    eprintln!("press ENTER to release the pool");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    pool.free(ptr)?;
    drop(pool);
    println!("pool released");
    ShmPool::uninitialize()?;
    Ok(())
}
