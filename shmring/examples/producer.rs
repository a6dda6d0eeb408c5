use std::time::Duration;

use shmring::get_ring_buffer;
use tracing::info;

/// Feed an existing ring with 8-byte counters.
///
/// Create the ring first (for example with `ipc_cli --ipc ringbuffer
/// --cmd create`), then run `producer <key>` and `consumer <key>` in two
/// shells.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let key: libc::key_t = std::env::args()
        .nth(1)
        .ok_or("usage: producer <key>")?
        .parse()?;

    let ring = get_ring_buffer(key)?;
    let entry_size = ring.attribute().entry_size as usize;
    let mut payload = vec![0u8; entry_size.min(64)];

    info!(key = format_args!("{key:#x}"), entry_size, "producer attached");

    for counter in 0u64.. {
        payload[..8].copy_from_slice(&counter.to_le_bytes());
        ring.produce(&payload, Duration::from_secs(60))?;
        if counter % 100_000 == 0 {
            info!(counter, "produced");
        }
    }
    Ok(())
}
