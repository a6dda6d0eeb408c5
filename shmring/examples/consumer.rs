use std::time::Duration;

use shmring::{get_ring_buffer, RingError};
use tracing::{info, warn};

/// Drain an existing ring and check the 8-byte counters are contiguous.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let key: libc::key_t = std::env::args()
        .nth(1)
        .ok_or("usage: consumer <key>")?
        .parse()?;

    let ring = get_ring_buffer(key)?;
    let entry_size = ring.attribute().entry_size as usize;
    let mut buf = vec![0u8; entry_size.min(64)];

    info!(key = format_args!("{key:#x}"), entry_size, "consumer attached");

    let mut expected = 0u64;
    loop {
        match ring.consume(&mut buf, Duration::from_secs(1)) {
            Ok(()) => {
                let counter = u64::from_le_bytes(buf[..8].try_into().unwrap());
                if counter != expected {
                    warn!(counter, expected, "sequence gap");
                }
                expected = counter + 1;
                if counter % 100_000 == 0 {
                    info!(counter, "consumed");
                }
            }
            Err(RingError::Timeout) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
