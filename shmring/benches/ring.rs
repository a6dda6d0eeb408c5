use std::hint::black_box;
use std::time::Duration;

use shmring::{create_ring_buffer, delete_ring_buffer, get_ring_buffer, RingBuffer, RingBufferAttribute};

fn main() {
    divan::main();
}

struct BenchRing {
    key: libc::key_t,
    ring: RingBuffer,
}

impl Drop for BenchRing {
    fn drop(&mut self) {
        let _ = delete_ring_buffer(self.key);
    }
}

fn setup_ring(capacity: u32, entry_size: u32) -> BenchRing {
    let attr =
        RingBufferAttribute::new(0, 4096, capacity, entry_size, false, false, "bench").unwrap();
    let key = create_ring_buffer(&attr).unwrap();
    let ring = get_ring_buffer(key).unwrap();
    BenchRing { key, ring }
}

#[divan::bench(args = [8, 64, 1024])]
fn bench_spsc_roundtrip(bencher: divan::Bencher, entry_size: u32) {
    let payload = vec![0xabu8; entry_size as usize];
    let mut out = vec![0u8; entry_size as usize];
    bencher
        .with_inputs(|| setup_ring(4096, entry_size))
        .bench_refs(|bench| {
            for _ in 0..4096 {
                bench
                    .ring
                    .produce(&payload, Duration::from_secs(1))
                    .unwrap();
                bench
                    .ring
                    .consume(&mut out, Duration::from_secs(1))
                    .unwrap();
            }
            black_box(&out);
        });
}

#[divan::bench(args = [64, 1024])]
fn bench_produce_until_full(bencher: divan::Bencher, entry_size: u32) {
    let payload = vec![0x5au8; entry_size as usize];
    bencher
        .with_inputs(|| setup_ring(4096, entry_size))
        .bench_refs(|bench| {
            for _ in 0..4095 {
                bench
                    .ring
                    .produce(&payload, Duration::from_secs(1))
                    .unwrap();
            }
        });
}
