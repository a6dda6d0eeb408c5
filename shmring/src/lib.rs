//! Lockless single-host ring buffer over System V shared memory.
//!
//! A ring lives in one pinned segment: a 4096-byte header (attributes plus
//! cacheline-isolated cursors and spin gates) followed by
//! `capacity * entry_size` slot bytes. Producers and consumers in any process
//! on the host poll with bounded-latency timeouts; no operation parks on a
//! kernel wait queue. Single-producer single-consumer rings are fully
//! lockless; the multi-producer and multi-consumer variants serialize each
//! side with a boolean spin gate.
//!
//! ```no_run
//! use std::time::Duration;
//! use shmring::{create_ring_buffer, get_ring_buffer, RingBufferAttribute};
//!
//! let attr = RingBufferAttribute::new(0, 4096, 4096, 64, false, false, "demo")?;
//! let key = create_ring_buffer(&attr)?;
//!
//! let ring = get_ring_buffer(key)?;
//! ring.produce(b"hello", Duration::from_millis(1))?;
//! # Ok::<(), shmring::RingError>(())
//! ```

pub mod error;
pub mod layout;
mod ring;
mod trace_macro;

pub use error::{Result, RingError};
pub use layout::{RingBufferAttribute, CACHELINE_SIZE, HEADER_SIZE, MAX_ENTRY_SIZE};
pub use ring::RingBuffer;

/// Create a new ring buffer segment and return its key.
///
/// With `attr.key == 0` a free key is chosen and returned. The segment is
/// pinned against swap-out; huge-page sizes need host support.
pub fn create_ring_buffer(attr: &RingBufferAttribute) -> Result<libc::key_t> {
    ring::create(attr)
}

/// Attach an existing ring buffer by key.
pub fn get_ring_buffer(key: libc::key_t) -> Result<RingBuffer> {
    ring::get(key)
}

/// Destroy a ring buffer segment immediately.
///
/// Active attachers are not detected; the application is responsible for
/// quiescing them first.
pub fn delete_ring_buffer(key: libc::key_t) -> Result<()> {
    ring::delete(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    /// Deletes the segment even when an assertion unwinds.
    struct KeyGuard(libc::key_t);

    impl Drop for KeyGuard {
        fn drop(&mut self) {
            let _ = delete_ring_buffer(self.0);
        }
    }

    fn make_ring(capacity: u32, entry_size: u32, mp: bool, mc: bool) -> (KeyGuard, RingBuffer) {
        let attr = RingBufferAttribute::new(0, 4096, capacity, entry_size, mp, mc, "test ring")
            .expect("attribute");
        let key = create_ring_buffer(&attr).expect("create");
        let ring = get_ring_buffer(key).expect("get");
        (KeyGuard(key), ring)
    }

    #[test]
    fn test_create_and_show_attribute() {
        let (guard, ring) = make_ring(16, 64, true, false);
        let attr = ring.attribute();
        assert_eq!(attr.key, guard.0);
        assert_eq!(attr.capacity, 16);
        assert_eq!(attr.entry_size, 64);
        assert!(attr.multiple_producer);
        assert!(!attr.multiple_consumer);
        assert_eq!(attr.cacheline_size, CACHELINE_SIZE);
        assert_eq!(attr.description(), "test ring");
        assert!(ring.is_empty());
        assert_eq!(ring.size(), 0);
    }

    #[rstest]
    #[case::capacity_not_pow2(4096, 15, 64)]
    #[case::capacity_zero(4096, 0, 64)]
    #[case::entry_not_pow2(4096, 16, 65)]
    #[case::entry_too_big(4096, 16, 128 * 1024)]
    #[case::bad_page_size(8192, 16, 64)]
    fn test_create_rejects_bad_attributes(
        #[case] page_size: u32,
        #[case] capacity: u32,
        #[case] entry_size: u32,
    ) {
        let attr =
            RingBufferAttribute::new(0, page_size, capacity, entry_size, false, false, "").unwrap();
        assert!(matches!(create_ring_buffer(&attr), Err(RingError::InvalidArgument(_))));
    }

    #[test]
    fn test_invalid_payload_sizes() {
        let (_guard, ring) = make_ring(16, 64, false, false);
        assert!(matches!(
            ring.produce(&[], Duration::from_nanos(1)),
            Err(RingError::InvalidArgument(_))
        ));
        assert!(matches!(
            ring.produce(&[0u8; 65], Duration::from_nanos(1)),
            Err(RingError::InvalidArgument(_))
        ));
        let mut small = [0u8; 0];
        assert!(matches!(
            ring.consume(&mut small, Duration::from_nanos(1)),
            Err(RingError::InvalidArgument(_))
        ));
        let mut big = [0u8; 65];
        assert!(matches!(
            ring.consume(&mut big, Duration::from_nanos(1)),
            Err(RingError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_capacity_law_one_sentinel_slot() {
        let (_guard, ring) = make_ring(4, 8, false, false);
        for i in 0u64..3 {
            ring.produce(&i.to_le_bytes(), Duration::from_nanos(1))
                .expect("ring not yet full");
        }
        assert_eq!(ring.size(), 3);
        assert!(matches!(
            ring.produce(&3u64.to_le_bytes(), Duration::from_nanos(1)),
            Err(RingError::Timeout)
        ));
    }

    #[test]
    fn test_consume_empty_times_out() {
        let (_guard, ring) = make_ring(4, 8, false, false);
        let mut buf = [0u8; 8];
        assert!(matches!(
            ring.consume(&mut buf, Duration::from_nanos(1)),
            Err(RingError::Timeout)
        ));
    }

    #[test]
    fn test_spsc_fifo_10k() {
        let (_guard, ring) = make_ring(4096, 64, false, false);
        let ring = Arc::new(ring);
        let producer_ring = ring.clone();

        let producer = std::thread::spawn(move || {
            for i in 0u64..10_000 {
                producer_ring
                    .produce(&i.to_le_bytes(), Duration::from_secs(5))
                    .expect("produce");
            }
        });

        let mut buf = [0u8; 8];
        for expected in 0u64..10_000 {
            ring.consume(&mut buf, Duration::from_secs(5)).expect("consume");
            assert_eq!(u64::from_le_bytes(buf), expected);
        }

        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_mpsc_no_loss_no_duplication() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 1000;

        let (_guard, ring) = make_ring(256, 16, true, false);
        let ring = Arc::new(ring);

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    ring.produce(&value.to_le_bytes(), Duration::from_secs(5))
                        .expect("produce");
                }
            }));
        }

        let mut seen = vec![false; (PRODUCERS * PER_PRODUCER) as usize];
        let mut buf = [0u8; 8];
        for _ in 0..PRODUCERS * PER_PRODUCER {
            ring.consume(&mut buf, Duration::from_secs(5)).expect("consume");
            let value = u64::from_le_bytes(buf) as usize;
            assert!(!seen[value], "value {value} consumed twice");
            seen[value] = true;
        }
        assert!(seen.iter().all(|&s| s));

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_mpmc_every_entry_consumed_once() {
        use std::sync::atomic::{AtomicU64, Ordering};

        const TOTAL: u64 = 2000;

        let (_guard, ring) = make_ring(128, 16, true, true);
        let ring = Arc::new(ring);
        let consumed = Arc::new(AtomicU64::new(0));

        let mut producers = Vec::new();
        for p in 0..2u64 {
            let ring = ring.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..TOTAL / 2 {
                    let value = p * (TOTAL / 2) + i;
                    ring.produce(&value.to_le_bytes(), Duration::from_secs(5))
                        .expect("produce");
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..2 {
            let ring = ring.clone();
            let consumed = consumed.clone();
            consumers.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                let mut buf = [0u8; 8];
                while consumed.load(Ordering::Relaxed) < TOTAL {
                    match ring.consume(&mut buf, Duration::from_millis(50)) {
                        Ok(()) => {
                            got.push(u64::from_le_bytes(buf));
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(RingError::Timeout) => continue,
                        Err(e) => panic!("consume failed: {e}"),
                    }
                }
                got
            }));
        }

        for producer in producers {
            producer.join().unwrap();
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..TOTAL).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_delete_then_get_fails() {
        let attr = RingBufferAttribute::new(0, 4096, 16, 64, false, false, "").unwrap();
        let key = create_ring_buffer(&attr).unwrap();
        delete_ring_buffer(key).unwrap();
        assert!(matches!(get_ring_buffer(key), Err(RingError::System { .. })));
    }

    #[test]
    fn test_restart_sees_live_entries() {
        let (_guard, ring) = make_ring(16, 8, false, false);
        ring.produce(&7u64.to_le_bytes(), Duration::from_nanos(1)).unwrap();
        let key = ring.attribute().key;
        drop(ring);

        let again = get_ring_buffer(key).expect("reattach");
        assert_eq!(again.size(), 1);
        let mut buf = [0u8; 8];
        again.consume(&mut buf, Duration::from_nanos(1)).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);
    }
}
