//! Byte-exact shared layout of a ring buffer segment.
//!
//! The segment starts with a 4096-byte header (attribute block, stable after
//! creation, followed by the cacheline-isolated state block), then
//! `capacity * entry_size` slot bytes. All processes on the host see the same
//! layout; the recorded cacheline size lets attachers reject a mismatched
//! build.

use std::sync::atomic::{AtomicBool, AtomicU32};

use crossbeam::utils::CachePadded;

use crate::error::{Result, RingError};

pub const HEADER_SIZE: usize = 4096;
pub const MAX_ENTRY_SIZE: u32 = 64 * 1024;
pub const DESCRIPTION_SIZE: usize = 256;

/// Cacheline size of the build host, as carried by `CachePadded`.
pub const CACHELINE_SIZE: u32 = std::mem::align_of::<CachePadded<u8>>() as u32;

/// Attribute block. Stable after creation; `key` and `id` are filled in by
/// `create_ring_buffer` with the values the kernel actually assigned.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RingBufferAttribute {
    pub key: libc::key_t,
    pub id: i32,
    pub page_size: u32,
    pub capacity: u32,
    pub entry_size: u32,
    pub multiple_producer: bool,
    pub multiple_consumer: bool,
    pub cacheline_size: u32,
    pub description: [u8; DESCRIPTION_SIZE],
}

impl RingBufferAttribute {
    pub fn new(
        key: libc::key_t,
        page_size: u32,
        capacity: u32,
        entry_size: u32,
        multiple_producer: bool,
        multiple_consumer: bool,
        description: &str,
    ) -> Result<RingBufferAttribute> {
        if description.len() >= DESCRIPTION_SIZE {
            return Err(RingError::InvalidArgument(format!(
                "description is {} bytes, at most {} allowed",
                description.len(),
                DESCRIPTION_SIZE - 1
            )));
        }
        let mut desc = [0u8; DESCRIPTION_SIZE];
        desc[..description.len()].copy_from_slice(description.as_bytes());
        Ok(RingBufferAttribute {
            key,
            id: 0,
            page_size,
            capacity,
            entry_size,
            multiple_producer,
            multiple_consumer,
            cacheline_size: CACHELINE_SIZE,
            description: desc,
        })
    }

    /// The description up to the first NUL, lossy on non-UTF-8 garbage.
    pub fn description(&self) -> String {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTION_SIZE);
        String::from_utf8_lossy(&self.description[..end]).into_owned()
    }
}

impl std::fmt::Debug for RingBufferAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferAttribute")
            .field("key", &format_args!("{:#x}", self.key))
            .field("id", &self.id)
            .field("page_size", &self.page_size)
            .field("capacity", &self.capacity)
            .field("entry_size", &self.entry_size)
            .field("multiple_producer", &self.multiple_producer)
            .field("multiple_consumer", &self.multiple_consumer)
            .field("cacheline_size", &self.cacheline_size)
            .field("description", &self.description())
            .finish()
    }
}

/// State block. Each field sits in its own cacheline so producers and
/// consumers never false-share.
#[repr(C)]
pub(crate) struct RingBufferState {
    pub(crate) head: CachePadded<AtomicU32>,
    pub(crate) tail: CachePadded<AtomicU32>,
    pub(crate) producer_lock: CachePadded<AtomicBool>,
    pub(crate) consumer_lock: CachePadded<AtomicBool>,
}

impl RingBufferState {
    pub(crate) fn new() -> RingBufferState {
        RingBufferState {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            producer_lock: CachePadded::new(AtomicBool::new(false)),
            consumer_lock: CachePadded::new(AtomicBool::new(false)),
        }
    }
}

#[repr(C, align(4096))]
pub(crate) struct RingBufferHeader {
    pub(crate) attribute: RingBufferAttribute,
    pub(crate) state: RingBufferState,
}

const _: () = assert!(std::mem::size_of::<RingBufferHeader>() == HEADER_SIZE);
