use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use shmseg::{PageSize, Segment};

use crate::error::{Result, RingError};
use crate::layout::{
    RingBufferAttribute, RingBufferHeader, RingBufferState, CACHELINE_SIZE, HEADER_SIZE,
    MAX_ENTRY_SIZE,
};
use crate::ring_trace;

/// A ring buffer attached into this process.
///
/// The instance views a shared segment created by [`create_ring_buffer`];
/// dropping it detaches the segment but never deletes it.
pub struct RingBuffer {
    header: NonNull<RingBufferHeader>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    #[inline(always)]
    fn header(&self) -> &RingBufferHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn state(&self) -> &RingBufferState {
        &self.header().state
    }

    /// Pointer to slot `idx` (already reduced modulo capacity).
    ///
    /// # Safety
    /// `idx < capacity`; the caller must hold the single-writer invariant
    /// for the side it writes on.
    #[inline(always)]
    unsafe fn slot_ptr(&self, idx: u32) -> *mut u8 {
        let entry_size = self.header().attribute.entry_size as usize;
        (self.header.as_ptr() as *mut u8).add(HEADER_SIZE + idx as usize * entry_size)
    }

    pub fn attribute(&self) -> RingBufferAttribute {
        self.header().attribute
    }

    /// Copy `buf` into the next free slot, spinning until there is room or
    /// the deadline passes.
    ///
    /// `timeout` of zero means a single attempt; a duration too large to add
    /// to the current instant means no deadline at all.
    pub fn produce(&self, buf: &[u8], timeout: Duration) -> Result<()> {
        let attr = &self.header().attribute;
        if buf.is_empty() || buf.len() > attr.entry_size as usize {
            return Err(RingError::InvalidArgument(format!(
                "payload of {} bytes, entry size is {}",
                buf.len(),
                attr.entry_size
            )));
        }

        let state = self.state();
        let _gate = attr
            .multiple_producer
            .then(|| SpinGate::acquire(&state.producer_lock));

        let capacity = attr.capacity;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let head = state.head.load(Ordering::Acquire);
            let tail = state.tail.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) % capacity == capacity - 1 {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    ring_trace!(head, tail, "produce deadline missed");
                    return Err(RingError::Timeout);
                }
                std::hint::spin_loop();
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.slot_ptr(tail % capacity), buf.len());
            }
            // payload must be visible before the new tail
            state.tail.store(tail.wrapping_add(1), Ordering::Release);
            ring_trace!(tail, len = buf.len(), "produced");
            return Ok(());
        }
    }

    /// Copy the next entry's leading `buf.len()` bytes out of the ring,
    /// spinning until an entry arrives or the deadline passes.
    pub fn consume(&self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let attr = &self.header().attribute;
        if buf.is_empty() || buf.len() > attr.entry_size as usize {
            return Err(RingError::InvalidArgument(format!(
                "receive buffer of {} bytes, entry size is {}",
                buf.len(),
                attr.entry_size
            )));
        }

        let state = self.state();
        let _gate = attr
            .multiple_consumer
            .then(|| SpinGate::acquire(&state.consumer_lock));

        let capacity = attr.capacity;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let tail = state.tail.load(Ordering::Acquire);
            let head = state.head.load(Ordering::Relaxed);
            if tail == head {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    ring_trace!(head, tail, "consume deadline missed");
                    return Err(RingError::Timeout);
                }
                std::hint::spin_loop();
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(self.slot_ptr(head % capacity), buf.as_mut_ptr(), buf.len());
            }
            // copy-out must complete before the slot is handed back
            state.head.store(head.wrapping_add(1), Ordering::Release);
            ring_trace!(head, len = buf.len(), "consumed");
            return Ok(());
        }
    }

    /// Best-effort number of entries in the ring. Not serialized with
    /// producers or consumers.
    pub fn size(&self) -> u32 {
        let state = self.state();
        let tail = state.tail.load(Ordering::Relaxed);
        let head = state.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) % self.header().attribute.capacity
    }

    /// Best-effort emptiness test. Not serialized with producers or consumers.
    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.tail.load(Ordering::Relaxed) == state.head.load(Ordering::Relaxed)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Err(errno) = Segment::detach(self.header.cast::<c_void>()) {
            tracing::warn!(errno = %errno, "failed to detach ring buffer segment");
        }
    }
}

/// Boolean spin gate serializing same-side participants of an MP/MC ring.
/// Held for the whole produce/consume call, released on every exit path.
struct SpinGate<'a> {
    lock: &'a AtomicBool,
}

impl<'a> SpinGate<'a> {
    fn acquire(lock: &'a AtomicBool) -> SpinGate<'a> {
        loop {
            if lock.load(Ordering::Relaxed) {
                std::hint::spin_loop();
                continue;
            }
            if lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGate { lock };
            }
        }
    }
}

impl Drop for SpinGate<'_> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::Release);
    }
}

pub(crate) fn create(attr: &RingBufferAttribute) -> Result<libc::key_t> {
    if attr.entry_size == 0 || !attr.entry_size.is_power_of_two() || attr.entry_size > MAX_ENTRY_SIZE {
        return Err(RingError::InvalidArgument(format!(
            "entry_size {} must be a power of two in [1, {}]",
            attr.entry_size, MAX_ENTRY_SIZE
        )));
    }
    if attr.capacity == 0 || !attr.capacity.is_power_of_two() {
        return Err(RingError::InvalidArgument(format!(
            "capacity {} must be a non-zero power of two",
            attr.capacity
        )));
    }
    let page = PageSize::from_bytes(attr.page_size).ok_or_else(|| {
        RingError::InvalidArgument(format!("page_size {} is not 4K, 2M or 1G", attr.page_size))
    })?;

    let total = HEADER_SIZE + attr.capacity as usize * attr.entry_size as usize;

    let (segment, key) = if attr.key != 0 {
        (create_segment(attr.key, total, page)?, attr.key)
    } else {
        // caller left key assignment to us: pick pseudo-random keys until
        // one is free
        loop {
            let key = random_key();
            match Segment::create(key, total, page) {
                Ok(seg) => break (seg, key),
                Err(Errno::EEXIST) => continue,
                Err(errno) => return Err(map_shmget_error(errno)),
            }
        }
    };

    if let Err(errno) = segment.pin() {
        let _ = segment.remove();
        return Err(RingError::OutOfSpace(format!(
            "cannot pin {} bytes of ring memory: {}",
            total, errno
        )));
    }

    let ptr = match segment.attach(None) {
        Ok(p) => p,
        Err(errno) => {
            let _ = segment.remove();
            return Err(RingError::system("shmat", errno));
        }
    };

    let mut attribute = *attr;
    attribute.key = key;
    attribute.id = segment.id();
    attribute.cacheline_size = CACHELINE_SIZE;
    unsafe {
        ptr.cast::<RingBufferHeader>().as_ptr().write(RingBufferHeader {
            attribute,
            state: RingBufferState::new(),
        });
    }

    if let Err(errno) = Segment::detach(ptr) {
        return Err(RingError::system("shmdt", errno));
    }

    tracing::debug!(key = format_args!("{key:#x}"), capacity = attr.capacity, "ring buffer created");
    Ok(key)
}

pub(crate) fn get(key: libc::key_t) -> Result<RingBuffer> {
    let segment = Segment::lookup(key).map_err(|e| RingError::system("shmget", e))?;
    let ptr = segment.attach(None).map_err(|e| RingError::system("shmat", e))?;
    let header = ptr.cast::<RingBufferHeader>();

    let attr = unsafe { &header.as_ref().attribute };
    if attr.cacheline_size != CACHELINE_SIZE {
        let _ = Segment::detach(ptr);
        return Err(RingError::InvalidArgument(format!(
            "ring was created with cacheline size {}, this build uses {}",
            attr.cacheline_size, CACHELINE_SIZE
        )));
    }
    if attr.capacity == 0 || !attr.capacity.is_power_of_two() || attr.entry_size == 0 {
        let _ = Segment::detach(ptr);
        return Err(RingError::InvalidArgument(format!(
            "segment {key:#x} does not carry a ring buffer header"
        )));
    }

    Ok(RingBuffer { header })
}

pub(crate) fn delete(key: libc::key_t) -> Result<()> {
    let segment = Segment::lookup(key).map_err(|e| RingError::system("shmget", e))?;
    segment.remove().map_err(|e| RingError::system("shmctl", e))?;
    tracing::debug!(key = format_args!("{key:#x}"), "ring buffer deleted");
    Ok(())
}

fn create_segment(key: libc::key_t, total: usize, page: PageSize) -> Result<Segment> {
    match Segment::create(key, total, page) {
        Ok(seg) => Ok(seg),
        Err(Errno::EEXIST) => Err(RingError::InvalidArgument(format!(
            "a segment with key {key:#x} already exists"
        ))),
        Err(errno) => Err(map_shmget_error(errno)),
    }
}

fn map_shmget_error(errno: Errno) -> RingError {
    match errno {
        Errno::ENOMEM | Errno::ENOSPC => {
            RingError::OutOfSpace(format!("cannot allocate ring memory: {errno}"))
        }
        _ => RingError::system("shmget", errno),
    }
}

fn random_key() -> libc::key_t {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    let mix = (ts.tv_nsec as u64)
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(std::process::id() as u64);
    let key = (mix >> 16) as i32 & 0x7fff_ffff;
    if key == 0 {
        1
    } else {
        key
    }
}
