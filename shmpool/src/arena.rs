//! Pool arena: a general-purpose heap over hook-provided extents.
//!
//! The arena owns a [`linked_list_allocator::Heap`] whose region grows
//! contiguously upward inside `[base, base + capacity)`. Whenever the heap
//! cannot satisfy a request, the arena asks its hook table for another
//! extent at the fixed address right after the mapped prefix and extends the
//! heap over it, so the heap region is always one contiguous run of backed
//! chunks.
//!
//! Every allocation is prefixed with a 16-byte header recording the request
//! size; `free(ptr)` reads it back to reconstruct the layout the way a
//! C-style allocator does.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use linked_list_allocator::Heap;

use crate::error::{PoolError, Result};
use crate::extent::ExtentHooks;
use crate::CHUNK_SIZE;

const ALLOC_HEADER: usize = 16;

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) struct Arena<H: ExtentHooks> {
    heap: Heap,
    hooks: H,
    base: u64,
    capacity: u64,
    mapped: u64,
    id: u32,
}

// the heap's internal pointers reference pool memory, not process-private
// state; the arena is used behind the pool's mutex
unsafe impl<H: ExtentHooks> Send for Arena<H> {}

impl<H: ExtentHooks> Arena<H> {
    pub(crate) fn new(base: u64, capacity: u64, hooks: H) -> Arena<H> {
        Arena {
            heap: Heap::empty(),
            hooks,
            base,
            capacity,
            mapped: 0,
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Allocate `size` bytes out of the pool. Null on failure, like the
    /// C-style allocator this fronts.
    pub(crate) fn malloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return std::ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(size + ALLOC_HEADER, ALLOC_HEADER) else {
            return std::ptr::null_mut();
        };

        loop {
            if let Ok(block) = self.heap.allocate_first_fit(layout) {
                unsafe {
                    (block.as_ptr() as *mut u64).write(size as u64);
                    return block.as_ptr().add(ALLOC_HEADER);
                }
            }
            if self.grow(layout.size() as u64).is_err() {
                return std::ptr::null_mut();
            }
        }
    }

    /// Map at least `need` more bytes and extend the heap over them.
    fn grow(&mut self, need: u64) -> Result<()> {
        let want = need.div_ceil(CHUNK_SIZE) * CHUNK_SIZE;
        if self.mapped + want > self.capacity {
            return Err(PoolError::OutOfSpace(format!(
                "pool of {:#x} bytes cannot grow by {want:#x} past {:#x} mapped",
                self.capacity, self.mapped
            )));
        }

        let addr = self.hooks.alloc(Some(self.base + self.mapped), want, CHUNK_SIZE)?;
        debug_assert_eq!(addr, self.base + self.mapped);

        unsafe {
            if self.mapped == 0 {
                self.heap.init(addr as *mut u8, want as usize);
            } else {
                self.heap.extend(want as usize);
            }
        }
        self.mapped += want;
        Ok(())
    }

    /// Release a block returned by [`malloc`](Self::malloc).
    pub(crate) fn free(&mut self, ptr: *mut u8) -> Result<()> {
        let addr = ptr as u64;
        if addr < self.base + ALLOC_HEADER as u64
            || addr >= self.base + self.mapped
            || addr % ALLOC_HEADER as u64 != 0
        {
            return Err(PoolError::InvalidArgument(format!(
                "pointer {addr:#x} was not allocated from this pool"
            )));
        }

        unsafe {
            let block = ptr.sub(ALLOC_HEADER);
            let size = (block as *const u64).read() as usize;
            let layout = Layout::from_size_align(size + ALLOC_HEADER, ALLOC_HEADER)
                .map_err(|_| PoolError::InvalidArgument(format!(
                    "pointer {addr:#x} does not carry a valid allocation header"
                )))?;
            self.heap
                .deallocate(NonNull::new_unchecked(block), layout);
        }
        Ok(())
    }

    /// Return every extent to the hooks, leaving the arena empty.
    pub(crate) fn reset(&mut self) {
        if self.mapped > 0 {
            self.hooks.destroy(self.base, self.mapped);
        }
        self.heap = Heap::empty();
        self.mapped = 0;
    }
}
