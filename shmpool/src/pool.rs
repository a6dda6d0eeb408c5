//! Shared memory pools.
//!
//! A pool is a contiguous run of the group's virtual address window served
//! by a general-purpose allocator. The lessor process creates the pool,
//! allocates and frees from it; lessee processes attach the backing chunks
//! at the same fixed addresses, so any pointer handed out by the lessor
//! resolves everywhere in the group.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use nix::errno::Errno;
use shmseg::Segment;

use crate::arena::Arena;
use crate::chunk::{chunk_index, ChunkStore, ChunkTable};
use crate::error::{PoolError, Result};
use crate::{group, vaw};
use crate::{CHUNK_SIZE, VA_START};

pub struct ShmPool {
    capacity: u64,
    offset: u64,
    arena: Mutex<Arena<ChunkStore>>,
}

impl ShmPool {
    /// Create a pool of `capacity` bytes, making this process its lessor.
    ///
    /// `capacity` must be a power of two between the minimum pool size and
    /// the window size. The window range is claimed immediately; backing
    /// chunks are mapped lazily as [`malloc`](Self::malloc) needs them.
    pub fn create(capacity: u64) -> Result<ShmPool> {
        let window = vaw::get()?;
        let pool_group = group::current_group()?;

        let offset = window.allocate(capacity)?;
        let vaddr = VA_START + offset;
        let store = match ChunkStore::open(&pool_group, vaddr, capacity) {
            Ok(store) => store,
            Err(e) => {
                let _ = window.free(offset);
                return Err(e);
            }
        };

        let arena = Arena::new(vaddr, capacity, store);
        tracing::debug!(
            group = %pool_group,
            vaddr = format_args!("{vaddr:#x}"),
            capacity = format_args!("{capacity:#x}"),
            arena = arena.id(),
            "pool created"
        );
        Ok(ShmPool {
            capacity,
            offset,
            arena: Mutex::new(arena),
        })
    }

    pub fn get_capacity(&self) -> u64 {
        self.capacity
    }

    pub fn get_offset(&self) -> u64 {
        self.offset
    }

    pub fn get_vaddr(&self) -> u64 {
        VA_START + self.offset
    }

    /// Identifier of the allocator arena serving this pool.
    pub fn arena_id(&self) -> u32 {
        self.arena.lock().unwrap().id()
    }

    /// Allocate `size` bytes of pool memory. Null on failure; the returned
    /// pointer lies inside `[vaddr, vaddr + capacity)` and is valid in every
    /// group member that attaches the covering chunks.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.arena.lock().unwrap().malloc(size)
    }

    /// Free a pointer returned by [`malloc`](Self::malloc).
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        self.arena.lock().unwrap().free(ptr)
    }

    /// Map the backed chunks overlapping `[vaddr, vaddr + size)` into this
    /// process at their fixed addresses. The lessee-side mirror of
    /// [`unmap`](Self::unmap).
    pub fn attach(vaddr: u64, size: u64) -> Result<()> {
        let pool_group = group::current_group()?;
        let table = ChunkTable::open(&pool_group)?;
        for chunk_vaddr in chunk_span(vaddr, size)? {
            let segment = table.lookup(chunk_index(chunk_vaddr))?.ok_or_else(|| {
                PoolError::InvalidArgument(format!(
                    "chunk at {chunk_vaddr:#x} is not backed by any segment"
                ))
            })?;
            let addr = NonNull::new(chunk_vaddr as *mut c_void).expect("window addresses are nonzero");
            segment
                .attach(Some(addr))
                .map_err(|e| PoolError::system("shmat", e))?;
        }
        Ok(())
    }

    /// Tear down this process's mappings overlapping `[vaddr, vaddr + size)`,
    /// including partially overlapping chunks. Chunks this process never
    /// attached are skipped.
    pub fn unmap(vaddr: u64, size: u64) -> Result<()> {
        for chunk_vaddr in chunk_span(vaddr, size)? {
            let addr = NonNull::new(chunk_vaddr as *mut c_void).expect("window addresses are nonzero");
            match Segment::detach(addr) {
                Ok(()) | Err(Errno::EINVAL) => {}
                Err(errno) => return Err(PoolError::system("shmdt", errno)),
            }
        }
        Ok(())
    }

    /// Create the shared metadata of a new group.
    pub fn create_group(name: &str) -> Result<()> {
        group::create_group(name)
    }

    /// Remove a group's shared metadata. The caller vouches nobody is
    /// attached.
    pub fn remove_group(name: &str) -> Result<()> {
        group::remove_group(name)
    }

    /// Join a group; required before creating pools or attaching chunks.
    pub fn initialize(name: &str) -> Result<()> {
        group::initialize(name)
    }

    /// Leave the current group.
    pub fn uninitialize() -> Result<()> {
        group::uninitialize()
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        // hand every extent back, then release the window range; lessees
        // must have unmapped by now per the pool contract
        self.arena.lock().unwrap().reset();
        match vaw::get() {
            Ok(window) => {
                if let Err(e) = window.free(self.offset) {
                    tracing::warn!(offset = format_args!("{:#x}", self.offset), error = %e, "pool window release failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "pool dropped after window uninitialization");
            }
        }
    }
}

/// Chunk base addresses covering `[vaddr, vaddr + size)`.
fn chunk_span(vaddr: u64, size: u64) -> Result<impl Iterator<Item = u64>> {
    let end = vaddr
        .checked_add(size)
        .filter(|_| size > 0 && vaddr >= VA_START)
        .ok_or_else(|| {
            PoolError::InvalidArgument(format!("range {vaddr:#x}+{size:#x} is not a window range"))
        })?;
    let first = vaddr - vaddr % CHUNK_SIZE;
    Ok((first..end).step_by(CHUNK_SIZE as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MIN_POOL_SIZE;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_group(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "pooltest_{}_{}_{}",
            std::process::id(),
            tag,
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Leaves the group and deletes its metadata even when a test unwinds.
    struct GroupGuard(String);

    impl GroupGuard {
        fn join(tag: &str) -> GroupGuard {
            let name = unique_group(tag);
            ShmPool::create_group(&name).unwrap();
            ShmPool::initialize(&name).unwrap();
            GroupGuard(name)
        }
    }

    impl Drop for GroupGuard {
        fn drop(&mut self) {
            let _ = ShmPool::uninitialize();
            let _ = ShmPool::remove_group(&self.0);
        }
    }

    #[test]
    #[serial]
    fn test_group_create_twice_fails() {
        let guard = GroupGuard::join("dup");
        assert!(matches!(
            ShmPool::create_group(&guard.0),
            Err(PoolError::AlreadyExists(_))
        ));
    }

    #[test]
    #[serial]
    fn test_pool_malloc_free_roundtrip() {
        let _guard = GroupGuard::join("alloc");

        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        assert_eq!(pool.get_capacity(), MIN_POOL_SIZE);
        assert_eq!(pool.get_vaddr(), VA_START + pool.get_offset());

        let ptr = pool.malloc(4096);
        assert!(!ptr.is_null());
        let addr = ptr as u64;
        assert!(addr >= pool.get_vaddr());
        assert!(addr < pool.get_vaddr() + pool.get_capacity());

        unsafe {
            std::ptr::write_bytes(ptr, 0xC7, 4096);
            assert_eq!(ptr.read(), 0xC7);
            assert_eq!(ptr.add(4095).read(), 0xC7);
        }

        pool.free(ptr).unwrap();
        assert!(matches!(pool.free(std::ptr::null_mut()), Err(PoolError::InvalidArgument(_))));
        assert_eq!(pool.malloc(0), std::ptr::null_mut());
    }

    #[test]
    #[serial]
    fn test_pool_claims_window_range() {
        let _guard = GroupGuard::join("window");

        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let offset = pool.get_offset();

        let window = vaw::get().unwrap();
        assert_eq!(window.query(offset).unwrap(), (offset, MIN_POOL_SIZE));

        drop(pool);
        assert!(window.query(offset).is_err(), "window range released on drop");
    }

    #[test]
    #[serial]
    fn test_lessee_attach_sees_lessor_writes() {
        let _guard = GroupGuard::join("share");

        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let ptr = pool.malloc(4096);
        assert!(!ptr.is_null());

        const MAGIC: u64 = 0x5EED_F00D_CAFE_D00D;
        unsafe { (ptr as *mut u64).write(MAGIC) };

        // replay the lessee's view: drop our mapping of the covering chunk,
        // then re-attach through the chunk table the way a second process
        // would
        let addr = ptr as u64;
        ShmPool::unmap(addr, 8).unwrap();
        ShmPool::attach(addr, 8).unwrap();

        assert_eq!(unsafe { (ptr as *const u64).read() }, MAGIC);
        pool.free(ptr).unwrap();
    }

    #[test]
    #[serial]
    fn test_attach_unbacked_chunk_fails() {
        let _guard = GroupGuard::join("unbacked");

        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        // far end of the pool, never touched by malloc
        let tail = pool.get_vaddr() + pool.get_capacity() - CHUNK_SIZE;
        assert!(matches!(
            ShmPool::attach(tail, 8),
            Err(PoolError::InvalidArgument(_))
        ));
    }

    #[test]
    #[serial]
    fn test_malloc_grows_across_chunks() {
        let _guard = GroupGuard::join("grow");

        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        // three allocations the size of a chunk force repeated extent growth
        let mut ptrs = Vec::new();
        for _ in 0..3 {
            let ptr = pool.malloc(CHUNK_SIZE as usize);
            assert!(!ptr.is_null());
            unsafe { std::ptr::write_bytes(ptr, 0x11, CHUNK_SIZE as usize) };
            ptrs.push(ptr);
        }
        for ptr in ptrs {
            pool.free(ptr).unwrap();
        }
    }

    #[test]
    #[serial]
    fn test_pool_requires_initialization() {
        assert!(matches!(
            ShmPool::create(MIN_POOL_SIZE),
            Err(PoolError::NotInitialized(_))
        ));
    }
}
