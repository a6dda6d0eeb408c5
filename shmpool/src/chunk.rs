//! Chunk table and chunk-backed extent store.
//!
//! Pool memory is materialized in fixed 2 MiB chunks, each its own shared
//! memory segment mapped at `VA_START + k * CHUNK_SIZE` in every process
//! that touches it. The per-group `chunks` file records which segment backs
//! which chunk: one signed 64-bit cell per chunk of the window, holding
//! `shmid + 1` (a zero cell means unbacked). The file is sparse; only
//! touched cells take space.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::ptr::NonNull;

use nix::errno::Errno;
use shmseg::Segment;

use crate::error::{PoolError, Result};
use crate::extent::ExtentHooks;
use crate::flock::FlockGuard;
use crate::group;
use crate::{CHUNK_SIZE, VA_SIZE, VA_START};

/// Index of the chunk containing `vaddr`, relative to the window start.
pub(crate) fn chunk_index(vaddr: u64) -> u64 {
    (vaddr - VA_START) / CHUNK_SIZE
}

/// The persistent chunk-to-segment binding of a group.
pub(crate) struct ChunkTable {
    file: File,
}

impl ChunkTable {
    pub(crate) fn table_size() -> u64 {
        (VA_SIZE / CHUNK_SIZE) * 8
    }

    pub(crate) fn create(group: &str) -> Result<()> {
        let path = group::chunks_path(group);
        let file = File::create(&path).map_err(|e| PoolError::io("create", e))?;
        file.set_len(Self::table_size())
            .map_err(|e| PoolError::io("ftruncate", e))?;
        Ok(())
    }

    pub(crate) fn remove(group: &str) -> Result<()> {
        std::fs::remove_file(group::chunks_path(group)).map_err(|e| PoolError::io("unlink", e))
    }

    pub(crate) fn open(group: &str) -> Result<ChunkTable> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(group::chunks_path(group))
            .map_err(|e| PoolError::io("open", e))?;
        Ok(ChunkTable { file })
    }

    fn read_cell(&self, index: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, index * 8)
            .map_err(|e| PoolError::io("pread", e))?;
        Ok(i64::from_ne_bytes(buf))
    }

    fn write_cell(&self, index: u64, value: i64) -> Result<()> {
        self.file
            .write_all_at(&value.to_ne_bytes(), index * 8)
            .map_err(|e| PoolError::io("pwrite", e))
    }

    /// The segment backing chunk `index`, if any.
    pub(crate) fn lookup(&self, index: u64) -> Result<Option<Segment>> {
        let _lock = FlockGuard::shared(&self.file)?;
        match self.read_cell(index)? {
            0 => Ok(None),
            cell => Ok(Some(Segment::from_id((cell - 1) as libc::c_int))),
        }
    }

    /// Record `segment` as the backing of chunk `index`; the cell must be
    /// empty.
    pub(crate) fn record(&self, index: u64, segment: Segment) -> Result<()> {
        let _lock = FlockGuard::exclusive(&self.file)?;
        if self.read_cell(index)? != 0 {
            return Err(PoolError::InvalidArgument(format!(
                "chunk {index} is already backed"
            )));
        }
        self.write_cell(index, segment.id() as i64 + 1)
    }

    pub(crate) fn clear(&self, index: u64) -> Result<()> {
        let _lock = FlockGuard::exclusive(&self.file)?;
        self.write_cell(index, 0)
    }
}

struct OwnedChunk {
    vaddr: u64,
    segment: Segment,
}

/// Extent store of one pool: creates chunk segments, maps them at their
/// fixed addresses and keeps the group's chunk table in sync. Implements
/// the full hook table the arena allocates through.
pub(crate) struct ChunkStore {
    table: ChunkTable,
    base: u64,
    capacity: u64,
    cursor: u64,
    owned: Vec<OwnedChunk>,
}

impl ChunkStore {
    pub(crate) fn open(group: &str, base: u64, capacity: u64) -> Result<ChunkStore> {
        Ok(ChunkStore {
            table: ChunkTable::open(group)?,
            base,
            capacity,
            cursor: 0,
            owned: Vec::new(),
        })
    }

    /// Create one chunk segment and map it at `vaddr`.
    fn map_chunk(&mut self, vaddr: u64) -> Result<()> {
        let segment =
            Segment::private(CHUNK_SIZE as usize).map_err(|e| match e {
                Errno::ENOMEM | Errno::ENOSPC => PoolError::OutOfSpace(format!(
                    "cannot create a {CHUNK_SIZE:#x}-byte chunk segment: {e}"
                )),
                e => PoolError::system("shmget", e),
            })?;

        let addr = NonNull::new(vaddr as *mut c_void).expect("window addresses are nonzero");
        if let Err(errno) = segment.attach(Some(addr)) {
            let _ = segment.remove();
            return Err(PoolError::system("shmat", errno));
        }

        if let Err(e) = self.table.record(chunk_index(vaddr), segment) {
            let _ = Segment::detach(addr);
            let _ = segment.remove();
            return Err(e);
        }

        self.owned.push(OwnedChunk { vaddr, segment });
        Ok(())
    }

    /// Detach and destroy one owned chunk, clearing its table cell.
    fn drop_chunk(&mut self, position: usize) {
        let chunk = self.owned.swap_remove(position);
        let addr = NonNull::new(chunk.vaddr as *mut c_void).expect("window addresses are nonzero");
        if let Err(errno) = Segment::detach(addr) {
            tracing::warn!(vaddr = format_args!("{:#x}", chunk.vaddr), errno = %errno, "chunk detach failed");
        }
        if let Err(errno) = chunk.segment.remove() {
            tracing::warn!(vaddr = format_args!("{:#x}", chunk.vaddr), errno = %errno, "chunk removal failed");
        }
        if let Err(e) = self.table.clear(chunk_index(chunk.vaddr)) {
            tracing::warn!(vaddr = format_args!("{:#x}", chunk.vaddr), error = %e, "chunk table clear failed");
        }
    }

    fn release_range(&mut self, addr: u64, size: u64) {
        let end = addr + size;
        let mut position = 0;
        while position < self.owned.len() {
            let vaddr = self.owned[position].vaddr;
            if vaddr >= addr && vaddr < end {
                self.drop_chunk(position);
            } else {
                position += 1;
            }
        }
    }

    fn in_range(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && addr + size <= self.base + self.capacity
    }
}

impl ExtentHooks for ChunkStore {
    fn alloc(&mut self, new_addr: Option<u64>, size: u64, align: u64) -> Result<u64> {
        if size == 0 || size % CHUNK_SIZE != 0 || align > CHUNK_SIZE {
            return Err(PoolError::InvalidArgument(format!(
                "extent of {size:#x} bytes aligned to {align:#x} is not a chunk multiple"
            )));
        }
        let addr = match new_addr {
            Some(addr) => {
                if addr % CHUNK_SIZE != 0 || !self.in_range(addr, size) {
                    return Err(PoolError::InvalidArgument(format!(
                        "fixed extent address {addr:#x} is not a chunk boundary inside the pool"
                    )));
                }
                addr
            }
            None => {
                let addr = self.base + self.cursor;
                if !self.in_range(addr, size) {
                    return Err(PoolError::OutOfSpace(format!(
                        "pool exhausted at {:#x} of {:#x} bytes",
                        self.cursor, self.capacity
                    )));
                }
                addr
            }
        };

        let mapped_before = self.owned.len();
        for k in 0..size / CHUNK_SIZE {
            if let Err(e) = self.map_chunk(addr + k * CHUNK_SIZE) {
                // roll back this extent's chunks; earlier extents stay
                while self.owned.len() > mapped_before {
                    let last = self.owned.len() - 1;
                    self.drop_chunk(last);
                }
                return Err(e);
            }
        }

        self.cursor = self.cursor.max(addr + size - self.base);
        tracing::debug!(
            addr = format_args!("{addr:#x}"),
            size = format_args!("{size:#x}"),
            "extent mapped"
        );
        Ok(addr)
    }

    fn dalloc(&mut self, addr: u64, size: u64) -> Result<()> {
        if addr % CHUNK_SIZE != 0 || size % CHUNK_SIZE != 0 || !self.in_range(addr, size) {
            return Err(PoolError::InvalidArgument(format!(
                "extent {addr:#x}+{size:#x} is not chunk-aligned inside the pool"
            )));
        }
        self.release_range(addr, size);
        Ok(())
    }

    fn destroy(&mut self, addr: u64, size: u64) {
        self.release_range(addr, size);
    }

    // chunks are shm segments, permanently committed
    fn commit(&mut self, _addr: u64, _size: u64) -> bool {
        false
    }

    fn decommit(&mut self, _addr: u64, _size: u64) -> bool {
        false
    }

    fn purge_lazy(&mut self, _addr: u64, _size: u64) -> bool {
        false
    }

    fn purge_forced(&mut self, _addr: u64, _size: u64) -> bool {
        false
    }

    fn split(&mut self, _addr: u64, _size: u64, size_a: u64, size_b: u64) -> bool {
        size_a % CHUNK_SIZE == 0 && size_b % CHUNK_SIZE == 0
    }

    fn merge(&mut self, addr_a: u64, size_a: u64, addr_b: u64, _size_b: u64) -> bool {
        addr_a % CHUNK_SIZE == 0 && addr_b % CHUNK_SIZE == 0 && addr_a + size_a == addr_b
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        while let Some(position) = self.owned.len().checked_sub(1) {
            self.drop_chunk(position);
        }
    }
}
