//! Extent provisioning hooks.
//!
//! The contract between a pool and the general-purpose allocator running on
//! top of it: the allocator never touches the OS itself, it asks its hook
//! table for extents in [`CHUNK_SIZE`](crate::CHUNK_SIZE) multiples. The
//! pool's chunk store is the sole implementer; the table lives per pool.
//!
//! Boolean hooks report capability: `false` means the operation is
//! unsupported or not admissible and the caller must behave as if nothing
//! happened.

use crate::error::Result;

pub trait ExtentHooks: Send {
    /// Provide an extent of `size` bytes (a `CHUNK_SIZE` multiple) aligned
    /// to `align`, at exactly `new_addr` when one is requested. Returns the
    /// extent's virtual address.
    fn alloc(&mut self, new_addr: Option<u64>, size: u64, align: u64) -> Result<u64>;

    /// Return an extent obtained from [`alloc`](Self::alloc).
    fn dalloc(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Like [`dalloc`](Self::dalloc) on a path that cannot fail; errors are
    /// logged and swallowed.
    fn destroy(&mut self, addr: u64, size: u64);

    /// Commit backing for `[addr, addr + size)`.
    fn commit(&mut self, addr: u64, size: u64) -> bool;

    /// Release backing while keeping the range reserved.
    fn decommit(&mut self, addr: u64, size: u64) -> bool;

    /// Hint that the range's contents are disposable.
    fn purge_lazy(&mut self, addr: u64, size: u64) -> bool;

    /// Drop the range's contents now.
    fn purge_forced(&mut self, addr: u64, size: u64) -> bool;

    /// Whether an extent may be split into `size_a` + `size_b`.
    fn split(&mut self, addr: u64, size: u64, size_a: u64, size_b: u64) -> bool;

    /// Whether two adjacent extents may be fused.
    fn merge(&mut self, addr_a: u64, size_a: u64, addr_b: u64, size_b: u64) -> bool;
}
