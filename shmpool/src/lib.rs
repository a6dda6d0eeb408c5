//! Shared-memory pools over a host-wide virtual address window.
//!
//! Processes of one *group* share a fixed virtual address range, partitioned
//! into pools by a buddy allocator whose state lives in a memory-mapped file
//! on the group's ramdisk directory. A pool's backing memory arrives in
//! 2 MiB shared-memory chunks mapped at fixed addresses, so a pointer
//! allocated by the pool's lessor means the same thing in every lessee that
//! attaches the covering chunks.
//!
//! Typical lessor flow:
//!
//! ```no_run
//! use shmpool::ShmPool;
//!
//! ShmPool::create_group("telemetry")?;
//! ShmPool::initialize("telemetry")?;
//! let pool = ShmPool::create(shmpool::MIN_POOL_SIZE)?;
//! let ptr = pool.malloc(4096);
//! # let _ = ptr;
//! # Ok::<(), shmpool::PoolError>(())
//! ```
//!
//! A lessee joins with `ShmPool::initialize`, attaches ranges it was handed
//! with `ShmPool::attach`, and must `ShmPool::unmap` them before the lessor
//! destroys the pool.

mod arena;
pub mod buddy;
mod chunk;
pub mod error;
pub mod extent;
mod flock;
pub mod group;
mod pool;
pub mod vaw;

pub use error::{PoolError, Result};
pub use extent::ExtentHooks;
pub use pool::ShmPool;

/// Start of the reserved virtual address range for pool memory.
pub const VA_START: u64 = 0x2000_0000_0000;

/// Size of the reserved virtual address range: 16 TiB.
pub const VA_SIZE: u64 = 0x1000_0000_0000;

/// Minimum pool capacity: 4 GiB. Also the buddy tree's unit size.
pub const MIN_POOL_SIZE: u64 = 0x1_0000_0000;

/// Granularity of pool backing memory: 2 MiB.
pub const CHUNK_SIZE: u64 = 0x20_0000;

/// Host-local ramdisk holding group metadata.
pub const META_HOME: &str = "/dev/shm";

/// Group directories are named `group_<name>`.
pub const GROUP_PREFIX: &str = "group_";
