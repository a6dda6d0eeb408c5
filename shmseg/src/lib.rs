//! System V shared-memory segments.
//!
//! This is the one primitive shared by the ring buffer and the shared-memory
//! pool system: a segment created by one process and attachable by any other
//! process on the host, optionally at a fixed virtual address. Creation and
//! attach are distinct flag paths: `create` always passes
//! `IPC_CREAT | IPC_EXCL`, `lookup` never passes creation flags.
//!
//! Errors are raw [`Errno`] values; callers wrap them with their own context.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Errno>;

const SHM_HUGE_SHIFT: libc::c_int = 26;
const SHM_HUGE_2MB: libc::c_int = 21 << SHM_HUGE_SHIFT;
const SHM_HUGE_1GB: libc::c_int = 30 << SHM_HUGE_SHIFT;

/// Backing page size of a segment. Huge pages require host support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Base4K,
    Huge2M,
    Huge1G,
}

impl PageSize {
    pub fn from_bytes(bytes: u32) -> Option<PageSize> {
        match bytes {
            0x1000 => Some(PageSize::Base4K),
            0x20_0000 => Some(PageSize::Huge2M),
            0x4000_0000 => Some(PageSize::Huge1G),
            _ => None,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            PageSize::Base4K => 0x1000,
            PageSize::Huge2M => 0x20_0000,
            PageSize::Huge1G => 0x4000_0000,
        }
    }

    fn shm_flags(self) -> libc::c_int {
        match self {
            PageSize::Base4K => 0,
            PageSize::Huge2M => libc::SHM_HUGETLB | SHM_HUGE_2MB,
            PageSize::Huge1G => libc::SHM_HUGETLB | SHM_HUGE_1GB,
        }
    }
}

/// Handle to a System V shared-memory segment, by kernel-assigned id.
///
/// The handle does not own the segment: dropping it detaches nothing and
/// destroys nothing. Destruction is an explicit [`Segment::remove`] by
/// whoever created the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    id: libc::c_int,
}

impl Segment {
    /// Create a new segment under `key`. Fails with `EEXIST` if a segment
    /// with this key is already present.
    pub fn create(key: libc::key_t, size: usize, page: PageSize) -> Result<Segment> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | 0o660 | page.shm_flags();
        let id = Errno::result(unsafe { libc::shmget(key, size, flags) })?;
        Ok(Segment { id })
    }

    /// Create an anonymous segment (`IPC_PRIVATE`), reachable only by id.
    pub fn private(size: usize) -> Result<Segment> {
        let id = Errno::result(unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o660) })?;
        Ok(Segment { id })
    }

    /// Look up an existing segment by key.
    pub fn lookup(key: libc::key_t) -> Result<Segment> {
        let id = Errno::result(unsafe { libc::shmget(key, 0, 0) })?;
        Ok(Segment { id })
    }

    pub const fn from_id(id: libc::c_int) -> Segment {
        Segment { id }
    }

    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    /// Pin the segment's pages (advisory lock against swap-out).
    pub fn pin(&self) -> Result<()> {
        Errno::result(unsafe { libc::shmctl(self.id, libc::SHM_LOCK, std::ptr::null_mut()) })?;
        Ok(())
    }

    /// The key the segment was created under (0 for `IPC_PRIVATE`).
    pub fn key(&self) -> Result<libc::key_t> {
        // shm_perm hides the key behind a double-underscore field on glibc
        Ok(self.stat()?.shm_perm.__key)
    }

    pub fn stat(&self) -> Result<libc::shmid_ds> {
        let mut ds = MaybeUninit::<libc::shmid_ds>::uninit();
        Errno::result(unsafe { libc::shmctl(self.id, libc::IPC_STAT, ds.as_mut_ptr()) })?;
        Ok(unsafe { ds.assume_init() })
    }

    /// Attach the segment, at `addr` if given (must be suitably aligned),
    /// anywhere otherwise.
    pub fn attach(&self, addr: Option<NonNull<c_void>>) -> Result<NonNull<c_void>> {
        let hint = addr.map_or(std::ptr::null(), |a| a.as_ptr() as *const c_void);
        let ptr = unsafe { libc::shmat(self.id, hint, 0) };
        if ptr as isize == -1 {
            return Err(Errno::last());
        }
        Ok(NonNull::new(ptr as *mut c_void).expect("shmat returned null"))
    }

    /// Detach a previously attached address from this process.
    pub fn detach(addr: NonNull<c_void>) -> Result<()> {
        Errno::result(unsafe { libc::shmdt(addr.as_ptr()) })?;
        Ok(())
    }

    /// Destroy the segment. Attached processes keep their mappings until
    /// they detach; nobody new can attach.
    pub fn remove(&self) -> Result<()> {
        Errno::result(unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) })?;
        Ok(())
    }
}
