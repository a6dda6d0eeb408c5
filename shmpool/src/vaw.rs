//! Virtual address window.
//!
//! A per-group singleton wrapping a buddy tree whose cell array is a
//! memory-mapped file in the group directory. Mutations are serialized by a
//! compound discipline: the in-process mutex first, then an exclusive
//! advisory lock on the tree file, so at most one mutator runs across the
//! whole host. Readers take the mutex and a shared advisory lock.
//!
//! Offsets handed out here are relative to [`VA_START`](crate::VA_START);
//! pools turn them into fixed virtual addresses.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::buddy::BuddyTree;
use crate::error::{PoolError, Result};
use crate::flock::FlockGuard;
use crate::group;
use crate::{MIN_POOL_SIZE, VA_SIZE};

static SINGLETON: Mutex<Option<Arc<Vaw>>> = Mutex::new(None);

pub struct Vaw {
    group: String,
    file: File,
    tree: Mutex<BuddyTree>,
    map: NonNull<c_void>,
    map_len: usize,
}

unsafe impl Send for Vaw {}
unsafe impl Sync for Vaw {}

impl Vaw {
    /// Open and map the group's buddy file. With `init_root` the tree is
    /// reset to a single idle root (used once, at group creation).
    fn open(group: &str, init_root: bool) -> Result<Vaw> {
        let path = group::buddies_path(group);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| PoolError::io("open", e))?;

        let tree_size = BuddyTree::calc_tree_size(VA_SIZE, MIN_POOL_SIZE) as usize;
        let file_len = file.metadata().map_err(|e| PoolError::io("fstat", e))?.len();
        if file_len < tree_size as u64 {
            return Err(PoolError::InvalidArgument(format!(
                "buddy file {} is {} bytes, expected at least {}",
                path.display(),
                file_len,
                tree_size
            )));
        }

        let map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(tree_size).expect("tree size is nonzero"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
            .map_err(|e| PoolError::system("mmap", e))?
        };

        let tree = unsafe {
            BuddyTree::from_mapped(VA_SIZE, MIN_POOL_SIZE, map.cast::<i64>(), init_root)?
        };

        Ok(Vaw {
            group: group.to_owned(),
            file,
            tree: Mutex::new(tree),
            map,
            map_len: tree_size,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Allocate `pool_size` bytes of window; returns the pool offset.
    pub fn allocate(&self, pool_size: u64) -> Result<u64> {
        if !pool_size.is_power_of_two()
            || pool_size < MIN_POOL_SIZE
            || pool_size > VA_SIZE
        {
            return Err(PoolError::InvalidArgument(format!(
                "pool size {pool_size:#x} must be a power of two in [{MIN_POOL_SIZE:#x}, {VA_SIZE:#x}]"
            )));
        }

        let mut tree = self.tree.lock().unwrap();
        let _file_lock = FlockGuard::exclusive(&self.file)?;
        tree.allocate(pool_size)
    }

    /// Release the pool at `pool_offset`.
    pub fn free(&self, pool_offset: u64) -> Result<()> {
        if pool_offset % MIN_POOL_SIZE != 0 || pool_offset >= VA_SIZE {
            return Err(PoolError::InvalidArgument(format!(
                "pool offset {pool_offset:#x} must be a multiple of {MIN_POOL_SIZE:#x} below {VA_SIZE:#x}"
            )));
        }

        let mut tree = self.tree.lock().unwrap();
        let _file_lock = FlockGuard::exclusive(&self.file)?;
        tree.free(pool_offset)
    }

    /// The pool containing `va_offset`: `(pool_offset, pool_size)`.
    pub fn query(&self, va_offset: u64) -> Result<(u64, u64)> {
        let tree = self.tree.lock().unwrap();
        let _file_lock = FlockGuard::shared(&self.file)?;
        tree.query(va_offset)
    }
}

impl Drop for Vaw {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { munmap(self.map, self.map_len) } {
            tracing::warn!(group = %self.group, errno = %errno, "failed to unmap buddy file");
        }
    }
}

/// Create a group's window state: the directory and the zero-filled buddy
/// file, with the root cell reset through a transient window.
pub fn create(group: &str) -> Result<()> {
    group::validate_name(group)?;
    let dir = group::group_dir(group);
    if dir.exists() {
        return Err(PoolError::AlreadyExists(format!(
            "group metadata directory {} already exists; if its owner crashed, \
             remove the stale group first",
            dir.display()
        )));
    }
    std::fs::create_dir(&dir).map_err(|e| PoolError::io("mkdir", e))?;

    let path = group::buddies_path(group);
    let file = File::create(&path).map_err(|e| PoolError::io("create", e))?;
    file.set_len(BuddyTree::calc_tree_size(VA_SIZE, MIN_POOL_SIZE))
        .map_err(|e| PoolError::io("ftruncate", e))?;
    drop(file);

    Vaw::open(group, true).map(drop)
}

/// Delete a group's window state. The caller guarantees no live users.
pub fn remove(group: &str) -> Result<()> {
    group::validate_name(group)?;
    std::fs::remove_file(group::buddies_path(group)).map_err(|e| PoolError::io("unlink", e))?;
    std::fs::remove_dir(group::group_dir(group)).map_err(|e| PoolError::io("rmdir", e))?;
    Ok(())
}

/// Install the per-process window singleton for `group`.
pub fn initialize(group: &str) -> Result<()> {
    let mut singleton = SINGLETON.lock().unwrap();
    if let Some(active) = singleton.as_ref() {
        return Err(PoolError::InvalidArgument(format!(
            "virtual address window is already initialized for group {:?}",
            active.group()
        )));
    }
    *singleton = Some(Arc::new(Vaw::open(group, false)?));
    Ok(())
}

/// Drop the singleton, unmapping the tree file. Idempotent.
pub fn uninitialize() -> Result<()> {
    SINGLETON.lock().unwrap().take();
    Ok(())
}

/// The window singleton installed by [`initialize`].
pub fn get() -> Result<Arc<Vaw>> {
    SINGLETON
        .lock()
        .unwrap()
        .clone()
        .ok_or(PoolError::NotInitialized("virtual address window"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_group(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "vawtest_{}_{}_{}",
            std::process::id(),
            tag,
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    struct GroupGuard(String);

    impl Drop for GroupGuard {
        fn drop(&mut self) {
            let _ = uninitialize();
            let _ = std::fs::remove_file(group::buddies_path(&self.0));
            let _ = std::fs::remove_dir(group::group_dir(&self.0));
        }
    }

    #[test]
    #[serial]
    fn test_create_initialize_allocate() {
        let name = unique_group("basic");
        let _guard = GroupGuard(name.clone());

        create(&name).unwrap();
        initialize(&name).unwrap();
        let vaw = get().unwrap();
        assert_eq!(vaw.group(), name);

        let a = vaw.allocate(MIN_POOL_SIZE).unwrap();
        let b = vaw.allocate(MIN_POOL_SIZE).unwrap();
        assert_ne!(a, b);

        assert_eq!(vaw.query(a).unwrap(), (a, MIN_POOL_SIZE));
        assert_eq!(vaw.query(b + MIN_POOL_SIZE - 1).unwrap(), (b, MIN_POOL_SIZE));

        vaw.free(a).unwrap();
        assert!(vaw.query(a).is_err());
        vaw.free(b).unwrap();
    }

    #[test]
    #[serial]
    fn test_argument_validation() {
        let name = unique_group("args");
        let _guard = GroupGuard(name.clone());

        create(&name).unwrap();
        initialize(&name).unwrap();
        let vaw = get().unwrap();

        assert!(matches!(
            vaw.allocate(MIN_POOL_SIZE - 1),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            vaw.allocate(MIN_POOL_SIZE / 2),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            vaw.allocate(VA_SIZE * 2),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(
            vaw.free(MIN_POOL_SIZE / 2),
            Err(PoolError::InvalidArgument(_))
        ));
        assert!(matches!(vaw.free(VA_SIZE), Err(PoolError::InvalidArgument(_))));
    }

    #[test]
    #[serial]
    fn test_reinitialize_is_error_and_get_requires_init() {
        let name = unique_group("reinit");
        let _guard = GroupGuard(name.clone());

        assert!(matches!(get(), Err(PoolError::NotInitialized(_))));

        create(&name).unwrap();
        initialize(&name).unwrap();
        assert!(matches!(initialize(&name), Err(PoolError::InvalidArgument(_))));

        uninitialize().unwrap();
        uninitialize().unwrap();
        assert!(matches!(get(), Err(PoolError::NotInitialized(_))));
    }

    #[test]
    #[serial]
    fn test_restart_preserves_allocations() {
        let name = unique_group("restart");
        let _guard = GroupGuard(name.clone());

        create(&name).unwrap();
        initialize(&name).unwrap();
        let offset = get().unwrap().allocate(MIN_POOL_SIZE).unwrap();

        uninitialize().unwrap();
        initialize(&name).unwrap();

        let vaw = get().unwrap();
        assert_eq!(vaw.query(offset).unwrap(), (offset, MIN_POOL_SIZE));
        vaw.free(offset).unwrap();
    }

    #[test]
    #[serial]
    fn test_concurrent_allocations_are_disjoint() {
        let name = unique_group("threads");
        let _guard = GroupGuard(name.clone());

        create(&name).unwrap();
        initialize(&name).unwrap();
        let vaw = get().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let vaw = vaw.clone();
            handles.push(std::thread::spawn(move || {
                (0..4)
                    .map(|_| vaw.allocate(MIN_POOL_SIZE).unwrap())
                    .collect::<Vec<_>>()
            }));
        }

        let mut offsets: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        offsets.sort_unstable();
        let before = offsets.len();
        offsets.dedup();
        assert_eq!(offsets.len(), before, "overlapping pool offsets handed out");

        for offset in offsets {
            vaw.free(offset).unwrap();
        }
    }
}
