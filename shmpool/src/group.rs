//! Group naming and lifecycle.
//!
//! A group is the visibility scope for pools: a directory on the host-local
//! ramdisk holding the buddy tree file and the chunk table. Every process
//! that wants to lease or borrow pool memory first joins a group, which
//! installs the group name and the VAW singleton for the process.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::chunk::ChunkTable;
use crate::error::{PoolError, Result};
use crate::vaw;
use crate::{GROUP_PREFIX, META_HOME};

static CURRENT_GROUP: Mutex<Option<String>> = Mutex::new(None);

pub fn group_dir(group: &str) -> PathBuf {
    Path::new(META_HOME).join(format!("{GROUP_PREFIX}{group}"))
}

pub fn buddies_path(group: &str) -> PathBuf {
    group_dir(group).join("buddies")
}

pub(crate) fn chunks_path(group: &str) -> PathBuf {
    group_dir(group).join("chunks")
}

pub(crate) fn validate_name(group: &str) -> Result<()> {
    if group.is_empty() || group.bytes().any(|b| b == b'/' || b == 0) {
        return Err(PoolError::InvalidArgument(format!(
            "group name {group:?} must be a non-empty path component"
        )));
    }
    Ok(())
}

/// Create the shared metadata of a new group.
///
/// Fails with [`PoolError::AlreadyExists`] if the group directory is present,
/// which after a crash means stale state: the operator has to `remove_group`
/// (or delete the directory) before the group can be created again.
pub fn create_group(group: &str) -> Result<()> {
    validate_name(group)?;
    vaw::create(group)?;
    if let Err(e) = ChunkTable::create(group) {
        // roll the half-made group back so a retry can succeed
        let _ = std::fs::remove_file(chunks_path(group));
        let _ = vaw::remove(group);
        return Err(e);
    }
    tracing::debug!(group, "group created");
    Ok(())
}

/// Remove the shared metadata of a group.
///
/// The caller vouches that no process is attached to the group or to any of
/// its pools.
pub fn remove_group(group: &str) -> Result<()> {
    validate_name(group)?;
    ChunkTable::remove(group)?;
    vaw::remove(group)?;
    tracing::debug!(group, "group removed");
    Ok(())
}

/// Join `group`: installs the per-process group identity and the VAW
/// singleton. Calling twice without [`uninitialize`] in between is an error.
pub fn initialize(group: &str) -> Result<()> {
    validate_name(group)?;
    let mut current = CURRENT_GROUP.lock().unwrap();
    if let Some(active) = current.as_deref() {
        return Err(PoolError::InvalidArgument(format!(
            "process is already a member of group {active:?}"
        )));
    }
    vaw::initialize(group)?;
    *current = Some(group.to_owned());
    Ok(())
}

/// Leave the current group. Idempotent.
pub fn uninitialize() -> Result<()> {
    let mut current = CURRENT_GROUP.lock().unwrap();
    vaw::uninitialize()?;
    *current = None;
    Ok(())
}

/// Name of the group this process joined.
pub fn current_group() -> Result<String> {
    CURRENT_GROUP
        .lock()
        .unwrap()
        .clone()
        .ok_or(PoolError::NotInitialized("process has not joined a group"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(
            group_dir("alpha"),
            Path::new("/dev/shm").join("group_alpha")
        );
        assert_eq!(
            buddies_path("alpha"),
            Path::new("/dev/shm/group_alpha/buddies")
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("ok_name").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("nul\0byte").is_err());
    }
}
